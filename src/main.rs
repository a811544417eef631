//! # bridge-chat
//!
//! Command-line front end for the AI bridge client.
//!
//! ## Subcommands
//!
//! - `bridge-chat chat`: interactive chat over stdin/stdout
//! - `bridge-chat ask <message>`: one request, reply printed as it streams
//! - `bridge-chat action <action> --lang <language>`: run a code action on a
//!   file or on stdin (`explain`, `explain-detailed`, `find-bugs`, `fix`,
//!   `tests`, `document`, `refactor-<goal>`, `complete`)
//! - `bridge-chat generate <description>`: free-form code generation
//! - `bridge-chat status`: WebSocket state and the bridge's `/status`
//! - `bridge-chat history list|search|clear|export|import`
//!
//! Replies go to stdout; logs go to stderr (`RUST_LOG` or `[logging] level`).

use std::error::Error;
use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{info, warn};

use bridge_client::history::{ImportReport, StateBackend};
use bridge_client::prompts::{self, CodeAction};
use bridge_client::{
    Assistant, BridgeHttpClient, Config, ConversationStore, FileBackend, MemoryBackend,
    RequestKind, Session, SessionEvent, WsTransport,
};

type BoxError = Box<dyn Error>;
type Store = ConversationStore<Box<dyn StateBackend>>;

#[derive(Parser)]
#[command(name = "bridge-chat", version)]
struct Cli {
    /// Config file (default: `bridge.toml` in the working directory, if present).
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat. `/clear`, `/status` and `/quit` are handled locally.
    Chat {
        /// Send the last N turns as context with each message.
        #[arg(long, default_value_t = 0)]
        context: usize,
    },
    /// Send one message and print the reply.
    Ask {
        message: String,
        /// Request kind: chat, code, explain, fix.
        #[arg(long, default_value = "chat")]
        kind: RequestKind,
        /// Skip the WebSocket and use the HTTP API directly.
        #[arg(long)]
        http: bool,
    },
    /// Run a code action on a file (or stdin).
    ///
    /// Refactoring goals: `refactor-readability`, `refactor-performance`,
    /// `refactor-error-handling`, `refactor-extract`, `refactor-simplify`.
    Action {
        action: CodeAction,
        /// Language tag used in the prompt, e.g. `rust`.
        #[arg(long)]
        lang: String,
        /// Source file; reads stdin when omitted.
        #[arg(long)]
        file: Option<String>,
        /// Print only the first code block of the reply.
        #[arg(long)]
        code_only: bool,
        /// Byte offset of the cursor for `complete` (default: end of input).
        #[arg(long)]
        cursor: Option<usize>,
    },
    /// Generate code from a description.
    Generate { description: String },
    /// Show connection state and bridge status.
    Status,
    /// Inspect or manage the conversation history.
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// Print the most recent messages.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Case-insensitive search over message content.
    Search { query: String },
    /// Delete every message.
    Clear,
    /// Write the history as JSON to a file (or stdout).
    Export { path: Option<String> },
    /// Replace the history with the valid records of a JSON file.
    Import { path: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("bridge-chat: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bridge-chat: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &Config) -> Result<(), BoxError> {
    match command {
        Commands::History { command } => run_history(command, open_store(config)?),
        Commands::Status => run_status(config).await,
        Commands::Chat { context } => {
            let assistant = build_assistant(config)?.with_context_turns(context);
            run_chat(assistant, config).await
        }
        Commands::Ask {
            message,
            kind,
            http,
        } => {
            let mut assistant = build_assistant(config)?;
            if http {
                let answer = assistant.ask_http(&message).await?;
                println!("{}", answer.content);
            } else {
                connect_if_configured(&assistant, config).await;
                assistant.ask(kind, &message, print_chunk).await?;
                println!();
            }
            Ok(())
        }
        Commands::Action {
            action,
            lang,
            file,
            code_only,
            cursor,
        } => {
            if cursor.is_some() && action != CodeAction::Complete {
                return Err("--cursor only applies to the complete action".into());
            }
            let code = match file {
                Some(path) => tokio::fs::read_to_string(&path).await?,
                None => {
                    let mut buf = String::new();
                    tokio::io::stdin().read_to_string(&mut buf).await?;
                    buf
                }
            };
            let prompt = match cursor {
                Some(at) => {
                    let (before, after) = prompts::cursor_context(&code, at);
                    prompts::complete_at_cursor(&lang, before, after)
                }
                None => action.prompt(&lang, &code),
            };
            let mut assistant = build_assistant(config)?;
            connect_if_configured(&assistant, config).await;
            if code_only {
                let answer = assistant.ask(action.kind(), &prompt, |_| {}).await?;
                println!("{}", prompts::extract_code(&answer.content));
            } else {
                assistant.ask(action.kind(), &prompt, print_chunk).await?;
                println!();
            }
            Ok(())
        }
        Commands::Generate { description } => {
            let mut assistant = build_assistant(config)?;
            connect_if_configured(&assistant, config).await;
            let prompt = prompts::generate_code(&description);
            assistant.ask(RequestKind::Code, &prompt, print_chunk).await?;
            println!();
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> Result<Store, BoxError> {
    let backend: Box<dyn StateBackend> = match config.history_path() {
        Some(path) => {
            info!("history file: {}", path.display());
            Box::new(FileBackend::new(path))
        }
        None => Box::new(MemoryBackend::new()),
    };
    Ok(ConversationStore::open(backend, config.history.max_entries)?)
}

fn build_assistant(config: &Config) -> Result<Assistant<Box<dyn StateBackend>>, BoxError> {
    let transport = Arc::new(WsTransport::new(&config.bridge.server_url)?);
    let session = Session::spawn(transport, config.session_config());
    let http = BridgeHttpClient::new(&config.bridge.api_url)?;
    let store = open_store(config)?;
    Ok(Assistant::new(session, Some(http), store).with_streaming(config.bridge.stream_response))
}

/// Connect up front when `auto_connect` is set. A failure is not fatal: the
/// request path reconnects or falls back to HTTP.
async fn connect_if_configured(assistant: &Assistant<Box<dyn StateBackend>>, config: &Config) {
    if !config.bridge.auto_connect {
        return;
    }
    if let Err(e) = assistant.session().connect().await {
        warn!("could not connect to {}: {e}", config.bridge.server_url);
    }
}

fn print_chunk(chunk: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(chunk.as_bytes());
    let _ = stdout.flush();
}

async fn run_chat(
    mut assistant: Assistant<Box<dyn StateBackend>>,
    config: &Config,
) -> Result<(), BoxError> {
    // State changes go to the log, not between reply lines.
    let mut events = assistant.session().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged(state) => info!("connection: {state}"),
                SessionEvent::Error(e) => warn!("bridge: {e}"),
                SessionEvent::Status(status) => info!("bridge status: {status}"),
                SessionEvent::Message(_) => {}
            }
        }
    });
    connect_if_configured(&assistant, config).await;

    eprintln!(
        "bridge: {} ({}). Type /quit to exit.",
        config.bridge.server_url,
        assistant.session().state()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                assistant.history_mut().clear()?;
                eprintln!("History cleared.");
                continue;
            }
            "/status" => {
                eprintln!("{}", assistant.session().state());
                continue;
            }
            _ => {}
        }
        match assistant.ask(RequestKind::Chat, line, print_chunk).await {
            Ok(_) => println!(),
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    assistant.session().disconnect().await;
    Ok(())
}

async fn run_status(config: &Config) -> Result<(), BoxError> {
    let transport = Arc::new(WsTransport::new(&config.bridge.server_url)?);
    let session = Session::spawn(transport, config.session_config());
    match session.connect().await {
        Ok(()) => println!("websocket: connected ({})", config.bridge.server_url),
        Err(e) => println!("websocket: {e} ({})", config.bridge.server_url),
    }
    session.disconnect().await;

    let http = BridgeHttpClient::new(&config.bridge.api_url)?;
    match tokio::time::timeout(Duration::from_secs(15), http.status()).await {
        Ok(Ok(status)) => println!("api: {}", serde_json::to_string_pretty(&status)?),
        Ok(Err(e)) => println!("api: {e}"),
        Err(_) => println!("api: timed out"),
    }
    Ok(())
}

fn run_history(command: HistoryCommand, mut store: Store) -> Result<(), BoxError> {
    match command {
        HistoryCommand::List { limit } => {
            for m in store.recent(limit) {
                println!("[{}] {}: {}", m.timestamp_ms, m.role.as_str(), m.content);
            }
        }
        HistoryCommand::Search { query } => {
            for m in store.search(&query) {
                println!("{} [{}] {}", m.id, m.role.as_str(), m.content);
            }
        }
        HistoryCommand::Clear => {
            store.clear()?;
            println!("History cleared.");
        }
        HistoryCommand::Export { path } => {
            let data = store.export_snapshot()?;
            match path {
                Some(path) => std::fs::write(path, data)?,
                None => println!("{data}"),
            }
        }
        HistoryCommand::Import { path } => {
            let data = std::fs::read_to_string(path)?;
            let ImportReport {
                accepted,
                rejected,
                evicted,
            } = store.import_snapshot(&data)?;
            println!("Imported {accepted} messages ({rejected} invalid, {evicted} over capacity).");
        }
    }
    Ok(())
}
