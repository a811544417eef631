//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `BRIDGE_SERVER_URL`, `BRIDGE_API_URL`,
//!    `BRIDGE_HISTORY_PATH`
//! 2. **Config file**: path via `--config <path>`, or `bridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [bridge]
//! server_url = "ws://localhost:8765"
//! api_url = "http://localhost:8766/api"
//! auto_connect = true
//! stream_response = true
//! max_reconnect_attempts = 5
//! reconnect_interval_ms = 5000
//! heartbeat_interval_secs = 30
//! connect_timeout_secs = 10
//! request_timeout_secs = 60
//!
//! # Optional; history stays in memory when `path` is omitted
//! [history]
//! path = "~/.bridge-client/history.json"
//! max_entries = 100
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::reconnect::ReconnectPolicy;
use crate::session::SessionConfig;

const DEFAULT_CONFIG_FILE: &str = "bridge.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the bridge lives and how the session behaves.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// WebSocket endpoint (default `ws://localhost:8765`).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// REST base for the HTTP fallback (default `http://localhost:8766/api`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Connect on startup instead of on first send (default true).
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Ask the bridge to stream replies (default true).
    #[serde(default = "default_true")]
    pub stream_response: bool,
    /// Automatic reconnects before giving up (default 5).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Base backoff delay in milliseconds (default 5000).
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Conversation history persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// JSON file for the log. A leading `~/` is expanded. In-memory when unset.
    pub path: Option<String>,
    /// Messages kept (default 100).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_server_url() -> String {
    "ws://localhost:8765".to_string()
}
fn default_api_url() -> String {
    "http://localhost:8766/api".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_interval_ms() -> u64 {
    5000
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    60
}
fn default_max_entries() -> usize {
    crate::history::DEFAULT_CAPACITY
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_url: default_api_url(),
            auto_connect: true,
            stream_response: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: default_max_entries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load config from file (if given or found) with env var overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without env overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("BRIDGE_SERVER_URL") {
            self.bridge.server_url = url;
        }
        if let Some(url) = lookup("BRIDGE_API_URL") {
            self.bridge.api_url = url;
        }
        if let Some(path) = lookup("BRIDGE_HISTORY_PATH") {
            self.history.path = Some(path);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.bridge;
        if !["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| b.server_url.starts_with(scheme))
        {
            return Err(ConfigError::Invalid(format!(
                "bridge.server_url must be a ws(s):// or http(s):// URL, got {:?}",
                b.server_url
            )));
        }
        if !b.api_url.starts_with("http://") && !b.api_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "bridge.api_url must be an http(s):// URL, got {:?}",
                b.api_url
            )));
        }
        for (name, value) in [
            ("bridge.heartbeat_interval_secs", b.heartbeat_interval_secs),
            ("bridge.connect_timeout_secs", b.connect_timeout_secs),
            ("bridge.request_timeout_secs", b.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.history.max_entries == 0 {
            return Err(ConfigError::Invalid("history.max_entries must be > 0".into()));
        }
        Ok(())
    }

    /// Session tunables derived from `[bridge]`.
    pub fn session_config(&self) -> SessionConfig {
        let b = &self.bridge;
        SessionConfig {
            connect_timeout: Duration::from_secs(b.connect_timeout_secs),
            request_timeout: Duration::from_secs(b.request_timeout_secs),
            heartbeat_interval: Duration::from_secs(b.heartbeat_interval_secs),
            reconnect: ReconnectPolicy::new(
                Duration::from_millis(b.reconnect_interval_ms),
                b.max_reconnect_attempts,
            ),
        }
    }

    /// History file path with `~/` expanded, if one is configured.
    pub fn history_path(&self) -> Option<PathBuf> {
        self.history.path.as_deref().map(|p| expand_home(p, std::env::var_os("HOME")))
    }
}

fn expand_home(path: &str, home: Option<std::ffi::OsString>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.bridge.server_url, "ws://localhost:8765");
        assert_eq!(config.bridge.api_url, "http://localhost:8766/api");
        assert!(config.bridge.auto_connect);
        assert!(config.bridge.stream_response);
        assert_eq!(config.history.max_entries, 100);
        assert!(config.history.path.is_none());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.session_config(), SessionConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bridge]
            server_url = "wss://bridge.example.com"
            max_reconnect_attempts = 2
            reconnect_interval_ms = 1000

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.bridge.server_url, "wss://bridge.example.com");
        assert_eq!(config.bridge.api_url, "http://localhost:8766/api");
        assert_eq!(config.logging.level, "debug");

        let session = config.session_config();
        assert_eq!(session.reconnect.max_attempts, 2);
        assert_eq!(session.reconnect.base_interval, Duration::from_millis(1000));
        assert_eq!(session.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("BRIDGE_SERVER_URL", "ws://10.0.0.2:9000"),
            ("BRIDGE_HISTORY_PATH", "/tmp/h.json"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| (*v).to_string()));
        assert_eq!(config.bridge.server_url, "ws://10.0.0.2:9000");
        assert_eq!(config.bridge.api_url, "http://localhost:8766/api");
        assert_eq!(config.history_path(), Some(PathBuf::from("/tmp/h.json")));
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = Config::default();
        config.bridge.server_url = "localhost:8765".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.bridge.request_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.history.max_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::Read { .. })
        ));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[bridge\nserver_url = ").unwrap();
        assert!(matches!(
            Config::from_file(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn home_expansion() {
        assert_eq!(
            expand_home("~/.bridge/h.json", Some("/home/me".into())),
            PathBuf::from("/home/me/.bridge/h.json")
        );
        assert_eq!(
            expand_home("~/h.json", None),
            PathBuf::from("~/h.json")
        );
        assert_eq!(
            expand_home("/abs/h.json", Some("/home/me".into())),
            PathBuf::from("/abs/h.json")
        );
    }
}
