//! Prompt builders for the code actions.
//!
//! Each action turns a language tag and a code selection into the message
//! text sent to the bridge, plus the [`RequestKind`] the bridge routes it by.

use crate::protocol::RequestKind;

/// Lines of context kept before the cursor line for a completion.
const COMPLETION_LINES_BEFORE: usize = 10;
/// Lines of context kept after the cursor line for a completion.
const COMPLETION_LINES_AFTER: usize = 5;

/// Code actions offered on a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeAction {
    /// Two or three sentence summary.
    ExplainBrief,
    ExplainDetailed,
    FindBugs,
    Fix,
    GenerateTests,
    Document,
    Refactor(RefactorGoal),
    /// Complete the code at the end of the input.
    Complete,
}

/// What a refactoring should aim for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefactorGoal {
    Readability,
    Performance,
    ErrorHandling,
    ExtractFunction,
    Simplify,
}

impl RefactorGoal {
    pub const ALL: [Self; 5] = [
        Self::Readability,
        Self::Performance,
        Self::ErrorHandling,
        Self::ExtractFunction,
        Self::Simplify,
    ];

    /// Short name used on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Readability => "readability",
            Self::Performance => "performance",
            Self::ErrorHandling => "error-handling",
            Self::ExtractFunction => "extract",
            Self::Simplify => "simplify",
        }
    }

    /// Phrase completing "Refactor this code to ...".
    pub fn instruction(self) -> &'static str {
        match self {
            Self::Readability => "improve readability",
            Self::Performance => "optimize performance",
            Self::ErrorHandling => "add error handling",
            Self::ExtractFunction => "extract function",
            Self::Simplify => "simplify logic",
        }
    }
}

impl std::str::FromStr for RefactorGoal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|goal| goal.as_str() == s)
            .ok_or_else(|| format!("unknown refactoring goal: {s}"))
    }
}

impl CodeAction {
    pub fn kind(self) -> RequestKind {
        match self {
            Self::ExplainBrief | Self::ExplainDetailed | Self::FindBugs => RequestKind::Explain,
            Self::Fix => RequestKind::Fix,
            Self::GenerateTests | Self::Document | Self::Refactor(_) | Self::Complete => {
                RequestKind::Code
            }
        }
    }

    /// Build the prompt for `code` written in `language`.
    pub fn prompt(self, language: &str, code: &str) -> String {
        let block = fenced(language, code);
        match self {
            Self::ExplainBrief => {
                format!("Briefly explain this {language} code in 2-3 sentences:\n\n{block}")
            }
            Self::ExplainDetailed => format!(
                "Provide a detailed explanation of this {language} code:\n\n{block}\n\n\
                 Include:\n\
                 1. What the code does\n\
                 2. How it works step by step\n\
                 3. Key concepts used\n\
                 4. Potential improvements or issues"
            ),
            Self::FindBugs => format!(
                "Analyze this {language} code for potential bugs, issues, and improvements:\n\n\
                 {block}\n\n\
                 List any:\n\
                 1. Bugs or errors\n\
                 2. Security vulnerabilities\n\
                 3. Performance issues\n\
                 4. Code style problems\n\
                 5. Suggested fixes"
            ),
            Self::Fix => format!("Fix this {language} code:\n{block}"),
            Self::GenerateTests => format!(
                "Generate unit tests for this {language} code using {}:\n\n{block}\n\n\
                 Include:\n\
                 1. Test for normal cases\n\
                 2. Edge cases\n\
                 3. Error cases\n\
                 4. Mocking if needed",
                test_framework(language)
            ),
            Self::Document => format!(
                "Add documentation/comments to this {language} code. Use the appropriate \
                 documentation style for {language}.\n\n{block}\n\nReturn only the documented code."
            ),
            Self::Refactor(goal) => format!(
                "Refactor this {language} code to {}:\n\n{block}\n\n\
                 Return only the refactored code.",
                goal.instruction()
            ),
            Self::Complete => {
                let (before, after) = cursor_context(code, code.len());
                complete_at_cursor(language, before, after)
            }
        }
    }
}

impl std::str::FromStr for CodeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explain" | "explain-brief" => Ok(Self::ExplainBrief),
            "explain-detailed" => Ok(Self::ExplainDetailed),
            "find-bugs" => Ok(Self::FindBugs),
            "fix" => Ok(Self::Fix),
            "tests" => Ok(Self::GenerateTests),
            "document" => Ok(Self::Document),
            "complete" => Ok(Self::Complete),
            "refactor" => Ok(Self::Refactor(RefactorGoal::Readability)),
            other => match other.strip_prefix("refactor-") {
                Some(goal) => goal.parse::<RefactorGoal>().map(Self::Refactor),
                None => Err(format!("unknown code action: {other}")),
            },
        }
    }
}

/// Free-form code generation request.
pub fn generate_code(description: &str) -> String {
    format!("Generate code: {description}")
}

/// Explain an error message and how to fix it.
pub fn explain_error(error_text: &str) -> String {
    format!(
        "Explain this error and suggest how to fix it:\n\n{}\n\n\
         Include:\n\
         1. What the error means\n\
         2. Common causes\n\
         3. How to fix it\n\
         4. Example fix if applicable",
        fenced("", error_text)
    )
}

/// Ask for the code to insert at a cursor. The cursor is marked with `|`
/// between `before` and `after`.
pub fn complete_at_cursor(language: &str, before: &str, after: &str) -> String {
    format!(
        "Complete the following {language} code at the cursor position (marked with |):\n\n\
         {}\n\n\
         Provide only the code to insert at the cursor position, without explanation.",
        fenced(language, &format!("{before}|{after}"))
    )
}

/// Text around byte offset `cursor`: from the start of the line ten lines
/// above it to the end of the line five lines below. An offset past the end
/// or inside a character is moved back to the nearest boundary.
pub fn cursor_context(text: &str, cursor: usize) -> (&str, &str) {
    let mut cursor = cursor.min(text.len());
    while !text.is_char_boundary(cursor) {
        cursor -= 1;
    }
    let (head, tail) = text.split_at(cursor);

    let start = head
        .rmatch_indices('\n')
        .nth(COMPLETION_LINES_BEFORE)
        .map_or(0, |(i, _)| i + 1);
    let end = tail
        .match_indices('\n')
        .nth(COMPLETION_LINES_AFTER)
        .map_or(tail.len(), |(i, _)| i);
    (&head[start..], &tail[..end])
}

/// First fenced code block of a reply, or the whole reply trimmed.
///
/// A fence only opens a block when it is followed by an optional word tag and
/// a newline; other backtick runs are skipped.
pub fn extract_code(content: &str) -> &str {
    let mut from = 0;
    while let Some(offset) = content[from..].find("```") {
        let after_fence = &content[from + offset + 3..];
        let tag_len = after_fence
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after_fence.len());
        if let Some(body) = after_fence[tag_len..].strip_prefix('\n') {
            return match body.find("```") {
                Some(end) => body[..end].trim(),
                None => content.trim(),
            };
        }
        from += offset + 3;
    }
    content.trim()
}

fn fenced(language: &str, code: &str) -> String {
    format!("```{language}\n{code}\n```")
}

fn test_framework(language: &str) -> &'static str {
    match language {
        "typescript" | "javascript" => "Jest",
        "python" => "pytest",
        "java" => "JUnit",
        "csharp" => "NUnit",
        "go" => "testing package",
        "rust" => "built-in test framework",
        _ => "appropriate test framework",
    }
}
