//! Response decoding that reports where in the payload a mismatch happened.

use serde::de::DeserializeOwned;
use std::fmt;

/// Characters of the offending line shown on each side of the error column.
const SNIPPET_RADIUS: usize = 24;

/// A decode failure located by serde path and line/column.
#[derive(Debug)]
pub struct JsonError {
    /// Dotted path to the failing field, empty at the document root.
    pub path: String,
    pub detail: String,
    pub line: usize,
    pub column: usize,
    pub snippet: String,
}

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.path.is_empty() && self.path != "." {
            write!(f, "at path '{}': ", self.path)?;
        }
        write!(
            f,
            "{} (line {} col {})\n{}",
            self.detail, self.line, self.column, self.snippet
        )
    }
}

impl std::error::Error for JsonError {}

/// Decode `body`, keeping the serde path and a snippet of the payload on failure.
pub fn parse_json_with_context<T: DeserializeOwned>(body: &str) -> Result<T, JsonError> {
    let deserializer = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(deserializer).map_err(|err| {
        let path = err.path().to_string();
        let inner = err.into_inner();
        let (line, column) = (inner.line(), inner.column());
        let message = inner.to_string();
        let suffix = format!(" at line {line} column {column}");
        let message = message.strip_suffix(&suffix).unwrap_or(&message);

        JsonError {
            path,
            detail: describe_mismatch(message),
            line,
            column,
            snippet: snippet_at(body, line, column),
        }
    })
}

/// "invalid type: null, expected a string" reads better as
/// "expected a string, got null".
fn describe_mismatch(message: &str) -> String {
    message
        .strip_prefix("invalid type: ")
        .or_else(|| message.strip_prefix("invalid value: "))
        .and_then(|rest| rest.split_once(", expected "))
        .map(|(actual, expected)| format!("expected {expected}, got {actual}"))
        .unwrap_or_else(|| message.to_owned())
}

/// The part of line `line` around `column`, with a caret under the column.
/// Portal responses are usually one long line, so only a window is shown.
fn snippet_at(body: &str, line: usize, column: usize) -> String {
    let text = body.lines().nth(line.saturating_sub(1)).unwrap_or_default();
    if text.is_empty() {
        return "(empty line)".to_owned();
    }

    let offset = column.saturating_sub(1).min(text.len());
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let at = chars.partition_point(|&(i, _)| i < offset);
    let from = at.saturating_sub(SNIPPET_RADIUS);
    let to = (at + SNIPPET_RADIUS).min(chars.len());

    let start = chars.get(from).map_or(text.len(), |&(i, _)| i);
    let end = chars.get(to).map_or(text.len(), |&(i, _)| i);
    let caret = " ".repeat(at - from) + "^";

    format!("...{}...\n   {caret}", &text[start..end])
}
