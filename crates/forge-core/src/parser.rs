//! Structured response extraction from free oracle text.
//!
//! Three strategies are tried in order:
//! - `Strict`: the whole text is JSON.
//! - `Embedded`: the first balanced `{...}` span inside surrounding prose.
//! - `Repaired`: the same span with raw newlines, carriage returns and tabs
//!   escaped inside string literals.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("response is empty")]
    Empty,
    #[error("no JSON object found in response")]
    NoObject,
    #[error("malformed JSON object: {0}")]
    Malformed(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Which strategy produced a parsed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Strict,
    Embedded,
    Repaired,
}

impl ParseStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Embedded => "embedded",
            Self::Repaired => "repaired",
        }
    }
}

/// A value and the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed<T> {
    pub value: T,
    pub strategy: ParseStrategy,
}

/// Parse a typed response out of oracle output.
///
/// # Example
/// ```
/// use forge_core::parser::{parse_response, ParseStrategy};
/// use forge_core::OracleResponse;
///
/// let text = "Here you go:\n{\"isTaskComplete\": true, \"completionReason\": \"done\"}\nBye.";
/// let parsed = parse_response::<OracleResponse>(text).unwrap();
/// assert!(parsed.value.is_task_complete);
/// assert_eq!(parsed.strategy, ParseStrategy::Embedded);
/// ```
pub fn parse_response<T: DeserializeOwned>(text: &str) -> Result<Parsed<T>> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    if let Ok(value) = parse_strict(text) {
        return Ok(Parsed {
            value,
            strategy: ParseStrategy::Strict,
        });
    }

    let span = extract_json_span(text).ok_or(ParseError::NoObject)?;

    match serde_json::from_str(span) {
        Ok(value) => Ok(Parsed {
            value,
            strategy: ParseStrategy::Embedded,
        }),
        Err(_) => {
            let value = parse_repaired(span)?;
            Ok(Parsed {
                value,
                strategy: ParseStrategy::Repaired,
            })
        }
    }
}

/// Whole-text parse.
pub fn parse_strict<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text.trim()).map_err(ParseError::Malformed)
}

/// Parse the first JSON object span found in `text`.
pub fn parse_embedded<T: DeserializeOwned>(text: &str) -> Result<T> {
    let span = extract_json_span(text).ok_or(ParseError::NoObject)?;
    serde_json::from_str(span).map_err(ParseError::Malformed)
}

/// Parse the first JSON object span after escaping control characters in strings.
pub fn parse_repaired<T: DeserializeOwned>(text: &str) -> Result<T> {
    let span = extract_json_span(text).ok_or(ParseError::NoObject)?;
    serde_json::from_str(&escape_control_chars_in_strings(span)).map_err(ParseError::Malformed)
}

// --- Span extraction ---

/// Locate the first balanced `{...}` span, ignoring braces inside strings.
///
/// When the object never closes (truncated output), falls back to the text
/// between the first `{` and the last `}`.
pub fn extract_json_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Escape raw `\n`, `\r` and `\t` occurring inside JSON string literals.
///
/// Whitespace between tokens is left alone.
pub fn escape_control_chars_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }

        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }

        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }

    out
}
