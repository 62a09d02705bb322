//! Redaction helpers for data that leaves the loop through events and logs.

use regex::Regex;
use serde_json::Value;

/// Upper bound, in characters, for argument and result previews.
pub const MAX_PREVIEW_CHARS: usize = 160;

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "private_key",
    "credential",
];

lazy_static::lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
    static ref CARD_NUMBER: Regex =
        Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`.
///
/// ```
/// use agentloop_core::redact::preview;
///
/// assert_eq!(preview("short", 10), "short");
/// assert_eq!(preview("héllo wörld", 5), "héllo...");
/// ```
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Replace the values of credential-like keys with `[REDACTED]`.
///
/// ```
/// use agentloop_core::redact::redact_value;
/// use serde_json::json;
///
/// let redacted = redact_value(&json!({"command": "deploy", "api_key": "sk-1"}));
/// assert_eq!(redacted, json!({"command": "deploy", "api_key": "[REDACTED]"}));
/// ```
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let lowered = key.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|k| lowered.contains(k)) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_value(val))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

/// Mask e-mail addresses and card numbers in free text.
pub fn redact_text(text: &str) -> String {
    let masked = EMAIL.replace_all(text, "[EMAIL]");
    CARD_NUMBER.replace_all(&masked, "[CARD]").into_owned()
}

/// Redacted single-line preview of tool arguments for events.
pub fn summarize_arguments(arguments: &Value) -> String {
    preview(&redact_text(&redact_value(arguments).to_string()), MAX_PREVIEW_CHARS)
}

/// Redacted preview of tool output for events.
pub fn summarize_output(output: &str) -> String {
    preview(
        &redact_text(&WHITESPACE.replace_all(output.trim(), " ")),
        MAX_PREVIEW_CHARS,
    )
}
