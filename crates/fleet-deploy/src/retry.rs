//! `[retry k/max]` markers embedded in stored error messages.
//!
//! The marker records how many automatic re-deliveries a site has had for
//! a deployment so the count survives restarts without an extra column.

use std::sync::LazyLock;

use regex::Regex;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[retry (\d+)/(\d+)\]\s*").expect("retry marker pattern is valid")
});

/// Retries already recorded in `message` (0 without a marker).
pub fn retry_count(message: &str) -> u32 {
    MARKER
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// The message without its marker.
pub fn strip_marker(message: &str) -> &str {
    match MARKER.find(message) {
        Some(m) => &message[m.end()..],
        None => message,
    }
}

/// Replace any existing marker with `[retry attempt/max]`.
pub fn with_marker(message: &str, attempt: u32, max: u32) -> String {
    format!("[retry {attempt}/{max}] {}", strip_marker(message))
}
