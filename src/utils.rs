use std::time::{Duration, Instant};

/// Format a `Duration` for log fields, scaling the unit automatically
/// (`1.94ms`, `2.34s`).
pub fn fmt_duration(d: Duration) -> String {
    format!("{d:.2?}")
}

/// Warn when `start` is more than `threshold` in the past.
pub fn log_if_slow(start: Instant, threshold: Duration, operation: &str) {
    let elapsed = start.elapsed();
    if elapsed > threshold {
        tracing::warn!(
            operation,
            duration = fmt_duration(elapsed),
            threshold = fmt_duration(threshold),
            "slow operation"
        );
    }
}

/// Cut `text` to at most `max` bytes without splitting a character.
pub fn truncate_utf8(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
