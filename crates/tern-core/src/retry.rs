//! Failure classification for LLM adapter errors, plus the retry policy.
//!
//! Adapters surface failures as plain text, so classification works on
//! the message. Three classes matter because each has its own recovery:
//! context overflow triggers compaction, transient failures back off
//! and retry, everything else is permanent and surfaces to the caller.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ErrorKind;

/// Retry policy for transient LLM errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Attempts after the first before giving up.
    pub limit: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the nth attempt: the initial delay doubled per prior
    /// attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

/// Phrases providers use when a request no longer fits the model's
/// context window. Matched case-insensitively against the raw error.
const OVERFLOW_MARKERS: &[&str] = &[
    "context length",
    "context window",
    "too many tokens",
    "prompt is too long",
    "input is too long",
    "request too large",
];

/// Connection-level interruptions worth retrying: the stream died, not
/// the request.
const INTERRUPTION_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "timed out",
    "unexpected eof",
    "end of stream",
];

/// Rate limiting and server-side failure statuses (429, 5xx) embedded
/// anywhere in the error text.
static RETRYABLE_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(429|5\d{2})\b").expect("static status pattern"));

pub fn is_context_overflow(error: &str) -> bool {
    let lower = error.to_lowercase();
    OVERFLOW_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn is_transient(error: &str) -> bool {
    if is_context_overflow(error) {
        return false;
    }
    if RETRYABLE_STATUS.is_match(error) {
        return true;
    }
    let lower = error.to_lowercase();
    INTERRUPTION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Map a raw adapter error to its recovery class. Overflow wins over
/// transient markers since the recovery differs (compaction, not
/// backoff).
pub fn classify_llm_error(error: &str) -> ErrorKind {
    if is_context_overflow(error) {
        ErrorKind::ContextLengthExceeded
    } else if is_transient(error) {
        ErrorKind::LlmTransient
    } else {
        ErrorKind::LlmPermanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_detection() {
        assert!(is_context_overflow("maximum context length exceeded"));
        assert!(is_context_overflow("Prompt is too long: 210000 tokens"));
        assert!(is_context_overflow("input exceeds the context window"));
        assert!(is_context_overflow("request too large for this model"));
        assert!(!is_context_overflow("rate limited, try again"));
    }

    #[test]
    fn transient_detection() {
        assert!(is_transient("HTTP 503 Service Unavailable"));
        assert!(is_transient("status 429"));
        assert!(is_transient("connection reset by peer"));
        assert!(is_transient("unexpected EOF while reading stream"));
        assert!(is_transient("request timed out"));
        // Overflow is never transient, even with a status code attached.
        assert!(!is_transient("too many tokens (400)"));
        assert!(!is_transient("invalid api key"));
        // 4xx other than 429 is not retryable.
        assert!(!is_transient("HTTP 403 Forbidden"));
    }

    #[test]
    fn classification() {
        assert_eq!(
            classify_llm_error("context length exceeded"),
            ErrorKind::ContextLengthExceeded
        );
        assert_eq!(classify_llm_error("HTTP 502 Bad Gateway"), ErrorKind::LlmTransient);
        assert_eq!(classify_llm_error("permission denied"), ErrorKind::LlmPermanent);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }
}
