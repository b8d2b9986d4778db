//! Retry classification and exponential backoff for segment fetches.

use std::time::Duration;
use thiserror::Error;

/// Coarse failure kind used to decide whether a segment fetch is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect or read timed out.
    Timeout,
    /// Server asked us to slow down (429).
    Throttled,
    /// Connection reset, refused, DNS, truncated body.
    Connection,
    /// Retryable server error.
    Http5xx(u16),
    /// Anything else; not retried.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff: `base_delay * 2^(attempt-1)`, capped at `max_delay`, for at most
/// `max_attempts` attempts (the first attempt included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// `attempt` is 1-based and names the attempt that just failed.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        match kind {
            ErrorKind::Other => RetryDecision::NoRetry,
            ErrorKind::Timeout
            | ErrorKind::Connection
            | ErrorKind::Throttled
            | ErrorKind::Http5xx(_) => RetryDecision::RetryAfter(self.delay_for(attempt)),
        }
    }

    /// Delay slept after the given failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// Delays slept for a segment that keeps failing with a retryable error.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.delay_for(a)).collect()
    }
}

/// Why a single fetch attempt failed.
#[derive(Debug, Error)]
pub enum SegmentFailure {
    /// Server answered with a non-success status.
    #[error("HTTP {0}")]
    Http(u16),
    /// Transport-level failure reported by the HTTP client.
    #[error("{0}")]
    Transport(#[source] reqwest::Error),
    /// Writing the segment to disk failed. Not retried.
    #[error("storage: {0}")]
    Storage(#[source] std::io::Error),
}

pub fn classify_http_status(code: u16) -> ErrorKind {
    match code {
        429 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code),
        _ => ErrorKind::Other,
    }
}

pub fn classify_transport(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        return ErrorKind::Timeout;
    }
    if let Some(status) = e.status() {
        return classify_http_status(status.as_u16());
    }
    if e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}

pub fn classify(failure: &SegmentFailure) -> ErrorKind {
    match failure {
        SegmentFailure::Http(code) => classify_http_status(*code),
        SegmentFailure::Transport(e) => classify_transport(e),
        SegmentFailure::Storage(_) => ErrorKind::Other,
    }
}
