//! Retry policy for streaming sessions
//!
//! A failed session is never resumed. A retry opens a brand-new session and
//! sends the same buffered utterance again.

use std::time::Duration;

use crate::Error;

/// Retry policy for session failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of fresh sessions after the first one fails
    pub max_retries: u32,
    /// Pause before each fresh session
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once_after(Duration::from_millis(250))
    }
}

impl RetryPolicy {
    /// Single retry after `delay`
    #[must_use]
    pub const fn once_after(delay: Duration) -> Self {
        Self {
            max_retries: 1,
            delay,
        }
    }

    /// Whether attempt number `attempt` (0-based) may be followed by another
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Whether a session error is worth a fresh session
///
/// Deadlines and transport drops are transient. Authentication failures need
/// an operator and are never retried.
#[must_use]
pub const fn is_recoverable(error: &Error) -> bool {
    error.is_retryable()
}
