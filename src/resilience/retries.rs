//! Upstream retry policy.

use std::time::Duration;

use crate::resilience::backoff::calculate_backoff;

/// When a session may re-dispatch to another upstream.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts after the first (K in the retry contract).
    pub max_retries: u32,

    /// Base delay for exponential backoff.
    pub base_delay_ms: u64,

    /// Delay cap.
    pub max_delay_ms: u64,

    /// How long a failing target sits out of rotation.
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            cooldown: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed. `retries_done` counts prior
    /// re-dispatches; `response_started` means at least one response
    /// byte has been forwarded to the client; after that, never retry.
    pub fn can_retry(&self, retries_done: u32, response_started: bool) -> bool {
        !response_started && retries_done < self.max_retries
    }

    /// Backoff before attempt number `retries_done + 1`.
    pub fn delay(&self, retries_done: u32) -> Duration {
        calculate_backoff(retries_done + 1, self.base_delay_ms, self.max_delay_ms)
    }
}
