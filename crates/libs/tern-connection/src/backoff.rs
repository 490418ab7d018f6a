//! Reconnection backoff.

use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Doubling delay between reconnection attempts, reset on success.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = INITIAL_DELAY
            .checked_mul(1u32 << self.attempt.min(5))
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
