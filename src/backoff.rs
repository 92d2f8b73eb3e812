//! # Reconnect Backoff
//!
//! Capped exponential backoff shared by the inbound receive loop and the
//! outbound sink workers.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Largest exponent applied to the base delay
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff policy: `base * 2^attempt`, never above `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a policy; `max` is raised to `base` if smaller
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Sleep for the given attempt's delay
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.delay(attempt)) => true,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
