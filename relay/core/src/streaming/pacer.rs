//! Outbound pacing
//!
//! Enforces a minimum delay before every unit handed to the transport so a
//! client is never flooded faster than it can render.

use std::time::Duration;

/// Process-wide delay applied before each outbound unit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pacer {
    delay: Duration,
}

impl Pacer {
    /// Create a pacer with the given inter-unit delay
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// A pacer that never waits
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// The configured delay
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Suspend the caller for the configured delay
    ///
    /// Returns immediately when the delay is zero.
    pub async fn pace(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}
