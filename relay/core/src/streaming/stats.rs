//! Per-request streaming statistics

use std::time::{Duration, Instant};

use crate::messages::UnitStatus;

/// Statistics for one relayed request
#[derive(Clone, Debug)]
pub struct StreamStats {
    /// Fragments received from upstream
    pub fragments_received: u32,
    /// Characters received from upstream
    pub chars_received: usize,
    /// Content units delivered to the client
    pub units_sent: u32,
    /// When the request started
    pub started_at: Instant,
    /// Last fragment received timestamp
    pub last_fragment_at: Option<Instant>,
    /// When the first content unit was delivered
    pub first_unit_at: Option<Instant>,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStats {
    /// Start tracking a request now
    #[must_use]
    pub fn new() -> Self {
        Self {
            fragments_received: 0,
            chars_received: 0,
            units_sent: 0,
            started_at: Instant::now(),
            last_fragment_at: None,
            first_unit_at: None,
        }
    }

    /// Record an upstream fragment
    pub fn record_fragment(&mut self, fragment: &str) {
        self.fragments_received += 1;
        self.chars_received += fragment.chars().count();
        self.last_fragment_at = Some(Instant::now());
    }

    /// Record a delivered content unit
    pub fn record_unit(&mut self) {
        self.units_sent += 1;
        if self.first_unit_at.is_none() {
            self.first_unit_at = Some(Instant::now());
        }
    }

    /// Time since the request started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time from request start to the first delivered unit
    #[must_use]
    pub fn time_to_first_unit(&self) -> Option<Duration> {
        self.first_unit_at.map(|t| t.duration_since(self.started_at))
    }

    /// Emit a summary line for the finished request
    pub fn log_summary(&self, status: UnitStatus) {
        tracing::info!(
            status = ?status,
            fragments = self.fragments_received,
            chars = self.chars_received,
            units = self.units_sent,
            ttfu_ms = self.time_to_first_unit().map(millis),
            elapsed_ms = millis(self.elapsed()),
            "Request finished"
        );
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting() {
        let mut stats = StreamStats::new();
        stats.record_fragment("héllo");
        stats.record_fragment(" ");
        stats.record_unit();
        stats.record_unit();

        assert_eq!(stats.fragments_received, 2);
        assert_eq!(stats.chars_received, 6);
        assert_eq!(stats.units_sent, 2);
        assert!(stats.last_fragment_at.is_some());
        assert!(stats.time_to_first_unit().is_some());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_no_units_means_no_ttfu() {
        let stats = StreamStats::default();
        assert!(stats.time_to_first_unit().is_none());
    }
}
