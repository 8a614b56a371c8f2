//! Transfer pacing
//!
//! Deadlines for bulk data grow with payload size so that a transfer moving
//! at least `min_kbps` is never cut off, while a stalled peer still is.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPace {
    base: Duration,
    min_kbps: u64,
}

impl TransferPace {
    pub fn new(base: Duration, min_kbps: u64) -> Self {
        Self {
            base,
            min_kbps: min_kbps.max(1),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Deadline for moving `bytes` of payload.
    pub fn deadline_for(&self, bytes: u64) -> Duration {
        let bytes_per_sec = self.min_kbps.saturating_mul(1024);
        let millis = bytes.saturating_mul(1000) / bytes_per_sec;
        self.base.saturating_add(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_gets_base_deadline() {
        let pace = TransferPace::new(Duration::from_secs(2), 5);
        assert_eq!(pace.deadline_for(0), Duration::from_secs(2));
    }

    #[test]
    fn test_deadline_scales_with_size() {
        let pace = TransferPace::new(Duration::from_secs(2), 5);
        // 50 KiB at 5 KiB/s is ten seconds on top of the base.
        assert_eq!(pace.deadline_for(50 * 1024), Duration::from_secs(12));
        assert!(pace.deadline_for(1024 * 1024) > pace.deadline_for(50 * 1024));
    }

    #[test]
    fn test_huge_payload_saturates() {
        let pace = TransferPace::new(Duration::from_secs(2), 5);
        assert!(pace.deadline_for(u64::MAX) > Duration::from_secs(60 * 60 * 24 * 365));
    }
}
