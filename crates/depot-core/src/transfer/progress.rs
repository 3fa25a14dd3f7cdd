//! Progress report throttling.

use std::time::{Duration, Instant};

/// Decides when a progress report is worth sending.
///
/// A report goes out when the percentage has advanced by at least `step`
/// points since the last one, or `interval` has passed. The same
/// percentage is never reported twice.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    step: u8,
    interval: Duration,
    last_percent: Option<u8>,
    last_at: Instant,
}

impl ProgressThrottle {
    pub fn new(step: u8, interval: Duration, now: Instant) -> Self {
        Self {
            step: step.clamp(1, 100),
            interval,
            last_percent: None,
            last_at: now,
        }
    }

    /// Last percentage reported, if any.
    pub fn last_percent(&self) -> Option<u8> {
        self.last_percent
    }

    /// Feed the running byte count. Returns the percentage to report, if any.
    pub fn observe(&mut self, transferred: u64, total: u64, now: Instant) -> Option<u8> {
        if total == 0 {
            return None;
        }
        let percent = (u128::from(transferred.min(total)) * 100 / u128::from(total)) as u8;
        let baseline = self.last_percent.unwrap_or(0);
        if percent <= baseline && (self.last_percent.is_some() || percent == 0) {
            return None;
        }

        let advanced = percent - baseline >= self.step;
        let elapsed = now.saturating_duration_since(self.last_at) >= self.interval;
        if !advanced && !elapsed {
            return None;
        }

        self.last_percent = Some(percent);
        self.last_at = now;
        Some(percent)
    }
}
