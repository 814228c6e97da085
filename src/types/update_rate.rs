//! Update rate control for exposure progress streams

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Update rate for progress subscribers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every event the watchdog produces (10 Hz by default)
    Native,

    /// Throttled to at most this many events per second.
    /// Terminal events are always delivered regardless of rate.
    Max(u32),
}

impl UpdateRate {
    /// Normalize rate against the watchdog frequency
    pub fn normalize(self, source_hz: f64) -> Self {
        match self {
            UpdateRate::Native => UpdateRate::Native,
            UpdateRate::Max(0) => UpdateRate::Native,
            UpdateRate::Max(hz) if hz as f64 >= source_hz => UpdateRate::Native,
            UpdateRate::Max(hz) => UpdateRate::Max(hz),
        }
    }

    /// Throttle interval, if any
    pub fn throttle_interval(self, source_hz: f64) -> Option<Duration> {
        match self.normalize(source_hz) {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_at_or_above_source_are_native() {
        assert_eq!(UpdateRate::Max(10).normalize(10.0), UpdateRate::Native);
        assert_eq!(UpdateRate::Max(0).normalize(10.0), UpdateRate::Native);
        assert_eq!(UpdateRate::Max(2).throttle_interval(10.0), Some(Duration::from_millis(500)));
        assert_eq!(UpdateRate::Native.throttle_interval(10.0), None);
    }
}
