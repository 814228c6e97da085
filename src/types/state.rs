//! Exposure state, progress events and outcomes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{ObservationTime, PixelBuffer};
use crate::{CameraError, Result};

/// Percent value emitted once when an exposure reaches a terminal outcome.
///
/// Anything above 100.0 is terminal; this value distinguishes "just finished"
/// from an integration that is sitting at 100% while readout starts.
pub const COMPLETION_PERCENT: f64 = 100.001;

/// Canonical camera state owned by the exposure state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExposureState {
    /// Device failure; no commands are accepted until reconnect
    Error,
    /// Ready to start an exposure
    Idle,
    /// Sensor is integrating
    Exposing,
    /// Integration finished, frame transfer in progress
    ImageReady,
}

impl ExposureState {
    /// True while an exposure is in flight (integrating or reading out).
    pub fn is_busy(self) -> bool {
        matches!(self, ExposureState::Exposing | ExposureState::ImageReady)
    }
}

impl fmt::Display for ExposureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExposureState::Error => "in error",
            ExposureState::Idle => "idle",
            ExposureState::Exposing => "exposing",
            ExposureState::ImageReady => "reading out",
        };
        f.write_str(name)
    }
}

/// Progress event delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureProgress {
    /// Seconds of integration left
    pub time_remaining: f64,
    /// Integration progress; above 100.0 means the exposure has ended
    pub percent: f64,
    /// State reported with this event. Terminal events use `ImageReady` for
    /// success, `Idle` for abort and `Error` for failure.
    pub status: ExposureState,
}

impl ExposureProgress {
    /// Progress of an integration that started `elapsed` ago.
    pub fn integrating(elapsed: Duration, requested: Duration) -> Self {
        let requested_s = requested.as_secs_f64();
        let elapsed_s = elapsed.as_secs_f64();
        let remaining = requested_s - elapsed_s;
        if remaining <= 0.0 || requested_s < 1e-6 {
            return Self { time_remaining: 0.0, percent: 100.0, status: ExposureState::Exposing };
        }
        Self {
            time_remaining: remaining,
            percent: (elapsed_s * 100.0 / requested_s).min(100.0),
            status: ExposureState::Exposing,
        }
    }

    /// Terminal event.
    pub fn finished(status: ExposureState) -> Self {
        Self { time_remaining: 0.0, percent: COMPLETION_PERCENT, status }
    }

    /// Whether this event closes the exposure.
    pub fn is_terminal(&self) -> bool {
        self.percent > 100.0
    }
}

/// How an exposure ended.
#[derive(Debug, Clone)]
pub enum ExposureOutcome {
    /// Frame fully transferred
    Completed(Arc<PixelBuffer>),
    /// Cancelled by the caller or the watchdog
    Aborted,
    /// Transfer ended with packets missing
    Incomplete { frame_id: Option<u16>, received: usize, expected: usize, missing: Vec<(u32, u32)> },
    /// Device failure
    Failed(String),
}

impl ExposureOutcome {
    /// Pixel data when the exposure completed.
    pub fn frame(&self) -> Option<&Arc<PixelBuffer>> {
        match self {
            ExposureOutcome::Completed(frame) => Some(frame),
            _ => None,
        }
    }

    pub(crate) fn from_error(error: &CameraError) -> Self {
        match error {
            CameraError::FrameIncomplete { frame_id, received, expected, missing } => {
                ExposureOutcome::Incomplete {
                    frame_id: *frame_id,
                    received: *received,
                    expected: *expected,
                    missing: missing.clone(),
                }
            }
            CameraError::Aborted => ExposureOutcome::Aborted,
            other => ExposureOutcome::Failed(other.to_string()),
        }
    }

    /// The frame, or the error that ended the exposure.
    pub fn into_result(self) -> Result<Arc<PixelBuffer>> {
        match self {
            ExposureOutcome::Completed(frame) => Ok(frame),
            ExposureOutcome::Aborted => Err(CameraError::Aborted),
            ExposureOutcome::Incomplete { frame_id, received, expected, missing } => {
                Err(CameraError::FrameIncomplete { frame_id, received, expected, missing })
            }
            ExposureOutcome::Failed(reason) => Err(CameraError::device_fatal(reason)),
        }
    }
}

/// Point-in-time copy of the state machine.
#[derive(Debug, Clone)]
pub struct ExposureSnapshot {
    pub state: ExposureState,
    /// Monotonic start of the current (or last) exposure
    pub started_at: Option<Instant>,
    /// Wall-clock timestamps of the current (or last) exposure
    pub observation: Option<ObservationTime>,
    pub requested_duration: Duration,
    pub aborted: bool,
    pub last_error: Option<String>,
    /// Result of the last finished exposure
    pub outcome: Option<ExposureOutcome>,
    /// Exposures started since connect; lets waiters tell one exposure from the next
    pub sequence: u64,
}

impl ExposureSnapshot {
    /// Fresh snapshot for a newly connected camera.
    pub fn idle() -> Self {
        Self {
            state: ExposureState::Idle,
            started_at: None,
            observation: None,
            requested_duration: Duration::ZERO,
            aborted: false,
            last_error: None,
            outcome: None,
            sequence: 0,
        }
    }

    /// Time since the exposure started.
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.started_at.map(|start| now.saturating_duration_since(start))
    }
}

impl Default for ExposureSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrating_progress_caps_at_hundred() {
        let half = ExposureProgress::integrating(Duration::from_secs(1), Duration::from_secs(2));
        assert!((half.percent - 50.0).abs() < 1e-9);
        assert!((half.time_remaining - 1.0).abs() < 1e-9);
        assert!(!half.is_terminal());

        let over = ExposureProgress::integrating(Duration::from_secs(3), Duration::from_secs(2));
        assert_eq!(over.percent, 100.0);
        assert_eq!(over.time_remaining, 0.0);
        assert!(!over.is_terminal());
    }

    #[test]
    fn zero_duration_is_immediately_integrated() {
        let bias = ExposureProgress::integrating(Duration::ZERO, Duration::ZERO);
        assert_eq!(bias.percent, 100.0);
    }

    #[test]
    fn finished_events_are_terminal() {
        let done = ExposureProgress::finished(ExposureState::ImageReady);
        assert!(done.is_terminal());
        assert_eq!(done.percent, COMPLETION_PERCENT);
    }

    #[test]
    fn outcomes_map_back_to_errors() {
        let incomplete = CameraError::FrameIncomplete {
            frame_id: Some(1),
            received: 5,
            expected: 8,
            missing: vec![(2, 2)],
        };
        let outcome = ExposureOutcome::from_error(&incomplete);
        assert!(matches!(
            outcome.into_result(),
            Err(CameraError::FrameIncomplete { received: 5, expected: 8, .. })
        ));
        assert!(matches!(ExposureOutcome::Aborted.into_result(), Err(CameraError::Aborted)));

        let frame = Arc::new(PixelBuffer::new(vec![1, 0], 1, 1, None));
        assert_eq!(ExposureOutcome::Completed(frame).into_result().unwrap().pixel(0, 0), Some(1));
    }

    #[test]
    fn busy_states() {
        assert!(ExposureState::Exposing.is_busy());
        assert!(ExposureState::ImageReady.is_busy());
        assert!(!ExposureState::Idle.is_busy());
        assert!(!ExposureState::Error.is_busy());
    }
}
