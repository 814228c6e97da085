//! Backend-agnostic exposure state machine.
//!
//! The machine is the only owner of the canonical [`ExposureSnapshot`]. It
//! lives in a `tokio::sync::watch` channel: every transition runs inside
//! `send_if_modified`, which holds the channel's lock for the whole
//! check-and-update, so transitions are totally ordered and no two callers are
//! ever mid-transition. Waiters use `wait_for`, which re-checks the predicate
//! under the same lock and therefore never misses a wake-up.
//!
//! ```text
//! Idle ──begin──▶ Exposing ──mark_readout──▶ ImageReady ──complete──▶ Idle
//!                    │                           │
//!                    └───────────abort───────────┴──────────────────▶ Idle
//! any ──fail──▶ Error   (terminal until reconnect)
//! ```
//!
//! Progress events go out on a broadcast channel: one per watchdog tick while
//! integrating, and exactly one terminal event per exposure.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::types::{
    ExposureOutcome, ExposureProgress, ExposureSnapshot, ExposureState, ObservationTime,
    PixelBuffer,
};
use crate::{CameraError, Result};

const PROGRESS_CAPACITY: usize = 64;

/// Shared handle to the exposure state machine.
///
/// Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct ExposureStateMachine {
    state: Arc<watch::Sender<ExposureSnapshot>>,
    progress: broadcast::Sender<ExposureProgress>,
}

impl Default for ExposureStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExposureStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ExposureSnapshot::idle());
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self { state: Arc::new(state), progress }
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> ExposureSnapshot {
        self.state.borrow().clone()
    }

    pub fn state(&self) -> ExposureState {
        self.state.borrow().state
    }

    /// Watch every state change
    pub fn subscribe(&self) -> watch::Receiver<ExposureSnapshot> {
        self.state.subscribe()
    }

    /// Receive progress events
    pub fn progress(&self) -> broadcast::Receiver<ExposureProgress> {
        self.progress.subscribe()
    }

    /// `Idle → Exposing`. Returns the new exposure's sequence number.
    ///
    /// Rejected in any other state; the running exposure's timestamps are
    /// left untouched.
    pub fn begin(&self, duration: Duration) -> Result<u64> {
        let mut outcome = Err(ExposureState::Idle);
        self.state.send_if_modified(|snapshot| {
            if snapshot.state != ExposureState::Idle {
                outcome = Err(snapshot.state);
                return false;
            }
            snapshot.state = ExposureState::Exposing;
            snapshot.started_at = Some(Instant::now().into_std());
            snapshot.observation = Some(ObservationTime::now());
            snapshot.requested_duration = duration;
            snapshot.aborted = false;
            snapshot.last_error = None;
            snapshot.outcome = None;
            snapshot.sequence += 1;
            outcome = Ok(snapshot.sequence);
            true
        });

        match outcome {
            Ok(sequence) => {
                info!(sequence, duration = ?duration, "exposure started");
                Ok(sequence)
            }
            Err(state) => {
                debug!(%state, "start rejected");
                Err(CameraError::invalid_state("start exposure", state))
            }
        }
    }

    /// `Exposing → ImageReady` on the first data packet, unless aborted.
    ///
    /// Idempotent; returns whether this call made the transition.
    pub fn mark_readout(&self) -> bool {
        let changed = self.state.send_if_modified(|snapshot| {
            if snapshot.state != ExposureState::Exposing || snapshot.aborted {
                return false;
            }
            snapshot.state = ExposureState::ImageReady;
            if let Some(observation) = snapshot.observation.as_mut() {
                observation.mark_end(Utc::now());
            }
            true
        });
        if changed {
            debug!("integration finished, reading out");
        }
        changed
    }

    /// `(Exposing|ImageReady) → Idle` with the transferred frame.
    ///
    /// Ignored once the exposure was aborted or failed.
    pub fn complete(&self, frame: PixelBuffer) -> bool {
        let frame = Arc::new(frame);
        let changed = self.state.send_if_modified(|snapshot| {
            if !snapshot.state.is_busy() || snapshot.aborted {
                return false;
            }
            snapshot.state = ExposureState::Idle;
            snapshot.outcome = Some(ExposureOutcome::Completed(frame.clone()));
            true
        });
        if changed {
            info!(bytes = frame.len(), frame_id = ?frame.frame_id, "exposure complete");
            self.emit(ExposureProgress::finished(ExposureState::ImageReady));
        }
        changed
    }

    /// `(Exposing|ImageReady) → Idle`, flagging the exposure as aborted.
    ///
    /// Wakes anyone waiting for the frame. Returns false when nothing was in
    /// flight.
    pub fn abort(&self) -> bool {
        let changed = self.state.send_if_modified(|snapshot| {
            if !snapshot.state.is_busy() {
                return false;
            }
            snapshot.state = ExposureState::Idle;
            snapshot.aborted = true;
            snapshot.outcome = Some(ExposureOutcome::Aborted);
            true
        });
        if changed {
            info!("exposure aborted");
            self.emit(ExposureProgress::finished(ExposureState::Idle));
        }
        changed
    }

    /// `(Exposing|ImageReady) → Idle` after a transfer failure.
    ///
    /// The camera stays usable; the error is kept as the exposure's outcome.
    pub fn fail_exposure(&self, error: &CameraError) -> bool {
        let outcome = ExposureOutcome::from_error(error);
        let reason = error.to_string();
        let changed = self.state.send_if_modified(|snapshot| {
            if !snapshot.state.is_busy() || snapshot.aborted {
                return false;
            }
            snapshot.state = ExposureState::Idle;
            snapshot.last_error = Some(reason.clone());
            snapshot.outcome = Some(outcome);
            true
        });
        if changed {
            warn!(error = %reason, "exposure failed");
            self.emit(ExposureProgress::finished(ExposureState::Idle));
        }
        changed
    }

    /// `any → Error`. Terminal until [`reset`](Self::reset).
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.state.send_if_modified(|snapshot| {
            if snapshot.state == ExposureState::Error {
                return false;
            }
            if snapshot.state.is_busy() {
                snapshot.outcome = Some(ExposureOutcome::Failed(reason.clone()));
            }
            snapshot.state = ExposureState::Error;
            snapshot.last_error = Some(reason.clone());
            true
        });
        if changed {
            error!(reason = %reason, "camera entered error state");
            self.emit(ExposureProgress::finished(ExposureState::Error));
        }
        changed
    }

    /// Back to `Idle` after a reconnect. Keeps the sequence counter.
    pub fn reset(&self) {
        self.state.send_modify(|snapshot| {
            let sequence = snapshot.sequence;
            *snapshot = ExposureSnapshot { sequence, ..ExposureSnapshot::idle() };
        });
        debug!("state machine reset");
    }

    /// Broadcast an integration progress event, if integrating.
    pub fn emit_progress(&self, now: Instant) -> Option<ExposureProgress> {
        let progress = {
            let snapshot = self.state.borrow();
            if snapshot.state != ExposureState::Exposing {
                return None;
            }
            let elapsed = snapshot.elapsed(now.into_std()).unwrap_or_default();
            ExposureProgress::integrating(elapsed, snapshot.requested_duration)
        };
        self.emit(progress);
        Some(progress)
    }

    /// Wait until exposure `sequence` is no longer in flight.
    pub async fn wait_settled(&self, sequence: u64) -> ExposureSnapshot {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.sequence != sequence || !s.state.is_busy()).await {
            Ok(snapshot) => snapshot.clone(),
            // The sender lives in `self`, so the channel cannot close here
            Err(_) => self.snapshot(),
        }
    }

    fn emit(&self, progress: ExposureProgress) {
        // No subscribers is fine
        let _ = self.progress.send(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> PixelBuffer {
        PixelBuffer::new(vec![0; 8], 2, 2, Some(1))
    }

    #[tokio::test]
    async fn full_lifecycle_emits_one_terminal_event() {
        let machine = ExposureStateMachine::new();
        let mut progress = machine.progress();

        let sequence = machine.begin(Duration::from_secs(1)).unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(machine.state(), ExposureState::Exposing);
        assert!(machine.emit_progress(Instant::now()).is_some());

        assert!(machine.mark_readout());
        assert!(!machine.mark_readout());
        assert_eq!(machine.state(), ExposureState::ImageReady);
        assert!(machine.snapshot().observation.unwrap().end.is_some());
        assert!(machine.emit_progress(Instant::now()).is_none());

        assert!(machine.complete(frame()));
        assert_eq!(machine.state(), ExposureState::Idle);
        assert!(machine.snapshot().outcome.unwrap().frame().is_some());

        let first = progress.recv().await.unwrap();
        assert!(!first.is_terminal());
        let last = progress.recv().await.unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.status, ExposureState::ImageReady);
        assert!(progress.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_while_exposing_keeps_timestamp() {
        let machine = ExposureStateMachine::new();
        machine.begin(Duration::from_secs(10)).unwrap();
        let started = machine.snapshot().started_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = machine.begin(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CameraError::InvalidState { state: ExposureState::Exposing, .. }));
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.started_at, started);
        assert_eq!(snapshot.requested_duration, Duration::from_secs(10));
        assert_eq!(snapshot.sequence, 1);
    }

    #[tokio::test]
    async fn abort_wakes_waiter_and_blocks_completion() {
        let machine = ExposureStateMachine::new();
        let sequence = machine.begin(Duration::from_secs(30)).unwrap();
        let waiter = tokio::spawn({
            let machine = machine.clone();
            async move { machine.wait_settled(sequence).await }
        });

        assert!(machine.abort());
        let settled = waiter.await.unwrap();
        assert_eq!(settled.state, ExposureState::Idle);
        assert!(settled.aborted);
        assert!(matches!(settled.outcome, Some(ExposureOutcome::Aborted)));

        // late frame and late readout are discarded
        assert!(!machine.complete(frame()));
        assert!(!machine.mark_readout());
        assert!(!machine.abort());
    }

    #[tokio::test]
    async fn abort_from_readout_returns_to_idle() {
        let machine = ExposureStateMachine::new();
        machine.begin(Duration::ZERO).unwrap();
        machine.mark_readout();
        let mut progress = machine.progress();
        assert!(machine.abort());
        assert_eq!(machine.state(), ExposureState::Idle);
        let event = progress.recv().await.unwrap();
        assert_eq!(event.status, ExposureState::Idle);
        assert!(event.is_terminal());
    }

    #[tokio::test]
    async fn fatal_error_is_terminal_until_reset() {
        let machine = ExposureStateMachine::new();
        assert!(machine.fail("heartbeat lost"));
        assert!(!machine.fail("again"));
        assert_eq!(machine.state(), ExposureState::Error);
        assert!(matches!(
            machine.begin(Duration::from_secs(1)),
            Err(CameraError::InvalidState { state: ExposureState::Error, .. })
        ));

        machine.reset();
        assert_eq!(machine.state(), ExposureState::Idle);
        assert_eq!(machine.begin(Duration::from_secs(1)).unwrap(), 1);
    }

    #[tokio::test]
    async fn transfer_failure_is_recoverable() {
        let machine = ExposureStateMachine::new();
        machine.begin(Duration::ZERO).unwrap();
        let error = CameraError::FrameIncomplete {
            frame_id: Some(2),
            received: 10,
            expected: 20,
            missing: vec![(3, 4)],
        };
        assert!(machine.fail_exposure(&error));
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.state, ExposureState::Idle);
        assert!(matches!(snapshot.outcome, Some(ExposureOutcome::Incomplete { received: 10, .. })));
        assert_eq!(machine.begin(Duration::ZERO).unwrap(), 2);
    }
}
