//! Readout supervision.
//!
//! The watchdog ticks only matter while an exposure is in flight. Each tick it
//! decides one action from the state snapshot; the session's watchdog task
//! carries the action out.

use std::time::{Duration, Instant};

use crate::config::WatchdogSection;
use crate::types::{ExposureSnapshot, ExposureState};

/// What the watchdog wants done this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Nothing in flight, or readout progressing normally
    None,
    /// Integrating; publish a progress event
    Progress,
    /// Integration time is over; publish progress and ask the backend whether
    /// readout has begun (for backends without a data path of their own)
    PollReadout,
    /// Data path went quiet during readout; scan for gaps and request a resend
    Retransmit,
    /// Overran the requested duration by more than the grace bound
    Abort,
}

/// Stateless decision logic
#[derive(Debug, Clone, Copy)]
pub struct ReadoutWatchdog {
    grace: Duration,
    inter_packet: Duration,
}

impl ReadoutWatchdog {
    pub fn new(grace: Duration, inter_packet: Duration) -> Self {
        Self { grace, inter_packet }
    }

    pub fn from_settings(settings: &WatchdogSection) -> Self {
        Self::new(settings.grace(), settings.inter_packet())
    }

    /// Allowed overrun past the requested duration
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Decide this tick's action.
    ///
    /// `since_last_packet` is the silence on the data path, when the backend
    /// can tell.
    pub fn evaluate(
        &self,
        snapshot: &ExposureSnapshot,
        now: Instant,
        since_last_packet: Option<Duration>,
    ) -> WatchdogAction {
        if !snapshot.state.is_busy() {
            return WatchdogAction::None;
        }
        let Some(elapsed) = snapshot.elapsed(now) else {
            return WatchdogAction::None;
        };
        let overrun = elapsed.saturating_sub(snapshot.requested_duration);
        if overrun > self.grace {
            return WatchdogAction::Abort;
        }

        match snapshot.state {
            ExposureState::Exposing if elapsed >= snapshot.requested_duration => {
                WatchdogAction::PollReadout
            }
            ExposureState::Exposing => WatchdogAction::Progress,
            ExposureState::ImageReady => match since_last_packet {
                Some(silence) if silence > self.inter_packet => WatchdogAction::Retransmit,
                _ => WatchdogAction::None,
            },
            _ => WatchdogAction::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(100);

    fn watchdog() -> ReadoutWatchdog {
        ReadoutWatchdog::from_settings(&WatchdogSection::default())
    }

    fn snapshot(state: ExposureState, started: Instant, requested: Duration) -> ExposureSnapshot {
        ExposureSnapshot {
            state,
            started_at: Some(started),
            requested_duration: requested,
            ..ExposureSnapshot::idle()
        }
    }

    #[test]
    fn abort_fires_only_past_the_grace_bound() {
        let start = Instant::now();
        let requested = Duration::from_secs(5);
        let grace = Duration::from_secs(10);
        let snap = snapshot(ExposureState::ImageReady, start, requested);
        let watchdog = watchdog();

        let one_tick_before = start + requested + grace - PERIOD;
        let at_bound = start + requested + grace;
        let one_tick_after = start + requested + grace + PERIOD;

        assert_ne!(watchdog.evaluate(&snap, one_tick_before, None), WatchdogAction::Abort);
        assert_ne!(watchdog.evaluate(&snap, at_bound, None), WatchdogAction::Abort);
        assert_eq!(watchdog.evaluate(&snap, one_tick_after, None), WatchdogAction::Abort);
    }

    #[test]
    fn integrating_reports_progress_then_polls_readout() {
        let start = Instant::now();
        let snap = snapshot(ExposureState::Exposing, start, Duration::from_secs(2));
        let watchdog = watchdog();
        assert_eq!(
            watchdog.evaluate(&snap, start + Duration::from_secs(1), None),
            WatchdogAction::Progress
        );
        assert_eq!(
            watchdog.evaluate(&snap, start + Duration::from_secs(3), None),
            WatchdogAction::PollReadout
        );
    }

    #[test]
    fn silent_readout_triggers_retransmit_not_abort() {
        let start = Instant::now();
        let snap = snapshot(ExposureState::ImageReady, start, Duration::from_secs(1));
        let watchdog = watchdog();
        let now = start + Duration::from_secs(2);
        assert_eq!(
            watchdog.evaluate(&snap, now, Some(Duration::from_millis(50))),
            WatchdogAction::None
        );
        assert_eq!(
            watchdog.evaluate(&snap, now, Some(Duration::from_millis(150))),
            WatchdogAction::Retransmit
        );
    }

    #[test]
    fn idle_and_error_are_ignored() {
        let start = Instant::now();
        let far = start + Duration::from_secs(3600);
        for state in [ExposureState::Idle, ExposureState::Error] {
            let snap = snapshot(state, start, Duration::ZERO);
            assert_eq!(watchdog().evaluate(&snap, far, None), WatchdogAction::None);
        }
    }
}
