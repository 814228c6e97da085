//! Heartbeat supervision of the control path.
//!
//! [`LivenessMonitor`] is a pure counter state machine; [`spawn_monitor`] runs
//! it on a fixed period against any [`Heartbeat`] and forces the exposure state
//! machine into `Error` once the device is declared dead.

use std::sync::Arc;
use tokio::time::{MissedTickBehavior, interval};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::LivenessSection;
use crate::machine::ExposureStateMachine;

/// Health of the control path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// Consecutive failed heartbeats so far
    Degraded(u32),
    /// Threshold reached; terminal until reconnect
    Fatal,
}

/// No-op command proving the device still answers
#[async_trait::async_trait]
pub trait Heartbeat: Send + Sync + 'static {
    async fn beat(&self) -> Result<()>;
}

/// Consecutive-failure counter
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    threshold: u32,
    state: Liveness,
}

impl LivenessMonitor {
    pub fn new(threshold: u32) -> Self {
        Self { threshold: threshold.max(1), state: Liveness::Healthy }
    }

    pub fn state(&self) -> Liveness {
        self.state
    }

    /// Fold one heartbeat result into the state.
    ///
    /// Success resets the counter; `Fatal` is sticky.
    pub fn record(&mut self, success: bool) -> Liveness {
        self.state = match (self.state, success) {
            (Liveness::Fatal, _) => Liveness::Fatal,
            (_, true) => Liveness::Healthy,
            (Liveness::Healthy, false) => self.escalate(1),
            (Liveness::Degraded(n), false) => self.escalate(n + 1),
        };
        self.state
    }

    fn escalate(&self, failures: u32) -> Liveness {
        if failures >= self.threshold { Liveness::Fatal } else { Liveness::Degraded(failures) }
    }
}

/// Run heartbeats until cancelled or the device is declared dead.
pub fn spawn_monitor<H>(
    heartbeat: Arc<H>,
    machine: ExposureStateMachine,
    settings: &LivenessSection,
    cancel: CancellationToken,
) -> JoinHandle<Liveness>
where
    H: Heartbeat + ?Sized,
{
    let period = settings.period();
    let mut monitor = LivenessMonitor::new(settings.threshold);

    tokio::spawn(async move {
        info!(period = ?period, "liveness monitor started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the first heartbeat goes out one period in
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("liveness monitor cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = heartbeat.beat() => result,
            };
            let previous = monitor.state();
            let state = monitor.record(result.is_ok());
            match (previous, state, result) {
                (_, Liveness::Fatal, Err(e)) => {
                    error!(error = %e, "device stopped answering heartbeats");
                    machine.fail(format!("device unresponsive: {e}"));
                    break;
                }
                (_, Liveness::Degraded(n), Err(e)) => {
                    warn!(failures = n, error = %e, "heartbeat failed");
                }
                (Liveness::Degraded(n), Liveness::Healthy, Ok(())) => {
                    info!(after = n, "heartbeat recovered");
                }
                _ => {}
            }
        }

        info!(state = ?monitor.state(), "liveness monitor ended");
        monitor.state()
    })
}
