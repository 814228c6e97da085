//! Camera session: one connected camera and its worker tasks
//!
//! A [`CameraSession`] owns the exposure state machine, the backend and three
//! long-lived tasks:
//!
//! - the readout watchdog, which publishes progress while integrating,
//!   recovers stalled transfers and aborts overruns
//! - the idle poller, which refreshes the sensor temperature between exposures
//! - the liveness monitor, for backends that expose a heartbeat
//!
//! Each exposure additionally gets a short-lived supervisor task that waits for
//! the backend's frame and settles the state machine. Commands that touch the
//! device are serialized by the session; abort is not, so it can always
//! interrupt a running exposure.
//!
//! ```rust,no_run
//! use skycam::{EngineConfig, SkyCam};
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> skycam::Result<()> {
//! let session = SkyCam::connect_gige(Ipv4Addr::new(192, 168, 1, 10), EngineConfig::default()).await?;
//! session.start_exposure(Duration::from_secs(5), true).await?;
//! let frame = session.wait_for_image().await?;
//! println!("{}x{} frame", frame.width, frame.height);
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```


use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendContext, CameraBackend, NetworkSetting};
use crate::config::{EngineConfig, IdlePollSection, WatchdogSection};
use crate::liveness::{Liveness, spawn_monitor};
use crate::machine::ExposureStateMachine;
use crate::stream::ThrottleExt;
use crate::types::{
    CameraDescriptor, ExposureProgress, ExposureSnapshot, ExposureState, ObservationTime,
    PixelBuffer, Roi, RoiRequest, UpdateRate,
};
use crate::watchdog::{ReadoutWatchdog, WatchdogAction};
use crate::{CameraError, Result};

/// Camera settings and readings collaborators need, e.g. for FITS headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub model: String,
    pub descriptor: CameraDescriptor,
    pub roi: Roi,
    pub gain: u32,
    pub read_port: u32,
    pub read_rate: u32,
    pub adc_offset: u16,
    /// Last polled sensor temperature, when the camera has a sensor
    pub temperature: Option<f64>,
    pub cooler_setpoint: Option<f64>,
    pub cooler_on: bool,
    /// Timestamps of the current or last exposure
    pub observation: Option<ObservationTime>,
}

impl CameraInfo {
    fn new(model: &str, descriptor: CameraDescriptor) -> Self {
        Self {
            model: model.to_string(),
            descriptor,
            roi: Roi::full(descriptor.width(), descriptor.height()),
            gain: 0,
            read_port: 0,
            read_rate: 0,
            adc_offset: 0,
            temperature: None,
            cooler_setpoint: None,
            cooler_on: false,
            observation: None,
        }
    }
}

struct Workers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    liveness: Option<JoinHandle<Liveness>>,
}

impl Workers {
    fn idle() -> Self {
        Self { cancel: CancellationToken::new(), handles: Vec::new(), liveness: None }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A connected camera
pub struct CameraSession<B: CameraBackend> {
    backend: Arc<B>,
    machine: ExposureStateMachine,
    config: EngineConfig,
    info: Arc<RwLock<CameraInfo>>,
    commands: tokio::sync::Mutex<()>,
    workers: Mutex<Workers>,
    connected: AtomicBool,
}

impl<B: CameraBackend> CameraSession<B> {
    /// Connect `backend` and start the worker tasks.
    pub async fn connect(backend: B, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(backend);
        let machine = ExposureStateMachine::new();
        let workers = Workers::idle();

        let descriptor = connect_backend(&*backend, &machine, &workers.cancel).await?;
        let info = Arc::new(RwLock::new(CameraInfo::new(backend.model(), descriptor)));

        let session = Self {
            backend,
            machine,
            config,
            info,
            commands: tokio::sync::Mutex::new(()),
            workers: Mutex::new(workers),
            connected: AtomicBool::new(true),
        };
        session.spawn_workers();
        info!(
            model = session.backend.model(),
            width = descriptor.width(),
            height = descriptor.height(),
            "camera session connected"
        );
        Ok(session)
    }

    fn spawn_workers(&self) {
        let mut workers = lock(&self.workers);
        let cancel = workers.cancel.clone();
        workers.handles = vec![
            spawn_watchdog(self.backend.clone(), self.machine.clone(), &self.config.watchdog, cancel.clone()),
            spawn_idle_poller(
                self.backend.clone(),
                self.machine.clone(),
                self.info.clone(),
                &self.config.idle_poll,
                cancel.clone(),
            ),
        ];
        workers.liveness = self
            .backend
            .heartbeat()
            .map(|heartbeat| spawn_monitor(heartbeat, self.machine.clone(), &self.config.liveness, cancel));
    }

    async fn stop_workers(&self) {
        let (handles, liveness) = {
            let mut workers = lock(&self.workers);
            workers.cancel.cancel();
            let stopped = std::mem::replace(&mut *workers, Workers::idle());
            (stopped.handles, stopped.liveness)
        };
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(handle) = liveness {
            if let Ok(state) = handle.await {
                debug!(?state, "liveness monitor joined");
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CameraError::connection_failed("camera is not connected"))
        }
    }

    /// Connected and idle; setters are refused otherwise.
    fn ensure_idle(&self, operation: &str) -> Result<()> {
        self.ensure_connected()?;
        match self.machine.state() {
            ExposureState::Idle => Ok(()),
            state => Err(CameraError::invalid_state(operation, state)),
        }
    }

    /// Start an exposure of `duration`; `shutter_open = false` takes a dark frame.
    ///
    /// Fails without queuing when an exposure is already in flight. A device
    /// command failure leaves the session idle.
    pub async fn start_exposure(&self, duration: Duration, shutter_open: bool) -> Result<()> {
        let _command = self.commands.lock().await;
        self.ensure_connected()?;
        let sequence = self.machine.begin(duration)?;

        if let Err(e) = self.backend.start_exposure(duration, shutter_open).await {
            warn!(error = %e, "device rejected exposure start");
            self.machine.fail_exposure(&e);
            return Err(e);
        }

        let snapshot = self.machine.snapshot();
        if snapshot.sequence == sequence && snapshot.state.is_busy() {
            spawn_supervisor(self.backend.clone(), self.machine.clone(), sequence, self.cancel_token());
            return Ok(());
        }
        if snapshot.state == ExposureState::Error {
            return Err(CameraError::device_fatal(
                snapshot.last_error.unwrap_or_else(|| "device error".to_string()),
            ));
        }
        // Aborted while the start command was in flight
        if let Err(e) = self.backend.abort_exposure().await {
            warn!(error = %e, "late abort failed");
        }
        Err(CameraError::Aborted)
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.workers).cancel.clone()
    }

    /// Abort the running exposure.
    ///
    /// The state machine returns to `Idle` at once and any waiter wakes with
    /// [`CameraError::Aborted`]. If the device then refuses the abort command,
    /// the camera is put into `Error`.
    pub async fn abort_exposure(&self) -> Result<()> {
        self.ensure_connected()?;
        abort_in_flight(&*self.backend, &self.machine).await.map(|_| ())
    }

    /// Wait for the current (or last) exposure and return its frame.
    pub async fn wait_for_image(&self) -> Result<Arc<PixelBuffer>> {
        let mut snapshot = self.machine.snapshot();
        if snapshot.state.is_busy() {
            snapshot = self.machine.wait_settled(snapshot.sequence).await;
        }
        if snapshot.state == ExposureState::Error {
            return Err(CameraError::device_fatal(
                snapshot.last_error.unwrap_or_else(|| "device error".to_string()),
            ));
        }
        match snapshot.outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(CameraError::invalid_state("wait for image", snapshot.state)),
        }
    }

    pub fn state(&self) -> ExposureState {
        self.machine.state()
    }

    pub fn snapshot(&self) -> ExposureSnapshot {
        self.machine.snapshot()
    }

    /// Device-side view of the exposure, as the backend reports it
    pub async fn device_state(&self) -> ExposureState {
        self.backend.current_state().await
    }

    /// Current settings and readings
    pub fn info(&self) -> CameraInfo {
        let mut info = self.info.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        info.observation = self.machine.snapshot().observation;
        info
    }

    pub fn descriptor(&self) -> CameraDescriptor {
        self.info.read().unwrap_or_else(|poisoned| poisoned.into_inner()).descriptor
    }

    /// Last polled sensor temperature
    pub fn temperature(&self) -> Option<f64> {
        self.info.read().unwrap_or_else(|poisoned| poisoned.into_inner()).temperature
    }

    fn update_info(&self, f: impl FnOnce(&mut CameraInfo)) {
        f(&mut self.info.write().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }

    /// Every progress event. Subscribers that fall behind skip ahead.
    pub fn progress(&self) -> BoxStream<'static, ExposureProgress> {
        BroadcastStream::new(self.machine.progress())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    /// Progress events at no more than `rate`; terminal events always pass.
    pub fn progress_throttled(&self, rate: UpdateRate) -> BoxStream<'static, ExposureProgress> {
        let source_hz = 1.0 / self.config.watchdog.period().as_secs_f64();
        match rate.throttle_interval(source_hz) {
            None => self.progress(),
            Some(period) => {
                self.progress().throttle_with(period, ExposureProgress::is_terminal).boxed()
            }
        }
    }

    /// Snapshot on every state change, starting with the current one
    pub fn state_updates(&self) -> BoxStream<'static, ExposureSnapshot> {
        WatchStream::new(self.machine.subscribe()).boxed()
    }

    pub async fn set_gain(&self, index: u32) -> Result<u32> {
        let _command = self.commands.lock().await;
        self.ensure_idle("set gain")?;
        let gain = self.backend.set_gain(index).await?;
        self.update_info(|info| info.gain = gain);
        Ok(gain)
    }

    pub async fn set_read_port(&self, index: u32) -> Result<u32> {
        let _command = self.commands.lock().await;
        self.ensure_idle("set read port")?;
        let port = self.backend.set_read_port(index).await?;
        self.update_info(|info| info.read_port = port);
        Ok(port)
    }

    pub async fn set_read_rate(&self, index: u32) -> Result<u32> {
        let _command = self.commands.lock().await;
        self.ensure_idle("set read rate")?;
        let rate = self.backend.set_read_rate(index).await?;
        self.update_info(|info| info.read_rate = rate);
        Ok(rate)
    }

    /// Normalize `request` onto the sensor and apply it.
    pub async fn set_roi(&self, request: RoiRequest) -> Result<Roi> {
        let _command = self.commands.lock().await;
        self.ensure_idle("set ROI")?;
        let descriptor = self.descriptor();
        let roi = request.normalize(descriptor.width(), descriptor.height());
        let applied = self.backend.set_roi(roi).await?;
        debug!(?request, ?applied, "ROI set");
        self.update_info(|info| info.roi = applied);
        Ok(applied)
    }

    pub async fn set_adc_offset(&self, offset: u16) -> Result<()> {
        let _command = self.commands.lock().await;
        self.ensure_idle("set ADC offset")?;
        self.backend.set_adc_offset(offset).await?;
        self.update_info(|info| info.adc_offset = offset);
        Ok(())
    }

    /// Switch the cooler and set its target in degrees Celsius.
    pub async fn set_cooler(&self, setpoint: f64, on: bool) -> Result<()> {
        let _command = self.commands.lock().await;
        self.ensure_connected()?;
        if self.machine.state() == ExposureState::Error {
            return Err(CameraError::invalid_state("set cooler", ExposureState::Error));
        }
        self.backend.set_cooler(setpoint, on).await?;
        self.update_info(|info| {
            info.cooler_setpoint = Some(setpoint);
            info.cooler_on = on;
        });
        info!(setpoint, on, "cooler set");
        Ok(())
    }

    /// Rewrite a persistent network setting on the device.
    pub async fn set_network(&self, setting: NetworkSetting, value: Ipv4Addr) -> Result<Ipv4Addr> {
        let _command = self.commands.lock().await;
        self.ensure_idle("change network settings")?;
        let stored = self.backend.set_network(setting, value).await?;
        info!(?setting, %stored, "network setting changed");
        Ok(stored)
    }

    /// Drop the device connection and connect again, clearing `Error`.
    pub async fn reconnect(&self) -> Result<()> {
        let _command = self.commands.lock().await;
        info!("reconnecting camera");
        self.connected.store(false, Ordering::SeqCst);
        self.stop_workers().await;
        if let Err(e) = self.backend.disconnect().await {
            warn!(error = %e, "disconnect before reconnect failed");
        }

        self.machine.reset();
        let cancel = self.cancel_token();
        let descriptor = connect_backend(&*self.backend, &self.machine, &cancel).await?;
        self.update_info(|info| {
            if info.descriptor != descriptor {
                info.roi = Roi::full(descriptor.width(), descriptor.height());
            }
            info.descriptor = descriptor;
        });
        self.connected.store(true, Ordering::SeqCst);
        self.spawn_workers();
        Ok(())
    }

    /// Abort any exposure, switch the cooler off, stop the workers and
    /// release the device.
    pub async fn disconnect(&self) -> Result<()> {
        let _command = self.commands.lock().await;
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = abort_in_flight(&*self.backend, &self.machine).await {
            warn!(error = %e, "abort during disconnect failed");
        }
        let info = self.info();
        if let (true, Some(setpoint)) = (info.cooler_on, info.cooler_setpoint) {
            match self.backend.set_cooler(setpoint, false).await {
                Ok(()) => self.update_info(|info| info.cooler_on = false),
                Err(e) => warn!(error = %e, "cooler off failed"),
            }
        }

        self.stop_workers().await;
        self.backend.disconnect().await?;
        info!("camera session disconnected");
        Ok(())
    }
}

impl<B: CameraBackend> Drop for CameraSession<B> {
    fn drop(&mut self) {
        debug!("dropping camera session");
        lock(&self.workers).cancel.cancel();
    }
}

async fn connect_backend<B: CameraBackend + ?Sized>(
    backend: &B,
    machine: &ExposureStateMachine,
    cancel: &CancellationToken,
) -> Result<CameraDescriptor> {
    let context = BackendContext { machine: machine.clone(), cancel: cancel.child_token() };
    backend.connect(context).await
}

/// `machine.abort()` then the device abort; a failed device abort is fatal.
///
/// Returns whether an exposure was in flight.
async fn abort_in_flight<B: CameraBackend + ?Sized>(
    backend: &B,
    machine: &ExposureStateMachine,
) -> Result<bool> {
    if !machine.abort() {
        return Ok(false);
    }
    if let Err(e) = backend.abort_exposure().await {
        machine.fail(format!("abort command failed: {e}"));
        return Err(e);
    }
    Ok(true)
}

/// Wait for exposure `sequence`'s frame and settle the state machine.
fn spawn_supervisor<B: CameraBackend>(
    backend: Arc<B>,
    machine: ExposureStateMachine,
    sequence: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = backend.download_image() => match result {
                Ok(frame) => {
                    machine.mark_readout();
                    machine.complete(frame);
                }
                Err(CameraError::Aborted) => {
                    machine.abort();
                }
                Err(e) => {
                    machine.fail_exposure(&e);
                }
            },
            _ = machine.wait_settled(sequence) => {
                debug!(sequence, "exposure settled before the download finished");
            }
            _ = cancel.cancelled() => {}
        }
    })
}

fn spawn_watchdog<B: CameraBackend>(
    backend: Arc<B>,
    machine: ExposureStateMachine,
    settings: &WatchdogSection,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let watchdog = ReadoutWatchdog::from_settings(settings);
    let period = settings.period();

    tokio::spawn(async move {
        debug!(period = ?period, "readout watchdog started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let snapshot = machine.snapshot();
            match watchdog.evaluate(&snapshot, now.into_std(), backend.since_last_packet()) {
                WatchdogAction::None => {}
                WatchdogAction::Progress => {
                    machine.emit_progress(now);
                }
                WatchdogAction::PollReadout => {
                    machine.emit_progress(now);
                    if backend.current_state().await == ExposureState::ImageReady {
                        machine.mark_readout();
                    }
                }
                WatchdogAction::Retransmit => {
                    if let Err(e) = backend.recover_transfer().await {
                        warn!(error = %e, "transfer recovery failed");
                    }
                }
                WatchdogAction::Abort => {
                    warn!(
                        requested = ?snapshot.requested_duration,
                        grace = ?watchdog.grace(),
                        "exposure overran, aborting"
                    );
                    if let Err(e) = abort_in_flight(&*backend, &machine).await {
                        warn!(error = %e, "watchdog abort failed");
                    }
                }
            }
        }
        debug!("readout watchdog ended");
    })
}

fn spawn_idle_poller<B: CameraBackend>(
    backend: Arc<B>,
    machine: ExposureStateMachine,
    info: Arc<RwLock<CameraInfo>>,
    settings: &IdlePollSection,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = settings.period();

    tokio::spawn(async move {
        debug!(period = ?period, "idle poller started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if machine.state() != ExposureState::Idle {
                continue;
            }
            match backend.sensor_temperature().await {
                Ok(temperature) => {
                    info.write().unwrap_or_else(|poisoned| poisoned.into_inner()).temperature =
                        temperature;
                }
                Err(e) => debug!(error = %e, "temperature poll failed"),
            }
        }
        debug!("idle poller ended");
    })
}
