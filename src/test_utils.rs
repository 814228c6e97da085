//! Test doubles for the acquisition engine
//!
//! In-memory datagram links, a frame packetizer, a simulated GigE-style
//! device speaking the control and data protocol, and a scripted backend for
//! session tests that do not need the wire.

#![cfg(any(test, feature = "test-utils"))]

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{BackendContext, CameraBackend};
use crate::config::EngineConfig;
use crate::gige::GigeCamera;
use crate::liveness::Heartbeat;
use crate::protocol::{ControlCommand, ControlReply, DataPacket, PacketKind, registers};
use crate::transport::DatagramLink;
use crate::types::{CameraDescriptor, ExposureState, PixelBuffer, Roi, TRAILER_RESERVE};
use crate::{CameraError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One end of an in-memory datagram pipe
pub struct MemoryLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryLink {
    /// Two connected ends; what one sends the other receives.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: tokio::sync::Mutex::new(b_rx) },
            Self { tx: b_tx, rx: tokio::sync::Mutex::new(a_rx) },
        )
    }
}

#[async_trait::async_trait]
impl DatagramLink for MemoryLink {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(len)
            }
            None => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "peer closed")),
        }
    }
}

/// Deterministic pixel bytes for a frame of `len` bytes.
pub fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

/// Every datagram of one frame, as a device would send it
#[derive(Debug, Clone)]
pub struct FrameDatagrams {
    pub frame_id: u16,
    pub leader: Vec<u8>,
    /// `payloads[i]` carries packet index `i + 1`
    pub payloads: Vec<Vec<u8>>,
    pub trailer: Vec<u8>,
}

impl FrameDatagrams {
    /// Packetize `pixels` followed by the end-of-frame marker.
    pub fn build(descriptor: &CameraDescriptor, frame_id: u16, pixels: &[u8]) -> Self {
        let mut stream = pixels.to_vec();
        stream.extend_from_slice(&[0u8; TRAILER_RESERVE]);

        let packet = |kind, index, payload: &[u8]| {
            DataPacket { status: 0, frame_id, kind, index, payload }.encode()
        };
        let payloads = stream
            .chunks(descriptor.effective_payload())
            .enumerate()
            .map(|(i, chunk)| packet(PacketKind::Payload, i as u32 + 1, chunk))
            .collect::<Vec<_>>();
        Self {
            frame_id,
            leader: packet(PacketKind::Leader, 0, &[]),
            trailer: packet(PacketKind::Trailer, payloads.len() as u32 + 1, &[]),
            payloads,
        }
    }

    /// Payload datagram for packet `index`, numbered from 1
    pub fn payload(&self, index: u32) -> Option<&[u8]> {
        let slot = (index as usize).checked_sub(1)?;
        self.payloads.get(slot).map(Vec::as_slice)
    }
}

/// Address the simulated host uses as stream destination
pub const SIMULATED_HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

struct Device {
    discovery_address: Ipv4Addr,
    registers: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
    frame_id: u16,
    frame: Option<FrameDatagrams>,
    drop_once: Vec<u32>,
    resends: Vec<(u16, u32, u32)>,
    resending: bool,
    streaming: bool,
    stream_task: Option<JoinHandle<()>>,
}

struct Shared {
    device: Mutex<Device>,
    responsive: AtomicBool,
    control: MemoryLink,
    data: Arc<MemoryLink>,
}

/// What the device does after answering a command
enum Effect {
    None,
    Stream { delay: Duration, frame: FrameDatagrams, drop: Vec<u32> },
    Abort(Option<Vec<u8>>),
    Resend(Vec<Vec<u8>>),
}

impl Device {
    fn handle(&mut self, sequence: u16, command: ControlCommand) -> (Option<Vec<u8>>, Effect) {
        match command {
            ControlCommand::Discovery => {
                (Some(ControlReply::encode_discovery(sequence, self.discovery_address)), Effect::None)
            }
            ControlCommand::Read { address } => {
                let value = self.registers.get(&address).copied().unwrap_or(0);
                (Some(ControlReply::encode_read(sequence, value)), Effect::None)
            }
            ControlCommand::Write { address, value } => {
                self.writes.push((address, value));
                let effect = match (address, value) {
                    (registers::EXPOSURE_START, 1) => self.start_frame(),
                    (registers::EXPOSURE_ABORT, 1) => {
                        if let Some(task) = self.stream_task.take() {
                            task.abort();
                        }
                        Effect::Abort(self.frame.as_ref().map(|frame| frame.trailer.clone()))
                    }
                    _ => {
                        self.registers.insert(address, value);
                        Effect::None
                    }
                };
                (Some(ControlReply::encode_write_ack(sequence, true)), effect)
            }
            ControlCommand::Resend { frame_id, first, last } => {
                self.resends.push((frame_id, first, last));
                let datagrams = match &self.frame {
                    Some(frame) if self.resending && frame.frame_id == frame_id => {
                        (first..=last).filter_map(|index| frame.payload(index)).map(<[u8]>::to_vec).collect()
                    }
                    _ => Vec::new(),
                };
                (None, Effect::Resend(datagrams))
            }
        }
    }

    fn start_frame(&mut self) -> Effect {
        let reg = |address| self.registers.get(&address).copied().unwrap_or(0);
        let Ok(descriptor) = CameraDescriptor::from_packet_size(
            reg(registers::SENSOR_WIDTH),
            reg(registers::SENSOR_HEIGHT),
            reg(registers::STREAM_PACKET_SIZE),
        ) else {
            return Effect::None;
        };
        let delay = Duration::from_micros(u64::from(reg(registers::EXPOSURE_TIME_US)));

        self.frame_id = match self.frame_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        let frame =
            FrameDatagrams::build(&descriptor, self.frame_id, &test_pattern(descriptor.frame_bytes()));
        self.frame = Some(frame.clone());
        if !self.streaming {
            return Effect::None;
        }
        Effect::Stream { delay, frame, drop: std::mem::take(&mut self.drop_once) }
    }
}

/// GigE-style device running on in-memory links
pub struct SimulatedCamera {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl SimulatedCamera {
    /// Start a device at `address` with a `width` x `height` sensor and a
    /// backend wired to it.
    pub fn start(
        address: Ipv4Addr,
        width: u32,
        height: u32,
        config: &EngineConfig,
    ) -> (Self, GigeCamera) {
        let (host_control, device_control) = MemoryLink::pair();
        let (host_data, device_data) = MemoryLink::pair();

        let registers = HashMap::from([
            (registers::SENSOR_WIDTH, width),
            (registers::SENSOR_HEIGHT, height),
            (registers::STREAM_PACKET_SIZE, 1500),
            (registers::GAIN, 0),
            (registers::SHUTTER_MODE, registers::SHUTTER_NORMAL),
            (registers::EXPOSURE_TIME_US, 0),
        ]);
        let shared = Arc::new(Shared {
            device: Mutex::new(Device {
                discovery_address: address,
                registers,
                writes: Vec::new(),
                frame_id: 0,
                frame: None,
                drop_once: Vec::new(),
                resends: Vec::new(),
                resending: true,
                streaming: true,
                stream_task: None,
            }),
            responsive: AtomicBool::new(true),
            control: device_control,
            data: Arc::new(device_data),
        });
        let task = tokio::spawn(serve(shared.clone()));

        let backend = GigeCamera::with_links(
            address,
            SIMULATED_HOST,
            Arc::new(host_control),
            Arc::new(host_data),
            config,
        );
        (Self { shared, task }, backend)
    }

    /// Stop answering control commands, as a device that fell off the network.
    pub fn set_responsive(&self, responsive: bool) {
        self.shared.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Hold image data back after integration, as a device stuck in readout.
    pub fn set_streaming(&self, streaming: bool) {
        lock(&self.shared.device).streaming = streaming;
    }

    /// Answer discovery with another address.
    pub fn set_discovery_address(&self, address: Ipv4Addr) {
        lock(&self.shared.device).discovery_address = address;
    }

    /// Record resend requests but never answer them.
    pub fn set_resending(&self, resending: bool) {
        lock(&self.shared.device).resending = resending;
    }

    /// Skip these packet indices on the next frame's first transmission. The
    /// trailer's index is one past the last payload.
    pub fn drop_packets_once(&self, indices: impl IntoIterator<Item = u32>) {
        lock(&self.shared.device).drop_once.extend(indices);
    }

    /// Resend requests received so far, as `(frame_id, first, last)`
    pub fn resend_requests(&self) -> Vec<(u16, u32, u32)> {
        lock(&self.shared.device).resends.clone()
    }

    pub fn register(&self, address: u32) -> Option<u32> {
        lock(&self.shared.device).registers.get(&address).copied()
    }

    /// Values written to `address`, oldest first
    pub fn writes_to(&self, address: u32) -> Vec<u32> {
        lock(&self.shared.device)
            .writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(task) = lock(&self.shared.device).stream_task.take() {
            task.abort();
        }
    }
}

async fn serve(shared: Arc<Shared>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let Ok(len) = shared.control.recv(&mut buf).await else {
            break;
        };
        if !shared.responsive.load(Ordering::SeqCst) {
            continue;
        }
        let Ok((sequence, command)) = ControlCommand::decode(&buf[..len]) else {
            continue;
        };

        let (reply, effect) = lock(&shared.device).handle(sequence, command);
        if let Some(reply) = reply {
            let _ = shared.control.send(&reply).await;
        }

        match effect {
            Effect::None => {}
            Effect::Stream { delay, frame, drop } => {
                let data = shared.data.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = data.send(&frame.leader).await;
                    for (i, payload) in frame.payloads.iter().enumerate() {
                        if !drop.contains(&(i as u32 + 1)) {
                            let _ = data.send(payload).await;
                        }
                    }
                    if !drop.contains(&(frame.payloads.len() as u32 + 1)) {
                        let _ = data.send(&frame.trailer).await;
                    }
                });
                lock(&shared.device).stream_task = Some(task);
            }
            Effect::Abort(trailer) => {
                if let Some(trailer) = trailer {
                    let _ = shared.data.send(&trailer).await;
                }
            }
            Effect::Resend(datagrams) => {
                for datagram in datagrams {
                    let _ = shared.data.send(&datagram).await;
                }
            }
        }
    }
}

/// Call recorded by [`MockBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Connect,
    Disconnect,
    Start { duration: Duration, shutter_open: bool },
    Abort,
    SetGain(u32),
    SetReadPort(u32),
    SetReadRate(u32),
    SetRoi(Roi),
    SetAdcOffset(u16),
    SetCooler { setpoint: f64, on: bool },
}

struct MockHeartbeat {
    healthy: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Heartbeat for MockHeartbeat {
    async fn beat(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CameraError::ChannelUnresponsive {
                operation: "write".into(),
                address: registers::HEARTBEAT_TIMEOUT,
                attempts: 3,
            })
        }
    }
}

/// Scripted backend without a wire
///
/// Frames are handed over with [`deliver`](Self::deliver); the reported device
/// state is whatever the test sets.
pub struct MockBackend {
    descriptor: CameraDescriptor,
    calls: Mutex<Vec<MockCall>>,
    frames_tx: mpsc::UnboundedSender<Result<PixelBuffer>>,
    frames_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<PixelBuffer>>>,
    device_state: Mutex<ExposureState>,
    temperature: Mutex<Option<f64>>,
    fail_start: AtomicBool,
    fail_abort: AtomicBool,
    healthy: Arc<AtomicBool>,
    with_heartbeat: bool,
}

impl MockBackend {
    pub fn new(width: u32, height: u32) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            descriptor: CameraDescriptor::with_payload(width, height, 1464)
                .unwrap_or_else(|e| panic!("mock descriptor: {e}")),
            calls: Mutex::new(Vec::new()),
            frames_tx,
            frames_rx: tokio::sync::Mutex::new(frames_rx),
            device_state: Mutex::new(ExposureState::Idle),
            temperature: Mutex::new(Some(-10.0)),
            fail_start: AtomicBool::new(false),
            fail_abort: AtomicBool::new(false),
            healthy: Arc::new(AtomicBool::new(true)),
            with_heartbeat: false,
        }
    }

    /// Supervise this backend with a heartbeat the test can break.
    pub fn with_heartbeat(mut self) -> Self {
        self.with_heartbeat = true;
        self
    }

    pub fn descriptor(&self) -> CameraDescriptor {
        self.descriptor
    }

    /// Complete the running download with `result`.
    pub fn deliver(&self, result: Result<PixelBuffer>) {
        let _ = self.frames_tx.send(result);
    }

    /// A full frame of the mock's sensor size
    pub fn frame(&self) -> PixelBuffer {
        PixelBuffer::new(
            test_pattern(self.descriptor.frame_bytes()),
            self.descriptor.width(),
            self.descriptor.height(),
            None,
        )
    }

    pub fn set_device_state(&self, state: ExposureState) {
        *lock(&self.device_state) = state;
    }

    pub fn set_temperature(&self, temperature: Option<f64>) {
        *lock(&self.temperature) = temperature;
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_abort(&self, fail: bool) {
        self.fail_abort.store(fail, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    fn unresponsive(address: u32) -> CameraError {
        CameraError::ChannelUnresponsive { operation: "write".into(), address, attempts: 3 }
    }
}

#[async_trait::async_trait]
impl CameraBackend for MockBackend {
    fn model(&self) -> &str {
        "mock camera"
    }

    async fn connect(&self, _context: BackendContext) -> Result<CameraDescriptor> {
        self.record(MockCall::Connect);
        Ok(self.descriptor)
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(MockCall::Disconnect);
        Ok(())
    }

    async fn start_exposure(&self, duration: Duration, shutter_open: bool) -> Result<()> {
        self.record(MockCall::Start { duration, shutter_open });
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Self::unresponsive(registers::EXPOSURE_START));
        }
        self.set_device_state(ExposureState::Exposing);
        Ok(())
    }

    async fn abort_exposure(&self) -> Result<()> {
        self.record(MockCall::Abort);
        if self.fail_abort.load(Ordering::SeqCst) {
            return Err(Self::unresponsive(registers::EXPOSURE_ABORT));
        }
        self.set_device_state(ExposureState::Idle);
        Ok(())
    }

    async fn current_state(&self) -> ExposureState {
        *lock(&self.device_state)
    }

    async fn download_image(&self) -> Result<PixelBuffer> {
        let mut frames = self.frames_rx.lock().await;
        frames.recv().await.unwrap_or(Err(CameraError::Aborted))
    }

    async fn sensor_temperature(&self) -> Result<Option<f64>> {
        Ok(*lock(&self.temperature))
    }

    async fn set_gain(&self, index: u32) -> Result<u32> {
        self.record(MockCall::SetGain(index));
        Ok(index)
    }

    async fn set_read_port(&self, index: u32) -> Result<u32> {
        self.record(MockCall::SetReadPort(index));
        Ok(index)
    }

    async fn set_read_rate(&self, index: u32) -> Result<u32> {
        self.record(MockCall::SetReadRate(index));
        Ok(index)
    }

    async fn set_roi(&self, roi: Roi) -> Result<Roi> {
        self.record(MockCall::SetRoi(roi));
        Ok(roi)
    }

    async fn set_adc_offset(&self, offset: u16) -> Result<()> {
        self.record(MockCall::SetAdcOffset(offset));
        Ok(())
    }

    async fn set_cooler(&self, setpoint: f64, on: bool) -> Result<()> {
        self.record(MockCall::SetCooler { setpoint, on });
        Ok(())
    }

    fn heartbeat(&self) -> Option<Arc<dyn Heartbeat>> {
        self.with_heartbeat
            .then(|| Arc::new(MockHeartbeat { healthy: self.healthy.clone() }) as Arc<dyn Heartbeat>)
    }
}
