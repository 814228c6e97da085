//! GigE-style camera backend.
//!
//! Control runs over a UDP request/reply protocol on the camera's control
//! port; image data streams to a local port as leader, payload and trailer
//! packets. Connecting performs the discovery handshake, programs the stream
//! destination and reads the sensor geometry.
//!
//! ```no_run
//! use skycam::{EngineConfig, GigeCamera};
//! use std::net::Ipv4Addr;
//!
//! # async fn example() -> skycam::Result<()> {
//! let config = EngineConfig::default();
//! let camera = GigeCamera::open(Ipv4Addr::new(192, 168, 1, 10), &config).await?;
//! # Ok(())
//! # }
//! ```

mod receiver;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendContext, CameraBackend, NetworkSetting};
use crate::channel::RegisterChannel;
use crate::config::{ChannelSection, EngineConfig, GigeSection, RetransmitSection};
use crate::liveness::Heartbeat;
use crate::machine::ExposureStateMachine;
use crate::protocol::registers;
use crate::retransmit::{RetransmitController, RetransmitDecision};
use crate::transport::{DatagramLink, host_address_toward};
use crate::types::{CameraDescriptor, ExposureState, PixelBuffer};
use crate::{CameraError, Result};

use receiver::{DatagramReceiver, Transfer, TransferSignal, send_resend};

const REPLY_QUEUE: usize = 16;
const SHUTTER_SETTLE: Duration = Duration::from_millis(100);
/// Longest exposure the 32-bit microsecond register holds
const MAX_EXPOSURE: Duration = Duration::from_micros(u32::MAX as u64);

/// Cached exposure registers; written only when they change
#[derive(Debug, Clone, Copy)]
struct RegisterCache {
    gain: u32,
    shutter: u32,
    exposure_us: u32,
}

struct Connected {
    channel: Arc<RegisterChannel>,
    transfer: Arc<Transfer>,
    registers: Mutex<RegisterCache>,
    machine: ExposureStateMachine,
    cancel: CancellationToken,
}

/// Writes the device-side heartbeat timeout, which doubles as a keep-alive
struct RegisterHeartbeat {
    channel: Arc<RegisterChannel>,
    timeout_ms: u32,
}

#[async_trait::async_trait]
impl Heartbeat for RegisterHeartbeat {
    async fn beat(&self) -> Result<()> {
        self.channel.write(registers::HEARTBEAT_TIMEOUT, self.timeout_ms).await
    }
}

/// Camera reached over the GigE-style UDP protocol
pub struct GigeCamera {
    camera_ip: Ipv4Addr,
    host_ip: Ipv4Addr,
    control: Arc<dyn DatagramLink>,
    data: Arc<dyn DatagramLink>,
    settings: GigeSection,
    channel_settings: ChannelSection,
    retransmit_settings: RetransmitSection,
    model: String,
    connected: RwLock<Option<Arc<Connected>>>,
}

impl GigeCamera {
    /// Bind the control and data sockets for the camera at `camera_ip`.
    pub async fn open(camera_ip: Ipv4Addr, config: &EngineConfig) -> Result<Self> {
        let camera = SocketAddrV4::new(camera_ip, config.gige.camera_port);
        let host_ip = host_address_toward(camera).await.map_err(|e| {
            CameraError::connection_failed_with_source("no matched host IP address", Box::new(e))
        })?;

        let control = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        control.connect(SocketAddr::V4(camera)).await?;
        let data =
            UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.gige.data_port))).await?;
        info!(%camera, %host_ip, data_port = config.gige.data_port, "sockets bound");

        Ok(Self::with_links(camera_ip, host_ip, Arc::new(control), Arc::new(data), config))
    }

    /// Use already established links, e.g. in-memory links in tests.
    pub fn with_links(
        camera_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
        control: Arc<dyn DatagramLink>,
        data: Arc<dyn DatagramLink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            camera_ip,
            host_ip,
            control,
            data,
            settings: config.gige.clone(),
            channel_settings: config.channel.clone(),
            retransmit_settings: config.retransmit.clone(),
            model: format!("GigE camera {camera_ip}"),
            connected: RwLock::new(None),
        }
    }

    pub fn camera_ip(&self) -> Ipv4Addr {
        self.camera_ip
    }

    pub fn host_ip(&self) -> Ipv4Addr {
        self.host_ip
    }

    fn connected(&self) -> Result<Arc<Connected>> {
        self.connected
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| CameraError::connection_failed("camera is not connected"))
    }

    async fn setup(&self, channel: &RegisterChannel) -> Result<(CameraDescriptor, RegisterCache)> {
        let found = channel.discover(self.settings.discovery_attempts).await?;
        if found.address != self.camera_ip {
            return Err(CameraError::connection_failed(format!(
                "not found camera: {} answered discovery for {}",
                found.address, self.camera_ip
            )));
        }

        channel.write(registers::CONTROL_PRIVILEGE, registers::CONTROL_PRIVILEGE_EXCLUSIVE).await?;
        channel.write(registers::STREAM_HOST_PORT, u32::from(self.settings.data_port)).await?;
        channel.write(registers::STREAM_PACKET_SIZE, self.settings.packet_size).await?;
        channel.write(registers::STREAM_PACKET_DELAY, self.settings.packet_delay).await?;
        channel.write(registers::STREAM_DESTINATION, u32::from(self.host_ip)).await?;
        channel.write(registers::ACQUISITION_SEQUENCE, 1).await?;

        let width = channel.read(registers::SENSOR_WIDTH).await?;
        let height = channel.read(registers::SENSOR_HEIGHT).await?;
        let packet_size = channel.read(registers::STREAM_PACKET_SIZE).await?;
        let descriptor = CameraDescriptor::from_packet_size(width, height, packet_size)?;

        let cache = RegisterCache {
            gain: channel.read(registers::GAIN).await?,
            shutter: channel.read(registers::SHUTTER_MODE).await?,
            exposure_us: channel.read(registers::EXPOSURE_TIME_US).await?,
        };
        Ok((descriptor, cache))
    }
}

#[async_trait::async_trait]
impl CameraBackend for GigeCamera {
    fn model(&self) -> &str {
        &self.model
    }

    async fn connect(&self, context: BackendContext) -> Result<CameraDescriptor> {
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE);
        let channel =
            Arc::new(RegisterChannel::new(self.control.clone(), reply_rx, &self.channel_settings));
        let transfer = Arc::new(Transfer::new(RetransmitController::from_settings(&self.retransmit_settings)));
        let cancel = context.cancel.child_token();

        DatagramReceiver {
            control: self.control.clone(),
            data: self.data.clone(),
            replies: reply_tx,
            transfer: transfer.clone(),
            channel: channel.clone(),
            machine: context.machine.clone(),
            cancel: cancel.clone(),
        }
        .spawn();

        let (descriptor, cache) = match self.setup(&channel).await {
            Ok(setup) => setup,
            Err(e) => {
                cancel.cancel();
                warn!(camera = %self.camera_ip, "connect failed: {}", e);
                return Err(match e {
                    e @ CameraError::Connection { .. } => e,
                    other => CameraError::connection_failed_with_source(
                        "failed to initialize camera registers",
                        Box::new(other),
                    ),
                });
            }
        };
        transfer.install(descriptor);

        info!(
            camera = %self.camera_ip,
            width = descriptor.width(),
            height = descriptor.height(),
            packets = descriptor.total_packets(),
            payload = descriptor.effective_payload(),
            "camera connected"
        );

        let connected = Connected {
            channel,
            transfer,
            registers: Mutex::new(cache),
            machine: context.machine,
            cancel,
        };
        *self.connected.write().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(Arc::new(connected));
        Ok(descriptor)
    }

    async fn disconnect(&self) -> Result<()> {
        let previous = self.connected.write().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(connected) = previous {
            connected.cancel.cancel();
            info!(camera = %self.camera_ip, "camera disconnected");
        }
        Ok(())
    }

    async fn start_exposure(&self, duration: Duration, shutter_open: bool) -> Result<()> {
        let exposure_us = u32::try_from(duration.as_micros())
            .map_err(|_| CameraError::ExposureOutOfRange { requested: duration, max: MAX_EXPOSURE })?;
        let connected = self.connected()?;
        let channel = &connected.channel;
        connected.transfer.begin();

        let mut cache = connected.registers.lock().await;
        let shutter = if shutter_open { registers::SHUTTER_NORMAL } else { registers::SHUTTER_CLOSED };
        if cache.shutter != shutter {
            cache.shutter = channel.write_verified(registers::SHUTTER_MODE, shutter).await?;
            tokio::time::sleep(SHUTTER_SETTLE).await;
        }
        if cache.exposure_us != exposure_us {
            cache.exposure_us = channel.write_verified(registers::EXPOSURE_TIME_US, exposure_us).await?;
        }
        drop(cache);

        channel.write(registers::EXPOSURE_START, 1).await?;
        debug!(exposure_us, shutter, "exposure command sent");
        Ok(())
    }

    async fn abort_exposure(&self) -> Result<()> {
        let connected = self.connected()?;
        connected.transfer.abort();
        connected.channel.write(registers::EXPOSURE_ABORT, 1).await
    }

    /// Readout on this family is push-driven: the receiver moves the machine
    /// to `ImageReady` on the first packet of the frame, and the device has
    /// no readout-status register. The machine's own state is the answer.
    async fn current_state(&self) -> ExposureState {
        match self.connected() {
            Ok(connected) => connected.machine.state(),
            Err(_) => ExposureState::Error,
        }
    }

    async fn download_image(&self) -> Result<PixelBuffer> {
        let connected = self.connected()?;
        let transfer = &connected.transfer;
        match transfer.wait().await {
            TransferSignal::Complete | TransferSignal::Stalled => transfer
                .with_assembler(|assembler| assembler.finish())
                .unwrap_or_else(|| Err(CameraError::connection_failed("camera is not connected"))),
            TransferSignal::Drained => Err(CameraError::Aborted),
            TransferSignal::Pending => Err(CameraError::protocol("transfer", "woke while pending")),
        }
    }

    async fn sensor_temperature(&self) -> Result<Option<f64>> {
        // This family has no readable sensor temperature
        Ok(None)
    }

    async fn set_gain(&self, index: u32) -> Result<u32> {
        let connected = self.connected()?;
        let mut cache = connected.registers.lock().await;
        if index > registers::GAIN_MAX || index == cache.gain {
            return Ok(cache.gain);
        }
        cache.gain = connected.channel.write_verified(registers::GAIN, index).await?;
        Ok(cache.gain)
    }

    async fn set_network(&self, setting: NetworkSetting, value: Ipv4Addr) -> Result<Ipv4Addr> {
        let connected = self.connected()?;
        let address = match setting {
            NetworkSetting::Address => registers::NETWORK_IP,
            NetworkSetting::Netmask => registers::NETWORK_NETMASK,
            NetworkSetting::Gateway => registers::NETWORK_GATEWAY,
        };
        let stored = connected.channel.write_verified(address, u32::from(value)).await?;
        Ok(Ipv4Addr::from(stored))
    }

    fn heartbeat(&self) -> Option<Arc<dyn Heartbeat>> {
        let connected = self.connected().ok()?;
        Some(Arc::new(RegisterHeartbeat {
            channel: connected.channel.clone(),
            timeout_ms: self.settings.heartbeat_timeout_ms,
        }))
    }

    fn since_last_packet(&self) -> Option<Duration> {
        self.connected().ok()?.transfer.since_last_packet(receiver::now())
    }

    async fn recover_transfer(&self) -> Result<()> {
        let connected = self.connected()?;
        if let RetransmitDecision::Request(request) = connected.transfer.next_resend(receiver::now()) {
            send_resend(&connected.channel, request);
        }
        Ok(())
    }
}
