//! Camera backend capability interface
//!
//! The engine drives every camera family through [`CameraBackend`]. Vendor SDK
//! cameras plug in here the same way as the built-in GigE backend; the session
//! never looks behind the trait.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::liveness::Heartbeat;
use crate::machine::ExposureStateMachine;
use crate::types::{CameraDescriptor, ExposureState, PixelBuffer, Roi};

/// What a backend receives when the session connects it
#[derive(Clone)]
pub struct BackendContext {
    /// State machine the backend reports readout start to
    pub machine: ExposureStateMachine,
    /// Cancelled when the session disconnects; backend tasks stop on it
    pub cancel: CancellationToken,
}

/// Persistent network setting on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSetting {
    Address,
    Netmask,
    Gateway,
}

/// Capability contract of a camera backend
///
/// Methods take `&self` so the session can share the backend between its
/// command path and its worker tasks. Setters are best effort: a backend
/// without the feature returns the value it actually applied (often the
/// unchanged current value) instead of failing.
#[async_trait::async_trait]
pub trait CameraBackend: Send + Sync + 'static {
    /// Human-readable camera model
    fn model(&self) -> &str;

    /// Open the device and describe its frame layout.
    async fn connect(&self, context: BackendContext) -> Result<CameraDescriptor>;

    /// Release the device. Called once, after any exposure was aborted.
    async fn disconnect(&self) -> Result<()>;

    /// Program and start an exposure.
    async fn start_exposure(&self, duration: Duration, shutter_open: bool) -> Result<()>;

    /// Ask the device to stop the running exposure.
    async fn abort_exposure(&self) -> Result<()>;

    /// Device-side view of the exposure
    async fn current_state(&self) -> ExposureState;

    /// Wait for the running exposure's frame.
    ///
    /// Must be cancel-safe: the session drops this future when the exposure
    /// is aborted or the device fails.
    async fn download_image(&self) -> Result<PixelBuffer>;

    /// Sensor temperature in degrees Celsius, `None` when the device has no sensor
    async fn sensor_temperature(&self) -> Result<Option<f64>>;

    async fn set_gain(&self, index: u32) -> Result<u32> {
        Ok(index)
    }

    async fn set_read_port(&self, index: u32) -> Result<u32> {
        Ok(index)
    }

    async fn set_read_rate(&self, index: u32) -> Result<u32> {
        Ok(index)
    }

    async fn set_roi(&self, roi: Roi) -> Result<Roi> {
        Ok(roi)
    }

    async fn set_adc_offset(&self, _offset: u16) -> Result<()> {
        Ok(())
    }

    async fn set_cooler(&self, _setpoint: f64, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Rewrite a persistent network setting; returns what the device now holds.
    async fn set_network(&self, setting: NetworkSetting, _value: Ipv4Addr) -> Result<Ipv4Addr> {
        Err(crate::CameraError::protocol(
            "network settings",
            format!("{setting:?} is not configurable on {}", self.model()),
        ))
    }

    /// Control-path heartbeat, for backends the engine must keep alive
    fn heartbeat(&self) -> Option<Arc<dyn Heartbeat>> {
        None
    }

    /// Silence on the data path since the last packet of the current frame
    fn since_last_packet(&self) -> Option<Duration> {
        None
    }

    /// Soft recovery of a stalled transfer, e.g. requesting lost packets again
    async fn recover_transfer(&self) -> Result<()> {
        Ok(())
    }
}
