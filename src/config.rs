//! Engine configuration loaded from YAML.
//!
//! Every key is optional; a missing key falls back to the default shown in
//! the section's `Default` impl. Durations are given in milliseconds.
//!
//! ```rust
//! use skycam::EngineConfig;
//!
//! let config = EngineConfig::from_yaml_str("watchdog:\n  grace_ms: 20000\n").unwrap();
//! assert_eq!(config.watchdog.grace().as_secs(), 20);
//! assert_eq!(config.channel.attempts, 3);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{DATA_HEADER_LEN, IP_HEADER_LEN, UDP_HEADER_LEN};
use crate::{CameraError, Result};

/// Full engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Register channel request/reply policy
    pub channel: ChannelSection,
    /// Heartbeat supervision
    pub liveness: LivenessSection,
    /// Readout supervision
    pub watchdog: WatchdogSection,
    /// Resend request policy
    pub retransmit: RetransmitSection,
    /// Background temperature polling
    pub idle_poll: IdlePollSection,
    /// GigE-style device network settings
    pub gige: GigeSection,
}

impl EngineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml_ng::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CameraError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Reject values that would stall or spin the worker tasks.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("channel.timeout_ms", self.channel.timeout_ms),
            ("liveness.period_ms", self.liveness.period_ms),
            ("watchdog.period_ms", self.watchdog.period_ms),
            ("watchdog.inter_packet_ms", self.watchdog.inter_packet_ms),
            ("idle_poll.period_ms", self.idle_poll.period_ms),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(CameraError::config(format!("{key} must be greater than zero")));
            }
        }
        if self.channel.attempts == 0 {
            return Err(CameraError::config("channel.attempts must be at least 1"));
        }
        if self.liveness.threshold == 0 {
            return Err(CameraError::config("liveness.threshold must be at least 1"));
        }
        if self.retransmit.max_requests == 0 {
            return Err(CameraError::config("retransmit.max_requests must be at least 1"));
        }

        let overhead = IP_HEADER_LEN + UDP_HEADER_LEN + DATA_HEADER_LEN;
        if self.gige.packet_size <= overhead {
            return Err(CameraError::config(format!(
                "gige.packet_size {} leaves no payload after {overhead} header bytes",
                self.gige.packet_size
            )));
        }
        Ok(())
    }
}

/// Register channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// Time to wait for a matching reply before retrying
    pub timeout_ms: u64,
    /// Send attempts before a request fails as unresponsive
    pub attempts: u32,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self { timeout_ms: 500, attempts: 3 }
    }
}

impl ChannelSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Liveness monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSection {
    /// Heartbeat period
    pub period_ms: u64,
    /// Consecutive failed heartbeats that declare the device dead
    pub threshold: u32,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self { period_ms: 1000, threshold: 3 }
    }
}

impl LivenessSection {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Readout watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    /// Tick period; also the cadence of progress events
    pub period_ms: u64,
    /// Time allowed past the requested exposure before aborting
    pub grace_ms: u64,
    /// Silence on the data path during readout that triggers a resend scan
    pub inter_packet_ms: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self { period_ms: 100, grace_ms: 10_000, inter_packet_ms: 100 }
    }
}

impl WatchdogSection {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn inter_packet(&self) -> Duration {
        Duration::from_millis(self.inter_packet_ms)
    }
}

/// Retransmission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetransmitSection {
    /// Minimum spacing between two requests for the same run
    pub backoff_ms: u64,
    /// Resend requests allowed per frame before the transfer is given up
    pub max_requests: u32,
}

impl Default for RetransmitSection {
    fn default() -> Self {
        Self { backoff_ms: 250, max_requests: 64 }
    }
}

impl RetransmitSection {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Idle poller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdlePollSection {
    /// Sensor temperature poll period while no exposure is running
    pub period_ms: u64,
}

impl Default for IdlePollSection {
    fn default() -> Self {
        Self { period_ms: 5000 }
    }
}

impl IdlePollSection {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// GigE-style device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GigeSection {
    /// Device control port
    pub camera_port: u16,
    /// Local port the device streams image data to
    pub data_port: u16,
    /// Requested packet size including IP and UDP headers
    pub packet_size: u32,
    /// Inter-packet delay programmed into the device
    pub packet_delay: u32,
    /// Device-side heartbeat timeout written on every heartbeat
    pub heartbeat_timeout_ms: u32,
    /// Discovery attempts before connect fails
    pub discovery_attempts: u32,
}

impl Default for GigeSection {
    fn default() -> Self {
        Self {
            camera_port: 3956,
            data_port: 49152,
            packet_size: 1500,
            packet_delay: 0,
            heartbeat_timeout_ms: 12_000,
            discovery_attempts: 3,
        }
    }
}
