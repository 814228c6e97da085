//! Error types for camera control and image acquisition.
//!
//! All fallible operations in the engine return [`CameraError`]. Errors carry
//! structured context (register addresses, frame ids, missing packet runs) so
//! the caller can log them or decide whether to retry.
//!
//! ## Error Categories
//!
//! - **Control path**: the register channel got no matching reply after its retry budget
//! - **Connection**: discovery or connect-time setup failed
//! - **Protocol**: a datagram could not be decoded
//! - **Transfer**: the frame assembler could not reconstruct a full frame
//! - **Device**: the liveness monitor declared the device dead
//! - **State**: a command was issued in a state that does not accept it
//! - **Request**: a parameter the device cannot represent
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use skycam::CameraError;
//!
//! let error = CameraError::ChannelUnresponsive {
//!     operation: "read".to_string(),
//!     address: 0xA004,
//!     attempts: 3,
//! };
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::types::ExposureState;

/// Result type alias for camera operations.
pub type Result<T, E = CameraError> = std::result::Result<T, E>;

/// Main error type for camera operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CameraError {
    #[error("Camera did not answer {operation} of register {address:#06x} after {attempts} attempts")]
    ChannelUnresponsive { operation: String, address: u32, attempts: u32 },

    #[error("Failed to connect to camera: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error(
        "Frame {frame_id:?} incomplete: received {received} of {expected} bytes, missing packets {missing:?}"
    )]
    FrameIncomplete { frame_id: Option<u16>, received: usize, expected: usize, missing: Vec<(u32, u32)> },

    #[error("Device is not responding: {reason}")]
    DeviceFatal { reason: String },

    #[error("Exposure aborted")]
    Aborted,

    #[error("Cannot {operation} while camera is {state}")]
    InvalidState { operation: String, state: ExposureState },

    #[error("Exposure of {requested:?} exceeds the device maximum of {max:?}")]
    ExposureOutOfRange { requested: Duration, max: Duration },

    #[error("Socket I/O failed")]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl CameraError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            CameraError::ChannelUnresponsive { .. } => true,
            CameraError::Connection { .. } => true,
            CameraError::FrameIncomplete { .. } => true,
            CameraError::Io { .. } => true,
            CameraError::InvalidState { .. } => true,
            CameraError::Aborted => true,
            CameraError::Protocol { .. } => false,
            CameraError::DeviceFatal { .. } => false,
            CameraError::Config { .. } => false,
            CameraError::ExposureOutOfRange { .. } => false,
        }
    }

    /// Returns whether the session must be reconnected before accepting commands.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CameraError::DeviceFatal { .. })
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            CameraError::ChannelUnresponsive { .. } => vec![
                "Check the camera is powered and cabled",
                "Verify no other host holds the control channel",
                "Increase the reply timeout on congested links",
            ],
            CameraError::Connection { .. } => vec![
                "Verify the camera IP address",
                "Ensure a local interface shares the camera's subnet",
                "Check firewall rules for the control and stream ports",
            ],
            CameraError::Protocol { .. } => vec![
                "Check the camera firmware speaks the expected protocol",
                "Capture traffic to inspect malformed datagrams",
            ],
            CameraError::FrameIncomplete { .. } => vec![
                "Lower the packet size or add packet delay",
                "Increase socket receive buffers",
                "Retry the exposure",
            ],
            CameraError::DeviceFatal { .. } => vec![
                "Reconnect the camera session",
                "Power-cycle the camera if reconnect fails",
            ],
            CameraError::Aborted => vec!["Start a new exposure"],
            CameraError::InvalidState { .. } => vec![
                "Wait for the current exposure to finish",
                "Abort the current exposure first",
            ],
            CameraError::ExposureOutOfRange { .. } => vec![
                "Split the integration into several shorter exposures",
            ],
            CameraError::Io { .. } => vec![
                "Check the local port is not already bound",
                "Verify network interface is up",
            ],
            CameraError::Config { .. } => vec![
                "Check configuration values against documented ranges",
                "Remove the key to fall back to its default",
            ],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        CameraError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        CameraError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for protocol decoding errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        CameraError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for commands rejected by the current state.
    pub fn invalid_state(operation: impl Into<String>, state: ExposureState) -> Self {
        CameraError::InvalidState { operation: operation.into(), state }
    }

    /// Helper constructor for fatal device errors.
    pub fn device_fatal(reason: impl Into<String>) -> Self {
        CameraError::DeviceFatal { reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        CameraError::Config { reason: reason.into() }
    }
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::Io { source: err }
    }
}

impl From<serde_yaml_ng::Error> for CameraError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        CameraError::Config { reason: err.to_string() }
    }
}
