//! Camera acquisition engine for scientific CCD/CMOS sensors.
//!
//! Skycam drives cameras for an automated telescope exposure sequencer. It
//! provides a backend-agnostic exposure state machine shared by every camera
//! family and a built-in backend for cameras speaking a GigE-style UDP
//! control and image-transfer protocol.
//!
//! # Features
//!
//! - **Exposure state machine**: totally ordered transitions, progress events,
//!   cooperative abort
//! - **Register channel**: sequenced request/reply over UDP with bounded retries
//! - **Frame assembly**: index-addressed slot table, duplicate suppression,
//!   gap detection and selective resend
//! - **Supervision**: heartbeat liveness monitor and readout watchdog
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use skycam::{EngineConfig, SkyCam, UpdateRate};
//! use futures::StreamExt;
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_path("skycam.yaml")?;
//!     let session = SkyCam::connect_gige(Ipv4Addr::new(192, 168, 1, 10), config).await?;
//!
//!     let mut progress = session.progress_throttled(UpdateRate::Max(2));
//!     session.start_exposure(Duration::from_secs(30), true).await?;
//!     while let Some(event) = progress.next().await {
//!         println!("{:.1}% ({:.1}s left)", event.percent, event.time_remaining);
//!         if event.is_terminal() {
//!             break;
//!         }
//!     }
//!
//!     let frame = session.wait_for_image().await?;
//!     println!("{} bytes", frame.len());
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

// Wire protocol and transport
pub mod channel;
pub mod protocol;
pub mod transport;

// Acquisition engine
pub mod assembler;
pub mod liveness;
pub mod machine;
pub mod retransmit;
pub mod stream;
pub mod watchdog;

// Backends and session
pub mod backend;
pub mod gige;
pub mod session;

// Core exports
pub use config::EngineConfig;
pub use error::*;
pub use types::*;

// Main API exports
pub use backend::{BackendContext, CameraBackend, NetworkSetting};
pub use gige::GigeCamera;
pub use machine::ExposureStateMachine;
pub use session::{CameraInfo, CameraSession};

use std::net::Ipv4Addr;

/// Unified entry point for camera sessions.
///
/// # Examples
///
/// ```rust,no_run
/// use skycam::{EngineConfig, SkyCam};
/// use std::net::Ipv4Addr;
///
/// #[tokio::main]
/// async fn main() -> skycam::Result<()> {
///     let session = SkyCam::connect_gige(Ipv4Addr::new(192, 168, 1, 10), EngineConfig::default()).await?;
///     // Use session...
///     session.disconnect().await
/// }
/// ```
pub struct SkyCam;

impl SkyCam {
    /// Connect to a GigE-style camera at `camera_ip`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - No local interface routes to the camera or the ports cannot be bound
    /// - The camera does not answer discovery, or another camera answers
    /// - Connect-time register setup fails
    pub async fn connect_gige(camera_ip: Ipv4Addr, config: EngineConfig) -> Result<CameraSession<GigeCamera>> {
        config.validate()?;
        let backend = GigeCamera::open(camera_ip, &config).await?;
        CameraSession::connect(backend, config).await
    }

    /// Start a session over any backend, e.g. a vendor SDK camera.
    pub async fn with_backend<B: CameraBackend>(backend: B, config: EngineConfig) -> Result<CameraSession<B>> {
        CameraSession::connect(backend, config).await
    }
}
