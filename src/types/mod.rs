//! Core value types shared across the acquisition engine.
//!
//! - [`CameraDescriptor`] fixes the frame geometry and packetization once per connect
//! - [`ExposureState`], [`ExposureProgress`] and [`ExposureSnapshot`] describe the
//!   exposure lifecycle as observed by subscribers
//! - [`PixelBuffer`] is the reconstructed 16-bit frame
//! - [`RoiRequest`] normalizes a caller's window onto the sensor
//! - [`ObservationTime`] carries the UTC stamps written into FITS headers

mod descriptor;
mod observation;
mod pixel;
mod roi;
mod state;
mod update_rate;

pub use descriptor::{
    BYTES_PER_PIXEL, CameraDescriptor, DATA_HEADER_LEN, IP_HEADER_LEN, MAX_PACKET_INDEX,
    TRAILER_RESERVE, UDP_HEADER_LEN,
};
pub use observation::ObservationTime;
pub use pixel::PixelBuffer;
pub use roi::{Roi, RoiRequest};
pub use state::{
    COMPLETION_PERCENT, ExposureOutcome, ExposureProgress, ExposureSnapshot, ExposureState,
};
pub use update_rate::UpdateRate;
