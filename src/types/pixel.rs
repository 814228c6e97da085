//! Reconstructed frame handed to collaborators

use std::sync::Arc;

use super::BYTES_PER_PIXEL;

/// Contiguous 16-bit pixel data of one frame.
///
/// This is the unit handed to the FITS writer and display. Data is shared via
/// `Arc` so subscribers can hold onto a frame without copying it.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    /// Raw little-endian 16-bit pixels in row-major order
    pub data: Arc<[u8]>,

    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Device frame id, when the transfer carried one
    pub frame_id: Option<u16>,
}

impl PixelBuffer {
    /// Create a new pixel buffer
    pub fn new(data: Vec<u8>, width: u32, height: u32, frame_id: Option<u16>) -> Self {
        Self { data: data.into(), width, height, frame_id }
    }

    /// Number of bytes in the buffer
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no data
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Pixel value at column `x`, row `y`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let bytes = self.data.get(offset..offset + BYTES_PER_PIXEL)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}
