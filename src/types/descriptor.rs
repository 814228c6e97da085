//! Sensor geometry and packetization of one frame

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::{CameraError, Result};

/// Length of the IPv4 header subtracted from the negotiated packet size.
pub const IP_HEADER_LEN: u32 = 20;
/// Length of the UDP header subtracted from the negotiated packet size.
pub const UDP_HEADER_LEN: u32 = 8;
/// Length of the data-path header preceding every payload.
pub const DATA_HEADER_LEN: u32 = 8;
/// Fixed-size end-of-frame marker the device appends to the last payload packet.
pub const TRAILER_RESERVE: usize = 64;
/// Pixels are transmitted as 16-bit words.
pub const BYTES_PER_PIXEL: usize = 2;
/// Packet indices are carried in a 24-bit field.
pub const MAX_PACKET_INDEX: u32 = 0x00FF_FFFF;

/// Immutable description of a connected camera's frame layout.
///
/// Built once per connect (or payload-size renegotiation). Everything the frame
/// assembler needs to size its slot table is derived here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    width: u32,
    height: u32,
    frame_bytes: usize,
    packet_size: u32,
    header_len: u32,
    effective_payload: usize,
    total_packets: u32,
}

impl CameraDescriptor {
    /// Build a descriptor from the packet size negotiated with the device.
    ///
    /// The effective payload is what remains of `packet_size` after the IP, UDP
    /// and data-path headers.
    pub fn from_packet_size(width: u32, height: u32, packet_size: u32) -> Result<Self> {
        let overhead = IP_HEADER_LEN + UDP_HEADER_LEN + DATA_HEADER_LEN;
        if packet_size <= overhead {
            return Err(CameraError::protocol(
                "descriptor",
                format!("packet size {packet_size} leaves no payload after {overhead} header bytes"),
            ));
        }
        let mut descriptor =
            Self::with_payload(width, height, (packet_size - overhead) as usize)?;
        descriptor.packet_size = packet_size;
        Ok(descriptor)
    }

    /// Build a descriptor from an already known effective payload per packet.
    pub fn with_payload(width: u32, height: u32, effective_payload: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(CameraError::protocol(
                "descriptor",
                format!("sensor size {width}x{height} is empty"),
            ));
        }
        if effective_payload == 0 {
            return Err(CameraError::protocol("descriptor", "effective payload is zero"));
        }

        let frame_bytes = width as usize * height as usize * BYTES_PER_PIXEL;
        let total_packets = Self::packets_for(frame_bytes, effective_payload);
        if total_packets > MAX_PACKET_INDEX {
            return Err(CameraError::protocol(
                "descriptor",
                format!("{total_packets} packets exceed the 24-bit packet index"),
            ));
        }

        let overhead = IP_HEADER_LEN + UDP_HEADER_LEN + DATA_HEADER_LEN;
        Ok(Self {
            width,
            height,
            frame_bytes,
            packet_size: effective_payload as u32 + overhead,
            header_len: DATA_HEADER_LEN,
            effective_payload,
            total_packets,
        })
    }

    /// `ceil((frame_bytes + TRAILER_RESERVE) / effective_payload)`
    pub fn packets_for(frame_bytes: usize, effective_payload: usize) -> u32 {
        (frame_bytes + TRAILER_RESERVE).div_ceil(effective_payload) as u32
    }

    /// Sensor width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Sensor height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes in one full 16-bit frame
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Negotiated packet size including IP and UDP headers
    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    /// Data-path header length
    pub fn header_len(&self) -> u32 {
        self.header_len
    }

    /// Pixel bytes carried by one full payload packet
    pub fn effective_payload(&self) -> usize {
        self.effective_payload
    }

    /// Number of payload packets per frame, numbered from 1
    pub fn total_packets(&self) -> u32 {
        self.total_packets
    }

    /// Byte range of the frame carried by payload packet `index`.
    ///
    /// Returns `None` for index 0 and indices past the last packet.
    pub fn pixel_range(&self, index: u32) -> Option<Range<usize>> {
        if index == 0 || index > self.total_packets {
            return None;
        }
        let start = ((index - 1) as usize * self.effective_payload).min(self.frame_bytes);
        let end = (start + self.effective_payload).min(self.frame_bytes);
        Some(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn large_sensor_packet_count_matches_formula() {
        let descriptor = CameraDescriptor::with_payload(4096, 4096, 1460).unwrap();
        assert_eq!(descriptor.frame_bytes(), 33_554_432);
        assert_eq!(descriptor.total_packets(), 22_983);
    }

    #[test]
    fn packet_size_subtracts_all_headers() {
        let descriptor = CameraDescriptor::from_packet_size(4096, 4096, 1500).unwrap();
        assert_eq!(descriptor.effective_payload(), 1464);
        assert_eq!(descriptor.packet_size(), 1500);
        assert_eq!(descriptor.header_len(), 8);
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(CameraDescriptor::from_packet_size(100, 100, 36).is_err());
        assert!(CameraDescriptor::with_payload(0, 100, 1400).is_err());
        assert!(CameraDescriptor::with_payload(100, 100, 0).is_err());
    }

    #[test]
    fn last_range_is_short() {
        let descriptor = CameraDescriptor::with_payload(10, 10, 64).unwrap();
        // 200 frame bytes + 64 reserve over 64-byte payloads
        assert_eq!(descriptor.total_packets(), 5);
        assert_eq!(descriptor.pixel_range(1), Some(0..64));
        assert_eq!(descriptor.pixel_range(4), Some(192..200));
        assert_eq!(descriptor.pixel_range(0), None);
        assert_eq!(descriptor.pixel_range(6), None);
    }

    proptest! {
        #[test]
        fn packets_cover_frame_and_trailer(
            width in 1u32..2048,
            height in 1u32..2048,
            payload in 64usize..9000,
        ) {
            let descriptor = CameraDescriptor::with_payload(width, height, payload).unwrap();
            let total = descriptor.total_packets() as usize;
            prop_assert!(total >= 1);
            prop_assert!(total * payload >= descriptor.frame_bytes() + TRAILER_RESERVE);
            prop_assert!((total - 1) * payload < descriptor.frame_bytes() + TRAILER_RESERVE);
        }
    }
}
