//! Data path: leader, payload and trailer packets

use crate::types::DATA_HEADER_LEN;
use crate::{CameraError, Result};

/// Role of a data packet within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Leader = 0x01,
    Trailer = 0x02,
    Payload = 0x03,
}

impl TryFrom<u8> for PacketKind {
    type Error = CameraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(PacketKind::Leader),
            0x02 => Ok(PacketKind::Trailer),
            0x03 => Ok(PacketKind::Payload),
            other => Err(CameraError::protocol("data packet", format!("unknown packet type {other:#04x}"))),
        }
    }
}

/// Borrowed view of one data-path datagram.
///
/// Layout: `[status:2][frameId:2][packetType:1][packetIndex:3][payload]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket<'a> {
    pub status: u16,
    pub frame_id: u16,
    pub kind: PacketKind,
    pub index: u32,
    pub payload: &'a [u8],
}

impl<'a> DataPacket<'a> {
    pub fn parse(datagram: &'a [u8]) -> Result<Self> {
        let header = DATA_HEADER_LEN as usize;
        if datagram.len() < header {
            return Err(CameraError::protocol(
                "data packet",
                format!("{} bytes is shorter than the {header}-byte header", datagram.len()),
            ));
        }
        Ok(Self {
            status: u16::from_be_bytes([datagram[0], datagram[1]]),
            frame_id: u16::from_be_bytes([datagram[2], datagram[3]]),
            kind: PacketKind::try_from(datagram[4])?,
            index: u32::from_be_bytes([0, datagram[5], datagram[6], datagram[7]]),
            payload: &datagram[header..],
        })
    }

    /// Serialize, as the device would send it. The index is truncated to 24 bits.
    pub fn encode(&self) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(DATA_HEADER_LEN as usize + self.payload.len());
        datagram.extend_from_slice(&self.status.to_be_bytes());
        datagram.extend_from_slice(&self.frame_id.to_be_bytes());
        datagram.push(self.kind as u8);
        datagram.extend_from_slice(&self.index.to_be_bytes()[1..]);
        datagram.extend_from_slice(self.payload);
        datagram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_big_endian() {
        let datagram = [0x00, 0x00, 0x12, 0x34, 0x03, 0x01, 0x02, 0x03, 0xAA, 0xBB];
        let packet = DataPacket::parse(&datagram).unwrap();
        assert_eq!(packet.frame_id, 0x1234);
        assert_eq!(packet.kind, PacketKind::Payload);
        assert_eq!(packet.index, 0x010203);
        assert_eq!(packet.payload, &[0xAA, 0xBB]);
        assert_eq!(packet.encode(), datagram);
    }

    #[test]
    fn leader_and_trailer_have_no_required_payload() {
        let leader = DataPacket { status: 0, frame_id: 1, kind: PacketKind::Leader, index: 0, payload: &[] };
        let parsed_leader = leader.encode();
        assert_eq!(DataPacket::parse(&parsed_leader).unwrap(), leader);
    }

    #[test]
    fn short_or_unknown_packets_are_rejected() {
        assert!(DataPacket::parse(&[0x00; 7]).is_err());
        assert!(DataPacket::parse(&[0, 0, 0, 1, 0x07, 0, 0, 1]).is_err());
    }
}
