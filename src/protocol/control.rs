//! Control path: register commands and replies

use std::net::Ipv4Addr;

use crate::{CameraError, Result};

/// Magic for commands that expect a reply
pub const MAGIC_ACK: u16 = 0x4201;
/// Magic for fire-and-forget commands
pub const MAGIC_NO_ACK: u16 = 0x4200;
/// `[magic:2][opcode:2][payloadLen:2][sequence:2]`
pub const CONTROL_HEADER_LEN: usize = 8;
/// Register read and write replies are exactly this long
pub const REGISTER_REPLY_LEN: usize = 12;
/// Shortest discovery reply that carries the device address
pub const DISCOVERY_REPLY_MIN_LEN: usize = 48;

const DISCOVERY_IP_OFFSET: usize = 44;
const WRITE_ACK_OFFSET: usize = 11;

/// Control operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Discovery = 0x0002,
    Resend = 0x0040,
    ReadRegister = 0x0080,
    WriteRegister = 0x0082,
}

impl Opcode {
    /// Opcode the device answers with
    pub fn ack(self) -> u16 {
        self as u16 + 1
    }

    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0002 => Some(Opcode::Discovery),
            0x0040 => Some(Opcode::Resend),
            0x0080 => Some(Opcode::ReadRegister),
            0x0082 => Some(Opcode::WriteRegister),
            _ => None,
        }
    }
}

/// Outbound control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Discovery,
    Read { address: u32 },
    Write { address: u32, value: u32 },
    /// Ask the device to stream packets `first..=last` of a frame again
    Resend { frame_id: u16, first: u32, last: u32 },
}

impl ControlCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlCommand::Discovery => Opcode::Discovery,
            ControlCommand::Read { .. } => Opcode::ReadRegister,
            ControlCommand::Write { .. } => Opcode::WriteRegister,
            ControlCommand::Resend { .. } => Opcode::Resend,
        }
    }

    /// Whether the device answers this command
    pub fn expects_reply(&self) -> bool {
        !matches!(self, ControlCommand::Resend { .. })
    }

    /// Register address named by the command, 0 when there is none
    pub fn address(&self) -> u32 {
        match self {
            ControlCommand::Read { address } | ControlCommand::Write { address, .. } => *address,
            _ => 0,
        }
    }

    /// Serialize with the given sequence id.
    pub fn encode(&self, sequence: u16) -> Vec<u8> {
        let magic = if self.expects_reply() { MAGIC_ACK } else { MAGIC_NO_ACK };
        let mut body: Vec<u8> = Vec::with_capacity(12);
        match *self {
            ControlCommand::Discovery => {}
            ControlCommand::Read { address } => body.extend_from_slice(&address.to_be_bytes()),
            ControlCommand::Write { address, value } => {
                body.extend_from_slice(&address.to_be_bytes());
                body.extend_from_slice(&value.to_be_bytes());
            }
            ControlCommand::Resend { frame_id, first, last } => {
                body.extend_from_slice(&u32::from(frame_id).to_be_bytes());
                body.extend_from_slice(&first.to_be_bytes());
                body.extend_from_slice(&last.to_be_bytes());
            }
        }

        let mut frame = Vec::with_capacity(CONTROL_HEADER_LEN + body.len());
        frame.extend_from_slice(&magic.to_be_bytes());
        frame.extend_from_slice(&(self.opcode() as u16).to_be_bytes());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&sequence.to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Parse a command as the device sees it. Returns the sequence id too.
    pub fn decode(frame: &[u8]) -> Result<(u16, Self)> {
        if frame.len() < CONTROL_HEADER_LEN {
            return Err(CameraError::protocol(
                "control command",
                format!("{} bytes is shorter than the header", frame.len()),
            ));
        }
        let magic = be_u16(frame, 0);
        if magic != MAGIC_ACK && magic != MAGIC_NO_ACK {
            return Err(CameraError::protocol("control command", format!("bad magic {magic:#06x}")));
        }
        let raw_opcode = be_u16(frame, 2);
        let opcode = Opcode::from_u16(raw_opcode).ok_or_else(|| {
            CameraError::protocol("control command", format!("unknown opcode {raw_opcode:#06x}"))
        })?;
        let payload_len = be_u16(frame, 4) as usize;
        let sequence = be_u16(frame, 6);
        let body = &frame[CONTROL_HEADER_LEN..];
        if body.len() < payload_len {
            return Err(CameraError::protocol(
                "control command",
                format!("payload length {payload_len} exceeds {} received bytes", body.len()),
            ));
        }

        let need = |n: usize| {
            if payload_len < n {
                Err(CameraError::protocol(
                    "control command",
                    format!("{opcode:?} needs {n} payload bytes, got {payload_len}"),
                ))
            } else {
                Ok(())
            }
        };
        let command = match opcode {
            Opcode::Discovery => ControlCommand::Discovery,
            Opcode::ReadRegister => {
                need(4)?;
                ControlCommand::Read { address: be_u32(body, 0) }
            }
            Opcode::WriteRegister => {
                need(8)?;
                ControlCommand::Write { address: be_u32(body, 0), value: be_u32(body, 4) }
            }
            Opcode::Resend => {
                need(12)?;
                ControlCommand::Resend {
                    frame_id: be_u32(body, 0) as u16,
                    first: be_u32(body, 4),
                    last: be_u32(body, 8),
                }
            }
        };
        Ok((sequence, command))
    }
}

/// Reply received on the control path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    /// Sequence id mirrored from the command
    pub sequence: u16,
    /// Whole datagram, header included
    pub datagram: Vec<u8>,
}

impl ControlReply {
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < CONTROL_HEADER_LEN {
            return Err(CameraError::protocol(
                "control reply",
                format!("{} bytes is shorter than the header", datagram.len()),
            ));
        }
        Ok(Self { sequence: be_u16(datagram, 6), datagram: datagram.to_vec() })
    }

    pub fn len(&self) -> usize {
        self.datagram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagram.is_empty()
    }

    /// Register value carried by a read reply.
    pub fn read_value(&self) -> Result<u32> {
        if self.datagram.len() != REGISTER_REPLY_LEN {
            return Err(CameraError::protocol(
                "read reply",
                format!("expected {REGISTER_REPLY_LEN} bytes, got {}", self.datagram.len()),
            ));
        }
        Ok(be_u32(&self.datagram, 8))
    }

    /// Whether a write reply acknowledges the write.
    pub fn write_acknowledged(&self) -> bool {
        self.datagram.len() == REGISTER_REPLY_LEN && self.datagram[WRITE_ACK_OFFSET] == 0x01
    }

    /// Build a read reply, as the device would send it.
    pub fn encode_read(sequence: u16, value: u32) -> Vec<u8> {
        let mut frame = reply_header(Opcode::ReadRegister, 4, sequence);
        frame.extend_from_slice(&value.to_be_bytes());
        frame
    }

    /// Build a write acknowledgment.
    pub fn encode_write_ack(sequence: u16, acknowledged: bool) -> Vec<u8> {
        let mut frame = reply_header(Opcode::WriteRegister, 4, sequence);
        frame.extend_from_slice(&[0, 0, 0, u8::from(acknowledged)]);
        frame
    }

    /// Build a discovery reply announcing `address`.
    pub fn encode_discovery(sequence: u16, address: Ipv4Addr) -> Vec<u8> {
        let body_len = DISCOVERY_REPLY_MIN_LEN - CONTROL_HEADER_LEN;
        let mut frame = reply_header(Opcode::Discovery, body_len as u16, sequence);
        frame.resize(DISCOVERY_REPLY_MIN_LEN, 0);
        frame[DISCOVERY_IP_OFFSET..DISCOVERY_REPLY_MIN_LEN].copy_from_slice(&address.octets());
        frame
    }
}

/// Device identity carried by a discovery reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub address: Ipv4Addr,
}

impl DiscoveryReply {
    pub fn parse(reply: &ControlReply) -> Result<Self> {
        let bytes = &reply.datagram;
        if bytes.len() < DISCOVERY_REPLY_MIN_LEN {
            return Err(CameraError::protocol(
                "discovery reply",
                format!("expected at least {DISCOVERY_REPLY_MIN_LEN} bytes, got {}", bytes.len()),
            ));
        }
        let octets = &bytes[DISCOVERY_IP_OFFSET..DISCOVERY_IP_OFFSET + 4];
        Ok(Self { address: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]) })
    }
}

fn reply_header(opcode: Opcode, payload_len: u16, sequence: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DISCOVERY_REPLY_MIN_LEN);
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&opcode.ack().to_be_bytes());
    frame.extend_from_slice(&payload_len.to_be_bytes());
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}
