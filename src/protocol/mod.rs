//! Wire formats of the control and data paths.
//!
//! All multi-byte integers are big-endian. The control path carries fixed-layout
//! register commands and their replies; the data path carries the leader,
//! payload and trailer packets of a frame.

mod control;
mod data;
pub mod registers;

pub use control::{
    CONTROL_HEADER_LEN, ControlCommand, ControlReply, DISCOVERY_REPLY_MIN_LEN, DiscoveryReply,
    MAGIC_ACK, MAGIC_NO_ACK, Opcode, REGISTER_REPLY_LEN,
};
pub use data::{DataPacket, PacketKind};
