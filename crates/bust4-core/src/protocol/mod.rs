//! Bus T4 wire protocol
//!
//! Implements the framed, checksummed serial format spoken by Bus T4
//! control units: a sync byte, a type byte, a declared length, a header
//! with source/destination addresses, and an XOR trailing checksum.

pub mod address;
pub mod codec;
mod error;
pub mod frame;
pub mod message;
pub mod serial;

pub use address::BusAddress;
pub use codec::{FrameCodec, FrameDecoder};
pub use error::ProtocolError;
pub use frame::Frame;
pub use message::{DeviceClass, MessageFlags, Protocol};

/// Sync marker preceding every frame on the wire; never stored.
pub const SYNC_BYTE: u8 = 0x00;

/// Frame type marker for the normal wire sub-protocol.
pub const FRAME_TYPE_NORMAL: u8 = 0x55;

/// Frame type marker for the alternate wire sub-protocol.
pub const FRAME_TYPE_ALT: u8 = 0xF0;

/// Maximum stored frame size in bytes (type + length + payload + checksum).
pub const MAX_FRAME_SIZE: usize = 63;

/// Maximum value of the declared-length byte.
pub const MAX_DECLARED_LEN: u8 = 60;

/// Maximum message length that fits the declared-length limit.
pub const MAX_MESSAGE_LEN: usize = MAX_DECLARED_LEN as usize - 8;

/// Default baud rate of the bus.
pub const DEFAULT_BAUD_RATE: u32 = 19200;
