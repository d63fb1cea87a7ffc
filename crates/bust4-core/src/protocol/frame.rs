//! Frame encoding and field access
//!
//! A frame is kept as the raw stored bytes (everything after the sync
//! byte) with accessor functions reading fields at fixed offsets. The
//! wire layout, offsets relative to the stored buffer:
//!
//! ```text
//! +------+--------+----+------+----------+----------+--------+---------+-------+
//! | type | length | to | from | protocol | msg size | hdr ck | message | trail |
//! |  1   |   1    | 2  |  2   |    1     |    1     |   1    |    m    |   1   |
//! +------+--------+----+------+----------+----------+--------+---------+-------+
//! ```
//!
//! `length = m + 8`. The header checksum is the XOR of the six header
//! bytes before it, the trailing byte is the XOR of the message bytes.
//! On the wire the frame is preceded by the sync byte and followed by
//! an echo of the length byte; neither is stored.
//! Because the header region XORs to zero by construction, the trailing
//! byte also equals the receiver's running XOR over header + message,
//! which is what the decoder verifies.

use super::address::BusAddress;
use super::message::{MessageFlags, Protocol};
use super::{ProtocolError, FRAME_TYPE_ALT, FRAME_TYPE_NORMAL, MAX_MESSAGE_LEN};

const OFFSET_LENGTH: usize = 1;
const OFFSET_TO: usize = 2;
const OFFSET_FROM: usize = 4;
const OFFSET_PROTOCOL: usize = 6;
const OFFSET_MESSAGE_SIZE: usize = 7;
const OFFSET_HEADER_CHECKSUM: usize = 8;
const OFFSET_MESSAGE: usize = 9;

/// XOR of a byte run; the only checksum the bus uses.
pub(crate) fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// One complete unit of bytes exchanged over the serial link, stored as
/// received (sync byte excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
}

impl Frame {
    /// Construct a frame from its logical parts. The declared size
    /// fields and both embedded checksums are filled in so that the
    /// result is internally consistent and passes the receive-side
    /// verification unchanged.
    pub fn build(
        frame_type: u8,
        to: BusAddress,
        from: BusAddress,
        protocol: Protocol,
        message: &[u8],
    ) -> Result<Self, ProtocolError> {
        if frame_type != FRAME_TYPE_NORMAL && frame_type != FRAME_TYPE_ALT {
            return Err(ProtocolError::InvalidFrameType(frame_type));
        }
        if message.len() > MAX_MESSAGE_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: message.len(),
                max: MAX_MESSAGE_LEN,
            });
        }

        let declared = message.len() as u8 + 8;
        let mut data = Vec::with_capacity(message.len() + 10);
        data.push(frame_type);
        data.push(declared);
        data.push(to.node);
        data.push(to.endpoint);
        data.push(from.node);
        data.push(from.endpoint);
        data.push(protocol.as_byte());
        data.push(message.len() as u8 + 1);
        data.push(xor_checksum(&data[OFFSET_TO..OFFSET_HEADER_CHECKSUM]));
        data.extend_from_slice(message);
        data.push(xor_checksum(message));

        Ok(Self { data })
    }

    /// Wrap stored bytes delivered by the decoder.
    pub(crate) fn from_stored(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Transport-layer frame type marker (0x55 normal, 0xF0 alternate).
    pub fn frame_type(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    /// Declared remaining length.
    pub fn declared_len(&self) -> u8 {
        self.data.get(OFFSET_LENGTH).copied().unwrap_or(0)
    }

    /// Destination address, if the header is present.
    pub fn to(&self) -> Option<BusAddress> {
        Some(BusAddress::new(
            *self.data.get(OFFSET_TO)?,
            *self.data.get(OFFSET_TO + 1)?,
        ))
    }

    /// Source address, if the header is present.
    pub fn from(&self) -> Option<BusAddress> {
        Some(BusAddress::new(
            *self.data.get(OFFSET_FROM)?,
            *self.data.get(OFFSET_FROM + 1)?,
        ))
    }

    /// Raw sub-protocol id byte.
    pub fn protocol_byte(&self) -> Option<u8> {
        self.data.get(OFFSET_PROTOCOL).copied()
    }

    /// Sub-protocol id, if it is one of the two known values.
    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_byte(self.protocol_byte()?)
    }

    /// Declared message size (message length + 1).
    pub fn message_size(&self) -> Option<u8> {
        self.data.get(OFFSET_MESSAGE_SIZE).copied()
    }

    /// Embedded header checksum byte.
    pub fn header_checksum(&self) -> Option<u8> {
        self.data.get(OFFSET_HEADER_CHECKSUM).copied()
    }

    /// Message bytes between the header and the trailing checksum.
    /// Empty when the frame is too short to carry a message.
    pub fn message(&self) -> &[u8] {
        if self.data.len() > OFFSET_MESSAGE + 1 {
            &self.data[OFFSET_MESSAGE..self.data.len() - 1]
        } else {
            &[]
        }
    }

    /// Device class byte (first message byte).
    pub fn device(&self) -> Option<u8> {
        self.message().first().copied()
    }

    /// Command code byte (second message byte).
    pub fn command(&self) -> Option<u8> {
        self.message().get(1).copied()
    }

    /// DMP flags byte.
    pub fn flags(&self) -> Option<MessageFlags> {
        Some(MessageFlags::from_bits(*self.message().get(2)?))
    }

    /// DMP sequence byte. Replies overload it as a progress/size field.
    pub fn sequence(&self) -> Option<u8> {
        self.message().get(3).copied()
    }

    /// DMP status byte.
    pub fn status(&self) -> Option<u8> {
        self.message().get(4).copied()
    }

    /// Payload of a DMP message (after flags, sequence and status).
    pub fn dmp_payload(&self) -> &[u8] {
        let message = self.message();
        message.get(5..).unwrap_or(&[])
    }

    /// Payload of a DEP message (directly after device and command).
    pub fn dep_payload(&self) -> &[u8] {
        let message = self.message();
        message.get(2..).unwrap_or(&[])
    }

    /// Trailing checksum byte verified by the receiver.
    pub fn trailing_checksum(&self) -> u8 {
        self.data.last().copied().unwrap_or(0)
    }

    /// Stored bytes, sync excluded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes this frame occupies on the wire: the leading
    /// sync byte, the stored bytes, and the trailing length echo.
    pub fn wire_len(&self) -> usize {
        self.data.len() + 2
    }
}
