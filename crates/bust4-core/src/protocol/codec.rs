//! Byte-stream framing
//!
//! The receive side is a byte-at-a-time state machine that validates the
//! sync marker, type byte, declared length and trailing checksum. Any
//! violation silently discards the frame in progress and resynchronizes
//! on the next sync byte; corrupt frames are never surfaced as errors.
//!
//! The transmit side emits the sync byte, the frame's stored bytes, and
//! a trailing echo of the declared length. The echo is not part of the
//! receive algorithm (a receiver is back in the waiting state by then
//! and skips it as a non-sync byte) but units on the bus transmit it,
//! so the encoder reproduces the same wire image.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::Frame;
use super::{ProtocolError, FRAME_TYPE_ALT, FRAME_TYPE_NORMAL, MAX_DECLARED_LEN, SYNC_BYTE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the sync marker; nothing buffered.
    Wait,
    /// Next byte is the frame type.
    Type,
    /// Next byte is the declared length.
    Length,
    /// Accumulating payload bytes into the running checksum.
    Payload,
    /// Next byte is the trailing checksum.
    Checksum,
}

/// Incremental frame decoder; push one byte at a time.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    buf: Vec<u8>,
    checksum: u8,
}

impl FrameDecoder {
    /// Fresh decoder in the waiting state.
    pub fn new() -> Self {
        Self {
            state: DecodeState::Wait,
            buf: Vec::with_capacity(super::MAX_FRAME_SIZE),
            checksum: 0,
        }
    }

    /// True when no frame is in progress. The link loop must not yield
    /// to transmission while this is false.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Wait
    }

    /// Feed one byte; returns a frame when this byte completes one that
    /// passes the trailing checksum.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            DecodeState::Wait => {
                // Sync byte is consumed, not stored.
                if byte == SYNC_BYTE {
                    self.state = DecodeState::Type;
                }
                None
            }
            DecodeState::Type => {
                if byte == FRAME_TYPE_NORMAL || byte == FRAME_TYPE_ALT {
                    self.buf.push(byte);
                    self.state = DecodeState::Length;
                } else {
                    self.reset();
                }
                None
            }
            DecodeState::Length => {
                if byte <= MAX_DECLARED_LEN {
                    self.buf.push(byte);
                    self.state = DecodeState::Payload;
                } else {
                    self.reset();
                }
                None
            }
            DecodeState::Payload => {
                self.buf.push(byte);
                self.checksum ^= byte;
                // Stored bytes reach declared + 1 once the payload run
                // (declared - 1 bytes after type and length) is in.
                if self.buf.len() >= self.buf[1] as usize + 1 {
                    self.state = DecodeState::Checksum;
                }
                None
            }
            DecodeState::Checksum => {
                let frame = if byte == self.checksum {
                    self.buf.push(byte);
                    Some(Frame::from_stored(std::mem::take(&mut self.buf)))
                } else {
                    tracing::trace!(
                        expected = self.checksum,
                        actual = byte,
                        "dropping frame with bad checksum"
                    );
                    None
                };
                self.reset();
                frame
            }
        }
    }

    /// Abandon any frame in progress and return to the waiting state.
    /// The link loop calls this when the line goes quiet mid-frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.checksum = 0;
        self.state = DecodeState::Wait;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame codec over a byte stream, usable with `tokio_util` I/O.
#[derive(Debug, Default)]
pub struct FrameCodec {
    decoder: FrameDecoder,
}

impl FrameCodec {
    /// Fresh codec with an idle decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no inbound frame is mid-flight.
    pub fn is_idle(&self) -> bool {
        self.decoder.is_idle()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        while src.has_remaining() {
            if let Some(frame) = self.decoder.push(src.get_u8()) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(frame.wire_len());
        dst.put_u8(SYNC_BYTE);
        dst.put_slice(frame.as_bytes());
        dst.put_u8(frame.declared_len());
        Ok(())
    }
}
