//! Protocol errors

use thiserror::Error;

/// Errors that can surface from the protocol engine.
///
/// Framing errors are deliberately absent: a corrupt frame is expected
/// line noise, silently dropped by the decoder while it resynchronizes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Device model lock timed out")]
    LockTimeout,

    #[error("Bus link closed")]
    LinkClosed,

    #[error("Request frame is missing its message header")]
    MalformedRequest,

    #[error("Invalid frame type: {0:#04x}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
