//! Message-level protocol constants
//!
//! A frame's message body starts with a device class byte and a command
//! byte; the DMP sub-protocol adds a flags/sequence/status triple before
//! the payload, DEP carries the payload directly.

use serde::{Deserialize, Serialize};

/// Sub-protocol identifier carried in the frame header. Selects how the
/// message body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// DEP: raw payload after device and command bytes.
    Dep,
    /// DMP: flags, sequence and status bytes precede the payload.
    Dmp,
}

impl Protocol {
    /// Wire value of this protocol id.
    pub fn as_byte(self) -> u8 {
        match self {
            Protocol::Dep => 1,
            Protocol::Dmp => 8,
        }
    }

    /// Parse a wire protocol id.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Protocol::Dep),
            8 => Some(Protocol::Dmp),
            _ => None,
        }
    }
}

/// Device class addressed by a message's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceClass {
    /// Generic unit functions (menu walking lives here).
    Standard = 0,
    /// Oview programmer.
    Oview = 1,
    /// Automation control unit.
    Controller = 4,
    /// Display unit.
    Screen = 6,
    /// Radio receiver.
    Radio = 10,
}

impl DeviceClass {
    /// Wire value of this device class.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Message flags bitfield.
///
/// Request/response and read/write intent, plus the multi-part
/// completion marker used by paginated replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// Final part of a multi-part exchange.
    pub const FINAL: u8 = 0x01;
    /// Acknowledgement requested/granted.
    pub const ACK: u8 = 0x08;
    /// Read intent.
    pub const GET: u8 = 0x10;
    /// Write intent.
    pub const SET: u8 = 0x20;
    /// Unsolicited event notification.
    pub const EVENT: u8 = 0x40;
    /// Marks the message as a request.
    pub const REQUEST: u8 = 0x80;

    /// Empty flag set.
    pub fn new() -> Self {
        Self(0)
    }

    /// Flag set for a read request expecting an acknowledged reply.
    pub fn get_request() -> Self {
        Self(Self::REQUEST | Self::ACK | Self::GET | Self::FINAL)
    }

    /// Flag set for a write request expecting an acknowledged reply.
    pub fn set_request() -> Self {
        Self(Self::REQUEST | Self::ACK | Self::SET | Self::FINAL)
    }

    /// Flag set for an info request (no read/write intent).
    pub fn info_request() -> Self {
        Self(Self::REQUEST | Self::ACK | Self::FINAL)
    }

    /// True when the FINAL bit is set.
    pub fn is_final(&self) -> bool {
        self.0 & Self::FINAL != 0
    }

    /// True when the EVENT bit is set.
    pub fn is_event(&self) -> bool {
        self.0 & Self::EVENT != 0
    }

    /// True when the REQUEST bit is set.
    pub fn is_request(&self) -> bool {
        self.0 & Self::REQUEST != 0
    }

    /// Raw bit pattern.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Rebuild from a raw bit pattern.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// Assemble a DMP message body: device, command, flags, sequence, status,
/// then the payload bytes.
pub fn dmp_message(
    device: DeviceClass,
    command: u8,
    flags: MessageFlags,
    sequence: u8,
    status: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut message = Vec::with_capacity(5 + payload.len());
    message.push(device.as_byte());
    message.push(command);
    message.push(flags.bits());
    message.push(sequence);
    message.push(status);
    message.extend_from_slice(payload);
    message
}
