//! Shared device model
//!
//! Everything discovery learns about the remote unit accumulates here:
//! its bus address, the command inventory, the menu tree, and the
//! per-command metadata blobs. Presentation layers read the same
//! structure; the engine guards it with an async mutex so a reader never
//! observes a discovery round-trip half-applied.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::protocol::address::BusAddress;

/// Minimum stored size of a command metadata blob. Short replies are
/// zero-padded up to this so the fixed-offset accessors stay in bounds.
pub const COMMAND_INFO_MIN_LEN: usize = 24;

/// One entry of the remote unit's menu tree, stored as the big-endian
/// u16 read off the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MenuRecord(pub u16);

impl MenuRecord {
    /// Build a record from its parts: command code, group marker and
    /// nesting depth.
    pub fn new(code: u8, depth: u8, group: bool) -> Self {
        let mut low = depth & 0x07;
        if group {
            low |= 0x08;
        }
        Self(u16::from_be_bytes([code, low]))
    }

    /// Command code this entry refers to.
    pub fn code(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Nesting depth within the menu tree.
    pub fn depth(&self) -> u8 {
        (self.0 & 0x07) as u8
    }

    /// True for group headers, which carry no value of their own.
    pub fn is_group(&self) -> bool {
        self.0 & 0x08 != 0
    }

    /// True for the root placeholder entry.
    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

/// Interpreted view over a command metadata blob.
///
/// The blob is at least [`COMMAND_INFO_MIN_LEN`] bytes; fixed offsets
/// describe the value's size, presentation type and scaling.
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo<'a> {
    blob: &'a [u8],
}

impl<'a> CommandInfo<'a> {
    /// Wrap a stored metadata blob.
    pub fn new(blob: &'a [u8]) -> Self {
        Self { blob }
    }

    fn byte(&self, index: usize) -> u8 {
        self.blob.get(index).copied().unwrap_or(0)
    }

    /// Size of the command's value in bytes.
    pub fn value_size(&self) -> u8 {
        self.byte(0) & 0x7F
    }

    /// Presentation type selector.
    pub fn type_selector(&self) -> u8 {
        self.byte(2)
    }

    /// Raw scaling/presentation flags.
    pub fn scaling_flags(&self) -> u8 {
        self.byte(3)
    }

    /// True when the raw value is divided for display.
    pub fn divides(&self) -> bool {
        self.byte(3) & 0x10 != 0
    }

    /// True when the raw value is multiplied for display.
    pub fn multiplies(&self) -> bool {
        self.byte(3) & 0x20 != 0
    }

    /// True when the value selects from an enumerated set.
    pub fn is_selection(&self) -> bool {
        self.byte(3) & 0x40 != 0
    }

    /// Number of selectable entries for selection-typed commands.
    pub fn selection_count(&self) -> u8 {
        self.byte(4)
    }

    /// Bitmap of which selection entries are valid.
    pub fn selection_bitmap(&self) -> &'a [u8] {
        self.blob.get(5..).unwrap_or(&[])
    }

    /// The raw blob bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.blob
    }
}

/// Accumulated knowledge about the remote unit on the bus.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteUnit {
    /// Learned bus address; starts at the unknown sentinel.
    pub address: BusAddress,

    /// Command codes the unit reported supporting.
    pub commands: Vec<u8>,

    /// Menu tree entries, indexed by position. Grows as paginated
    /// replies arrive; holes are root placeholders until filled.
    pub menu: Vec<MenuRecord>,

    /// Set once a menu reply carried the final-part marker.
    pub menu_complete: bool,

    /// Metadata blobs keyed by command code.
    pub command_info: BTreeMap<u8, Vec<u8>>,

    /// Set once every eligible menu entry has its metadata.
    pub command_info_complete: bool,
}

impl RemoteUnit {
    /// Fresh model with nothing learned yet.
    pub fn new() -> Self {
        Self {
            address: BusAddress::UNKNOWN,
            ..Default::default()
        }
    }

    /// True once the unit's address has been learned.
    pub fn has_address(&self) -> bool {
        self.address != BusAddress::UNKNOWN
    }

    /// Store a metadata blob for a command, zero-padding short replies
    /// so the fixed-offset accessors stay valid.
    pub fn insert_command_info(&mut self, code: u8, mut blob: Vec<u8>) {
        if blob.len() < COMMAND_INFO_MIN_LEN {
            blob.resize(COMMAND_INFO_MIN_LEN, 0);
        }
        self.command_info.insert(code, blob);
    }

    /// Interpreted view of a command's metadata, if fetched.
    pub fn command_info(&self, code: u8) -> Option<CommandInfo<'_>> {
        self.command_info.get(&code).map(|b| CommandInfo::new(b))
    }

    /// First menu entry that should have metadata but doesn't yet.
    /// Root placeholders and group headers carry none.
    pub fn next_missing_command_info(&self) -> Option<u8> {
        self.menu
            .iter()
            .filter(|r| !r.is_root() && !r.is_group())
            .map(|r| r.code())
            .find(|code| !self.command_info.contains_key(code))
    }

    /// True when nothing is left for discovery to do.
    pub fn discovery_complete(&self) -> bool {
        self.has_address()
            && !self.commands.is_empty()
            && self.menu_complete
            && self.command_info_complete
    }
}
