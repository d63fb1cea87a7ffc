//! Bus participant addressing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a participant on the automation bus: a node byte plus an
/// endpoint byte. Equality is structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusAddress {
    /// Node identifier
    pub node: u8,
    /// Endpoint within the node
    pub endpoint: u8,
}

impl BusAddress {
    /// Broadcast address; every unit on the bus accepts frames sent here.
    pub const BROADCAST: BusAddress = BusAddress::new(0xFF, 0xFF);

    /// The bridge's own fixed bus address.
    pub const BRIDGE: BusAddress = BusAddress::new(0x50, 0x90);

    /// Sentinel for a peer whose address has not been learned yet.
    /// Shares the broadcast value; a real unit never claims it.
    pub const UNKNOWN: BusAddress = BusAddress::BROADCAST;

    /// Create an address from its node and endpoint bytes.
    pub const fn new(node: u8, endpoint: u8) -> Self {
        Self { node, endpoint }
    }
}

impl Default for BusAddress {
    /// The not-yet-learned sentinel.
    fn default() -> Self {
        BusAddress::UNKNOWN
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}", self.node, self.endpoint)
    }
}
