//! # Bus T4 Core Library
//!
//! Protocol engine for bridging the Bus T4 two-wire home-automation bus
//! (used by motorized gate and door control units) to a network client.
//!
//! This library provides:
//! - Frame codec for the checksummed serial wire format
//! - Bounded transport queues decoupling frame I/O from processing
//! - A single-outstanding-request correlator with timeout and retry
//! - A discovery engine that incrementally learns a remote unit's
//!   address, command inventory, menu tree, and per-command metadata
//!
//! The HTTP presentation layer, network connectivity management, and
//! human-readable label tables are external collaborators; they consume
//! this engine through the bus client's public operations.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bust4_core::{engine::BusClient, protocol::serial};
//!
//! let port = serial::open_port("/dev/ttyS0", None)?;
//! let client = BusClient::spawn(port, Default::default());
//!
//! // Discovery runs in the background; snapshot its progress.
//! let unit = client.lock_unit(std::time::Duration::from_secs(1)).await?;
//! println!("commands: {:02x?}", unit.commands);
//! ```

#![warn(missing_docs)]

pub mod engine;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::engine::{BusClient, EngineConfig};
    pub use crate::engine::model::{CommandInfo, MenuRecord, RemoteUnit};
    pub use crate::protocol::address::BusAddress;
    pub use crate::protocol::frame::Frame;
    pub use crate::protocol::message::{DeviceClass, MessageFlags, Protocol};
    pub use crate::protocol::ProtocolError;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
