//! Core types and traits for the association layer
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod serde;
pub mod types;

use std::time::Duration;

pub use self::error::{Error, Result};
pub use self::types::{new_uid, Address, DisassociateInfo, HandshakeInfo, TransportConfig};

/// Default interval between heartbeat timer firings
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Default delay before an Associate PDU is retried after backpressure
pub const DEFAULT_BACKOFF_INTERVAL: Duration = Duration::from_millis(5);

/// Default capacity of a physical handle's write queue
pub const DEFAULT_OUTBOUND_BUFFER: usize = 1024;

/// Default largest PDU size in bytes
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Smallest accepted `max_frame_size`; an Associate PDU must always fit
pub const MIN_FRAME_SIZE: usize = 512;

/// Largest accepted `max_frame_size`; frame lengths travel as a u32
pub const MAX_FRAME_SIZE: usize = u32::MAX as usize;
