//! Association transport: handshake, heartbeat and payload buffering on top of
//! a pluggable physical transport.
//!
//! An association is a named, monitored, bidirectional channel between two
//! actor systems. [`ProtocolTransport`] wraps any [`network::Transport`] and
//! runs one state machine per association; applications talk to it through
//! [`ProtocolHandle`].
pub mod core;
pub mod detector;
pub mod network;
pub mod protocol;
mod util;

// Re-export commonly used items
pub use crate::core::{Address, DisassociateInfo, Error, HandshakeInfo, Result, TransportConfig};
pub use crate::detector::{FailureDetector, FailureDetectorConfig};
pub use crate::network::{HandleEvent, HandleEventListener, ManagementCommand, Transport};
pub use crate::protocol::{
    AssociationEventListener, AssociationInfo, InboundAssociation, ProtocolHandle,
    ProtocolTransport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
