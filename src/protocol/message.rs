use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{DisassociateInfo, HandshakeInfo};

/// Control-plane protocol data units exchanged over an association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pdu {
    /// Handshake carrying the sender's address and incarnation UID
    Associate(HandshakeInfo),

    /// Orderly teardown with a stated reason
    Disassociate(DisassociateInfo),

    /// Liveness signal, carries nothing
    Heartbeat,

    /// Opaque application bytes
    Payload(Bytes),
}

impl Pdu {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Pdu::Associate(_) => "Associate",
            Pdu::Disassociate(_) => "Disassociate",
            Pdu::Heartbeat => "Heartbeat",
            Pdu::Payload(_) => "Payload",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Address;

    #[test]
    fn test_pdu_kind() {
        let info = HandshakeInfo::new(Address::local("loopback", "sys"), 1);
        assert_eq!(Pdu::Associate(info).kind(), "Associate");
        assert_eq!(
            Pdu::Disassociate(DisassociateInfo::Shutdown).kind(),
            "Disassociate"
        );
        assert_eq!(Pdu::Heartbeat.kind(), "Heartbeat");
        assert_eq!(Pdu::Payload(Bytes::from_static(b"x")).kind(), "Payload");
    }
}
