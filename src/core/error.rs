use std::io;
use thiserror::Error;

use super::types::DisassociateInfo;

/// Error types for the association layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("Refused association with quarantined UID {0}")]
    ForbiddenUid(u64),

    #[error("Peer judged unavailable by the failure detector")]
    HandshakeTimeout,

    #[error("Peer disassociated: {0}")]
    PeerDisassociated(DisassociateInfo),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Association was disassociated before the handshake finished")]
    DisassociatedBeforeHandshake,

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new transport failure
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::TransportFailure(msg.into())
    }

    /// Creates a new malformed PDU error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedPdu(msg.into())
    }

    /// Creates a new protocol violation error
    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    /// Creates a new address error
    pub fn address(msg: impl Into<String>) -> Self {
        Error::Address(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// The reason reported to listeners when an association ends with this error.
    pub fn disassociate_info(&self) -> DisassociateInfo {
        match self {
            Error::PeerDisassociated(info) => *info,
            Error::ForbiddenUid(_) => DisassociateInfo::Quarantined,
            _ => DisassociateInfo::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::protocol_violation("heartbeat before handshake");
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(
            err.to_string(),
            "Protocol violation: heartbeat before handshake"
        );
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_disassociate_info_mapping() {
        assert_eq!(
            Error::PeerDisassociated(DisassociateInfo::Shutdown).disassociate_info(),
            DisassociateInfo::Shutdown
        );
        assert_eq!(
            Error::ForbiddenUid(7).disassociate_info(),
            DisassociateInfo::Quarantined
        );
        assert_eq!(
            Error::HandshakeTimeout.disassociate_info(),
            DisassociateInfo::Unknown
        );
        assert_eq!(
            Error::malformed("garbage").disassociate_info(),
            DisassociateInfo::Unknown
        );
    }
}
