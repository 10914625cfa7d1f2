use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use crate::detector::FailureDetectorConfig;

/// Endpoint identifier of an actor system: `protocol://system@host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    protocol: String,
    system: String,
    host: Option<String>,
    port: Option<u16>,
}

impl Address {
    /// Creates an address without a network location
    pub fn local(protocol: impl Into<String>, system: impl Into<String>) -> Self {
        Address {
            protocol: protocol.into(),
            system: system.into(),
            host: None,
            port: None,
        }
    }

    /// Creates an address reachable at `host:port`
    pub fn remote(
        protocol: impl Into<String>,
        system: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Address {
            protocol: protocol.into(),
            system: system.into(),
            host: Some(host.into()),
            port: Some(port),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns `true` when the address carries both host and port
    pub fn has_location(&self) -> bool {
        self.host.is_some() && self.port.is_some()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.system)?;
        if let Some(host) = &self.host {
            if host.contains(':') {
                write!(f, "@[{}]", host)?;
            } else {
                write!(f, "@{}", host)?;
            }
            if let Some(port) = self.port {
                write!(f, ":{}", port)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (protocol, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::address(format!("missing '://' in {:?}", s)))?;
        if protocol.is_empty() {
            return Err(Error::address(format!("empty protocol in {:?}", s)));
        }

        let Some((system, location)) = rest.split_once('@') else {
            if rest.is_empty() {
                return Err(Error::address(format!("empty system name in {:?}", s)));
            }
            return Ok(Address::local(protocol, rest));
        };
        if system.is_empty() {
            return Err(Error::address(format!("empty system name in {:?}", s)));
        }

        let (host, port) = location
            .rsplit_once(':')
            .ok_or_else(|| Error::address(format!("missing port in {:?}", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::address(format!("empty host in {:?}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::address(format!("bad port in {:?}: {}", s, e)))?;

        Ok(Address::remote(protocol, system, host, port))
    }
}

/// Identity exchanged in the Associate PDU
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Address of the sending system
    pub origin: Address,
    /// Incarnation UID of the sending system
    pub uid: u64,
}

impl HandshakeInfo {
    pub fn new(origin: Address, uid: u64) -> Self {
        HandshakeInfo { origin, uid }
    }
}

/// Reason carried by a Disassociate PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisassociateInfo {
    Unknown,
    Shutdown,
    Quarantined,
}

impl fmt::Display for DisassociateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DisassociateInfo::Unknown => "unknown",
            DisassociateInfo::Shutdown => "shutdown",
            DisassociateInfo::Quarantined => "quarantined",
        };
        f.write_str(reason)
    }
}

/// Generates a fresh incarnation UID
pub fn new_uid() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen()
}

/// Configuration for the association layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// UID of the local incarnation, sent in every Associate PDU
    pub system_uid: u64,
    /// Interval between heartbeat timer firings
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub heartbeat_interval: Duration,
    /// Delay before retrying an Associate PDU rejected by backpressure
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub backoff_interval: Duration,
    /// Capacity of each physical handle's write queue, handed to the
    /// physical transport through `Transport::configure`
    pub outbound_buffer: usize,
    /// Largest PDU accepted on decode and framing
    pub max_frame_size: usize,
    /// UIDs refused for every handshake
    pub refused_uids: Vec<u64>,
    /// Failure detector built for each association
    pub failure_detector: FailureDetectorConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            system_uid: new_uid(),
            heartbeat_interval: super::DEFAULT_HEARTBEAT_INTERVAL,
            backoff_interval: super::DEFAULT_BACKOFF_INTERVAL,
            outbound_buffer: super::DEFAULT_OUTBOUND_BUFFER,
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
            refused_uids: Vec::new(),
            failure_detector: FailureDetectorConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Checks that every setting is usable
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::config("heartbeat_interval must be greater than zero"));
        }
        if self.backoff_interval.is_zero() {
            return Err(Error::config("backoff_interval must be greater than zero"));
        }
        if self.outbound_buffer == 0 {
            return Err(Error::config("outbound_buffer must be greater than zero"));
        }
        if self.max_frame_size < super::MIN_FRAME_SIZE {
            return Err(Error::config(format!(
                "max_frame_size must be at least {} bytes",
                super::MIN_FRAME_SIZE
            )));
        }
        if self.max_frame_size > super::MAX_FRAME_SIZE {
            return Err(Error::config(format!(
                "max_frame_size must be at most {} bytes",
                super::MAX_FRAME_SIZE
            )));
        }
        self.failure_detector.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_parse() {
        let addr = Address::remote("tcp", "sys", "127.0.0.1", 2552);
        assert_eq!(addr.to_string(), "tcp://sys@127.0.0.1:2552");
        assert_eq!(addr.to_string().parse::<Address>().unwrap(), addr);

        let local = Address::local("loopback", "sys");
        assert_eq!(local.to_string(), "loopback://sys");
        assert_eq!("loopback://sys".parse::<Address>().unwrap(), local);
        assert!(!local.has_location());
    }

    #[test]
    fn test_address_ipv6() {
        let addr = Address::remote("tcp", "sys", "::1", 9000);
        assert_eq!(addr.to_string(), "tcp://sys@[::1]:9000");
        let parsed: Address = "tcp://sys@[::1]:9000".parse().unwrap();
        assert_eq!(parsed.host(), Some("::1"));
        assert_eq!(parsed.port(), Some(9000));
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("sys@host:1".parse::<Address>().is_err());
        assert!("tcp://@host:1".parse::<Address>().is_err());
        assert!("tcp://sys@host".parse::<Address>().is_err());
        assert!("tcp://sys@host:notaport".parse::<Address>().is_err());
        assert!("tcp://".parse::<Address>().is_err());
    }

    #[test]
    fn test_new_uid_random() {
        assert_ne!(new_uid(), new_uid());
    }

    #[test]
    fn test_config_validation() {
        assert!(TransportConfig::default().validate().is_ok());

        let mut config = TransportConfig::default();
        config.heartbeat_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TransportConfig::default();
        config.max_frame_size = 1;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.max_frame_size = crate::core::MAX_FRAME_SIZE;
        assert!(config.validate().is_ok());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_frame_limit_fits_length_prefix() {
        let mut config = TransportConfig::default();
        config.max_frame_size = crate::core::MAX_FRAME_SIZE + 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_json_round_trip() {
        let mut config = TransportConfig::default();
        config.heartbeat_interval = Duration::from_millis(1500);
        config.refused_uids = vec![42];

        let json = serde_json::to_string(&config).unwrap();
        let decoded: TransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.system_uid, config.system_uid);
        assert_eq!(decoded.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(decoded.refused_uids, vec![42]);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let decoded: TransportConfig =
            serde_json::from_str(r#"{ "heartbeat_interval": 0.5 }"#).unwrap();
        assert_eq!(decoded.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(decoded.outbound_buffer, crate::core::DEFAULT_OUTBOUND_BUFFER);
    }
}
