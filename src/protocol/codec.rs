use bincode::Options;
use bytes::Bytes;

use super::message::Pdu;
use crate::core::{DisassociateInfo, Error, HandshakeInfo, Result};

/// Encodes and decodes whole PDUs.
///
/// Framing is the physical transport's job; every buffer handed to
/// [`PduCodec::decode`] must hold exactly one PDU.
#[derive(Debug, Clone, Copy)]
pub struct PduCodec {
    max_pdu_size: u64,
}

impl Default for PduCodec {
    fn default() -> Self {
        PduCodec::new(crate::core::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl PduCodec {
    /// Creates a codec refusing PDUs larger than `max_pdu_size` bytes
    pub fn new(max_pdu_size: usize) -> Self {
        PduCodec {
            max_pdu_size: max_pdu_size as u64,
        }
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_limit(self.max_pdu_size)
            .reject_trailing_bytes()
    }

    pub fn encode(&self, pdu: &Pdu) -> Result<Bytes> {
        self.options()
            .serialize(pdu)
            .map(Bytes::from)
            .map_err(|e| Error::malformed(format!("failed to encode {}: {}", pdu.kind(), e)))
    }

    pub fn encode_associate(&self, info: &HandshakeInfo) -> Result<Bytes> {
        self.encode(&Pdu::Associate(info.clone()))
    }

    pub fn encode_disassociate(&self, reason: DisassociateInfo) -> Result<Bytes> {
        self.encode(&Pdu::Disassociate(reason))
    }

    pub fn encode_heartbeat(&self) -> Result<Bytes> {
        self.encode(&Pdu::Heartbeat)
    }

    pub fn encode_payload(&self, payload: Bytes) -> Result<Bytes> {
        self.encode(&Pdu::Payload(payload))
    }

    /// Decodes one PDU; anything else is [`Error::MalformedPdu`]
    pub fn decode(&self, bytes: &[u8]) -> Result<Pdu> {
        self.options()
            .deserialize(bytes)
            .map_err(|e| Error::malformed(format!("failed to decode PDU: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Address;

    #[test]
    fn test_codec_associate() {
        let codec = PduCodec::default();
        let info = HandshakeInfo::new(Address::remote("tcp", "sys", "10.0.0.1", 2552), 99);

        let bytes = codec.encode_associate(&info).unwrap();
        match codec.decode(&bytes).unwrap() {
            Pdu::Associate(decoded) => assert_eq!(decoded, info),
            other => panic!("Decoded wrong PDU: {:?}", other),
        }
    }

    #[test]
    fn test_codec_all_kinds() {
        let codec = PduCodec::default();
        assert_eq!(
            codec
                .decode(&codec.encode_disassociate(DisassociateInfo::Quarantined).unwrap())
                .unwrap(),
            Pdu::Disassociate(DisassociateInfo::Quarantined)
        );
        assert_eq!(
            codec.decode(&codec.encode_heartbeat().unwrap()).unwrap(),
            Pdu::Heartbeat
        );

        let payload = Bytes::from_static(b"hi");
        assert_eq!(
            codec
                .decode(&codec.encode_payload(payload.clone()).unwrap())
                .unwrap(),
            Pdu::Payload(payload)
        );
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let codec = PduCodec::default();
        assert!(matches!(codec.decode(&[]), Err(Error::MalformedPdu(_))));
        assert!(matches!(codec.decode(&[0xff; 3]), Err(Error::MalformedPdu(_))));
    }

    #[test]
    fn test_decode_trailing_bytes_is_malformed() {
        let codec = PduCodec::default();
        let mut bytes = codec.encode_heartbeat().unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(codec.decode(&bytes), Err(Error::MalformedPdu(_))));
    }

    #[test]
    fn test_size_limit() {
        let codec = PduCodec::new(16);
        let payload = Bytes::from(vec![7u8; 64]);
        assert!(codec.encode_payload(payload).is_err());
    }
}
