use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, MAX_FRAME_SIZE};

/// Length-prefixed framing so whole PDUs survive a byte stream
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a frame codec refusing frames above `max_frame_size` bytes,
    /// capped at what the u32 length prefix can express
    pub fn new(max_frame_size: usize) -> Self {
        FrameCodec {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(crate::core::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Need more data to read frame length
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(Error::transport(format!(
                "frame of {} bytes exceeds limit of {}",
                length, self.max_frame_size
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(Error::transport(format!(
                "frame of {} bytes exceeds limit of {}",
                item.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_split_across_reads() {
        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut wire).unwrap();
        codec.encode(Bytes::from_static(b"world"), &mut wire).unwrap();

        let mut partial = wire.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);

        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Bytes::from_static(b"world"))
        );
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new(8);
        let mut wire = BytesMut::new();
        wire.put_u32(9);
        assert!(codec.decode(&mut wire).is_err());
        assert!(codec
            .encode(Bytes::from_static(b"123456789"), &mut BytesMut::new())
            .is_err());
    }

    #[test]
    fn test_limit_capped_by_length_prefix() {
        assert_eq!(FrameCodec::new(usize::MAX).max_frame_size(), MAX_FRAME_SIZE);
        assert_eq!(FrameCodec::new(1024).max_frame_size(), 1024);
    }
}
