//! Codec for encoding/decoding control messages
//!
//! Format: [length: u32 big endian][payload: bincode serialized message]

use crate::messages::ControlMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control message codec, usable directly or through `tokio_util::codec::Framed`
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl ControlCodec {
    /// Encode a message into `dst`
    pub fn encode_into(msg: &ControlMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }

    /// Decode one message from `src`
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed.
    pub fn decode_from(src: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let msg_bytes = src.split_to(length);
        let msg: ControlMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_from(src)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::encode_into(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HealthSnapshot;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn heartbeat() -> ControlMessage {
        ControlMessage::Heartbeat {
            node_id: "node-a".to_string(),
            health: HealthSnapshot::default(),
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let mut encoded = BytesMut::new();
        ControlCodec::encode_into(&heartbeat(), &mut encoded).unwrap();

        // Only the length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(ControlCodec::decode_from(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(ControlCodec::decode_from(&mut buf).unwrap(), Some(heartbeat()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple() {
        let msg2 = ControlMessage::Disconnect {
            reason: "bye".to_string(),
        };

        let mut buf = BytesMut::new();
        ControlCodec::encode_into(&heartbeat(), &mut buf).unwrap();
        ControlCodec::encode_into(&msg2, &mut buf).unwrap();

        let mut codec = ControlCodec;
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(heartbeat()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg2));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(&[0u8; 8]);

        assert!(matches!(
            ControlCodec::decode_from(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, ControlCodec);
        let mut reader = FramedRead::new(server, ControlCodec);

        writer.send(heartbeat()).await.unwrap();
        writer
            .send(ControlMessage::Rejected {
                reason: "nope".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(reader.next().await.unwrap().unwrap(), heartbeat());
        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            ControlMessage::Rejected { .. }
        ));
    }
}
