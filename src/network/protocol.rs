use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// Protocol versioning
pub const PROTOCOL_VERSION: u8 = 1;

/// Frames larger than this are treated as malformed.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Error types for protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("frame of {0} bytes exceeds the 64 KiB limit")]
    FrameTooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Payload carried by a wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Presence broadcast: who we are and where our TCP listener is.
    Announce { nickname: String, tcp_port: u16 },
    /// A chat message addressed to the receiving peer.
    Chat {
        timestamp_ms: u64,
        nickname: String,
        body: String,
    },
}

/// Envelope wrapping every announce datagram and TCP frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version
    pub version: u8,
    /// Message ID for correlating and tracing individual messages
    pub message_id: Uuid,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_id: Uuid::new_v4(),
            payload,
        }
    }

    /// Encode an envelope to bytes
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode bytes to an envelope, rejecting version mismatches
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = bincode::deserialize(data)?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }
}

/// Builds outgoing envelopes stamped with the local identity.
#[derive(Debug, Clone)]
pub struct Protocol {
    nickname: String,
}

impl Protocol {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
        }
    }

    /// Create a presence announcement advertising our messaging port
    pub fn announce(&self, tcp_port: u16) -> Envelope {
        Envelope::new(Payload::Announce {
            nickname: self.nickname.clone(),
            tcp_port,
        })
    }

    /// Create a chat message stamped with the current wall clock
    pub fn chat(&self, body: impl Into<String>) -> Envelope {
        Envelope::new(Payload::Chat {
            timestamp_ms: unix_millis(),
            nickname: self.nickname.clone(),
            body: body.into(),
        })
    }
}

/// Milliseconds since the Unix epoch, for wire timestamps.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Length-prefixed codec for TCP chat frames: a 4-byte big-endian length
/// followed by a bincode envelope. Partial frames stay buffered in `src`
/// until the advertised length has arrived.
#[derive(Debug, Default)]
pub struct ChatCodec;

impl Decoder for ChatCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(len);
        Envelope::decode(&frame).map(Some)
    }
}

impl Encoder<Envelope> for ChatCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let data = item.encode()?;

        if data.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }

        dst.reserve(4 + data.len());
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_roundtrip() {
        let envelope = Protocol::new("nisse").announce(45678);
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        assert_eq!(decoded.message_id, envelope.message_id);
        assert_eq!(
            decoded.payload,
            Payload::Announce {
                nickname: "nisse".to_string(),
                tcp_port: 45678,
            }
        );
    }

    #[test]
    fn chat_frame_survives_newlines_and_non_ascii() {
        let body = "första raden\nsecond line\n\u{2764} こんにちは";
        let envelope = Protocol::new("åsa").chat(body);
        let mut codec = ChatCodec;
        let mut buf = BytesMut::new();
        codec.encode(envelope, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded.payload {
            Payload::Chat {
                nickname,
                body: decoded_body,
                ..
            } => {
                assert_eq!(nickname, "åsa");
                assert_eq!(decoded_body, body);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_stay_buffered_until_complete() {
        let mut codec = ChatCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(Protocol::new("bo").chat("hello"), &mut wire)
            .unwrap();

        // Feed the frame one byte at a time; it must decode exactly once,
        // and only when the final byte lands.
        let total = wire.len();
        let mut fed = BytesMut::new();
        let mut decoded = Vec::new();
        for (i, byte) in wire.iter().enumerate() {
            fed.extend_from_slice(&[*byte]);
            if let Some(frame) = codec.decode(&mut fed).unwrap() {
                assert_eq!(i, total - 1);
                decoded.push(frame);
            }
        }
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut envelope = Protocol::new("x").announce(1);
        envelope.version = PROTOCOL_VERSION + 1;
        let bytes = bincode::serialize(&envelope).unwrap();

        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Envelope::decode(&[0xff; 7]).is_err());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = ChatCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        buf.put_slice(&[0u8; 8]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
