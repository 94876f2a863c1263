//! Wire protocol for peer links.
//!
//! Each link carries two kinds of frames:
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────────┐
//! │ Text frame   │ ControlPacket, JSON tagged by `packetKind`     │
//! │ Binary frame │ SyncMessage, bincode (standard config)         │
//! └──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! Replication handshake on every new link, both directions:
//!
//! ```text
//! A ── SyncStep1(digest_A) ─────────────▶ B
//! A ◀──────────── SyncStep2(lz4 delta) ── B   records A lacks
//! A ◀── Update(delta) ─────────────────── B   afterwards, incremental
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tavern_core::{CardId, PeerId, StreamId};

use crate::awareness::AwarenessState;
use crate::layering::{LayerRecord, LayerVersion};
use crate::store::{CardRecord, CardVersion};
use crate::streams::MediaTrack;

// ───────────────────────────────────────────────────────────────────
// Frames
// ───────────────────────────────────────────────────────────────────

/// One WebSocket frame, transport-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

// ───────────────────────────────────────────────────────────────────
// Control packets
// ───────────────────────────────────────────────────────────────────

/// Small JSON messages on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "packetKind")]
pub enum ControlPacket {
    /// Identity handshake: durable id and display name.
    #[serde(rename = "ID")]
    Identity {
        #[serde(rename = "docID")]
        doc_id: PeerId,
        #[serde(rename = "myName")]
        my_name: String,
    },
    #[serde(rename = "cursor")]
    Cursor { x: f32, y: f32 },
    #[serde(rename = "cursorLeft")]
    CursorLeft,
    #[serde(rename = "awareness")]
    Awareness { clock: u64, state: AwarenessState },
    #[serde(rename = "stream")]
    Stream {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        tracks: Vec<MediaTrack>,
    },
    #[serde(rename = "streamEnded")]
    StreamEnded {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
    },
    /// Any kind this build does not know.
    #[serde(other)]
    Unknown,
}

impl ControlPacket {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::Text(self.to_json()?))
    }
}

// ───────────────────────────────────────────────────────────────────
// Replication payloads
// ───────────────────────────────────────────────────────────────────

/// What a peer already has, sent in the first sync step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreDigest {
    pub cards: BTreeMap<CardId, CardVersion>,
    pub layers: BTreeMap<CardId, LayerVersion>,
    /// yrs state vector of the shared text.
    pub text_state: Vec<u8>,
}

/// A batch of replicated writes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreDelta {
    pub cards: Vec<CardRecord>,
    pub layers: Vec<LayerRecord>,
    /// yrs update, empty when no text changed.
    pub text: Vec<u8>,
}

impl StoreDelta {
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty() && self.layers.is_empty() && self.text.is_empty()
    }

    /// Highest logical clock among the records.
    pub fn max_clock(&self) -> u64 {
        let cards = self.cards.iter().map(|r| r.stamp.clock);
        let layers = self.layers.iter().map(|r| r.stamp.clock);
        cards.chain(layers).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    SyncStep1,
    SyncStep2,
    Update,
    Ping,
    Pong,
}

/// Top-level binary message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub origin: PeerId,
    /// Sender's Lamport clock when the message was built.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn sync_step1(origin: PeerId, clock: u64, digest: &StoreDigest) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep1,
            origin,
            clock,
            payload: encode_payload(digest)?,
        })
    }

    /// Full catch-up delta, LZ4 compressed.
    pub fn sync_step2(origin: PeerId, clock: u64, delta: &StoreDelta) -> Result<Self, ProtocolError> {
        let raw = encode_payload(delta)?;
        Ok(Self {
            msg_type: MessageType::SyncStep2,
            origin,
            clock,
            payload: lz4_flex::compress_prepend_size(&raw),
        })
    }

    pub fn update(origin: PeerId, clock: u64, delta: &StoreDelta) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Update,
            origin,
            clock,
            payload: encode_payload(delta)?,
        })
    }

    pub fn ping(origin: PeerId) -> Self {
        Self {
            msg_type: MessageType::Ping,
            origin,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(origin: PeerId) -> Self {
        Self {
            msg_type: MessageType::Pong,
            origin,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::Binary(self.encode()?))
    }

    /// Parse a `SyncStep1` payload.
    pub fn digest(&self) -> Result<StoreDigest, ProtocolError> {
        if self.msg_type != MessageType::SyncStep1 {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse a `SyncStep2` or `Update` payload.
    pub fn delta(&self) -> Result<StoreDelta, ProtocolError> {
        match self.msg_type {
            MessageType::SyncStep2 => {
                let raw = lz4_flex::decompress_size_prepended(&self.payload)
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                decode_payload(&raw)
            }
            MessageType::Update => decode_payload(&self.payload),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Stream offer for the local outbound stream.
pub fn stream_offer(stream_id: StreamId, tracks: &[MediaTrack]) -> ControlPacket {
    ControlPacket::Stream {
        stream_id,
        tracks: tracks.to_vec(),
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Stamp;
    use crate::store::Slot;
    use crate::streams::TrackKind;
    use tavern_core::{Card, CardDraft, Point};

    fn sample_delta() -> StoreDelta {
        let card = Card::from_draft(
            CardDraft::video("https://example.org/v").at(Point::new(100.0, 100.0)),
            CardId::from("c1"),
            PeerId(3),
        );
        StoreDelta {
            cards: vec![CardRecord {
                id: CardId::from("c1"),
                stamp: Stamp::new(4, PeerId(3)),
                slot: Slot::Live(card),
                trashed_at: None,
            }],
            layers: vec![LayerRecord {
                id: CardId::from("c1"),
                stamp: Stamp::new(5, PeerId(3)),
                present: true,
            }],
            text: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_identity_packet_shape() {
        let packet = ControlPacket::Identity {
            doc_id: PeerId(42),
            my_name: "Ann".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&packet.to_json().unwrap()).unwrap();
        assert_eq!(json["packetKind"], "ID");
        assert_eq!(json["docID"], 42);
        assert_eq!(json["myName"], "Ann");
    }

    #[test]
    fn test_cursor_packet_parse() {
        let packet = ControlPacket::parse(r#"{"packetKind":"cursor","x":250.5,"y":10}"#).unwrap();
        assert_eq!(packet, ControlPacket::Cursor { x: 250.5, y: 10.0 });
    }

    #[test]
    fn test_unknown_packet_kind_tolerated() {
        let packet = ControlPacket::parse(r#"{"packetKind":"confetti","amount":9}"#).unwrap();
        assert_eq!(packet, ControlPacket::Unknown);
    }

    #[test]
    fn test_malformed_packet_is_error() {
        assert!(ControlPacket::parse("{not json").is_err());
        assert!(ControlPacket::parse(r#"{"x":1}"#).is_err());
    }

    #[test]
    fn test_stream_offer_json() {
        let track = MediaTrack::new(TrackKind::Video, "cam");
        let packet = stream_offer(StreamId::new(), std::slice::from_ref(&track));
        let text = packet.to_json().unwrap();
        assert!(text.contains("\"packetKind\":\"stream\""));
        assert!(text.contains("\"streamId\""));
        assert_eq!(ControlPacket::parse(&text).unwrap(), packet);
    }

    #[test]
    fn test_update_message_carries_delta() {
        let delta = sample_delta();
        let msg = SyncMessage::update(PeerId(3), 5, &delta).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.origin, PeerId(3));
        assert_eq!(decoded.delta().unwrap(), delta);
        assert_eq!(delta.max_clock(), 5);
    }

    #[test]
    fn test_sync_step2_is_compressed() {
        let mut delta = sample_delta();
        delta.text = vec![7; 4096];
        let msg = SyncMessage::sync_step2(PeerId(1), 0, &delta).unwrap();
        assert!(msg.payload.len() < 4096);
        assert_eq!(msg.delta().unwrap(), delta);
    }

    #[test]
    fn test_digest_wrong_type() {
        let msg = SyncMessage::ping(PeerId(1));
        assert!(matches!(msg.digest(), Err(ProtocolError::InvalidMessageType)));
        assert!(matches!(msg.delta(), Err(ProtocolError::InvalidMessageType)));
    }

    #[test]
    fn test_garbage_binary_rejected() {
        assert!(SyncMessage::decode(&[0xff, 0xfe, 0xfd]).is_err());
    }

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(ProtocolError::Timeout.to_string(), "Connection timeout");
        assert!(ProtocolError::DeserializationError("bad".into())
            .to_string()
            .contains("bad"));
    }
}
