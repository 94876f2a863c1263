//! # tavern-core: shared data model for Tavern sessions
//!
//! Everything a peer needs to describe the shared surface, with no I/O:
//!
//! - [`card`]: the replicated [`Card`] record and its [`CardKind`] sum type
//! - [`geometry`]: points, sizes and the viewport normalizer
//! - [`text`]: collaborative text buffers referenced by text cards
//!
//! Identifier newtypes live here so every crate agrees on ordering and
//! wire representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod card;
pub mod geometry;
pub mod text;

pub use card::{Card, CardDraft, CardKind, ChatMessage, PlayerState};
pub use geometry::{Point, Size, Viewport, NORMALIZED_EXTENT};
pub use text::{SharedText, TextEdit, TextError};

/// Durable peer identity.
///
/// Stable for the lifetime of a participant process and totally ordered:
/// the lowest live id wins every deterministic tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Draw a fresh random id.
    pub fn random() -> Self {
        Self((Uuid::new_v4().as_u128() >> 64) as u64)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one transport endpoint. Changes every time a process restarts,
/// so it must never leak into durable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportId(pub Uuid);

impl TransportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Card identifier. Random, never reused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a shared text buffer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextId(String);

impl TextId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TextId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Media stream handle id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub Uuid);

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}
