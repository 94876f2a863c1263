//! The replicated card record.
//!
//! A [`Card`] is the durable unit of shared content. Its kind-specific
//! payload is a closed sum type, so every consumer matches exhaustively.

use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Size};
use crate::{CardId, PeerId, TextId};

/// Playback state of an embedded video player.
///
/// Only the card's manager publishes changes to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub playing: bool,
    pub played_progress: f32,
    pub played_seconds: f32,
    pub volume: f32,
    pub muted: bool,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            playing: false,
            played_progress: 0.0,
            played_seconds: 0.0,
            volume: 1.0,
            muted: false,
        }
    }
}

/// One line in a chat card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: PeerId,
    pub author_name: String,
    /// Logical time of the post.
    pub time: u64,
    pub text: String,
}

/// Kind tag plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardKind {
    /// Live camera of the author. The stream itself is never replicated.
    Avatar,
    Video { uri: String, player: PlayerState },
    Text { text_id: TextId },
    Image { uri: String },
    Chat { messages: Vec<ChatMessage> },
}

impl CardKind {
    pub fn label(&self) -> &'static str {
        match self {
            CardKind::Avatar => "avatar",
            CardKind::Video { .. } => "video",
            CardKind::Text { .. } => "text",
            CardKind::Image { .. } => "image",
            CardKind::Chat { .. } => "chat",
        }
    }

    /// Initial size in normalized units.
    pub fn default_size(&self) -> Size {
        match self {
            CardKind::Avatar => Size::new(200.0, 200.0),
            CardKind::Video { .. } => Size::new(330.0, 220.0),
            CardKind::Text { .. } => Size::new(200.0, 400.0),
            CardKind::Image { .. } => Size::new(300.0, 300.0),
            CardKind::Chat { .. } => Size::new(300.0, 300.0),
        }
    }

    fn default_icon(&self) -> &'static str {
        match self {
            CardKind::Avatar => "eye",
            CardKind::Video { .. } => "youtube",
            CardKind::Text { .. } => "quill",
            CardKind::Image { .. } => "image",
            CardKind::Chat { .. } => "chat",
        }
    }

    pub fn is_avatar(&self) -> bool {
        matches!(self, CardKind::Avatar)
    }

    /// Same payload with any playback stopped.
    pub fn paused(&self) -> CardKind {
        match self {
            CardKind::Video { uri, player } => CardKind::Video {
                uri: uri.clone(),
                player: PlayerState {
                    playing: false,
                    ..player.clone()
                },
            },
            other => other.clone(),
        }
    }
}

/// Durable, replicated card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub kind: CardKind,
    pub title: String,
    pub icon: String,
    /// Top-left corner, normalized.
    pub position: Point,
    /// Normalized.
    pub size: Size,
    pub author: PeerId,
    pub manager: PeerId,
    pub trashed: bool,
}

impl Card {
    /// Materialize a draft authored and managed by `author`.
    pub fn from_draft(draft: CardDraft, id: CardId, author: PeerId) -> Self {
        Self {
            id,
            kind: draft.kind,
            title: draft.title,
            icon: draft.icon,
            position: draft.position,
            size: draft.size,
            author,
            manager: author,
            trashed: false,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.trashed
    }

    /// A fresh live copy under a new id, owned by `owner`.
    pub fn reissue(&self, id: CardId, owner: PeerId) -> Card {
        Card {
            id,
            kind: self.kind.clone(),
            title: self.title.clone(),
            icon: self.icon.clone(),
            position: self.position,
            size: self.size,
            author: owner,
            manager: owner,
            trashed: false,
        }
    }
}

/// Everything a caller chooses about a new card. Identity and ownership are
/// filled in by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CardDraft {
    pub kind: CardKind,
    pub title: String,
    pub icon: String,
    pub position: Point,
    pub size: Size,
}

impl CardDraft {
    pub fn new(kind: CardKind, title: impl Into<String>) -> Self {
        Self {
            size: kind.default_size(),
            icon: kind.default_icon().to_string(),
            kind,
            title: title.into(),
            position: Point::ORIGIN,
        }
    }

    pub fn avatar(name: &str) -> Self {
        Self::new(CardKind::Avatar, name)
    }

    pub fn video(uri: impl Into<String>) -> Self {
        Self::new(
            CardKind::Video {
                uri: uri.into(),
                player: PlayerState::default(),
            },
            "video",
        )
    }

    pub fn text(text_id: TextId) -> Self {
        Self::new(CardKind::Text { text_id }, "text")
    }

    pub fn image(uri: impl Into<String>) -> Self {
        Self::new(CardKind::Image { uri: uri.into() }, "image")
    }

    pub fn chat(owner_name: &str) -> Self {
        Self::new(
            CardKind::Chat {
                messages: Vec::new(),
            },
            format!("{owner_name}'s chat"),
        )
    }

    pub fn at(mut self, position: Point) -> Self {
        self.position = position;
        self
    }

    pub fn sized(mut self, size: Size) -> Self {
        self.size = size;
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }
}
