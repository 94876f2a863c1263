//! # tavern-collab: Peer-to-peer session sync for Tavern
//!
//! Every participant holds a full replica of the shared surface and talks
//! to every other participant directly. There is no authority: records
//! merge by Lamport stamp, text merges through a CRDT, and card management
//! moves to the lowest live peer when its manager leaves.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐  announce   ┌───────────────┐  announce  ┌──────────────┐
//!  │ Node (alice) │ ──────────▶ │ SignalServer  │ ◀───────── │ Node (bob)   │
//!  │              │             │ (topic relay) │            │              │
//!  │  SyncEngine  │             └───────────────┘            │  SyncEngine  │
//!  │  MeshSession │ ◀══════════ WsTransport link ══════════▶ │  MeshSession │
//!  └──────┬───────┘   text: ControlPacket (JSON)             └──────┬───────┘
//!         │           binary: SyncMessage (bincode)                 │
//!         ▼                                                         ▼
//!   ViewSnapshot                                              ViewSnapshot
//! ```
//!
//! ## Modules
//!
//! - [`session`]: room id and secret, token channels
//! - [`clock`], [`store`], [`layering`]: replicated card state
//! - [`awareness`]: ephemeral per-peer presence
//! - [`streams`]: media stream registry
//! - [`protocol`]: control packets and sync messages
//! - [`mesh`]: per-link state machine
//! - [`ownership`]: manager election and handover
//! - [`backpack`], [`storage`]: peer-local persistence
//! - [`ui`], [`view`]: local UI state and render snapshots
//! - [`engine`]: the single-owner state machine tying it together
//! - [`transport`], [`signaling`], [`node`]: async networking
//! - [`broadcast`], [`server`]: the signaling relay

pub mod awareness;
pub mod backpack;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod engine;
pub mod layering;
pub mod mesh;
pub mod node;
pub mod ownership;
pub mod protocol;
pub mod server;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod store;
pub mod streams;
pub mod transport;
pub mod ui;
pub mod view;

// Re-exports for convenience
pub use awareness::{AwarenessState, AwarenessTracker, CursorColor, PeerEntry};
pub use backpack::{Backpack, BackpackError, BACKPACK_KEY};
pub use clock::{LamportClock, Stamp};
pub use config::{NodeConfig, SignalServerConfig, DEFAULT_SIGNALING};
pub use engine::{CaptureMode, EngineError, EngineOptions, SyncEngine};
pub use mesh::{ConnectionState, MeshEvent, MeshSession, NetworkInput, TransportCommand};
pub use node::{Node, NodeError, NodeHandle};
pub use protocol::{ControlPacket, Frame, MessageType, ProtocolError, SyncMessage};
pub use server::{ServerStats, SignalServer};
pub use session::{FileTokenChannel, MemoryTokenChannel, Session, SessionError, TokenChannel};
pub use signaling::{Announcement, Discovery, NoDiscovery, SignalingClient, SignalingConfig, StaticDiscovery};
pub use storage::{LocalStore, MemoryStore, RocksLocalStore, StorageError, StoreConfig};
pub use store::{CardRecord, ReplicatedStore};
pub use streams::{MediaError, MediaSource, MediaStream, MediaTrack, NoCamera, SyntheticCamera, TrackKind};
pub use transport::{TransportError, WsTransport};
pub use ui::{LocalUiState, UiAction};
pub use view::{CardView, PeerView, ViewSnapshot};
