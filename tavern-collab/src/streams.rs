//! Media streams and the StreamRegistry.
//!
//! Streams are live resources tied to a peer's lifetime and are never
//! replicated. The registry binds remote streams to the transport they
//! arrived on and holds the local outbound stream, which is offered to every
//! link that opens while it is alive.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use tavern_core::{StreamId, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: Uuid,
    pub kind: TrackKind,
    pub label: String,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            label: label.into(),
        }
    }
}

/// Handle to a live stream. Clones share the stopped flag.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: StreamId,
    tracks: Vec<MediaTrack>,
    stopped: Arc<AtomicBool>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(StreamId::new(), tracks)
    }

    /// A stream announced by a remote peer.
    pub fn with_id(id: StreamId, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id,
            tracks,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Stop all tracks. Returns `true` only for the call that stopped them.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("no capture device available")]
    Unavailable,
    #[error("media acquisition failed: {0}")]
    Failed(String),
}

/// Where the local camera comes from.
pub trait MediaSource: Send + Sync {
    fn acquire(&self) -> BoxFuture<'static, Result<MediaStream, MediaError>>;
}

/// Headless stand-in that always yields a stream with one audio and one
/// video track.
#[derive(Debug, Clone, Default)]
pub struct SyntheticCamera;

impl MediaSource for SyntheticCamera {
    fn acquire(&self) -> BoxFuture<'static, Result<MediaStream, MediaError>> {
        Box::pin(async {
            Ok(MediaStream::new(vec![
                MediaTrack::new(TrackKind::Audio, "synthetic microphone"),
                MediaTrack::new(TrackKind::Video, "synthetic camera"),
            ]))
        })
    }
}

/// A source that always fails with the given error.
#[derive(Debug, Clone)]
pub struct NoCamera(pub MediaError);

impl Default for NoCamera {
    fn default() -> Self {
        Self(MediaError::Unavailable)
    }
}

impl MediaSource for NoCamera {
    fn acquire(&self) -> BoxFuture<'static, Result<MediaStream, MediaError>> {
        let err = self.0.clone();
        Box::pin(async move { Err(err) })
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StreamRegistry {
    bindings: HashMap<TransportId, MediaStream>,
    local: Option<MediaStream>,
    offered: HashSet<TransportId>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, transport: TransportId, stream: MediaStream) {
        log::debug!("Stream {:?} attached for {transport}", stream.id());
        self.bindings.insert(transport, stream);
    }

    pub fn detach(&mut self, transport: &TransportId) -> Option<MediaStream> {
        self.bindings.remove(transport)
    }

    pub fn get(&self, transport: &TransportId) -> Option<&MediaStream> {
        self.bindings.get(transport)
    }

    /// Forget everything about a departed link.
    pub fn drop_transport(&mut self, transport: &TransportId) {
        self.bindings.remove(transport);
        self.offered.remove(transport);
    }

    pub fn set_local(&mut self, stream: MediaStream) {
        if let Some(previous) = self.local.replace(stream) {
            previous.stop();
        }
        self.offered.clear();
    }

    /// The local stream while it is live.
    pub fn local(&self) -> Option<&MediaStream> {
        self.local.as_ref().filter(|s| !s.is_stopped())
    }

    /// Record that the local stream went out on `transport`. Returns `false`
    /// if it already had.
    pub fn mark_offered(&mut self, transport: TransportId) -> bool {
        self.offered.insert(transport)
    }

    /// Stop the local stream. Returns its id only the first time.
    pub fn teardown_local(&mut self) -> Option<StreamId> {
        let stream = self.local.take()?;
        self.offered.clear();
        if stream.stop() {
            log::info!("Local stream {:?} stopped", stream.id());
            Some(stream.id())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&TransportId, &MediaStream)> {
        self.bindings.iter()
    }
}
