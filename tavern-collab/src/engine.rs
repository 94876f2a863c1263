//! SyncEngine: one peer's whole session state behind a single owner.
//!
//! Local operations and network inputs both land here, one at a time, and
//! leave behind transport commands to execute and a fresh view snapshot.
//!
//! ```text
//!  local op ───────────┐                      ┌──▶ TransportCommand queue
//!                      ▼                      │
//!  NetworkInput ──▶ MeshSession ──MeshEvent──▶ SyncEngine
//!                                             │   store / layering / text
//!                                             │   awareness / streams
//!                                             │   backpack / ui
//!                                             └──▶ ViewProjector ──▶ observers
//! ```
//!
//! No I/O happens in this module. The async node feeds it and drains it; the
//! simulation tests do the same with in-memory links.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use tavern_core::{
    Card, CardDraft, CardId, CardKind, ChatMessage, PeerId, PlayerState, Point, SharedText, Size,
    StreamId, TextEdit, TextError, TextId, TransportId, Viewport,
};

use crate::awareness::{AwarenessTracker, CursorThrottle};
use crate::backpack::{Backpack, BackpackError};
use crate::clock::LamportClock;
use crate::layering::{LayerRecord, Layering};
use crate::mesh::{MeshEvent, MeshSession, NetworkInput, TransportCommand};
use crate::ownership;
use crate::protocol::{stream_offer, ControlPacket, MessageType, StoreDelta, StoreDigest, SyncMessage};
use crate::session::Session;
use crate::storage::LocalStore;
use crate::store::{CardRecord, ReplicatedStore};
use crate::streams::{MediaError, MediaStream, StreamRegistry};
use crate::ui::{LocalUiState, UiAction};
use crate::view::{ProjectionInput, ViewProjector, ViewSnapshot};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown card {0}")]
    UnknownCard(CardId),
    #[error("card {0} is trashed")]
    Trashed(CardId),
    #[error("card {card} is managed by {manager}")]
    NotManager { card: CardId, manager: PeerId },
    #[error("card {0} cannot be captured")]
    NotCapturable(CardId),
    #[error("card {card} is not a {expected} card")]
    WrongKind { card: CardId, expected: &'static str },
    #[error("card {0} is not in the backpack")]
    NotInBackpack(CardId),
    #[error(transparent)]
    Text(#[from] TextError),
    #[error("could not start local media: {0}")]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub peer: PeerId,
    pub transport: TransportId,
    pub name: String,
    pub viewport: Viewport,
    pub cursor_interval: Duration,
}

impl EngineOptions {
    /// Fresh identities with default viewport and cursor rate.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            peer: PeerId::random(),
            transport: TransportId::new(),
            name: name.into(),
            viewport: Viewport::default(),
            cursor_interval: Duration::from_millis(33),
        }
    }

    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }
}

/// What happens to the live card when it goes into the backpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// The live card is trashed.
    Stash,
    /// The live card stays.
    Pin,
}

pub struct SyncEngine {
    peer: PeerId,
    name: String,
    clock: LamportClock,
    store: ReplicatedStore,
    layering: Layering,
    text: SharedText,
    awareness: AwarenessTracker,
    mesh: MeshSession,
    streams: StreamRegistry,
    backpack: Backpack,
    ui: LocalUiState,
    projector: ViewProjector,
    throttle: CursorThrottle,
}

impl SyncEngine {
    pub fn new(session: Session, options: EngineOptions, local_store: Box<dyn LocalStore>) -> Self {
        let mut engine = Self {
            peer: options.peer,
            name: options.name.clone(),
            clock: LamportClock::new(options.peer),
            store: ReplicatedStore::new(),
            layering: Layering::new(),
            text: SharedText::new(),
            awareness: AwarenessTracker::new(options.peer, options.name.clone()),
            mesh: MeshSession::new(session, options.peer, options.transport, options.name),
            streams: StreamRegistry::new(),
            backpack: Backpack::load(local_store),
            ui: LocalUiState::default(),
            projector: ViewProjector::new(options.viewport),
            throttle: CursorThrottle::new(options.cursor_interval),
        };
        engine.refresh();
        engine
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn transport(&self) -> TransportId {
        self.mesh.local_transport()
    }

    pub fn session(&self) -> &Session {
        self.mesh.session()
    }

    pub fn store(&self) -> &ReplicatedStore {
        &self.store
    }

    pub fn layering(&self) -> &Layering {
        &self.layering
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn mesh(&self) -> &MeshSession {
        &self.mesh
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn backpack(&self) -> &Backpack {
        &self.backpack
    }

    pub fn clock(&self) -> u64 {
        self.clock.now()
    }

    // ─── Session ────────────────────────────────────────────────────

    /// Join the mesh. Idempotent.
    pub fn connect(&mut self) {
        self.mesh.connect();
    }

    pub fn drain_commands(&mut self) -> Vec<TransportCommand> {
        self.mesh.drain_commands()
    }

    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.projector.latest()
    }

    pub fn observe(&mut self, observer: impl FnMut(&Arc<ViewSnapshot>) + Send + 'static) {
        self.projector.observe(observer);
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.projector.set_viewport(viewport);
        self.refresh();
    }

    // ─── Cards ──────────────────────────────────────────────────────

    /// Create a card authored and managed by this peer, on top of the stack.
    pub fn add_card(&mut self, draft: CardDraft) -> CardId {
        let id = CardId::generate();
        let card = Card::from_draft(draft, id.clone(), self.peer);
        let record = self.store.set(card, self.clock.tick());
        let layer = self.layering.append(&id, self.clock.tick());
        log::debug!("Added card {id}");
        self.publish(vec![record], vec![layer]);
        id
    }

    /// Replace a card's contents. Id and author are kept from the stored card.
    pub fn update_card(&mut self, mut card: Card) -> Result<(), EngineError> {
        let existing = self.live_card(&card.id)?;
        card.author = existing.author;
        if card.trashed {
            return self.trash_card(&card.id);
        }
        let record = self.store.set(card, self.clock.tick());
        self.publish(vec![record], Vec::new());
        Ok(())
    }

    /// Move to a normalized position and bring to front.
    pub fn move_card(&mut self, id: &CardId, position: Point) -> Result<(), EngineError> {
        let mut card = self.live_card(id)?;
        card.position = position;
        let record = self.store.set(card, self.clock.tick());
        let layer = self.layering.move_to_front(id, self.clock.tick());
        self.publish(vec![record], vec![layer]);
        Ok(())
    }

    /// Resize to a normalized size.
    pub fn resize_card(&mut self, id: &CardId, size: Size) -> Result<(), EngineError> {
        let mut card = self.live_card(id)?;
        card.size = size;
        let record = self.store.set(card, self.clock.tick());
        self.publish(vec![record], Vec::new());
        Ok(())
    }

    pub fn trash_card(&mut self, id: &CardId) -> Result<(), EngineError> {
        self.live_card(id)?;
        let Some(record) = self.store.mark_trashed(id, self.clock.tick()) else {
            return Err(EngineError::Trashed(id.clone()));
        };
        let layer = self.layering.remove(id, self.clock.tick());
        self.after_card_change(&record);
        log::debug!("Trashed card {id}");
        self.publish(vec![record], vec![layer]);
        Ok(())
    }

    /// Purge trashed cards for good. Returns how many were purged.
    pub fn compact(&mut self) -> usize {
        let records = self.store.compact(&mut self.clock);
        let count = records.len();
        if count > 0 {
            log::info!("Compacted {count} trashed card(s)");
            self.publish(records, Vec::new());
        }
        count
    }

    fn live_card(&self, id: &CardId) -> Result<Card, EngineError> {
        let card = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::UnknownCard(id.clone()))?;
        if card.trashed {
            return Err(EngineError::Trashed(id.clone()));
        }
        Ok(card.clone())
    }

    // ─── Card content ───────────────────────────────────────────────

    pub fn edit_text(&mut self, text_id: &TextId, edit: &TextEdit) -> Result<(), EngineError> {
        let update = self.text.edit(text_id, edit)?;
        self.publish_delta(StoreDelta {
            text: update,
            ..StoreDelta::default()
        });
        self.refresh();
        Ok(())
    }

    pub fn text_content(&self, text_id: &TextId) -> String {
        self.text.content(text_id)
    }

    /// Playback state of a video card. Only its manager may change it.
    pub fn set_playback(&mut self, id: &CardId, player: PlayerState) -> Result<(), EngineError> {
        let mut card = self.live_card(id)?;
        if card.manager != self.peer {
            return Err(EngineError::NotManager {
                card: id.clone(),
                manager: card.manager,
            });
        }
        match &mut card.kind {
            CardKind::Video { player: current, .. } => *current = player,
            _ => {
                return Err(EngineError::WrongKind {
                    card: id.clone(),
                    expected: "video",
                })
            }
        }
        let record = self.store.set(card, self.clock.tick());
        self.publish(vec![record], Vec::new());
        Ok(())
    }

    pub fn post_chat(&mut self, id: &CardId, text: impl Into<String>) -> Result<(), EngineError> {
        let mut card = self.live_card(id)?;
        let stamp = self.clock.tick();
        match &mut card.kind {
            CardKind::Chat { messages } => messages.push(ChatMessage {
                author: self.peer,
                author_name: self.name.clone(),
                time: stamp.clock,
                text: text.into(),
            }),
            _ => {
                return Err(EngineError::WrongKind {
                    card: id.clone(),
                    expected: "chat",
                })
            }
        }
        let record = self.store.set(card, stamp);
        self.publish(vec![record], Vec::new());
        Ok(())
    }

    // ─── Presence ───────────────────────────────────────────────────

    /// Publish the local avatar once media acquisition has finished. A failed
    /// acquisition leaves shared state untouched.
    pub fn add_my_presence(
        &mut self,
        name: &str,
        acquired: Result<MediaStream, MediaError>,
    ) -> Result<CardId, EngineError> {
        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Media acquisition failed: {e}");
                return Err(e.into());
            }
        };
        self.set_name(name);
        self.streams.set_local(stream);
        self.offer_local_stream_to_all();

        let existing = self
            .store
            .live_cards()
            .into_iter()
            .find(|c| c.kind.is_avatar() && c.author == self.peer);
        let id = match existing {
            Some(card) => card.id,
            None => self.add_card(CardDraft::avatar(name)),
        };
        self.refresh();
        Ok(id)
    }

    /// Local pointer in pixels, `None` when it leaves the surface. Returns
    /// `true` if a packet went out.
    pub fn move_cursor(&mut self, position: Option<Point>, now: Instant) -> bool {
        let normalized = position.map(|p| self.projector.viewport().normalize(p));
        if !self.awareness.set_local_cursor(normalized) {
            return false;
        }
        let sent = match normalized {
            Some(p) if self.throttle.admit(now) => {
                self.mesh
                    .broadcast_control(&ControlPacket::Cursor { x: p.x, y: p.y });
                true
            }
            Some(_) => false,
            None => {
                self.mesh.broadcast_control(&ControlPacket::CursorLeft);
                true
            }
        };
        self.refresh();
        sent
    }

    pub fn set_local_field(&mut self, key: impl Into<String>, value: Value) {
        self.awareness.set_local_field(key, value);
        self.broadcast_awareness();
    }

    pub fn set_active_region(&mut self, region: Option<String>) {
        self.awareness.set_active_region(region);
        self.broadcast_awareness();
    }

    pub fn set_name(&mut self, name: &str) {
        if self.name == name {
            return;
        }
        self.name = name.to_string();
        self.mesh.set_name(name);
        self.awareness.set_name(name);
        self.broadcast_awareness();
    }

    fn awareness_packet(&self) -> ControlPacket {
        ControlPacket::Awareness {
            clock: self.awareness.local_clock(),
            state: self.awareness.local_state().clone(),
        }
    }

    fn broadcast_awareness(&mut self) {
        let packet = self.awareness_packet();
        self.mesh.broadcast_control(&packet);
        self.refresh();
    }

    // ─── Backpack ───────────────────────────────────────────────────

    pub fn capture_to_backpack(&mut self, id: &CardId, mode: CaptureMode) -> Result<(), EngineError> {
        let card = self.live_card(id)?;
        if card.kind.is_avatar() {
            return Err(EngineError::NotCapturable(id.clone()));
        }
        self.backpack.capture(&card);
        match mode {
            CaptureMode::Stash => self.trash_card(id)?,
            CaptureMode::Pin => self.refresh(),
        }
        Ok(())
    }

    /// Put a stored snapshot back on the surface under a fresh id.
    pub fn release_from_backpack(&mut self, id: &CardId) -> Result<CardId, EngineError> {
        let snapshot = self.backpack.take(id).map_err(|e| match e {
            BackpackError::NotFound(id) => EngineError::NotInBackpack(id),
            other => {
                log::error!("Backpack failure: {other}");
                EngineError::NotInBackpack(id.clone())
            }
        })?;
        let new_id = CardId::generate();
        let card = snapshot.reissue(new_id.clone(), self.peer);
        let record = self.store.set(card, self.clock.tick());
        let layer = self.layering.append(&new_id, self.clock.tick());
        self.publish(vec![record], vec![layer]);
        Ok(new_id)
    }

    pub fn clear_backpack(&mut self) {
        self.backpack.clear();
        self.refresh();
    }

    // ─── Local UI ───────────────────────────────────────────────────

    pub fn ui(&mut self, action: UiAction) {
        if self.ui.apply(action) {
            self.refresh();
        }
    }

    // ─── Network ────────────────────────────────────────────────────

    pub fn handle_network(&mut self, input: NetworkInput) {
        for event in self.mesh.handle(input) {
            self.handle_event(event);
        }
        self.refresh();
    }

    /// Keepalive on every open link.
    pub fn ping(&mut self) {
        self.mesh.broadcast_sync(&SyncMessage::ping(self.peer), None);
    }

    fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::PeerJoined { transport } => self.greet(transport),
            MeshEvent::PeerIdentified {
                transport,
                peer,
                name,
            } => {
                self.awareness.identify(peer, transport, &name);
            }
            MeshEvent::PeerLeft { transport, peer } => self.peer_left(transport, peer),
            MeshEvent::Control {
                transport,
                peer,
                packet,
            } => self.control(transport, peer, packet),
            MeshEvent::StreamReceived {
                transport,
                stream_id,
                tracks,
            } => {
                self.streams
                    .attach(transport, MediaStream::with_id(stream_id, tracks));
            }
            MeshEvent::Sync { transport, message } => self.sync(transport, message),
        }
    }

    /// New link: open the state exchange, send awareness, offer our stream.
    fn greet(&mut self, transport: TransportId) {
        let digest = StoreDigest {
            cards: self.store.digest(),
            layers: self.layering.digest(),
            text_state: self.text.state_vector(),
        };
        match SyncMessage::sync_step1(self.peer, self.clock.now(), &digest) {
            Ok(msg) => self.mesh.send_sync(transport, &msg),
            Err(e) => log::error!("Failed to build sync step 1: {e}"),
        }
        let awareness = self.awareness_packet();
        self.mesh.send_control_to(transport, &awareness);
        self.offer_local_stream(transport);
    }

    fn offer_local_stream(&mut self, transport: TransportId) {
        let Some(stream) = self.streams.local() else {
            return;
        };
        let packet = stream_offer(stream.id(), stream.tracks());
        if self.streams.mark_offered(transport) {
            self.mesh.send_control_to(transport, &packet);
        }
    }

    fn offer_local_stream_to_all(&mut self) {
        for transport in self.mesh.open_transports() {
            self.offer_local_stream(transport);
        }
    }

    fn peer_left(&mut self, transport: TransportId, peer: Option<PeerId>) {
        self.streams.drop_transport(&transport);
        let Some(peer) = peer else {
            return;
        };

        if let Some(other) = self.mesh.transports_of(peer).first().copied() {
            // Still reachable on another link.
            if self.awareness.get(&peer).map(|e| e.transport) == Some(transport) {
                self.awareness.rebind(peer, other);
            }
            return;
        }

        self.awareness.remove(peer);

        let mut live: BTreeSet<PeerId> = self.mesh.live_peers();
        live.insert(self.peer);
        let records: Vec<CardRecord> = ownership::reassign(&self.store, peer, &live)
            .into_iter()
            .map(|card| self.store.set(card, self.clock.tick()))
            .collect();
        if !records.is_empty() {
            self.publish(records, Vec::new());
        }
    }

    fn control(&mut self, transport: TransportId, peer: PeerId, packet: ControlPacket) {
        match packet {
            ControlPacket::Cursor { x, y } => {
                self.awareness.apply_cursor(peer, Some(Point::new(x, y)));
            }
            ControlPacket::CursorLeft => {
                self.awareness.apply_cursor(peer, None);
            }
            ControlPacket::Awareness { clock, state } => {
                self.awareness.apply_remote(peer, transport, clock, state);
            }
            ControlPacket::StreamEnded { stream_id } => {
                if self.streams.get(&transport).map(|s| s.id()) == Some(stream_id) {
                    self.streams.detach(&transport);
                    log::debug!("Stream {stream_id:?} from {peer} ended");
                }
            }
            ControlPacket::Identity { .. } | ControlPacket::Stream { .. } | ControlPacket::Unknown => {}
        }
    }

    fn sync(&mut self, transport: TransportId, message: SyncMessage) {
        self.clock.observe(message.clock);
        match message.msg_type {
            MessageType::SyncStep1 => match message.digest() {
                Ok(digest) => self.answer_digest(transport, &digest),
                Err(e) => log::warn!("Bad sync step 1 from {transport}: {e}"),
            },
            MessageType::SyncStep2 | MessageType::Update => match message.delta() {
                Ok(delta) => self.merge_remote(transport, delta),
                Err(e) => log::warn!("Bad delta from {transport}: {e}"),
            },
            MessageType::Ping => {
                self.mesh.send_sync(transport, &SyncMessage::pong(self.peer));
            }
            MessageType::Pong => {}
        }
    }

    fn answer_digest(&mut self, transport: TransportId, digest: &StoreDigest) {
        let text = match self.text.diff(&digest.text_state) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Bad text state vector from {transport}: {e}");
                Vec::new()
            }
        };
        let delta = StoreDelta {
            cards: self.store.missing_from(&digest.cards),
            layers: self.layering.missing_from(&digest.layers),
            text,
        };
        match SyncMessage::sync_step2(self.peer, self.clock.now(), &delta) {
            Ok(msg) => self.mesh.send_sync(transport, &msg),
            Err(e) => log::error!("Failed to build sync step 2: {e}"),
        }
    }

    /// Merge a remote delta and relay whatever changed to the other links.
    fn merge_remote(&mut self, from: TransportId, delta: StoreDelta) {
        self.clock.observe(delta.max_clock());

        let cards = self.store.apply_all(delta.cards);
        let layers: Vec<LayerRecord> = delta
            .layers
            .into_iter()
            .filter(|record| self.layering.apply(record.clone()))
            .collect();
        let text = if delta.text.is_empty() {
            Vec::new()
        } else {
            match self.text.apply_update(&delta.text) {
                Ok(true) => delta.text,
                Ok(false) => Vec::new(),
                Err(e) => {
                    log::warn!("Bad text update from {from}: {e}");
                    Vec::new()
                }
            }
        };

        for record in &cards {
            self.after_card_change(record);
        }

        let relay = StoreDelta {
            cards,
            layers,
            text,
        };
        if relay.is_empty() {
            return;
        }
        match SyncMessage::update(self.peer, self.clock.now(), &relay) {
            Ok(msg) => self.mesh.broadcast_sync(&msg, Some(from)),
            Err(e) => log::error!("Failed to build relay update: {e}"),
        }
    }

    /// Our own avatar going to the trash ends the local stream, whoever
    /// trashed it.
    fn after_card_change(&mut self, record: &CardRecord) {
        let Some(card) = self.store.get(&record.id) else {
            return;
        };
        if !card.trashed {
            return;
        }
        let own_avatar = card.kind.is_avatar() && card.author == self.peer;
        let id = card.id.clone();
        if own_avatar {
            if let Some(stream_id) = self.streams.teardown_local() {
                self.mesh
                    .broadcast_control(&ControlPacket::StreamEnded { stream_id });
            }
        }
        self.ui.retain_selection(|selected: &CardId| selected != &id);
    }

    // ─── Plumbing ───────────────────────────────────────────────────

    fn publish(&mut self, cards: Vec<CardRecord>, layers: Vec<LayerRecord>) {
        self.publish_delta(StoreDelta {
            cards,
            layers,
            text: Vec::new(),
        });
        self.refresh();
    }

    fn publish_delta(&mut self, delta: StoreDelta) {
        if delta.is_empty() {
            return;
        }
        match SyncMessage::update(self.peer, self.clock.now(), &delta) {
            Ok(msg) => self.mesh.broadcast_sync(&msg, None),
            Err(e) => log::error!("Failed to build update: {e}"),
        }
    }

    fn stream_bindings(&self) -> BTreeMap<PeerId, StreamId> {
        let mut out = BTreeMap::new();
        for (transport, stream) in self.streams.bindings() {
            if let Some(peer) = self.mesh.peer_of(transport) {
                out.insert(peer, stream.id());
            }
        }
        if let Some(local) = self.streams.local() {
            out.insert(self.peer, local.id());
        }
        out
    }

    fn refresh(&mut self) {
        let streams = self.stream_bindings();
        let input = ProjectionInput {
            store: &self.store,
            layering: &self.layering,
            awareness: &self.awareness,
            text: &self.text,
            streams: &streams,
            backpack: self.backpack.items(),
            ui: &self.ui,
        };
        self.projector.project(input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::streams::{MediaTrack, TrackKind};

    fn engine(peer: u64) -> SyncEngine {
        SyncEngine::new(
            Session::generate(),
            EngineOptions::new(format!("peer{peer}")).with_peer(PeerId(peer)),
            Box::new(MemoryStore::new()),
        )
    }

    fn camera() -> MediaStream {
        MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "cam")])
    }

    #[test]
    fn test_add_card_layers_on_top() {
        let mut e = engine(1);
        let a = e.add_card(CardDraft::image("a"));
        let b = e.add_card(CardDraft::image("b"));
        assert_eq!(e.snapshot().layering, vec![a.clone(), b.clone()]);
        e.move_card(&a, Point::new(5.0, 5.0)).unwrap();
        assert_eq!(e.snapshot().layering, vec![b, a]);
    }

    #[test]
    fn test_trash_removes_from_layering() {
        let mut e = engine(1);
        let a = e.add_card(CardDraft::image("a"));
        e.trash_card(&a).unwrap();
        assert!(e.snapshot().cards.is_empty());
        assert!(!e.layering().contains(&a));
        assert!(matches!(e.trash_card(&a), Err(EngineError::Trashed(_))));
        assert!(matches!(
            e.move_card(&CardId::from("nope"), Point::ORIGIN),
            Err(EngineError::UnknownCard(_))
        ));
    }

    #[test]
    fn test_update_keeps_author() {
        let mut e = engine(1);
        let id = e.add_card(CardDraft::image("a"));
        let mut card = e.store().get(&id).unwrap().clone();
        card.author = PeerId(99);
        card.title = "new".into();
        e.update_card(card).unwrap();
        let stored = e.store().get(&id).unwrap();
        assert_eq!(stored.author, PeerId(1));
        assert_eq!(stored.title, "new");
    }

    #[test]
    fn test_playback_manager_only() {
        let mut e = engine(1);
        let id = e.add_card(CardDraft::video("https://v"));
        let playing = PlayerState {
            playing: true,
            ..PlayerState::default()
        };
        e.set_playback(&id, playing.clone()).unwrap();

        let mut card = e.store().get(&id).unwrap().clone();
        card.manager = PeerId(2);
        e.update_card(card).unwrap();
        assert!(matches!(
            e.set_playback(&id, playing),
            Err(EngineError::NotManager { manager: PeerId(2), .. })
        ));
    }

    #[test]
    fn test_chat_post() {
        let mut e = engine(1);
        let chat = e.add_card(CardDraft::chat("peer1"));
        e.post_chat(&chat, "hello").unwrap();
        match &e.store().get(&chat).unwrap().kind {
            CardKind::Chat { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].author, PeerId(1));
                assert_eq!(messages[0].text, "hello");
            }
            other => panic!("unexpected kind {other:?}"),
        }
        let img = e.add_card(CardDraft::image("x"));
        assert!(matches!(e.post_chat(&img, "x"), Err(EngineError::WrongKind { .. })));
    }

    #[test]
    fn test_text_edit() {
        let mut e = engine(1);
        let text_id = TextId::generate();
        e.add_card(CardDraft::text(text_id.clone()));
        e.edit_text(&text_id, &TextEdit::Insert { index: 0, chunk: "hey".into() })
            .unwrap();
        assert_eq!(e.text_content(&text_id), "hey");
        assert!(e
            .edit_text(&text_id, &TextEdit::Delete { index: 2, len: 5 })
            .is_err());
    }

    #[test]
    fn test_presence_failure_leaves_state() {
        let mut e = engine(1);
        let err = e
            .add_my_presence("ann", Err(MediaError::PermissionDenied))
            .unwrap_err();
        assert!(matches!(err, EngineError::Media(MediaError::PermissionDenied)));
        assert!(e.store().is_empty());
    }

    #[test]
    fn test_trashing_own_avatar_stops_stream_once() {
        let mut e = engine(1);
        let stream = camera();
        let handle = stream.clone();
        let avatar = e.add_my_presence("ann", Ok(stream)).unwrap();
        assert_eq!(e.snapshot().card(&avatar).unwrap().stream, Some(handle.id()));

        e.trash_card(&avatar).unwrap();
        assert!(handle.is_stopped());
        assert!(e.streams().local().is_none());
    }

    #[test]
    fn test_presence_reuses_avatar() {
        let mut e = engine(1);
        let first = e.add_my_presence("ann", Ok(camera())).unwrap();
        let second = e.add_my_presence("ann", Ok(camera())).unwrap();
        assert_eq!(first, second);
        assert_eq!(e.store().live_cards().len(), 1);
    }

    #[test]
    fn test_capture_modes() {
        let mut e = engine(1);
        let a = e.add_card(CardDraft::image("a"));
        let b = e.add_card(CardDraft::image("b"));
        e.capture_to_backpack(&a, CaptureMode::Stash).unwrap();
        e.capture_to_backpack(&b, CaptureMode::Pin).unwrap();

        let snap = e.snapshot();
        assert_eq!(snap.backpack.len(), 2);
        assert!(snap.card(&a).is_none());
        assert!(snap.card(&b).is_some());

        let avatar = e.add_my_presence("ann", Ok(camera())).unwrap();
        assert!(matches!(
            e.capture_to_backpack(&avatar, CaptureMode::Stash),
            Err(EngineError::NotCapturable(_))
        ));
    }

    #[test]
    fn test_release_issues_fresh_id() {
        let mut e = engine(1);
        let a = e.add_card(CardDraft::image("a.png"));
        e.capture_to_backpack(&a, CaptureMode::Stash).unwrap();
        let released = e.release_from_backpack(&a).unwrap();
        assert_ne!(released, a);
        assert!(e.backpack().is_empty());
        assert_eq!(
            e.store().get(&released).unwrap().kind,
            CardKind::Image { uri: "a.png".into() }
        );
        assert!(matches!(
            e.release_from_backpack(&a),
            Err(EngineError::NotInBackpack(_))
        ));
    }

    #[test]
    fn test_cursor_throttled() {
        let mut e = engine(1);
        let t0 = Instant::now();
        assert!(e.move_cursor(Some(Point::new(10.0, 10.0)), t0));
        assert!(!e.move_cursor(Some(Point::new(11.0, 10.0)), t0 + Duration::from_millis(5)));
        assert!(e.move_cursor(Some(Point::new(12.0, 10.0)), t0 + Duration::from_millis(40)));
        assert!(e.move_cursor(None, t0 + Duration::from_millis(41)));
        assert_eq!(e.snapshot().peers[0].cursor, None);
    }

    #[test]
    fn test_ui_state_is_local() {
        let mut e = engine(1);
        e.connect();
        e.drain_commands();
        e.ui(UiAction::ToggleBackpack);
        assert!(e.snapshot().ui.backpack_open);
        assert!(e.drain_commands().is_empty());
    }

    #[test]
    fn test_compact_purges() {
        let mut e = engine(1);
        let a = e.add_card(CardDraft::image("a"));
        e.trash_card(&a).unwrap();
        assert_eq!(e.compact(), 1);
        assert!(e.store().get(&a).is_none());
        assert_eq!(e.compact(), 0);
    }
}
