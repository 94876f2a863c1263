//! ViewProjector: replicated and ephemeral state folded into one immutable
//! snapshot for the renderer.
//!
//! Cards come out in layering order (index = z), trashed cards are dropped,
//! and every normalized coordinate is converted to local pixels here, at
//! emission time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tavern_core::{Card, CardId, CardKind, PeerId, Point, SharedText, Size, StreamId, TransportId, Viewport};

use crate::awareness::{AwarenessTracker, CursorColor};
use crate::layering::Layering;
use crate::store::ReplicatedStore;
use crate::ui::LocalUiState;

#[derive(Debug, Clone, PartialEq)]
pub struct CardView {
    pub card: Card,
    /// Local pixels.
    pub position: Point,
    /// Local pixels.
    pub size: Size,
    pub z: usize,
    /// Live stream behind an avatar card, if any.
    pub stream: Option<StreamId>,
    /// Body of a text card.
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerView {
    pub id: PeerId,
    pub transport: Option<TransportId>,
    pub name: String,
    /// Local pixels.
    pub cursor: Option<Point>,
    pub active_region: Option<String>,
    pub color: CursorColor,
    pub is_local: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewSnapshot {
    pub version: u64,
    pub cards: Vec<CardView>,
    /// Visible card ids, bottom to top.
    pub layering: Vec<CardId>,
    /// Local peer first, then remote peers by id.
    pub peers: Vec<PeerView>,
    pub local_peer: Option<PeerId>,
    pub backpack: Vec<Card>,
    pub ui: LocalUiState,
}

impl ViewSnapshot {
    pub fn card(&self, id: &CardId) -> Option<&CardView> {
        self.cards.iter().find(|c| &c.card.id == id)
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerView> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn peers_in_region(&self, region: &str) -> Vec<&PeerView> {
        self.peers
            .iter()
            .filter(|p| p.active_region.as_deref() == Some(region))
            .collect()
    }
}

/// Everything a projection reads.
pub struct ProjectionInput<'a> {
    pub store: &'a ReplicatedStore,
    pub layering: &'a Layering,
    pub awareness: &'a AwarenessTracker,
    pub text: &'a SharedText,
    /// Stream currently bound to each durable peer, local included.
    pub streams: &'a BTreeMap<PeerId, StreamId>,
    pub backpack: &'a [Card],
    pub ui: &'a LocalUiState,
}

type SnapshotObserver = Box<dyn FnMut(&Arc<ViewSnapshot>) + Send>;

pub struct ViewProjector {
    viewport: Viewport,
    version: u64,
    last: Arc<ViewSnapshot>,
    observers: Vec<SnapshotObserver>,
}

impl ViewProjector {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            version: 0,
            last: Arc::new(ViewSnapshot::default()),
            observers: Vec::new(),
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn latest(&self) -> Arc<ViewSnapshot> {
        Arc::clone(&self.last)
    }

    pub fn observe(&mut self, observer: impl FnMut(&Arc<ViewSnapshot>) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Build a snapshot and hand it to every observer. Nothing is emitted if
    /// it equals the previous one.
    pub fn project(&mut self, input: ProjectionInput<'_>) -> Arc<ViewSnapshot> {
        let mut snapshot = self.build(input);
        snapshot.version = self.last.version;
        if snapshot == *self.last {
            return self.latest();
        }

        self.version += 1;
        snapshot.version = self.version;
        let snapshot = Arc::new(snapshot);
        self.last = Arc::clone(&snapshot);
        for observer in &mut self.observers {
            observer(&snapshot);
        }
        snapshot
    }

    fn build(&self, input: ProjectionInput<'_>) -> ViewSnapshot {
        let live: BTreeMap<CardId, Card> = input
            .store
            .live_cards()
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        // Layering first; live cards it has not heard of yet go on top in id
        // order so every peer shows the same stack.
        let mut order: Vec<CardId> = input
            .layering
            .order()
            .into_iter()
            .filter(|id| live.contains_key(id))
            .collect();
        let placed: BTreeSet<CardId> = order.iter().cloned().collect();
        order.extend(live.keys().filter(|id| !placed.contains(*id)).cloned());

        let cards = order
            .iter()
            .enumerate()
            .filter_map(|(z, id)| live.get(id).map(|card| self.card_view(card, z, &input)))
            .collect();

        ViewSnapshot {
            version: 0,
            cards,
            layering: order,
            peers: self.peer_views(input.awareness),
            local_peer: Some(input.awareness.local_id()),
            backpack: input.backpack.to_vec(),
            ui: input.ui.clone(),
        }
    }

    fn card_view(&self, card: &Card, z: usize, input: &ProjectionInput<'_>) -> CardView {
        let (stream, text) = match &card.kind {
            CardKind::Avatar => (input.streams.get(&card.author).copied(), None),
            CardKind::Text { text_id } => (None, Some(input.text.content(text_id))),
            CardKind::Video { .. } | CardKind::Image { .. } | CardKind::Chat { .. } => (None, None),
        };
        CardView {
            card: card.clone(),
            position: self.viewport.denormalize(card.position),
            size: self.viewport.denormalize_size(card.size),
            z,
            stream,
            text,
        }
    }

    fn peer_views(&self, awareness: &AwarenessTracker) -> Vec<PeerView> {
        let local = awareness.local_state();
        let local_id = awareness.local_id();
        let mut peers = vec![PeerView {
            id: local_id,
            transport: None,
            name: local.name.clone(),
            cursor: local.cursor.map(|c| self.viewport.denormalize(c)),
            active_region: local.active_region.clone(),
            color: CursorColor::from_peer(local_id),
            is_local: true,
        }];
        for (id, entry) in awareness.get_states() {
            peers.push(PeerView {
                id: *id,
                transport: Some(entry.transport),
                name: entry.state.name.clone(),
                cursor: entry.state.cursor.map(|c| self.viewport.denormalize(c)),
                active_region: entry.state.active_region.clone(),
                color: CursorColor::from_peer(*id),
                is_local: false,
            });
        }
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Stamp;
    use std::sync::Mutex;
    use tavern_core::{CardDraft, TextEdit, TextId};

    struct Fixture {
        store: ReplicatedStore,
        layering: Layering,
        awareness: AwarenessTracker,
        text: SharedText,
        streams: BTreeMap<PeerId, StreamId>,
        ui: LocalUiState,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: ReplicatedStore::new(),
                layering: Layering::new(),
                awareness: AwarenessTracker::new(PeerId(1), "me"),
                text: SharedText::new(),
                streams: BTreeMap::new(),
                ui: LocalUiState::default(),
            }
        }

        fn add(&mut self, id: &str, draft: CardDraft, clock: u64) {
            let card = Card::from_draft(draft, CardId::from(id), PeerId(1));
            self.store.set(card, Stamp::new(clock, PeerId(1)));
            self.layering.append(&CardId::from(id), Stamp::new(clock, PeerId(1)));
        }

        fn input(&self) -> ProjectionInput<'_> {
            ProjectionInput {
                store: &self.store,
                layering: &self.layering,
                awareness: &self.awareness,
                text: &self.text,
                streams: &self.streams,
                backpack: &[],
                ui: &self.ui,
            }
        }
    }

    #[test]
    fn test_layering_order_and_pixels() {
        let mut f = Fixture::new();
        f.add("a", CardDraft::image("a").at(Point::new(100.0, 100.0)), 1);
        f.add("b", CardDraft::image("b"), 2);
        f.layering.move_to_front(&CardId::from("a"), Stamp::new(3, PeerId(1)));

        let mut projector = ViewProjector::new(Viewport::new(2000.0, 500.0));
        let snap = projector.project(f.input());
        assert_eq!(snap.layering, vec![CardId::from("b"), CardId::from("a")]);
        let a = snap.card(&CardId::from("a")).unwrap();
        assert_eq!(a.z, 1);
        assert_eq!(a.position, Point::new(200.0, 50.0));
    }

    #[test]
    fn test_trashed_filtered() {
        let mut f = Fixture::new();
        f.add("a", CardDraft::image("a"), 1);
        f.store.mark_trashed(&CardId::from("a"), Stamp::new(2, PeerId(1)));
        let snap = ViewProjector::new(Viewport::default()).project(f.input());
        assert!(snap.cards.is_empty());
    }

    #[test]
    fn test_unlayered_cards_appended() {
        let mut f = Fixture::new();
        f.add("b", CardDraft::image("b"), 1);
        let card = Card::from_draft(CardDraft::image("z"), CardId::from("a"), PeerId(2));
        f.store.set(card, Stamp::new(1, PeerId(2)));
        let snap = ViewProjector::new(Viewport::default()).project(f.input());
        assert_eq!(snap.layering, vec![CardId::from("b"), CardId::from("a")]);
    }

    #[test]
    fn test_text_and_stream_resolved() {
        let mut f = Fixture::new();
        let text_id = TextId::from("t1");
        f.text
            .edit(&text_id, &TextEdit::Insert { index: 0, chunk: "hi".into() })
            .unwrap();
        f.add("t", CardDraft::text(text_id), 1);
        f.add("av", CardDraft::avatar("me"), 2);
        let stream = StreamId::new();
        f.streams.insert(PeerId(1), stream);

        let snap = ViewProjector::new(Viewport::default()).project(f.input());
        assert_eq!(snap.card(&CardId::from("t")).unwrap().text.as_deref(), Some("hi"));
        assert_eq!(snap.card(&CardId::from("av")).unwrap().stream, Some(stream));
    }

    #[test]
    fn test_remote_cursor_denormalized() {
        let mut f = Fixture::new();
        let link = TransportId::new();
        f.awareness.identify(PeerId(7), link, "bob");
        f.awareness.apply_cursor(PeerId(7), Some(Point::new(500.0, 500.0)));
        f.awareness.set_active_region(Some("lounge".into()));

        let snap = ViewProjector::new(Viewport::new(800.0, 600.0)).project(f.input());
        let bob = snap.peer(PeerId(7)).unwrap();
        assert_eq!(bob.cursor, Some(Point::new(400.0, 300.0)));
        assert!(snap.peers[0].is_local);
        assert_eq!(snap.peers_in_region("lounge").len(), 1);
    }

    #[test]
    fn test_observer_fires_on_change_only() {
        let mut f = Fixture::new();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut projector = ViewProjector::new(Viewport::default());
        projector.observe(move |snap| sink.lock().unwrap().push(snap.version));

        projector.project(f.input());
        projector.project(f.input());
        f.add("a", CardDraft::image("a"), 1);
        projector.project(f.input());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
