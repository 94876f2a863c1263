//! Awareness: ephemeral per-peer state.
//!
//! Name, cursor, active region and free-form fields for every live peer.
//! None of it is durable. An entry exists only while the peer's transport is
//! open and is dropped without a tombstone the moment it closes; a peer that
//! comes back gets a fresh entry.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! CursorThrottle::admit()   (leading edge, 33ms)
//!       │
//!       ▼
//! ControlPacket::Cursor { x, y }  (normalized)
//!       │
//!       ▼   (mesh broadcast)
//! Remote AwarenessTracker::apply_cursor()
//!       │
//!       ▼
//! ViewProjector → local pixels
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tavern_core::{PeerId, Point, TransportId};

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

/// What one peer publishes about itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AwarenessState {
    pub name: String,
    /// Normalized coordinates; `None` when the pointer left the surface.
    pub cursor: Option<Point>,
    pub active_region: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

/// A remote peer's live entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub transport: TransportId,
    pub clock: u64,
    pub state: AwarenessState,
}

/// Which entries an update touched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AwarenessChange {
    pub added: Vec<PeerId>,
    pub updated: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl AwarenessChange {
    fn added(peer: PeerId) -> Self {
        Self {
            added: vec![peer],
            ..Self::default()
        }
    }

    fn updated(peer: PeerId) -> Self {
        Self {
            updated: vec![peer],
            ..Self::default()
        }
    }

    fn removed(peer: PeerId) -> Self {
        Self {
            removed: vec![peer],
            ..Self::default()
        }
    }
}

type AwarenessObserver = Box<dyn FnMut(&AwarenessChange) + Send>;

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

pub struct AwarenessTracker {
    local_id: PeerId,
    local_clock: u64,
    local: AwarenessState,
    peers: BTreeMap<PeerId, PeerEntry>,
    observers: Vec<AwarenessObserver>,
}

impl AwarenessTracker {
    pub fn new(local_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            local_id,
            local_clock: 0,
            local: AwarenessState {
                name: name.into(),
                ..AwarenessState::default()
            },
            peers: BTreeMap::new(),
            observers: Vec::new(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    pub fn local_clock(&self) -> u64 {
        self.local_clock
    }

    /// Set a free-form field on the local entry. Returns the new clock.
    pub fn set_local_field(&mut self, key: impl Into<String>, value: Value) -> u64 {
        self.local.fields.insert(key.into(), value);
        self.bump_local()
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> u64 {
        self.local.name = name.into();
        self.bump_local()
    }

    pub fn set_active_region(&mut self, region: Option<String>) -> u64 {
        self.local.active_region = region;
        self.bump_local()
    }

    /// Cursor moves travel as their own packets and do not bump the clock.
    pub fn set_local_cursor(&mut self, cursor: Option<Point>) -> bool {
        if self.local.cursor == cursor {
            return false;
        }
        self.local.cursor = cursor;
        self.notify(&AwarenessChange::updated(self.local_id));
        true
    }

    fn bump_local(&mut self) -> u64 {
        self.local_clock += 1;
        self.notify(&AwarenessChange::updated(self.local_id));
        self.local_clock
    }

    /// First sight of a peer through the identity handshake.
    pub fn identify(&mut self, peer: PeerId, transport: TransportId, name: &str) -> bool {
        if peer == self.local_id {
            return false;
        }
        match self.peers.get_mut(&peer) {
            Some(entry) if entry.transport == transport => false,
            Some(entry) => {
                // Same durable peer on a new link: fresh entry.
                *entry = fresh_entry(transport, name);
                self.notify(&AwarenessChange::updated(peer));
                true
            }
            None => {
                self.peers.insert(peer, fresh_entry(transport, name));
                self.notify(&AwarenessChange::added(peer));
                true
            }
        }
    }

    /// Full state from a peer. Stale clocks on the same link are ignored.
    pub fn apply_remote(
        &mut self,
        peer: PeerId,
        transport: TransportId,
        clock: u64,
        state: AwarenessState,
    ) -> bool {
        if peer == self.local_id {
            return false;
        }
        match self.peers.get_mut(&peer) {
            Some(entry)
                if entry.transport == transport
                    && (clock < entry.clock || (clock == entry.clock && entry.state == state)) =>
            {
                false
            }
            Some(entry) => {
                entry.transport = transport;
                entry.clock = clock;
                entry.state = state;
                self.notify(&AwarenessChange::updated(peer));
                true
            }
            None => {
                self.peers.insert(
                    peer,
                    PeerEntry {
                        transport,
                        clock,
                        state,
                    },
                );
                self.notify(&AwarenessChange::added(peer));
                true
            }
        }
    }

    /// Cursor packet from a known peer.
    pub fn apply_cursor(&mut self, peer: PeerId, cursor: Option<Point>) -> bool {
        let Some(entry) = self.peers.get_mut(&peer) else {
            return false;
        };
        if entry.state.cursor == cursor {
            return false;
        }
        entry.state.cursor = cursor;
        self.notify(&AwarenessChange::updated(peer));
        true
    }

    /// Drop a peer's entry. No tombstone is kept.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        if self.peers.remove(&peer).is_some() {
            self.notify(&AwarenessChange::removed(peer));
            true
        } else {
            false
        }
    }

    /// Point an entry at another live transport of the same peer.
    pub fn rebind(&mut self, peer: PeerId, transport: TransportId) {
        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.transport = transport;
        }
    }

    /// Live remote peers.
    pub fn get_states(&self) -> &BTreeMap<PeerId, PeerEntry> {
        &self.peers
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    pub fn observe(&mut self, observer: impl FnMut(&AwarenessChange) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn notify(&mut self, change: &AwarenessChange) {
        for observer in &mut self.observers {
            observer(change);
        }
    }
}

fn fresh_entry(transport: TransportId, name: &str) -> PeerEntry {
    PeerEntry {
        transport,
        clock: 0,
        state: AwarenessState {
            name: name.to_string(),
            ..AwarenessState::default()
        },
    }
}

// ───────────────────────────────────────────────────────────────────
// Cursor rate limiting
// ───────────────────────────────────────────────────────────────────

/// Leading-edge throttle: the first move in each interval goes out, the rest
/// are dropped.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Cursor colour
// ───────────────────────────────────────────────────────────────────

/// RGBA colour for a peer's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable colour for a durable peer id. Hue from the id, fixed
    /// saturation and lightness.
    pub fn from_peer(id: PeerId) -> Self {
        let hue = ((id.0 % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 1.0 / 2.0 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn tracker() -> AwarenessTracker {
        AwarenessTracker::new(PeerId(1), "me")
    }

    #[test]
    fn test_identify_adds_entry() {
        let mut t = tracker();
        let link = TransportId::new();
        assert!(t.identify(PeerId(2), link, "bob"));
        assert!(!t.identify(PeerId(2), link, "bob"));
        assert_eq!(t.get(&PeerId(2)).unwrap().state.name, "bob");
    }

    #[test]
    fn test_ignores_self() {
        let mut t = tracker();
        assert!(!t.identify(PeerId(1), TransportId::new(), "me"));
        assert!(t.get_states().is_empty());
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut t = tracker();
        let link = TransportId::new();
        let state = AwarenessState {
            name: "bob".into(),
            ..AwarenessState::default()
        };
        assert!(t.apply_remote(PeerId(2), link, 3, state.clone()));
        let older = AwarenessState {
            name: "old".into(),
            ..state
        };
        assert!(!t.apply_remote(PeerId(2), link, 2, older));
        assert_eq!(t.get(&PeerId(2)).unwrap().state.name, "bob");
    }

    #[test]
    fn test_reconnect_gets_fresh_entry() {
        let mut t = tracker();
        let first = TransportId::new();
        t.identify(PeerId(2), first, "bob");
        t.apply_cursor(PeerId(2), Some(Point::new(5.0, 5.0)));
        t.remove(PeerId(2));
        assert!(t.get(&PeerId(2)).is_none());

        let second = TransportId::new();
        t.identify(PeerId(2), second, "bob");
        let entry = t.get(&PeerId(2)).unwrap();
        assert_eq!(entry.transport, second);
        assert_eq!(entry.state.cursor, None);
    }

    #[test]
    fn test_cursor_from_unknown_peer_dropped() {
        let mut t = tracker();
        assert!(!t.apply_cursor(PeerId(9), Some(Point::new(1.0, 1.0))));
        assert!(t.get_states().is_empty());
    }

    #[test]
    fn test_observer_distinguishes_changes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let mut t = tracker();
        t.observe(move |change| sink.lock().unwrap().push(change.clone()));

        let link = TransportId::new();
        t.identify(PeerId(2), link, "bob");
        t.apply_cursor(PeerId(2), Some(Point::new(1.0, 2.0)));
        t.remove(PeerId(2));

        let log = log.lock().unwrap();
        assert_eq!(log[0].added, vec![PeerId(2)]);
        assert_eq!(log[1].updated, vec![PeerId(2)]);
        assert_eq!(log[2].removed, vec![PeerId(2)]);
    }

    #[test]
    fn test_local_field_bumps_clock() {
        let mut t = tracker();
        assert_eq!(t.set_local_field("mood", Value::from("happy")), 1);
        assert_eq!(t.set_active_region(Some("lobby".into())), 2);
        assert_eq!(t.local_state().fields["mood"], Value::from("happy"));
        assert!(t.set_local_cursor(Some(Point::new(1.0, 1.0))));
        assert_eq!(t.local_clock(), 2);
    }

    #[test]
    fn test_throttle_leading_edge() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(33));
        let t0 = Instant::now();
        assert!(throttle.admit(t0));
        assert!(!throttle.admit(t0 + Duration::from_millis(10)));
        assert!(!throttle.admit(t0 + Duration::from_millis(32)));
        assert!(throttle.admit(t0 + Duration::from_millis(33)));
    }

    #[test]
    fn test_cursor_color_stable_and_distinct() {
        assert_eq!(CursorColor::from_peer(PeerId(42)), CursorColor::from_peer(PeerId(42)));
        assert_ne!(CursorColor::from_peer(PeerId(1)), CursorColor::from_peer(PeerId(180)));
        let [r, g, b, a] = CursorColor::from_peer(PeerId(7)).to_array();
        for c in [r, g, b] {
            assert!((0.0..=1.0).contains(&c));
        }
        assert_eq!(a, 1.0);
    }

    #[test]
    fn test_hsl_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 1e-5);
        assert!(g.abs() < 1e-5);
        assert!(b.abs() < 1e-5);
    }
}
