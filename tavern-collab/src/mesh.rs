//! MeshSession: the lifecycle of direct peer links, without I/O.
//!
//! The session is fed [`NetworkInput`]s by whatever moves bytes and answers
//! with [`MeshEvent`]s for the engine plus [`TransportCommand`]s for the
//! transport. Per link:
//!
//! ```text
//!  discovered ──dial/accept──▶ handshaking ──ID packet──▶ connected
//!       │                          │                          │
//!       └──────── dial failed      └──────────┬───────────────┘
//!                                             ▼
//!                                          closed  (peer-left, once)
//! ```
//!
//! A closed link is forgotten outright. Its transport id may be announced
//! again later and is then treated as new.
//!
//! Transport ids change on every restart, so the identity handshake maps
//! each link to the durable [`PeerId`] behind it. Both directions of that
//! mapping live here and nowhere else.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tavern_core::{PeerId, StreamId, TransportId};

use crate::protocol::{ControlPacket, Frame, SyncMessage};
use crate::session::Session;
use crate::streams::MediaTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Handshaking,
    Connected,
}

/// Inputs from the transport and discovery layers.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkInput {
    Discovered { transport: TransportId, addr: String },
    Opened { transport: TransportId },
    Frame { transport: TransportId, frame: Frame },
    Closed { transport: TransportId },
    DialFailed { transport: TransportId },
}

/// What the transport should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Start discovery for the room.
    JoinRoom { room: String },
    Dial { transport: TransportId, addr: String },
    Send { to: TransportId, frame: Frame },
    Close { transport: TransportId },
}

/// What happened on the mesh.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerJoined {
        transport: TransportId,
    },
    PeerIdentified {
        transport: TransportId,
        peer: PeerId,
        name: String,
    },
    /// Fires exactly once per link that reached `handshaking`.
    PeerLeft {
        transport: TransportId,
        peer: Option<PeerId>,
    },
    Control {
        transport: TransportId,
        peer: PeerId,
        packet: ControlPacket,
    },
    Sync {
        transport: TransportId,
        message: SyncMessage,
    },
    StreamReceived {
        transport: TransportId,
        stream_id: StreamId,
        tracks: Vec<MediaTrack>,
    },
}

#[derive(Debug, Clone)]
struct Connection {
    state: ConnectionState,
    peer: Option<PeerId>,
}

pub struct MeshSession {
    session: Session,
    local_peer: PeerId,
    local_transport: TransportId,
    local_name: String,
    joined: bool,
    connections: HashMap<TransportId, Connection>,
    /// Durable id → every open link it is reachable on.
    peers: BTreeMap<PeerId, BTreeSet<TransportId>>,
    outbox: VecDeque<TransportCommand>,
}

impl MeshSession {
    pub fn new(
        session: Session,
        local_peer: PeerId,
        local_transport: TransportId,
        local_name: impl Into<String>,
    ) -> Self {
        Self {
            session,
            local_peer,
            local_transport,
            local_name: local_name.into(),
            joined: false,
            connections: HashMap::new(),
            peers: BTreeMap::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn local_transport(&self) -> TransportId {
        self.local_transport
    }

    /// Join the room. Idempotent; returns `true` the first time.
    pub fn connect(&mut self) -> bool {
        if self.joined {
            return false;
        }
        self.joined = true;
        self.outbox.push_back(TransportCommand::JoinRoom {
            room: self.session.room_id().to_string(),
        });
        log::info!("Joining room {}", self.session.room_id());
        true
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.local_name = name.into();
    }

    // ─── Inputs ─────────────────────────────────────────────────────

    pub fn handle(&mut self, input: NetworkInput) -> Vec<MeshEvent> {
        match input {
            NetworkInput::Discovered { transport, addr } => {
                self.discovered(transport, addr);
                Vec::new()
            }
            NetworkInput::Opened { transport } => self.opened(transport),
            NetworkInput::Frame { transport, frame } => self.receive(transport, frame),
            NetworkInput::Closed { transport } => self.closed(transport),
            NetworkInput::DialFailed { transport } => {
                self.dial_failed(transport);
                Vec::new()
            }
        }
    }

    /// A peer announced itself. Only the lower transport id dials.
    pub fn discovered(&mut self, transport: TransportId, addr: String) {
        if !self.joined || transport == self.local_transport {
            return;
        }
        if self.connections.contains_key(&transport) {
            return;
        }
        self.set_state(transport, ConnectionState::Discovered, None);
        if self.local_transport < transport {
            log::debug!("Dialing {transport} at {addr}");
            self.outbox.push_back(TransportCommand::Dial { transport, addr });
        }
    }

    /// A link is up in either direction. Sends our identity.
    pub fn opened(&mut self, transport: TransportId) -> Vec<MeshEvent> {
        if let Some(conn) = self.connections.get(&transport) {
            if matches!(
                conn.state,
                ConnectionState::Handshaking | ConnectionState::Connected
            ) {
                return Vec::new();
            }
        }
        self.set_state(transport, ConnectionState::Handshaking, None);
        let identity = ControlPacket::Identity {
            doc_id: self.local_peer,
            my_name: self.local_name.clone(),
        };
        self.send_control_to(transport, &identity);
        vec![MeshEvent::PeerJoined { transport }]
    }

    pub fn receive(&mut self, transport: TransportId, frame: Frame) -> Vec<MeshEvent> {
        let Some(conn) = self.connections.get(&transport) else {
            log::debug!("Frame from unknown link {transport} dropped");
            return Vec::new();
        };
        if !matches!(
            conn.state,
            ConnectionState::Handshaking | ConnectionState::Connected
        ) {
            return Vec::new();
        }
        let peer = conn.peer;

        match frame {
            Frame::Text(text) => match ControlPacket::parse(&text) {
                Ok(packet) => self.control(transport, peer, packet),
                Err(e) => {
                    log::warn!("Malformed control packet from {transport}: {e}");
                    Vec::new()
                }
            },
            Frame::Binary(bytes) => match SyncMessage::decode(&bytes) {
                Ok(message) => vec![MeshEvent::Sync { transport, message }],
                Err(e) => {
                    log::warn!("Undecodable sync frame from {transport}: {e}");
                    Vec::new()
                }
            },
        }
    }

    fn control(
        &mut self,
        transport: TransportId,
        peer: Option<PeerId>,
        packet: ControlPacket,
    ) -> Vec<MeshEvent> {
        match packet {
            ControlPacket::Identity { doc_id, my_name } => {
                self.identify(transport, peer, doc_id, my_name)
            }
            ControlPacket::Stream { stream_id, tracks } => vec![MeshEvent::StreamReceived {
                transport,
                stream_id,
                tracks,
            }],
            ControlPacket::Unknown => {
                log::debug!("Ignoring unknown packet kind from {transport}");
                Vec::new()
            }
            packet => match peer {
                Some(peer) => vec![MeshEvent::Control {
                    transport,
                    peer,
                    packet,
                }],
                None => {
                    log::debug!("Control packet before identity from {transport} dropped");
                    Vec::new()
                }
            },
        }
    }

    fn identify(
        &mut self,
        transport: TransportId,
        known: Option<PeerId>,
        peer: PeerId,
        name: String,
    ) -> Vec<MeshEvent> {
        if let Some(known) = known {
            if known != peer {
                log::warn!("Link {transport} changed identity {known} -> {peer}, ignored");
            }
            return Vec::new();
        }
        if peer == self.local_peer {
            log::warn!("Link {transport} claims our own id, closing");
            self.outbox.push_back(TransportCommand::Close { transport });
            return Vec::new();
        }
        self.set_state(transport, ConnectionState::Connected, Some(peer));
        self.peers.entry(peer).or_default().insert(transport);
        log::info!("Peer {peer} ({name}) identified on {transport}");
        vec![MeshEvent::PeerIdentified {
            transport,
            peer,
            name,
        }]
    }

    /// The link is gone. Emits `PeerLeft` once, and only for links that
    /// were ever open.
    pub fn closed(&mut self, transport: TransportId) -> Vec<MeshEvent> {
        let Some(conn) = self.connections.remove(&transport) else {
            return Vec::new();
        };
        let was_open = matches!(
            conn.state,
            ConnectionState::Handshaking | ConnectionState::Connected
        );
        let peer = conn.peer;

        if let Some(peer) = peer {
            if let Some(links) = self.peers.get_mut(&peer) {
                links.remove(&transport);
                if links.is_empty() {
                    self.peers.remove(&peer);
                }
            }
        }
        log::debug!("Link {transport} closed");

        if was_open {
            log::info!("Peer left on {transport} ({peer:?})");
            vec![MeshEvent::PeerLeft { transport, peer }]
        } else {
            Vec::new()
        }
    }

    pub fn dial_failed(&mut self, transport: TransportId) {
        if let Some(conn) = self.connections.get(&transport) {
            if conn.state == ConnectionState::Discovered {
                log::warn!("Dial to {transport} failed; waiting for the next announcement");
                self.connections.remove(&transport);
            }
        }
    }

    fn set_state(&mut self, transport: TransportId, state: ConnectionState, peer: Option<PeerId>) {
        let conn = self.connections.entry(transport).or_insert(Connection {
            state,
            peer: None,
        });
        log::debug!("Link {transport}: {:?} -> {state:?}", conn.state);
        conn.state = state;
        if peer.is_some() {
            conn.peer = peer;
        }
    }

    // ─── Outputs ────────────────────────────────────────────────────

    /// Send a control packet to every open link of a durable peer.
    pub fn send_control(&mut self, peer: PeerId, packet: &ControlPacket) -> bool {
        let links: Vec<TransportId> = self.transports_of(peer);
        for link in &links {
            self.send_control_to(*link, packet);
        }
        !links.is_empty()
    }

    pub fn send_control_to(&mut self, transport: TransportId, packet: &ControlPacket) {
        match packet.to_frame() {
            Ok(frame) => self.outbox.push_back(TransportCommand::Send {
                to: transport,
                frame,
            }),
            Err(e) => log::error!("Failed to encode control packet: {e}"),
        }
    }

    pub fn broadcast_control(&mut self, packet: &ControlPacket) {
        for link in self.open_transports() {
            self.send_control_to(link, packet);
        }
    }

    pub fn send_sync(&mut self, transport: TransportId, message: &SyncMessage) {
        match message.to_frame() {
            Ok(frame) => self.outbox.push_back(TransportCommand::Send {
                to: transport,
                frame,
            }),
            Err(e) => log::error!("Failed to encode sync message: {e}"),
        }
    }

    /// Send to every open link except `except`.
    pub fn broadcast_sync(&mut self, message: &SyncMessage, except: Option<TransportId>) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode sync message: {e}");
                return;
            }
        };
        for link in self.open_transports() {
            if Some(link) != except {
                self.outbox.push_back(TransportCommand::Send {
                    to: link,
                    frame: frame.clone(),
                });
            }
        }
    }

    pub fn drain_commands(&mut self) -> Vec<TransportCommand> {
        self.outbox.drain(..).collect()
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub fn state(&self, transport: &TransportId) -> Option<ConnectionState> {
        self.connections.get(transport).map(|c| c.state)
    }

    pub fn peer_of(&self, transport: &TransportId) -> Option<PeerId> {
        self.connections.get(transport).and_then(|c| c.peer)
    }

    pub fn transports_of(&self, peer: PeerId) -> Vec<TransportId> {
        self.peers
            .get(&peer)
            .map(|links| links.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_peer_live(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Durable ids of every identified remote peer.
    pub fn live_peers(&self) -> BTreeSet<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Links in `handshaking` or `connected`, in a stable order.
    pub fn open_transports(&self) -> Vec<TransportId> {
        let mut links: Vec<TransportId> = self
            .connections
            .iter()
            .filter(|(_, c)| {
                matches!(
                    c.state,
                    ConnectionState::Handshaking | ConnectionState::Connected
                )
            })
            .map(|(t, _)| *t)
            .collect();
        links.sort();
        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh(peer: u64) -> MeshSession {
        let mut m = MeshSession::new(Session::generate(), PeerId(peer), TransportId::new(), "me");
        m.connect();
        m.drain_commands();
        m
    }

    fn id_frame(peer: u64, name: &str) -> Frame {
        ControlPacket::Identity {
            doc_id: PeerId(peer),
            my_name: name.into(),
        }
        .to_frame()
        .unwrap()
    }

    #[test]
    fn test_connect_idempotent() {
        let mut m = MeshSession::new(Session::generate(), PeerId(1), TransportId::new(), "me");
        assert!(m.connect());
        assert!(!m.connect());
        let cmds = m.drain_commands();
        assert_eq!(cmds.len(), 1);
        assert!(matches!(cmds[0], TransportCommand::JoinRoom { .. }));
    }

    #[test]
    fn test_lower_transport_dials() {
        let mut m = mesh(1);
        let local = m.local_transport();
        let remote = TransportId::new();
        m.discovered(remote, "127.0.0.1:1".into());
        let dialed = m
            .drain_commands()
            .iter()
            .any(|c| matches!(c, TransportCommand::Dial { .. }));
        assert_eq!(dialed, local < remote);
        assert_eq!(m.state(&remote), Some(ConnectionState::Discovered));
    }

    #[test]
    fn test_discovery_before_connect_ignored() {
        let mut m = MeshSession::new(Session::generate(), PeerId(1), TransportId::new(), "me");
        m.discovered(TransportId::new(), "x".into());
        assert!(m.drain_commands().is_empty());
    }

    #[test]
    fn test_handshake_maps_identity() {
        let mut m = mesh(1);
        let link = TransportId::new();
        let events = m.opened(link);
        assert_eq!(events, vec![MeshEvent::PeerJoined { transport: link }]);

        // Our identity went out first.
        let cmds = m.drain_commands();
        match &cmds[0] {
            TransportCommand::Send { to, frame: Frame::Text(text) } => {
                assert_eq!(*to, link);
                assert!(text.contains("\"packetKind\":\"ID\""));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let events = m.receive(link, id_frame(7, "bob"));
        assert_eq!(
            events,
            vec![MeshEvent::PeerIdentified {
                transport: link,
                peer: PeerId(7),
                name: "bob".into()
            }]
        );
        assert_eq!(m.state(&link), Some(ConnectionState::Connected));
        assert_eq!(m.peer_of(&link), Some(PeerId(7)));
        assert_eq!(m.transports_of(PeerId(7)), vec![link]);
    }

    #[test]
    fn test_peer_left_exactly_once() {
        let mut m = mesh(1);
        let link = TransportId::new();
        m.opened(link);
        m.receive(link, id_frame(7, "bob"));

        let first = m.closed(link);
        assert_eq!(
            first,
            vec![MeshEvent::PeerLeft {
                transport: link,
                peer: Some(PeerId(7))
            }]
        );
        assert!(m.closed(link).is_empty());
        assert!(!m.is_peer_live(PeerId(7)));
    }

    #[test]
    fn test_closed_link_is_forgotten() {
        let mut m = mesh(1);
        let link = TransportId::new();
        m.opened(link);
        m.receive(link, id_frame(7, "bob"));
        m.closed(link);

        assert_eq!(m.state(&link), None);
        assert_eq!(m.peer_of(&link), None);
        assert!(m.open_transports().is_empty());
        assert!(m.closed(link).is_empty());

        // A fresh announcement starts over.
        m.discovered(link, "127.0.0.1:9".into());
        assert_eq!(m.state(&link), Some(ConnectionState::Discovered));
    }

    #[test]
    fn test_send_control_reaches_every_link_of_peer() {
        let mut m = mesh(1);
        let a = TransportId::new();
        let b = TransportId::new();
        let other = TransportId::new();
        for (link, peer) in [(a, 7), (b, 7), (other, 8)] {
            m.opened(link);
            m.receive(link, id_frame(peer, "x"));
        }
        m.drain_commands();

        let cursor = ControlPacket::Cursor { x: 2.0, y: 3.0 };
        assert!(m.send_control(PeerId(7), &cursor));
        let mut targets: Vec<TransportId> = m
            .drain_commands()
            .into_iter()
            .map(|cmd| match cmd {
                TransportCommand::Send { to, frame } => {
                    assert_eq!(frame, cursor.to_frame().unwrap());
                    to
                }
                other => panic!("unexpected command {other:?}"),
            })
            .collect();
        targets.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(targets, expected);

        assert!(!m.send_control(PeerId(99), &cursor));
        assert!(m.drain_commands().is_empty());
    }

    #[test]
    fn test_no_events_after_close() {
        let mut m = mesh(1);
        let link = TransportId::new();
        m.opened(link);
        m.receive(link, id_frame(7, "bob"));
        m.closed(link);
        let cursor = ControlPacket::Cursor { x: 1.0, y: 1.0 }.to_frame().unwrap();
        assert!(m.receive(link, cursor).is_empty());
    }

    #[test]
    fn test_unopened_link_close_is_silent() {
        let mut m = mesh(1);
        let link = TransportId::new();
        m.discovered(link, "x".into());
        assert!(m.closed(link).is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_dropped() {
        let mut m = mesh(1);
        let link = TransportId::new();
        m.opened(link);
        m.receive(link, id_frame(7, "bob"));
        assert!(m
            .receive(link, Frame::Text(r#"{"packetKind":"wave"}"#.into()))
            .is_empty());
        assert!(m.receive(link, Frame::Text("garbage".into())).is_empty());
        assert!(m.receive(link, Frame::Binary(vec![0xff, 0xff])).is_empty());
        assert_eq!(m.state(&link), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_control_needs_identity() {
        let mut m = mesh(1);
        let link = TransportId::new();
        m.opened(link);
        let cursor = ControlPacket::Cursor { x: 1.0, y: 1.0 }.to_frame().unwrap();
        assert!(m.receive(link, cursor.clone()).is_empty());
        m.receive(link, id_frame(7, "bob"));
        assert_eq!(m.receive(link, cursor).len(), 1);
    }

    #[test]
    fn test_two_links_same_peer() {
        let mut m = mesh(1);
        let a = TransportId::new();
        let b = TransportId::new();
        m.opened(a);
        m.receive(a, id_frame(7, "bob"));
        m.opened(b);
        m.receive(b, id_frame(7, "bob"));
        m.closed(a);
        assert!(m.is_peer_live(PeerId(7)));
        m.closed(b);
        assert!(!m.is_peer_live(PeerId(7)));
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let mut m = mesh(1);
        let a = TransportId::new();
        let b = TransportId::new();
        m.opened(a);
        m.opened(b);
        m.drain_commands();
        m.broadcast_sync(&SyncMessage::ping(PeerId(1)), Some(a));
        let cmds = m.drain_commands();
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], TransportCommand::Send { to, .. } if *to == b));
    }

    #[test]
    fn test_dial_failure_allows_retry() {
        let mut m = mesh(1);
        let remote = TransportId::new();
        m.discovered(remote, "x".into());
        m.dial_failed(remote);
        assert_eq!(m.state(&remote), None);
        m.discovered(remote, "x".into());
        assert_eq!(m.state(&remote), Some(ConnectionState::Discovered));
    }
}
