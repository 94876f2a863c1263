//! Node: the async driver around one [`SyncEngine`].
//!
//! ```text
//!  NodeHandle ── update queue ──┐
//!  WsTransport ── NetworkInput ─┤
//!  Discovery ── Announcement ───┼──▶ run loop ──▶ SyncEngine
//!  keepalive tick ──────────────┘        │
//!                                        ├──▶ TransportCommand ──▶ WsTransport / Discovery
//!                                        └──▶ watch<Arc<ViewSnapshot>>
//! ```
//!
//! The engine is owned by a single task; every mutation, local or remote, is
//! applied there one at a time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tavern_core::{Card, CardDraft, CardId, PeerId, PlayerState, Point, Size, TextEdit, TextId};

use crate::config::NodeConfig;
use crate::engine::{CaptureMode, EngineError, EngineOptions, SyncEngine};
use crate::mesh::{NetworkInput, TransportCommand};
use crate::session::Session;
use crate::signaling::{Announcement, Discovery};
use crate::storage::{LocalStore, MemoryStore, RocksLocalStore, StorageError, StoreConfig};
use crate::streams::{MediaError, MediaSource};
use crate::transport::{TransportError, WsTransport};
use crate::ui::UiAction;
use crate::view::ViewSnapshot;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("local storage: {0}")]
    Storage(#[from] StorageError),
    #[error("could not start local media: {0}")]
    Media(MediaError),
    #[error(transparent)]
    Engine(EngineError),
    #[error("node has shut down")]
    Closed,
}

impl From<EngineError> for NodeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Media(e) => NodeError::Media(e),
            other => NodeError::Engine(other),
        }
    }
}

type Update = Box<dyn FnOnce(&mut SyncEngine) + Send>;

pub struct Node;

impl Node {
    /// Bind the peer transport, open local storage and start the run loop.
    /// The node joins its room immediately.
    pub async fn start(
        config: NodeConfig,
        session: Session,
        discovery: Arc<dyn Discovery>,
        media: Arc<dyn MediaSource>,
    ) -> Result<NodeHandle, NodeError> {
        let store: Box<dyn LocalStore> = match &config.data_dir {
            Some(dir) => Box::new(RocksLocalStore::open(StoreConfig::new(dir.join("local")))?),
            None => Box::new(MemoryStore::new()),
        };

        let mut options = EngineOptions::new(config.name.clone()).with_viewport(config.viewport);
        options.cursor_interval = config.cursor_interval;

        let (net_tx, net_rx) = mpsc::channel(config.event_capacity);
        let transport =
            WsTransport::bind(&config.listen_addr, session.clone(), options.transport, net_tx).await?;
        let local_addr = transport.local_addr();
        let announcement = Announcement {
            from: options.transport,
            addr: config
                .advertised_addr
                .clone()
                .unwrap_or_else(|| local_addr.to_string()),
        };

        let mut engine = SyncEngine::new(session.clone(), options, store);
        let peer = engine.peer();
        let (snap_tx, snap_rx) = watch::channel(engine.snapshot());
        engine.observe(move |snapshot| {
            snap_tx.send_replace(snapshot.clone());
        });

        log::info!(
            "Node {} ({peer}) joining room {} via {}",
            config.name,
            session.room_id(),
            announcement.addr
        );

        let (update_tx, update_rx) = mpsc::channel(config.queue_capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let runner = Runner {
            engine,
            transport,
            discovery,
            announcement,
            discovered: None,
        };
        let task = tokio::spawn(runner.run(update_rx, net_rx, stop_rx, config.keepalive_interval));

        Ok(NodeHandle {
            updates: update_tx,
            snapshots: snap_rx,
            session,
            peer,
            local_addr,
            media,
            stop: Some(stop_tx),
            task: Some(task),
        })
    }
}

struct Runner {
    engine: SyncEngine,
    transport: WsTransport,
    discovery: Arc<dyn Discovery>,
    announcement: Announcement,
    discovered: Option<mpsc::Receiver<Announcement>>,
}

impl Runner {
    async fn run(
        mut self,
        mut updates: mpsc::Receiver<Update>,
        mut network: mpsc::Receiver<NetworkInput>,
        mut stop: oneshot::Receiver<()>,
        keepalive: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.engine.connect();
        self.flush();

        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some(update) = updates.recv() => update(&mut self.engine),
                Some(input) = network.recv() => self.engine.handle_network(input),
                Some(found) = next_announcement(&mut self.discovered) => {
                    self.engine.handle_network(NetworkInput::Discovered {
                        transport: found.from,
                        addr: found.addr,
                    });
                }
                _ = ticker.tick() => self.engine.ping(),
            }
            self.flush();
        }

        for transport in self.engine.mesh().open_transports() {
            self.transport.execute(TransportCommand::Close { transport });
        }
        log::info!("Node {} stopped", self.engine.peer());
    }

    fn flush(&mut self) {
        for command in self.engine.drain_commands() {
            match command {
                TransportCommand::JoinRoom { room } => {
                    if self.discovered.is_none() {
                        self.discovered = Some(self.discovery.start(&room, self.announcement.clone()));
                    }
                }
                other => self.transport.execute(other),
            }
        }
    }
}

async fn next_announcement(rx: &mut Option<mpsc::Receiver<Announcement>>) -> Option<Announcement> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Client side of a running node.
pub struct NodeHandle {
    updates: mpsc::Sender<Update>,
    snapshots: watch::Receiver<Arc<ViewSnapshot>>,
    session: Session,
    peer: PeerId,
    local_addr: SocketAddr,
    media: Arc<dyn MediaSource>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Token another process can pass to join this room.
    pub fn token(&self) -> String {
        self.session.to_token()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.snapshots.clone()
    }

    /// Wait until a snapshot satisfies `pred`.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&ViewSnapshot) -> bool,
    ) -> Result<Arc<ViewSnapshot>, NodeError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| pred(&**s))
            .await
            .map_err(|_| NodeError::Closed)?;
        Ok(snapshot.clone())
    }

    /// Run `f` against the engine on the node task and return its result.
    pub async fn update<R, F>(&self, f: F) -> Result<R, NodeError>
    where
        R: Send + 'static,
        F: FnOnce(&mut SyncEngine) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let update: Update = Box::new(move |engine| {
            let _ = tx.send(f(engine));
        });
        self.updates
            .send(update)
            .await
            .map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)
    }

    // ─── Cards ──────────────────────────────────────────────────────

    pub async fn add_card(&self, draft: CardDraft) -> Result<CardId, NodeError> {
        self.update(move |e| e.add_card(draft)).await
    }

    pub async fn update_card(&self, card: Card) -> Result<(), NodeError> {
        Ok(self.update(move |e| e.update_card(card)).await??)
    }

    pub async fn move_card(&self, id: CardId, position: Point) -> Result<(), NodeError> {
        Ok(self.update(move |e| e.move_card(&id, position)).await??)
    }

    pub async fn resize_card(&self, id: CardId, size: Size) -> Result<(), NodeError> {
        Ok(self.update(move |e| e.resize_card(&id, size)).await??)
    }

    pub async fn trash_card(&self, id: CardId) -> Result<(), NodeError> {
        Ok(self.update(move |e| e.trash_card(&id)).await??)
    }

    pub async fn compact(&self) -> Result<usize, NodeError> {
        self.update(|e| e.compact()).await
    }

    pub async fn edit_text(&self, text_id: TextId, edit: TextEdit) -> Result<(), NodeError> {
        Ok(self.update(move |e| e.edit_text(&text_id, &edit)).await??)
    }

    pub async fn set_playback(&self, id: CardId, player: PlayerState) -> Result<(), NodeError> {
        Ok(self.update(move |e| e.set_playback(&id, player)).await??)
    }

    pub async fn post_chat(&self, id: CardId, text: String) -> Result<(), NodeError> {
        Ok(self.update(move |e| e.post_chat(&id, text)).await??)
    }

    // ─── Presence ───────────────────────────────────────────────────

    /// Acquire local media, then publish the avatar. Acquisition runs on the
    /// caller's task so the engine never waits on it.
    pub async fn add_my_presence(&self, name: impl Into<String>) -> Result<CardId, NodeError> {
        let name = name.into();
        let acquired = self.media.acquire().await;
        Ok(self
            .update(move |e| e.add_my_presence(&name, acquired))
            .await??)
    }

    /// Pointer position in pixels, `None` when it leaves the surface.
    pub async fn move_cursor(&self, position: Option<Point>) -> Result<bool, NodeError> {
        self.update(move |e| e.move_cursor(position, Instant::now()))
            .await
    }

    pub async fn set_active_region(&self, region: Option<String>) -> Result<(), NodeError> {
        self.update(move |e| e.set_active_region(region)).await
    }

    pub async fn set_name(&self, name: String) -> Result<(), NodeError> {
        self.update(move |e| e.set_name(&name)).await
    }

    // ─── Backpack and UI ────────────────────────────────────────────

    pub async fn capture_to_backpack(&self, id: CardId, mode: CaptureMode) -> Result<(), NodeError> {
        Ok(self
            .update(move |e| e.capture_to_backpack(&id, mode))
            .await??)
    }

    pub async fn release_from_backpack(&self, id: CardId) -> Result<CardId, NodeError> {
        Ok(self
            .update(move |e| e.release_from_backpack(&id))
            .await??)
    }

    pub async fn clear_backpack(&self) -> Result<(), NodeError> {
        self.update(|e| e.clear_backpack()).await
    }

    pub async fn ui(&self, action: UiAction) -> Result<(), NodeError> {
        self.update(move |e| e.ui(action)).await
    }

    /// Stop the run loop and close every peer link.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Node task failed: {e}");
            }
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
