//! Signaling relay server.
//!
//! ```text
//! Peer A ──┐                         ┌──▶ Peer B
//!          ├── topic (room id) ──────┤
//! Peer C ──┘   TopicGroup fan-out    └──▶ Peer D
//! ```
//!
//! The relay holds no application state. It forwards each `publish` to every
//! subscriber of the topic, the publisher included, and answers `ping` with
//! `pong`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::TopicManager;
use crate::config::SignalServerConfig;
use crate::signaling::SignalMessage;

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
}

pub struct SignalServer {
    config: SignalServerConfig,
    topics: Arc<TopicManager>,
    stats: Arc<RwLock<ServerStats>>,
    next_conn: Arc<AtomicU64>,
}

impl SignalServer {
    pub fn new(config: SignalServerConfig) -> Self {
        let topics = Arc::new(TopicManager::new(config.broadcast_capacity));
        Self {
            config,
            topics,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_conn: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SignalServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Signaling relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let topics = self.topics.clone();
            let stats = self.stats.clone();
            let max = self.config.max_subscribers_per_topic;
            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, conn, topics, stats, max).await
                {
                    log::warn!("Signaling connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        conn: u64,
        topics: Arc<TopicManager>,
        stats: Arc<RwLock<ServerStats>>,
        max_subscribers: usize,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws.split();
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Forwarder tasks push into this; the loop below writes it out.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<str>>();
        let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                Some(text) = out_rx.recv() => {
                    ws_sender.send(Message::text(text.to_string())).await?;
                }
                msg = ws_receiver.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::debug!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    };
                    stats.write().await.total_messages += 1;

                    let parsed = match serde_json::from_str::<SignalMessage>(text.as_str()) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            log::warn!("Malformed signaling message from {addr}: {e}");
                            continue;
                        }
                    };
                    match parsed {
                        SignalMessage::Subscribe { topics: names } => {
                            for name in names {
                                if forwarders.contains_key(&name) {
                                    continue;
                                }
                                let group = topics.get_or_create(&name).await;
                                let Some(mut rx) = group.subscribe(conn, max_subscribers).await else {
                                    log::warn!("Topic {name} is full, refusing {addr}");
                                    continue;
                                };
                                let out = out_tx.clone();
                                let handle = tokio::spawn(async move {
                                    loop {
                                        match rx.recv().await {
                                            Ok(relayed) => {
                                                if out.send(relayed.text).is_err() {
                                                    return;
                                                }
                                            }
                                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                                log::warn!("Subscriber lagged, {n} message(s) dropped");
                                            }
                                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                                        }
                                    }
                                });
                                forwarders.insert(name, handle);
                            }
                        }
                        SignalMessage::Unsubscribe { topics: names } => {
                            for name in names {
                                Self::leave(&topics, &mut forwarders, &name, conn).await;
                            }
                        }
                        SignalMessage::Publish { topic, .. } => {
                            if let Some(group) = topics.get(&topic).await {
                                group.publish(conn, Arc::from(text.as_str()));
                            }
                        }
                        SignalMessage::Ping => {
                            if let Some(pong) = SignalMessage::Pong.to_json() {
                                ws_sender.send(Message::text(pong)).await?;
                            }
                        }
                        SignalMessage::Pong => {}
                    }
                }
            }
        }

        let names: Vec<String> = forwarders.keys().cloned().collect();
        for name in names {
            Self::leave(&topics, &mut forwarders, &name, conn).await;
        }
        stats.write().await.active_connections -= 1;
        log::debug!("Signaling connection from {addr} closed");
        Ok(())
    }

    async fn leave(
        topics: &TopicManager,
        forwarders: &mut HashMap<String, JoinHandle<()>>,
        name: &str,
        conn: u64,
    ) {
        if let Some(handle) = forwarders.remove(name) {
            handle.abort();
        }
        if let Some(group) = topics.get(name).await {
            group.unsubscribe(conn).await;
        }
        topics.remove_if_empty(name).await;
    }
}
