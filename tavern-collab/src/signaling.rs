//! Peer discovery through signaling relays.
//!
//! A relay is a dumb pub/sub hub speaking small JSON messages:
//!
//! ```text
//! {"type":"subscribe","topics":["<room>"]}
//! {"type":"publish","topic":"<room>","data":{"from":"<transport>","addr":"host:port"}}
//! {"type":"ping"}  /  {"type":"pong"}
//! ```
//!
//! Every configured endpoint gets its own task with its own retry backoff, so
//! any single reachable relay is enough to find peers.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use tavern_core::TransportId;

/// "I am here": a transport and where to dial it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub from: TransportId,
    pub addr: String,
}

/// Relay wire messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Publish { topic: String, data: Value },
    Ping,
    Pong,
}

impl SignalMessage {
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Source of peer announcements for a room.
pub trait Discovery: Send + Sync {
    /// Start announcing `me` in `room`. Announcements from others arrive on
    /// the returned channel.
    fn start(&self, room: &str, me: Announcement) -> mpsc::Receiver<Announcement>;
}

/// Discovery that never finds anyone.
#[derive(Debug, Clone, Default)]
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn start(&self, _room: &str, _me: Announcement) -> mpsc::Receiver<Announcement> {
        let (tx, rx) = mpsc::channel(1);
        // Keep the channel open for the life of the runtime.
        tokio::spawn(async move {
            tx.closed().await;
        });
        rx
    }
}

/// Fixed list of peers, for tests and LAN setups.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<Announcement>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Announcement>) -> Self {
        Self { peers }
    }
}

impl Discovery for StaticDiscovery {
    fn start(&self, _room: &str, me: Announcement) -> mpsc::Receiver<Announcement> {
        let (tx, rx) = mpsc::channel(self.peers.len().max(1));
        let peers: Vec<Announcement> = self.peers.iter().filter(|p| p.from != me.from).cloned().collect();
        tokio::spawn(async move {
            for peer in peers {
                if tx.send(peer).await.is_err() {
                    return;
                }
            }
            tx.closed().await;
        });
        rx
    }
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub endpoints: Vec<String>,
    pub announce_interval: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
    pub capacity: usize,
}

/// Discovery over one or more signaling relays.
#[derive(Debug, Clone)]
pub struct SignalingClient {
    config: SignalingConfig,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig) -> Self {
        Self { config }
    }
}

impl Discovery for SignalingClient {
    fn start(&self, room: &str, me: Announcement) -> mpsc::Receiver<Announcement> {
        let (tx, rx) = mpsc::channel(self.config.capacity);
        if self.config.endpoints.is_empty() {
            log::warn!("No signaling endpoints configured; peers will not be discovered");
        }
        for endpoint in &self.config.endpoints {
            tokio::spawn(run_endpoint(
                endpoint.clone(),
                room.to_string(),
                me.clone(),
                tx.clone(),
                self.config.clone(),
            ));
        }
        rx
    }
}

enum SessionEnd {
    Disconnected,
    ReceiverGone,
}

/// Connect, serve, back off, repeat. Ends when nobody listens any more.
async fn run_endpoint(
    url: String,
    room: String,
    me: Announcement,
    tx: mpsc::Sender<Announcement>,
    config: SignalingConfig,
) {
    let mut backoff = config.retry_min;
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                log::info!("Connected to signaling relay {url}");
                backoff = config.retry_min;
                match serve_endpoint(ws, &room, &me, &tx, config.announce_interval).await {
                    SessionEnd::ReceiverGone => return,
                    SessionEnd::Disconnected => {
                        log::warn!("Signaling relay {url} disconnected");
                    }
                }
            }
            Err(e) => log::warn!("Signaling relay {url} unreachable: {e}"),
        }
        if tx.is_closed() {
            return;
        }
        log::warn!("Retrying {url} in {backoff:?}");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.retry_max);
    }
}

async fn serve_endpoint<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    room: &str,
    me: &Announcement,
    tx: &mpsc::Sender<Announcement>,
    announce_interval: Duration,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let subscribe = SignalMessage::Subscribe {
        topics: vec![room.to_string()],
    };
    let announce = match serde_json::to_value(me) {
        Ok(data) => SignalMessage::Publish {
            topic: room.to_string(),
            data,
        },
        Err(e) => {
            log::error!("Failed to encode announcement: {e}");
            return SessionEnd::ReceiverGone;
        }
    };
    let (Some(subscribe), Some(announce)) = (subscribe.to_json(), announce.to_json()) else {
        return SessionEnd::ReceiverGone;
    };
    if sink.send(Message::text(subscribe)).await.is_err() {
        return SessionEnd::Disconnected;
    }

    let mut known: HashSet<TransportId> = HashSet::new();
    let mut ticker = tokio::time::interval(announce_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if sink.send(Message::text(announce.clone())).await.is_err() {
                    return SessionEnd::Disconnected;
                }
            }
            _ = tx.closed() => return SessionEnd::ReceiverGone,
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Disconnected,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::debug!("Signaling read error: {e}");
                        return SessionEnd::Disconnected;
                    }
                };
                match serde_json::from_str::<SignalMessage>(text.as_str()) {
                    Ok(SignalMessage::Publish { data, .. }) => {
                        let Ok(peer) = serde_json::from_value::<Announcement>(data) else {
                            log::debug!("Ignoring foreign publish on signaling relay");
                            continue;
                        };
                        if peer.from == me.from {
                            continue;
                        }
                        // Answer newcomers once so they need not wait a full interval.
                        if known.insert(peer.from)
                            && sink.send(Message::text(announce.clone())).await.is_err()
                        {
                            return SessionEnd::Disconnected;
                        }
                        if tx.send(peer).await.is_err() {
                            return SessionEnd::ReceiverGone;
                        }
                    }
                    Ok(SignalMessage::Ping) => {
                        if let Some(pong) = SignalMessage::Pong.to_json() {
                            if sink.send(Message::text(pong)).await.is_err() {
                                return SessionEnd::Disconnected;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::debug!("Unparsable signaling message: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_message_shape() {
        let msg = SignalMessage::Subscribe {
            topics: vec!["room".into()],
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"subscribe","topics":["room"]}"#
        );
        let parsed: SignalMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(parsed, SignalMessage::Ping);
    }

    #[test]
    fn test_announcement_in_publish() {
        let ann = Announcement {
            from: TransportId::new(),
            addr: "127.0.0.1:9".into(),
        };
        let msg = SignalMessage::Publish {
            topic: "r".into(),
            data: serde_json::to_value(&ann).unwrap(),
        };
        let back: SignalMessage = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        match back {
            SignalMessage::Publish { data, .. } => {
                assert_eq!(serde_json::from_value::<Announcement>(data).unwrap(), ann);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_static_discovery_skips_self() {
        let me = Announcement {
            from: TransportId::new(),
            addr: "a".into(),
        };
        let other = Announcement {
            from: TransportId::new(),
            addr: "b".into(),
        };
        let discovery = StaticDiscovery::new(vec![me.clone(), other.clone()]);
        let mut rx = discovery.start("room", me);
        assert_eq!(rx.recv().await, Some(other));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_does_not_panic() {
        let client = SignalingClient::new(SignalingConfig {
            endpoints: vec!["ws://127.0.0.1:1".into()],
            announce_interval: Duration::from_millis(50),
            retry_min: Duration::from_millis(10),
            retry_max: Duration::from_millis(20),
            capacity: 4,
        });
        let mut rx = client.start(
            "room",
            Announcement {
                from: TransportId::new(),
                addr: "x".into(),
            },
        );
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err());
    }
}
