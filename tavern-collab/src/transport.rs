//! WebSocket peer transport.
//!
//! One WebSocket per peer pair. The dialer connects to
//! `ws://<addr>/<room>/<secret>/<dialer transport id>`; the acceptor checks
//! room and secret against its own session and refuses anything else with a
//! 403 during the handshake.
//!
//! ```text
//!            ┌──────────── link task (per peer) ────────────┐
//! execute ──▶│ mpsc<Frame> ──▶ writer ──▶ WebSocket sink     │
//!            │                                              │
//! events  ◀──│ NetworkInput ◀── reader ◀── WebSocket stream │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! Text frames carry control packets, binary frames carry sync messages; the
//! transport never looks inside either.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use tavern_core::TransportId;

use crate::mesh::{NetworkInput, TransportCommand};
use crate::protocol::Frame;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct Link {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Frame>,
}

type Links = Arc<Mutex<HashMap<TransportId, Link>>>;

/// Shared state every link task needs.
#[derive(Clone)]
struct Shared {
    links: Links,
    events: mpsc::Sender<NetworkInput>,
    generation: Arc<AtomicU64>,
}

pub struct WsTransport {
    local: TransportId,
    session: Session,
    local_addr: SocketAddr,
    shared: Shared,
    accept_task: JoinHandle<()>,
}

impl WsTransport {
    /// Bind the listener and start accepting peer links.
    pub async fn bind(
        addr: &str,
        session: Session,
        local: TransportId,
        events: mpsc::Sender<NetworkInput>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        log::info!("Peer transport listening on {local_addr}");

        let shared = Shared {
            links: Arc::new(Mutex::new(HashMap::new())),
            events,
            generation: Arc::new(AtomicU64::new(0)),
        };
        let accept_task = tokio::spawn(accept_loop(listener, session.clone(), shared.clone()));

        Ok(Self {
            local,
            session,
            local_addr,
            shared,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> TransportId {
        self.local
    }

    /// Number of links with a live writer.
    pub fn link_count(&self) -> usize {
        self.shared.links.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn execute(&self, command: TransportCommand) {
        match command {
            TransportCommand::Dial { transport, addr } => {
                let url = format!(
                    "ws://{addr}/{}/{}/{}",
                    self.session.room_id(),
                    self.session.secret(),
                    self.local
                );
                tokio::spawn(dial(url, transport, self.shared.clone()));
            }
            TransportCommand::Send { to, frame } => {
                let sent = self
                    .shared
                    .links
                    .lock()
                    .ok()
                    .and_then(|links| links.get(&to).map(|l| l.outgoing.send(frame).is_ok()))
                    .unwrap_or(false);
                if !sent {
                    log::debug!("No writer for {to}, frame dropped");
                }
            }
            TransportCommand::Close { transport } => {
                // Dropping the sender ends the writer, which closes the socket.
                if let Ok(mut links) = self.shared.links.lock() {
                    links.remove(&transport);
                }
            }
            TransportCommand::JoinRoom { .. } => {}
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Ok(mut links) = self.shared.links.lock() {
            links.clear();
        }
    }
}

async fn accept_loop(listener: TcpListener, session: Session, shared: Shared) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Accept failed: {e}");
                continue;
            }
        };
        log::debug!("New TCP connection from {addr}");
        let session = session.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_incoming(stream, addr, session, shared).await {
                log::debug!("Incoming link from {addr} refused: {e}");
            }
        });
    }
}

async fn handle_incoming(
    stream: TcpStream,
    addr: SocketAddr,
    session: Session,
    shared: Shared,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut remote: Option<TransportId> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match parse_link_path(req.uri().path(), &session) {
            Some(id) => {
                remote = Some(id);
                Ok(resp)
            }
            None => {
                let mut refused = ErrorResponse::new(Some("wrong room".to_string()));
                *refused.status_mut() = StatusCode::FORBIDDEN;
                Err(refused)
            }
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some(remote) = remote else {
        return Ok(());
    };
    log::debug!("Accepted link from {remote} at {addr}");
    run_link(ws, remote, shared).await;
    Ok(())
}

/// `/<room>/<secret>/<transport>` for our session, else `None`.
fn parse_link_path(path: &str, session: &Session) -> Option<TransportId> {
    let mut parts = path.trim_start_matches('/').split('/');
    let room = parts.next()?;
    let secret = parts.next()?;
    let transport = TransportId::parse(parts.next()?)?;
    if parts.next().is_some() || room != session.room_id() || secret != session.secret() {
        return None;
    }
    Some(transport)
}

async fn dial(url: String, remote: TransportId, shared: Shared) {
    match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => {
            log::debug!("Dialed {remote}");
            run_link(ws, remote, shared).await;
        }
        Err(e) => {
            log::warn!("Dial to {remote} failed: {e}");
            let _ = shared
                .events
                .send(NetworkInput::DialFailed { transport: remote })
                .await;
        }
    }
}

/// Pump one link until either side closes it.
async fn run_link<S>(ws: WebSocketStream<S>, remote: TransportId, shared: Shared)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let generation = shared.generation.fetch_add(1, Ordering::Relaxed);
    {
        let Ok(mut links) = shared.links.lock() else {
            return;
        };
        if links.contains_key(&remote) {
            log::debug!("Duplicate link to {remote} dropped");
            return;
        }
        links.insert(
            remote,
            Link {
                generation,
                outgoing: tx,
            },
        );
    }
    if shared
        .events
        .send(NetworkInput::Opened { transport: remote })
        .await
        .is_err()
    {
        return;
    }

    let (mut sink, mut stream) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Frame::Text(text) => Message::text(text),
                Frame::Binary(bytes) => Message::binary(bytes),
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => Frame::Text(text.as_str().to_string()),
            Ok(Message::Binary(data)) => Frame::Binary(data.into()),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                log::debug!("Link {remote} error: {e}");
                break;
            }
        };
        if shared
            .events
            .send(NetworkInput::Frame {
                transport: remote,
                frame,
            })
            .await
            .is_err()
        {
            break;
        }
    }

    writer.abort();
    if let Ok(mut links) = shared.links.lock() {
        if links.get(&remote).map(|l| l.generation) == Some(generation) {
            links.remove(&remote);
        }
    }
    let _ = shared
        .events
        .send(NetworkInput::Closed { transport: remote })
        .await;
}
