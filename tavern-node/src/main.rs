//! Tavern node: headless participant and signaling relay.
//!
//! `tavern-node join` runs one participant: it joins (or creates) a room,
//! reads commands from stdin and logs every view snapshot.
//! `tavern-node signal` runs the relay participants find each other through.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use tavern_collab::{
    CaptureMode, FileTokenChannel, MediaSource, MemoryTokenChannel, NoCamera, Node, NodeConfig,
    NodeError, NodeHandle, Session, SignalServer, SignalServerConfig, SignalingClient,
    SyntheticCamera, TokenChannel, ViewSnapshot, DEFAULT_SIGNALING,
};
use tavern_core::{CardDraft, TextId, Viewport};

use commands::{Command, NewCard};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Join a room as a participant
    Join(JoinArgs),
    /// Run a signaling relay
    Signal {
        #[arg(long, env = "TAVERN_SIGNAL_BIND", default_value = "127.0.0.1:4444")]
        bind: String,
    },
}

#[derive(Args)]
struct JoinArgs {
    /// Display name
    #[arg(long, env = "TAVERN_NAME", default_value = "guest")]
    name: String,
    /// Room token to join; a new room is created without one
    #[arg(long, env = "TAVERN_TOKEN")]
    token: Option<String>,
    /// Peer transport listen address
    #[arg(long, env = "TAVERN_LISTEN", default_value = "127.0.0.1:0")]
    listen: String,
    /// Address other peers should dial
    #[arg(long, env = "TAVERN_ADVERTISE")]
    advertise: Option<String>,
    /// Signaling relay URLs (repeatable)
    #[arg(long = "signal", env = "TAVERN_SIGNAL", value_delimiter = ',')]
    signal: Vec<String>,
    /// Directory for the backpack and the session token
    #[arg(long, env = "TAVERN_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Viewport width in pixels
    #[arg(long, default_value_t = 1280.0)]
    width: f32,
    /// Viewport height in pixels
    #[arg(long, default_value_t = 800.0)]
    height: f32,
    /// Join without a camera
    #[arg(long)]
    no_camera: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Mode::Signal { bind } => {
            let server = SignalServer::new(SignalServerConfig {
                bind_addr: bind,
                ..SignalServerConfig::default()
            });
            server.run().await?;
        }
        Mode::Join(args) => join(args).await?,
    }
    Ok(())
}

fn resolve_session(args: &JoinArgs) -> Session {
    let mut channel: Box<dyn TokenChannel> = match (&args.token, &args.data_dir) {
        (Some(token), _) => Box::new(MemoryTokenChannel::new(Some(token.clone()))),
        (None, Some(dir)) => Box::new(FileTokenChannel::new(dir.join("session"))),
        (None, None) => Box::new(MemoryTokenChannel::new(None)),
    };
    Session::resume_or_create(channel.as_mut())
}

async fn join(args: JoinArgs) -> Result<(), NodeError> {
    let session = resolve_session(&args);
    let config = NodeConfig {
        name: args.name.clone(),
        listen_addr: args.listen.clone(),
        advertised_addr: args.advertise.clone(),
        signaling_endpoints: if args.signal.is_empty() {
            DEFAULT_SIGNALING.iter().map(|s| s.to_string()).collect()
        } else {
            args.signal.clone()
        },
        data_dir: args.data_dir.clone(),
        viewport: Viewport::new(args.width, args.height),
        ..NodeConfig::default()
    };
    let discovery = Arc::new(SignalingClient::new(config.signaling()));
    let media: Arc<dyn MediaSource> = if args.no_camera {
        Arc::new(NoCamera::default())
    } else {
        Arc::new(SyntheticCamera)
    };

    let node = Node::start(config, session, discovery, media).await?;
    println!("Session token: {}", node.token());
    info!("Peer {} listening on {}", node.peer(), node.local_addr());

    let mut snapshots = node.subscribe();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            info!("{}", summarize(&snapshot));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(&node, &args.name, command).await {
                            warn!("{e}");
                        }
                    }
                    Err(e) => warn!("{e}"),
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn execute(node: &NodeHandle, name: &str, command: Command) -> Result<(), NodeError> {
    match command {
        Command::Add(kind) => {
            let draft = match kind {
                NewCard::Text => CardDraft::text(TextId::generate()),
                NewCard::Video(uri) => CardDraft::video(uri),
                NewCard::Image(uri) => CardDraft::image(uri),
                NewCard::Chat => CardDraft::chat(name),
            };
            let id = node.add_card(draft).await?;
            println!("added {id}");
        }
        Command::Move { id, to } => node.move_card(id, to).await?,
        Command::Resize { id, size } => node.resize_card(id, size).await?,
        Command::Trash(id) => node.trash_card(id).await?,
        Command::Capture(id) => node.capture_to_backpack(id, CaptureMode::Stash).await?,
        Command::Release(index) => {
            let Some(id) = node.snapshot().backpack.get(index).map(|c| c.id.clone()) else {
                warn!("Backpack has no slot {index}");
                return Ok(());
            };
            let id = node.release_from_backpack(id).await?;
            println!("released as {id}");
        }
        Command::Cursor(position) => {
            node.move_cursor(position).await?;
        }
        Command::Avatar => {
            let id = node.add_my_presence(name).await?;
            println!("avatar {id}");
        }
        Command::Say { id, text } => node.post_chat(id, text).await?,
        Command::Region(region) => node.set_active_region(region).await?,
        Command::Compact => {
            let purged = node.compact().await?;
            println!("purged {purged} card(s)");
        }
        Command::Quit => {}
    }
    Ok(())
}

fn summarize(snapshot: &ViewSnapshot) -> String {
    let mut out = format!(
        "v{}: {} card(s), {} peer(s), {} in backpack",
        snapshot.version,
        snapshot.cards.len(),
        snapshot.peers.len(),
        snapshot.backpack.len()
    );
    for view in &snapshot.cards {
        out.push_str(&format!(
            "\n  [{}] {} {} at ({:.0}, {:.0}) managed by {}",
            view.z,
            view.card.id,
            view.card.kind.label(),
            view.position.x,
            view.position.y,
            view.card.manager
        ));
    }
    for peer in &snapshot.peers {
        let cursor = peer
            .cursor
            .map(|p| format!("({:.0}, {:.0})", p.x, p.y))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!("\n  {} {} cursor {}", peer.id, peer.name, cursor));
    }
    out
}
