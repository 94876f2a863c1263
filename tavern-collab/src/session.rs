//! Session: the room a process belongs to.
//!
//! A room id and secret, derived once at startup and immutable afterwards.
//! They round-trip through a resumable token of the form `!<room>-<secret>`
//! so a restart or a shared link lands in the same room.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

const ID_LEN: usize = 9;
const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed session token: {0:?}")]
    Malformed(String),
    #[error("token channel failed: {0}")]
    Channel(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    room_id: String,
    secret: String,
}

impl Session {
    /// Fresh random room.
    pub fn generate() -> Self {
        Self {
            room_id: random_id(),
            secret: random_id(),
        }
    }

    /// Parse `!room-secret`. A leading `#` (URL fragment) is accepted.
    pub fn parse(token: &str) -> Result<Self, SessionError> {
        let malformed = || SessionError::Malformed(token.to_string());
        let body = token.trim();
        let body = body.strip_prefix('#').unwrap_or(body);
        let body = body.strip_prefix('!').ok_or_else(malformed)?;
        let (room, secret) = body.split_once('-').ok_or_else(malformed)?;
        if !is_token_part(room) || !is_token_part(secret) {
            return Err(malformed());
        }
        Ok(Self {
            room_id: room.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Resume from the channel, or create a room and publish its token.
    pub fn resume_or_create(channel: &mut dyn TokenChannel) -> Self {
        if let Some(token) = channel.read() {
            match Self::parse(&token) {
                Ok(session) => {
                    log::info!("Resuming room {}", session.room_id);
                    return session;
                }
                Err(e) => log::warn!("Ignoring stored token: {e}"),
            }
        }
        let session = Self::generate();
        if let Err(e) = channel.publish(&session.to_token()) {
            log::warn!("Could not publish session token: {e}");
        }
        log::info!("Created room {}", session.room_id);
        session
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn to_token(&self) -> String {
        format!("!{}-{}", self.room_id, self.secret)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}

fn is_token_part(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

fn random_id() -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut out = String::with_capacity(ID_LEN);
    for _ in 0..ID_LEN {
        out.push(ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}

// ───────────────────────────────────────────────────────────────────
// Token channels
// ───────────────────────────────────────────────────────────────────

/// Where the resumable token lives between runs.
pub trait TokenChannel {
    fn read(&self) -> Option<String>;
    fn publish(&mut self, token: &str) -> Result<(), SessionError>;
}

/// Token kept in a plain file.
#[derive(Debug, Clone)]
pub struct FileTokenChannel {
    path: PathBuf,
}

impl FileTokenChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenChannel for FileTokenChannel {
    fn read(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn publish(&mut self, token: &str) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, token)?;
        Ok(())
    }
}

/// Token held in memory, e.g. passed on the command line.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenChannel {
    token: Option<String>,
}

impl MemoryTokenChannel {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl TokenChannel for MemoryTokenChannel {
    fn read(&self) -> Option<String> {
        self.token.clone()
    }

    fn publish(&mut self, token: &str) -> Result<(), SessionError> {
        self.token = Some(token.to_string());
        Ok(())
    }
}
