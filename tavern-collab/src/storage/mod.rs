//! Peer-local durable storage.
//!
//! ```text
//! ┌──────────┐  JSON bytes   ┌──────────────────────────┐
//! │ Backpack │ ────────────▶ │ LocalStore               │
//! └──────────┘  fixed key    │  ├─ RocksLocalStore (CF) │
//!                            │  └─ MemoryStore          │
//!                            └──────────────────────────┘
//! ```
//!
//! Nothing here is replicated. Values are opaque byte strings under string
//! keys, rewritten whole on every save.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksLocalStore, StoreConfig};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Key-value persistence for local-only state.
pub trait LocalStore: Send {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;
}
