//! In-process store for tests and diskless runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{LocalStore, StorageError};

/// Clones share one map, so a "restarted" component can reopen what an
/// earlier one wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Seed a raw value.
    pub fn with_entry(self, key: &str, value: &[u8]) -> Self {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(key.to_string(), value.to_vec());
        }
        self
    }
}

impl LocalStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self
            .inner
            .lock()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io("write refused".into()));
        }
        let mut map = self
            .inner
            .lock()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_contents() {
        let mut a = MemoryStore::new();
        let b = a.clone();
        a.store("k", b"v").unwrap();
        assert_eq!(b.load("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(b.load("missing").unwrap(), None);
    }

    #[test]
    fn test_failing_store() {
        let mut s = MemoryStore::failing();
        assert!(s.store("k", b"v").is_err());
    }
}
