//! Backpack: peer-local card snapshots kept for later.
//!
//! Never replicated. The whole list is written as a JSON array under
//! [`BACKPACK_KEY`] after every change and read back once at startup.

use thiserror::Error;

use tavern_core::{Card, CardId};

use crate::storage::{LocalStore, StorageError};

pub const BACKPACK_KEY: &str = "myBackpack";

#[derive(Debug, Error)]
pub enum BackpackError {
    #[error("card {0} is not in the backpack")]
    NotFound(CardId),
    #[error("backpack encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct Backpack {
    items: Vec<Card>,
    store: Box<dyn LocalStore>,
}

impl Backpack {
    /// Load from `store`. Missing or unreadable data gives an empty backpack.
    pub fn load(store: Box<dyn LocalStore>) -> Self {
        let items = match store.load(BACKPACK_KEY) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Card>>(&bytes) {
                Ok(items) => items,
                Err(e) => {
                    log::warn!("Discarding unreadable backpack: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("Could not read backpack: {e}");
                Vec::new()
            }
        };
        log::debug!("Backpack loaded with {} item(s)", items.len());
        Self { items, store }
    }

    pub fn items(&self) -> &[Card] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &CardId) -> Option<&Card> {
        self.items.iter().find(|c| &c.id == id)
    }

    /// Store a paused snapshot. A snapshot with the same id is replaced in
    /// place.
    pub fn capture(&mut self, card: &Card) {
        let snapshot = Card {
            kind: card.kind.paused(),
            trashed: false,
            ..card.clone()
        };
        match self.items.iter_mut().find(|c| c.id == snapshot.id) {
            Some(slot) => *slot = snapshot,
            None => self.items.push(snapshot),
        }
        self.save();
    }

    /// Remove and return a snapshot.
    pub fn take(&mut self, id: &CardId) -> Result<Card, BackpackError> {
        let index = self
            .items
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| BackpackError::NotFound(id.clone()))?;
        let card = self.items.remove(index);
        self.save();
        Ok(card)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.save();
    }

    /// Rewrite the whole list.
    pub fn persist(&mut self) -> Result<(), BackpackError> {
        let bytes = serde_json::to_vec(&self.items)?;
        self.store.store(BACKPACK_KEY, &bytes)?;
        Ok(())
    }

    // The in-memory list stays authoritative when a write fails.
    fn save(&mut self) {
        if let Err(e) = self.persist() {
            log::error!("Failed to persist backpack: {e}");
        }
    }
}
