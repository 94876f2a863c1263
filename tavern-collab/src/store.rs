//! ReplicatedStore: the card registry.
//!
//! A last-writer-wins map from [`CardId`] to a whole-card register. Each
//! entry keeps the [`Stamp`] of the write that produced it; an incoming
//! record replaces the entry only when its stamp is strictly greater.
//!
//! The trash flag is a separate field with its own stamp. It only ever goes
//! from unset to set, so a concurrent write to the card body cannot bring a
//! trashed card back.
//!
//! ```text
//!  local set ──┐                     ┌──▶ observers(live cards)
//!              ├──▶ apply(record) ───┤
//!  remote  ────┘   stamp > current?  └──▶ changed record (relay)
//! ```
//!
//! Because stamps are totally ordered, the final map depends only on the set
//! of records applied, never on their arrival order, and re-applying a record
//! is a no-op.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tavern_core::{Card, CardId};

use crate::clock::{LamportClock, Stamp};

/// Content of one register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Slot {
    Live(Card),
    /// Compacted away. Kept so late writes from before the purge lose.
    Purged,
}

/// One replicated write, as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    pub id: CardId,
    pub stamp: Stamp,
    pub slot: Slot,
    /// Stamp of the write that trashed the card, if any.
    pub trashed_at: Option<Stamp>,
}

/// Both stamps of a register, as exchanged in digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardVersion {
    pub stamp: Stamp,
    pub trashed_at: Option<Stamp>,
}

impl CardVersion {
    /// `true` if a replica at `self` already holds everything in `other`.
    pub fn covers(&self, other: &CardVersion) -> bool {
        self.stamp >= other.stamp && self.trashed_at >= other.trashed_at
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    stamp: Stamp,
    slot: Slot,
    trashed_at: Option<Stamp>,
}

impl Entry {
    fn version(&self) -> CardVersion {
        CardVersion {
            stamp: self.stamp,
            trashed_at: self.trashed_at,
        }
    }

    /// Keep the card's own flag in step with the trash stamp.
    fn sync_trashed(&mut self) {
        if let Slot::Live(card) = &mut self.slot {
            card.trashed = self.trashed_at.is_some();
        }
    }
}

type StoreObserver = Box<dyn FnMut(&[Card]) + Send>;

/// Convergent card registry.
#[derive(Default)]
pub struct ReplicatedStore {
    entries: BTreeMap<CardId, Entry>,
    observers: Vec<StoreObserver>,
}

impl ReplicatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a card under a freshly ticked stamp.
    pub fn set(&mut self, card: Card, stamp: Stamp) -> CardRecord {
        let record = CardRecord {
            id: card.id.clone(),
            stamp,
            trashed_at: card.trashed.then_some(stamp),
            slot: Slot::Live(card),
        };
        self.apply(record.clone());
        record
    }

    /// Soft-delete: keep the card but flag it trashed.
    pub fn mark_trashed(&mut self, id: &CardId, stamp: Stamp) -> Option<CardRecord> {
        let mut card = self.get(id)?.clone();
        if card.trashed {
            return None;
        }
        card.trashed = true;
        Some(self.set(card, stamp))
    }

    /// Merge one record. Returns `true` if it changed the map.
    pub fn apply(&mut self, record: CardRecord) -> bool {
        let changed = self.merge(record);
        if changed {
            self.notify();
        }
        changed
    }

    /// Merge a batch, notifying observers once. Returns the records that won.
    pub fn apply_all(&mut self, records: Vec<CardRecord>) -> Vec<CardRecord> {
        let mut won = Vec::new();
        for record in records {
            if self.merge(record.clone()) {
                won.push(record);
            }
        }
        if !won.is_empty() {
            self.notify();
        }
        won
    }

    fn merge(&mut self, record: CardRecord) -> bool {
        let CardRecord {
            id,
            stamp,
            slot,
            trashed_at,
        } = record;
        // A trashed body without a trash stamp was trashed by that write.
        let trashed_at = match &slot {
            Slot::Live(card) if card.trashed => trashed_at.max(Some(stamp)),
            _ => trashed_at,
        };

        let Some(entry) = self.entries.get_mut(&id) else {
            let mut entry = Entry {
                stamp,
                slot,
                trashed_at,
            };
            entry.sync_trashed();
            self.entries.insert(id, entry);
            return true;
        };

        let mut changed = false;
        if stamp > entry.stamp {
            entry.stamp = stamp;
            entry.slot = slot;
            changed = true;
        }
        if trashed_at > entry.trashed_at {
            entry.trashed_at = trashed_at;
            changed = true;
        }
        if changed {
            entry.sync_trashed();
        }
        changed
    }

    /// The card under `id`, trashed or not. Purged entries read as absent.
    pub fn get(&self, id: &CardId) -> Option<&Card> {
        match &self.entries.get(id)?.slot {
            Slot::Live(card) => Some(card),
            Slot::Purged => None,
        }
    }

    /// Stamp of the latest write to the card body.
    pub fn stamp_of(&self, id: &CardId) -> Option<Stamp> {
        self.entries.get(id).map(|e| e.stamp)
    }

    pub fn trashed_at(&self, id: &CardId) -> Option<Stamp> {
        self.entries.get(id).and_then(|e| e.trashed_at)
    }

    pub fn for_each(&self, mut f: impl FnMut(&Card)) {
        for entry in self.entries.values() {
            if let Slot::Live(card) = &entry.slot {
                f(card);
            }
        }
    }

    /// Non-trashed cards in id order.
    pub fn live_cards(&self) -> Vec<Card> {
        let mut out = Vec::new();
        self.for_each(|card| {
            if card.is_live() {
                out.push(card.clone());
            }
        });
        out
    }

    /// Register a callback fired with the live card list after every change.
    pub fn observe(&mut self, observer: impl FnMut(&[Card]) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn notify(&mut self) {
        if self.observers.is_empty() {
            return;
        }
        let live = self.live_cards();
        for observer in &mut self.observers {
            observer(&live);
        }
    }

    /// Current version of every entry.
    pub fn digest(&self) -> BTreeMap<CardId, CardVersion> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.version()))
            .collect()
    }

    /// Records the remote side is missing or holds at an older version.
    pub fn missing_from(&self, remote: &BTreeMap<CardId, CardVersion>) -> Vec<CardRecord> {
        self.entries
            .iter()
            .filter(|(id, e)| remote.get(*id).map_or(true, |theirs| !theirs.covers(&e.version())))
            .map(|(id, e)| CardRecord {
                id: id.clone(),
                stamp: e.stamp,
                slot: e.slot.clone(),
                trashed_at: e.trashed_at,
            })
            .collect()
    }

    /// Replace every trashed card with a purged tombstone.
    pub fn compact(&mut self, clock: &mut LamportClock) -> Vec<CardRecord> {
        let trashed: Vec<(CardId, Option<Stamp>)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.trashed_at.is_some() && matches!(e.slot, Slot::Live(_)))
            .map(|(id, e)| (id.clone(), e.trashed_at))
            .collect();

        let records: Vec<CardRecord> = trashed
            .into_iter()
            .map(|(id, trashed_at)| CardRecord {
                id,
                stamp: clock.tick(),
                slot: Slot::Purged,
                trashed_at,
            })
            .collect();
        self.apply_all(records)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
