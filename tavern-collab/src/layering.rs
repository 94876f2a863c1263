//! Layering: the convergent z-order of card ids.
//!
//! Modelled as a last-writer-wins element set. Each id carries the stamp of
//! its latest append or remove; present ids are ordered by that stamp, so
//! "bring to front" is simply a fresh append. Concurrent moves from several
//! peers settle on the same order everywhere: highest stamp on top.
//!
//! Removal is final. Card ids are never reused and a trashed card never comes
//! back, so a remove beats any append of the same id whatever their stamps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tavern_core::CardId;

use crate::clock::Stamp;

/// One replicated layering write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: CardId,
    pub stamp: Stamp,
    pub present: bool,
}

/// State of one element, as exchanged in digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerVersion {
    pub stamp: Stamp,
    pub present: bool,
}

impl LayerVersion {
    /// Whether `self` wins over `other` on merge.
    fn supersedes(&self, other: &LayerVersion) -> bool {
        match (self.present, other.present) {
            (false, true) => true,
            (true, false) => false,
            _ => self.stamp > other.stamp,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Layering {
    elements: BTreeMap<CardId, LayerVersion>,
}

impl Layering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `id` at the end of the sequence.
    pub fn append(&mut self, id: &CardId, stamp: Stamp) -> LayerRecord {
        self.local(id, stamp, true)
    }

    pub fn remove(&mut self, id: &CardId, stamp: Stamp) -> LayerRecord {
        self.local(id, stamp, false)
    }

    /// Remove-then-append, collapsed into one write with a newer stamp.
    pub fn move_to_front(&mut self, id: &CardId, stamp: Stamp) -> LayerRecord {
        self.append(id, stamp)
    }

    fn local(&mut self, id: &CardId, stamp: Stamp, present: bool) -> LayerRecord {
        let record = LayerRecord {
            id: id.clone(),
            stamp,
            present,
        };
        self.apply(record.clone());
        record
    }

    /// Merge a record. Returns `true` if it changed anything.
    pub fn apply(&mut self, record: LayerRecord) -> bool {
        let incoming = LayerVersion {
            stamp: record.stamp,
            present: record.present,
        };
        if let Some(current) = self.elements.get(&record.id) {
            if !incoming.supersedes(current) {
                return false;
            }
        }
        self.elements.insert(record.id, incoming);
        true
    }

    /// Present ids, bottom first.
    pub fn order(&self) -> Vec<CardId> {
        let mut present: Vec<(&Stamp, &CardId)> = self
            .elements
            .iter()
            .filter(|(_, v)| v.present)
            .map(|(id, v)| (&v.stamp, id))
            .collect();
        present.sort();
        present.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn contains(&self, id: &CardId) -> bool {
        self.elements.get(id).is_some_and(|v| v.present)
    }

    /// Stamp of the latest write for `id`.
    pub fn stamp_of(&self, id: &CardId) -> Option<Stamp> {
        self.elements.get(id).map(|v| v.stamp)
    }

    pub fn digest(&self) -> BTreeMap<CardId, LayerVersion> {
        self.elements
            .iter()
            .map(|(id, v)| (id.clone(), *v))
            .collect()
    }

    pub fn missing_from(&self, remote: &BTreeMap<CardId, LayerVersion>) -> Vec<LayerRecord> {
        self.elements
            .iter()
            .filter(|(id, v)| remote.get(*id).map_or(true, |theirs| v.supersedes(theirs)))
            .map(|(id, v)| LayerRecord {
                id: id.clone(),
                stamp: v.stamp,
                present: v.present,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_core::PeerId;

    fn id(s: &str) -> CardId {
        CardId::from(s)
    }

    fn stamp(clock: u64, peer: u64) -> Stamp {
        Stamp::new(clock, PeerId(peer))
    }

    #[test]
    fn test_append_orders_by_stamp() {
        let mut layers = Layering::new();
        layers.append(&id("a"), stamp(1, 1));
        layers.append(&id("b"), stamp(2, 1));
        layers.append(&id("c"), stamp(3, 1));
        assert_eq!(layers.order(), vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn test_move_to_front() {
        let mut layers = Layering::new();
        layers.append(&id("a"), stamp(1, 1));
        layers.append(&id("b"), stamp(2, 1));
        layers.move_to_front(&id("a"), stamp(3, 1));
        assert_eq!(layers.order(), vec![id("b"), id("a")]);
    }

    #[test]
    fn test_remove_drops_id() {
        let mut layers = Layering::new();
        layers.append(&id("a"), stamp(1, 1));
        layers.remove(&id("a"), stamp(2, 1));
        assert!(layers.order().is_empty());
        assert!(!layers.contains(&id("a")));
    }

    #[test]
    fn test_concurrent_moves_converge() {
        let base = vec![
            LayerRecord { id: id("a"), stamp: stamp(1, 1), present: true },
            LayerRecord { id: id("b"), stamp: stamp(2, 1), present: true },
        ];
        let from_p1 = LayerRecord { id: id("a"), stamp: stamp(3, 1), present: true };
        let from_p2 = LayerRecord { id: id("b"), stamp: stamp(3, 2), present: true };

        let mut x = Layering::new();
        let mut y = Layering::new();
        for r in base.iter().cloned() {
            x.apply(r.clone());
            y.apply(r);
        }
        x.apply(from_p1.clone());
        x.apply(from_p2.clone());
        y.apply(from_p2);
        y.apply(from_p1);

        assert_eq!(x.order(), y.order());
        assert_eq!(x.order(), vec![id("a"), id("b")]);
    }

    #[test]
    fn test_each_id_once() {
        let mut layers = Layering::new();
        layers.append(&id("a"), stamp(1, 1));
        layers.move_to_front(&id("a"), stamp(2, 1));
        layers.move_to_front(&id("a"), stamp(3, 2));
        assert_eq!(layers.order(), vec![id("a")]);
    }

    #[test]
    fn test_remove_beats_later_append() {
        let mut layers = Layering::new();
        layers.append(&id("a"), stamp(5, 1));
        assert!(layers.apply(LayerRecord { id: id("a"), stamp: stamp(4, 2), present: false }));
        assert!(!layers.contains(&id("a")));

        // A move stamped after the remove arrives late.
        assert!(!layers.apply(LayerRecord { id: id("a"), stamp: stamp(9, 3), present: true }));
        assert!(layers.order().is_empty());
    }

    #[test]
    fn test_missing_from_sends_remove_behind_newer_append() {
        let mut ours = Layering::new();
        ours.append(&id("a"), stamp(1, 1));
        ours.remove(&id("a"), stamp(2, 1));
        let mut theirs = Layering::new();
        theirs.append(&id("a"), stamp(6, 2));

        let missing = ours.missing_from(&theirs.digest());
        assert_eq!(missing.len(), 1);
        for r in missing {
            theirs.apply(r);
        }
        assert!(theirs.order().is_empty());
        assert!(theirs.missing_from(&ours.digest()).is_empty());
    }

    #[test]
    fn test_missing_from() {
        let mut ours = Layering::new();
        ours.append(&id("a"), stamp(1, 1));
        ours.append(&id("b"), stamp(2, 1));
        let mut theirs = Layering::new();
        theirs.append(&id("a"), stamp(1, 1));

        for r in ours.missing_from(&theirs.digest()) {
            theirs.apply(r);
        }
        assert_eq!(theirs.order(), ours.order());
    }
}
