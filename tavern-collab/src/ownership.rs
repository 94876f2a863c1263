//! OwnershipResolver: hand orphaned cards to a live peer.
//!
//! Every survivor runs this on its own when a peer leaves. The new manager is
//! the lowest live durable id, so all of them pick the same one and the
//! resulting writes are identical up to their stamps.

use std::collections::BTreeSet;

use tavern_core::{Card, PeerId};

use crate::store::ReplicatedStore;

/// The deterministic successor: lowest live id.
pub fn resolve_manager(live: &BTreeSet<PeerId>) -> Option<PeerId> {
    live.iter().next().copied()
}

/// Cards managed by `departed`, rewritten to the successor. The caller stamps
/// and applies them. Trashed cards are left alone.
pub fn reassign(store: &ReplicatedStore, departed: PeerId, live: &BTreeSet<PeerId>) -> Vec<Card> {
    if live.contains(&departed) {
        return Vec::new();
    }
    let Some(successor) = resolve_manager(live) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    store.for_each(|card| {
        if card.is_live() && card.manager == departed {
            log::info!(
                "Reassigning card {}: manager {} -> {}",
                card.id,
                departed,
                successor
            );
            out.push(Card {
                manager: successor,
                ..card.clone()
            });
        }
    });
    out
}
