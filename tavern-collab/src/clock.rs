//! Lamport clock and the stamps it hands out.
//!
//! Every replicated write carries a [`Stamp`]. Stamps order first by logical
//! time, then by peer id, so two distinct writers never produce equal stamps
//! and every replica picks the same winner.

use serde::{Deserialize, Serialize};
use tavern_core::PeerId;

/// Logical timestamp of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub peer: PeerId,
}

impl Stamp {
    pub fn new(clock: u64, peer: PeerId) -> Self {
        Self { clock, peer }
    }
}

/// Per-process Lamport clock.
#[derive(Debug, Clone)]
pub struct LamportClock {
    peer: PeerId,
    time: u64,
}

impl LamportClock {
    pub fn new(peer: PeerId) -> Self {
        Self { peer, time: 0 }
    }

    /// Advance and stamp a local write.
    pub fn tick(&mut self) -> Stamp {
        self.time += 1;
        Stamp::new(self.time, self.peer)
    }

    /// Fold in a clock value seen on the wire.
    pub fn observe(&mut self, remote: u64) {
        if remote > self.time {
            self.time = remote;
        }
    }

    pub fn now(&self) -> u64 {
        self.time
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_monotonic() {
        let mut clock = LamportClock::new(PeerId(1));
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
        assert_eq!(b.clock, 2);
    }

    #[test]
    fn test_observe_jumps_forward_only() {
        let mut clock = LamportClock::new(PeerId(1));
        clock.observe(10);
        assert_eq!(clock.tick().clock, 11);
        clock.observe(3);
        assert_eq!(clock.now(), 11);
    }

    #[test]
    fn test_peer_breaks_ties() {
        let low = Stamp::new(5, PeerId(3));
        let high = Stamp::new(5, PeerId(7));
        assert!(high > low);
        assert!(Stamp::new(6, PeerId(1)) > high);
    }
}
