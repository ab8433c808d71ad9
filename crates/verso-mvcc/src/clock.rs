//! Process-wide logical time.
//!
//! Two distinguished epochs: `current` (the next epoch to be assigned) and
//! `earliest` (lower bound on epochs any live snapshot may observe). Reads
//! are plain atomic loads; `advance` happens only under the commit lock and
//! `set_earliest` only under the registry lock, so neither needs a
//! compare-and-swap.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use verso_types::Epoch;

#[derive(Debug)]
pub struct EpochClock {
    current: AtomicU64,
    earliest: AtomicU64,
}

impl EpochClock {
    pub(crate) fn new(start: Epoch) -> Self {
        Self {
            current: AtomicU64::new(start.0),
            earliest: AtomicU64::new(start.0),
        }
    }

    /// The next epoch to be assigned to snapshots and commits.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Epoch {
        Epoch(self.current.load(Ordering::Acquire))
    }

    /// Lower bound on epochs any live snapshot may observe.
    #[inline]
    #[must_use]
    pub fn earliest(&self) -> Epoch {
        Epoch(self.earliest.load(Ordering::Acquire))
    }

    /// Increment `current`. Caller must hold the commit lock.
    pub(crate) fn advance(&self) -> Epoch {
        let next = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(target: "verso::clock", current_epoch = next, "epoch_advance");
        Epoch(next)
    }

    /// Caller must hold the registry lock.
    pub(crate) fn set_earliest(&self, epoch: Epoch) {
        self.earliest.store(epoch.0, Ordering::Release);
        trace!(target: "verso::clock", earliest_epoch = epoch.0, "earliest_epoch_set");
    }

    /// Rewrite `current` wholesale. Only epoch compression does this, with
    /// both the commit lock and the registry lock held.
    pub(crate) fn set_current(&self, epoch: Epoch) {
        self.current.store(epoch.0, Ordering::Release);
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new(Epoch(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let clock = EpochClock::default();
        assert_eq!(clock.current(), Epoch(1));
        assert_eq!(clock.earliest(), Epoch(1));
    }

    #[test]
    fn advance_increments_current_only() {
        let clock = EpochClock::new(Epoch(600));
        assert_eq!(clock.advance(), Epoch(601));
        assert_eq!(clock.current(), Epoch(601));
        assert_eq!(clock.earliest(), Epoch(600));
    }

    #[test]
    fn earliest_tracks_registry_updates() {
        let clock = EpochClock::new(Epoch(10));
        clock.set_earliest(Epoch(12));
        assert_eq!(clock.earliest(), Epoch(12));
    }
}
