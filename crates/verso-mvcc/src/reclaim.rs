//! Deferred reclamation for superseded history blocks.
//!
//! History mutations publish a fresh immutable block and hand the old one
//! here. The reclaimer guarantees the block is destroyed only after every
//! reader that could still be inside it has moved on, using epoch-based
//! reclamation from `crossbeam-epoch`.
//!
//! Readers do not pin anything on their fast path; they hold an `Arc` to
//! the block they loaded, so a retired block's destructor simply runs once
//! the last reference drops. The crossbeam deferral adds the grace period
//! that keeps destruction off the reader's critical path and gives the
//! runtime observable retire/reclaim counters.

use crossbeam_epoch as epoch;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Monotonic retire/reclaim counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub retired: u64,
    pub reclaimed: u64,
}

impl ReclaimStats {
    /// Retired blocks whose destructor has not yet run.
    #[must_use]
    pub fn pending(self) -> u64 {
        self.retired.saturating_sub(self.reclaimed)
    }
}

#[derive(Debug)]
pub struct EpochReclaimer {
    collector: epoch::Collector,
    retired: Arc<AtomicU64>,
    reclaimed: Arc<AtomicU64>,
}

impl Default for EpochReclaimer {
    fn default() -> Self {
        Self {
            collector: epoch::Collector::new(),
            retired: Arc::new(AtomicU64::new(0)),
            reclaimed: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl EpochReclaimer {
    /// Schedule `value` for destruction once no concurrent reader can still
    /// observe it.
    pub fn retire<V: Send + 'static>(&self, value: V) {
        let handle = self.collector.register();
        let guard = handle.pin();
        self.retired.fetch_add(1, Ordering::Relaxed);
        let reclaimed = Arc::clone(&self.reclaimed);
        guard.defer(move || {
            drop(value);
            reclaimed.fetch_add(1, Ordering::Relaxed);
        });
        trace!(target: "verso::reclaim", "block_retired");
    }

    /// Run `f` after the current grace period ends.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        let handle = self.collector.register();
        let guard = handle.pin();
        self.retired.fetch_add(1, Ordering::Relaxed);
        let reclaimed = Arc::clone(&self.reclaimed);
        guard.defer(move || {
            f();
            reclaimed.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Best-effort pass flushing deferred destructors.
    pub fn collect(&self) {
        let pending = self.stats().pending().clamp(1, 8);
        let passes = usize::try_from(pending).unwrap_or(8);
        for _ in 0..passes {
            let handle = self.collector.register();
            handle.pin().flush();
            if self.stats().pending() == 0 {
                break;
            }
            std::thread::yield_now();
        }
    }

    #[must_use]
    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            retired: self.retired.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_then_collect_runs_destructor() {
        let reclaimer = EpochReclaimer::default();
        let witness = Arc::new(AtomicU64::new(0));

        struct Bump(Arc<AtomicU64>);
        impl Drop for Bump {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        reclaimer.retire(Bump(Arc::clone(&witness)));
        assert_eq!(reclaimer.stats().retired, 1);

        reclaimer.collect();
        assert_eq!(witness.load(Ordering::SeqCst), 1);
        assert_eq!(reclaimer.stats().pending(), 0);
    }

    #[test]
    fn defer_runs_closure() {
        let reclaimer = EpochReclaimer::default();
        let witness = Arc::new(AtomicU64::new(0));
        let w = Arc::clone(&witness);
        reclaimer.defer(move || {
            w.fetch_add(7, Ordering::SeqCst);
        });
        reclaimer.collect();
        assert_eq!(witness.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn stats_track_pending() {
        let reclaimer = EpochReclaimer::default();
        assert_eq!(reclaimer.stats(), ReclaimStats::default());
        reclaimer.retire(vec![1_u8, 2, 3]);
        assert!(reclaimer.stats().retired >= 1);
    }
}
