//! Epoch compression: renaming the live epoch space into a small dense range
//! so the clock never overflows.
//!
//! Compression is stop-the-world for writers (it holds the commit lock) and
//! for registry traffic (it holds the registry lock). Lock-free readers are
//! excluded by a sequence fence: compression makes the sequence odd while it
//! rewrites boundaries, and readers retry any read that overlapped an odd
//! window. The registry's cleanup fence keeps in-flight destroy phases from
//! racing the renames.

use crate::object::{ObjectId, VersionedObject};
use crate::RuntimeInner;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use verso_error::Result;
use verso_types::Epoch;

/// Seqlock-style fence between lock-free readers and epoch compression.
///
/// Readers run their closure and keep the result only if no compression
/// window opened meanwhile; otherwise they re-run it. The closure must be
/// idempotent and re-read any epoch it depends on, which the history read
/// paths do.
#[derive(Debug, Default)]
pub(crate) struct CompressionFence {
    seq: AtomicU64,
}

impl CompressionFence {
    pub(crate) fn read<R>(&self, mut f: impl FnMut() -> R) -> R {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::thread::yield_now();
                continue;
            }
            let result = f();
            if self.seq.load(Ordering::Acquire) == before {
                return result;
            }
        }
    }

    fn open(&self) {
        let prev = self.seq.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(prev & 1, 0, "compression fence opened twice");
    }

    fn close(&self) {
        let prev = self.seq.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(prev & 1, 1, "compression fence closed while open");
    }
}

/// When to trigger compression from `maybe_compress_epochs`, and where the
/// renamed epochs land.
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    /// Compress once `current_epoch` reaches this value.
    pub min_current_epoch: Epoch,
    /// First epoch of the dense range the live epochs are renamed into.
    /// Clamped to at least 1; epoch 0 is the tail sentinel.
    pub target_base: Epoch,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_current_epoch: Epoch(1 << 31),
            target_base: Epoch(1),
        }
    }
}

/// Rename all live epochs into a dense range starting at the configured
/// `target_base` and reset the clock accordingly.
///
/// Holds, in order: the commit lock, the registry lock, the cleanup fence
/// (write side), and the reader fence. Value-preserving: the old-to-new map is
/// strictly monotone over every epoch that participates in a visibility
/// comparison (registry keys, stored history boundaries, and cleanup-pair
/// `valid_from` epochs), so each comparison's outcome is unchanged.
pub(crate) fn compress_epochs(inner: &RuntimeInner) -> Result<()> {
    let _commit = inner.commit_lock.lock();
    let (mut state, _quiesced) = inner.registry.freeze();

    // Objects with obsolete versions are exactly the ones on cleanup lists.
    let mut objects: BTreeMap<ObjectId, Arc<dyn VersionedObject>> = BTreeMap::new();
    let mut epochs: BTreeSet<Epoch> = BTreeSet::new();
    for (epoch, entry) in &state.entries {
        epochs.insert(*epoch);
        for cleanup in &entry.cleanups {
            objects
                .entry(cleanup.object.object_id())
                .or_insert_with(|| Arc::clone(&cleanup.object));
            if cleanup.valid_from != Epoch(0) {
                epochs.insert(cleanup.valid_from);
            }
        }
    }
    for object in objects.values() {
        epochs.extend(object.boundary_epochs());
    }

    let base = inner.compression.target_base.0.max(1);
    let map: BTreeMap<Epoch, Epoch> = epochs
        .iter()
        .enumerate()
        .map(|(i, &old)| {
            let dense = u64::try_from(i).expect("live epoch count fits in u64");
            (old, Epoch(base + dense))
        })
        .collect();
    let count = u64::try_from(map.len()).expect("live epoch count fits in u64");
    let new_current = Epoch(base + count.saturating_sub(1));
    let old_current = inner.clock.current();

    inner.fence.open();
    let renamed = apply_renames(&objects, &map);
    if let Err(err) = renamed {
        inner.fence.close();
        return Err(err);
    }

    let old_entries = std::mem::take(&mut state.entries);
    for (epoch, mut entry) in old_entries {
        let new_epoch = map[&epoch];
        for cleanup in &mut entry.cleanups {
            if let Some(&new_valid_from) = map.get(&cleanup.valid_from) {
                cleanup.valid_from = new_valid_from;
            }
        }
        for snapshot in entry.snapshots.values() {
            snapshot.set_epoch(new_epoch);
        }
        state.entries.insert(new_epoch, entry);
    }

    inner.clock.set_current(new_current);
    let new_earliest = state.entries.keys().next().copied().unwrap_or(new_current);
    inner.clock.set_earliest(new_earliest);
    inner.fence.close();

    info!(
        target: "verso::compress",
        old_current = old_current.0,
        new_current = new_current.0,
        renamed_epochs = map.len(),
        objects = objects.len(),
        "epochs_compressed"
    );
    Ok(())
}

fn apply_renames(
    objects: &BTreeMap<ObjectId, Arc<dyn VersionedObject>>,
    map: &BTreeMap<Epoch, Epoch>,
) -> Result<()> {
    for object in objects.values() {
        // Ascending application keeps each intermediate history ordered:
        // the predecessor boundary is already small, the successor still big.
        for old in object.boundary_epochs() {
            let new = map[&old];
            if new != old {
                object.rename_epoch(old, new)?;
            }
        }
        debug!(
            target: "verso::compress",
            object = %object.object_id(),
            "object_boundaries_renamed"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::CompressionFence;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fence_passes_reads_through_when_idle() {
        let fence = CompressionFence::default();
        assert_eq!(fence.read(|| 41 + 1), 42);
    }

    #[test]
    fn fence_retries_reads_that_overlap_a_window() {
        let fence = Arc::new(CompressionFence::default());
        let value = Arc::new(AtomicU64::new(0));

        let writer = {
            let fence = Arc::clone(&fence);
            let value = Arc::clone(&value);
            thread::spawn(move || {
                for i in 1..=500_u64 {
                    fence.open();
                    value.store(i * 2, Ordering::Relaxed);
                    value.store(i * 2 + 1, Ordering::Relaxed);
                    fence.close();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let fence = Arc::clone(&fence);
                let value = Arc::clone(&value);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        // A committed read can never observe the even
                        // mid-window state.
                        let seen = fence.read(|| value.load(Ordering::Relaxed));
                        assert!(seen == 0 || seen % 2 == 1, "torn read: {seen}");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
