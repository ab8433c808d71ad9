//! Per-object version history.
//!
//! A history is an immutable block of `(valid_to, value)` entries published
//! through an [`ArcSwap`]. Readers load the current block and scan it without
//! taking any lock; every mutation builds a replacement block and installs it
//! with compare-and-swap, retrying until the install lands. Superseded blocks
//! go to the [`EpochReclaimer`] so no concurrent reader is ever left inside a
//! freed block.
//!
//! Entry `i` is visible to a snapshot at epoch `e` when
//! `entries[i-1].valid_to <= e < entries[i].valid_to`. The head entry has no
//! lower bound and the tail carries [`Epoch::SENTINEL`] as its upper bound:
//! the tail is the current committed value.

use crate::reclaim::EpochReclaimer;
use arc_swap::ArcSwap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::trace;
use verso_error::{Result, VersoError};
use verso_types::Epoch;

#[derive(Debug, Clone)]
pub(crate) struct VersionEntry<T> {
    pub valid_to: Epoch,
    pub value: T,
}

#[derive(Debug)]
pub(crate) struct HistoryBlock<T> {
    capacity: usize,
    entries: Vec<VersionEntry<T>>,
}

impl<T> HistoryBlock<T> {
    fn with_capacity(capacity: usize, entries: Vec<VersionEntry<T>>) -> Result<Self> {
        if capacity < entries.len() {
            return Err(VersoError::CapacityViolation {
                requested: capacity,
                size: entries.len(),
            });
        }
        let mut stored = Vec::with_capacity(capacity);
        stored.extend(entries);
        Ok(Self {
            capacity,
            entries: stored,
        })
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Configuration for a freshly constructed history.
#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    /// Entry slots to allocate up front. Appends grow the block as needed.
    pub initial_capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct VersionHistory<T> {
    block: ArcSwap<HistoryBlock<T>>,
}

impl<T: Clone + Send + Sync + 'static> VersionHistory<T> {
    pub(crate) fn new(initial: T, config: HistoryConfig) -> Self {
        let entries = vec![VersionEntry {
            valid_to: Epoch::SENTINEL,
            value: initial,
        }];
        let capacity = config.initial_capacity.max(1);
        let block = HistoryBlock::with_capacity(capacity, entries)
            .expect("initial capacity is clamped to hold one entry");
        Self {
            block: ArcSwap::from_pointee(block),
        }
    }

    /// Number of entries, including the current (tail) value.
    pub(crate) fn len(&self) -> usize {
        self.block.load().len()
    }

    /// The value visible to a snapshot at `epoch`. Lock-free.
    pub(crate) fn value_at(&self, epoch: Epoch) -> T {
        let block = self.block.load();
        let entries = &block.entries;
        for i in (1..entries.len()).rev() {
            let valid_from = entries[i - 1].valid_to;
            if valid_from <= epoch {
                return entries[i].value.clone();
            }
        }
        entries[0].value.clone()
    }

    /// The epoch at which the current (tail) version became valid, or
    /// `Epoch(0)` if the tail has no recorded lower bound.
    pub(crate) fn tail_valid_from(&self) -> Epoch {
        let block = self.block.load();
        let n = block.len();
        if n >= 2 {
            block.entries[n - 2].valid_to
        } else {
            Epoch(0)
        }
    }

    /// The epoch at which the entry *before* the tail became valid. This is
    /// the version a commit has just superseded, identified the way the
    /// registry's cleanup lists key versions.
    pub(crate) fn prior_valid_from(&self) -> Epoch {
        let block = self.block.load();
        let n = block.len();
        if n >= 3 {
            block.entries[n - 3].valid_to
        } else {
            Epoch(0)
        }
    }

    /// Rebuild-and-CAS helper. `build` sees the freshly loaded block and
    /// either produces its replacement or reports a violated precondition.
    /// CAS failure is not an error; the build is re-run against the new
    /// current block until the install lands.
    fn install<F>(&self, reclaimer: &EpochReclaimer, build: F) -> Result<()>
    where
        F: Fn(&HistoryBlock<T>) -> Result<HistoryBlock<T>>,
    {
        loop {
            let cur = self.block.load_full();
            let next = Arc::new(build(&cur)?);
            let prev = self.block.compare_and_swap(&cur, next);
            if Arc::ptr_eq(&*prev, &cur) {
                drop(prev);
                reclaimer.retire(cur);
                return Ok(());
            }
        }
    }

    /// Append a tentative new tail: the former tail's `valid_to` is patched
    /// to `new_valid_to` and `value` becomes the new tail.
    pub(crate) fn append(
        &self,
        new_valid_to: Epoch,
        value: T,
        reclaimer: &EpochReclaimer,
    ) -> Result<()> {
        self.install(reclaimer, |cur| {
            let n = cur.len();
            if n >= 2 && cur.entries[n - 2].valid_to >= new_valid_to {
                return Err(VersoError::invariant(format!(
                    "append at epoch {new_valid_to} not above existing boundary {}",
                    cur.entries[n - 2].valid_to
                )));
            }
            let mut entries = cur.entries.clone();
            if let Some(tail) = entries.last_mut() {
                tail.valid_to = new_valid_to;
            }
            entries.push(VersionEntry {
                valid_to: Epoch::SENTINEL,
                value: value.clone(),
            });
            let capacity = cur.capacity.max(entries.len());
            HistoryBlock::with_capacity(capacity, entries)
        })?;
        trace!(target: "verso::history", valid_to = new_valid_to.0, "history_append");
        Ok(())
    }

    /// Remove the tentative tail installed by a failed commit's setup.
    pub(crate) fn pop_back(&self, reclaimer: &EpochReclaimer) -> Result<()> {
        self.install(reclaimer, |cur| {
            if cur.len() < 2 {
                return Err(VersoError::HistoryUnderflow);
            }
            let mut entries = cur.entries.clone();
            entries.pop();
            if let Some(tail) = entries.last_mut() {
                tail.valid_to = Epoch::SENTINEL;
            }
            HistoryBlock::with_capacity(cur.capacity, entries)
        })?;
        trace!(target: "verso::history", "history_pop_back");
        Ok(())
    }

    /// Remove the entry whose validity begins at `valid_from`. A head removal
    /// collapses forward; an interior removal stitches the predecessor's
    /// `valid_to` to the removed entry's.
    pub(crate) fn drop_entry(&self, valid_from: Epoch, reclaimer: &EpochReclaimer) -> Result<()> {
        self.install(reclaimer, |cur| {
            let entries = &cur.entries;
            if entries.len() < 2 {
                return Err(VersoError::HistoryUnderflow);
            }

            if valid_from < entries[0].valid_to {
                let remaining = entries[1..].to_vec();
                return HistoryBlock::with_capacity(cur.capacity, remaining);
            }

            for i in 1..entries.len() {
                if entries[i - 1].valid_to == valid_from {
                    let mut remaining = entries.clone();
                    let removed = remaining.remove(i);
                    remaining[i - 1].valid_to = removed.valid_to;
                    return HistoryBlock::with_capacity(cur.capacity, remaining);
                }
            }

            Err(VersoError::invariant(format!(
                "no version starting at epoch {valid_from} to clean up"
            )))
        })?;
        trace!(target: "verso::history", valid_from = valid_from.0, "history_drop_entry");
        Ok(())
    }

    /// Rewrite a single boundary: the entry whose `valid_to` equals
    /// `old` gets `new` instead. Rejects renames that would break the
    /// strictly-increasing boundary order.
    pub(crate) fn rename_valid_to(&self, old: Epoch, new: Epoch) -> Result<Epoch> {
        if old.is_sentinel() || new.is_sentinel() {
            return Err(VersoError::invariant(
                "rename of the tail sentinel boundary",
            ));
        }
        // No reclaimer involvement: renames run under the compression fence
        // with all readers excluded, and the install loop below still
        // replaces whole blocks, never mutating one in place.
        loop {
            let cur = self.block.load_full();
            let entries = &cur.entries;
            let Some(i) = entries[..entries.len().saturating_sub(1)]
                .iter()
                .position(|e| e.valid_to == old)
            else {
                return Err(VersoError::invariant(format!(
                    "no boundary at epoch {old} to rename"
                )));
            };
            if i > 0 && entries[i - 1].valid_to >= new {
                return Err(VersoError::invariant(format!(
                    "renamed boundary {new} not above predecessor {}",
                    entries[i - 1].valid_to
                )));
            }
            if i + 1 < entries.len() - 1 && entries[i + 1].valid_to <= new {
                return Err(VersoError::invariant(format!(
                    "renamed boundary {new} not below successor {}",
                    entries[i + 1].valid_to
                )));
            }
            let mut renamed = entries.clone();
            renamed[i].valid_to = new;
            let next = HistoryBlock::with_capacity(cur.capacity, renamed)?;
            let prev = self.block.compare_and_swap(&cur, Arc::new(next));
            if Arc::ptr_eq(&*prev, &cur) {
                return Ok(new);
            }
        }
    }

    /// All stored boundaries (non-tail `valid_to` values), oldest first.
    pub(crate) fn boundary_epochs(&self) -> Vec<Epoch> {
        let block = self.block.load();
        let n = block.len();
        block.entries[..n.saturating_sub(1)]
            .iter()
            .map(|e| e.valid_to)
            .collect()
    }

    /// Check the structural invariants: boundaries strictly ascending and
    /// non-sentinel, tail carrying the sentinel.
    pub(crate) fn validate(&self) -> Result<()> {
        let block = self.block.load();
        let entries = &block.entries;
        let mut prev = Epoch(0);
        for (i, entry) in entries.iter().enumerate() {
            if i + 1 == entries.len() {
                if !entry.valid_to.is_sentinel() {
                    return Err(VersoError::invariant(format!(
                        "tail entry carries bound {} instead of the sentinel",
                        entry.valid_to
                    )));
                }
                break;
            }
            if entry.valid_to.is_sentinel() || entry.valid_to <= prev {
                return Err(VersoError::invariant(format!(
                    "boundary {} at index {i} not above predecessor {prev}",
                    entry.valid_to
                )));
            }
            prev = entry.valid_to;
        }
        Ok(())
    }

    pub(crate) fn dump_into(&self, out: &mut String, indent: usize)
    where
        T: std::fmt::Debug,
    {
        let block = self.block.load();
        let pad = " ".repeat(indent);
        let _ = writeln!(
            out,
            "{pad}history with {} values (capacity {})",
            block.len(),
            block.capacity
        );
        for (i, entry) in block.entries.iter().enumerate() {
            let _ = writeln!(
                out,
                "{pad}  {i}: valid to {} value {:?}",
                entry.valid_to, entry.value
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(initial: i32) -> (VersionHistory<i32>, EpochReclaimer) {
        (
            VersionHistory::new(initial, HistoryConfig::default()),
            EpochReclaimer::default(),
        )
    }

    #[test]
    fn fresh_history_serves_initial_value_everywhere() {
        let (h, _) = history(7);
        assert_eq!(h.len(), 1);
        assert_eq!(h.value_at(Epoch(1)), 7);
        assert_eq!(h.value_at(Epoch(1_000_000)), 7);
        h.validate().unwrap();
    }

    #[test]
    fn append_splits_visibility_at_the_boundary() {
        let (h, r) = history(0);
        h.append(Epoch(601), 5, &r).unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h.value_at(Epoch(600)), 0);
        assert_eq!(h.value_at(Epoch(601)), 5);
        assert_eq!(h.value_at(Epoch(700)), 5);
        assert_eq!(h.tail_valid_from(), Epoch(601));
        h.validate().unwrap();
    }

    #[test]
    fn append_below_existing_boundary_is_rejected() {
        let (h, r) = history(0);
        h.append(Epoch(10), 1, &r).unwrap();
        h.append(Epoch(20), 2, &r).unwrap();
        let err = h.append(Epoch(20), 3, &r).unwrap_err();
        assert!(matches!(err, VersoError::InvariantViolation { .. }));
    }

    #[test]
    fn pop_back_restores_previous_tail() {
        let (h, r) = history(0);
        h.append(Epoch(10), 1, &r).unwrap();
        h.pop_back(&r).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.value_at(Epoch(50)), 0);
        h.validate().unwrap();
    }

    #[test]
    fn pop_back_on_sole_entry_underflows() {
        let (h, r) = history(0);
        assert_eq!(h.pop_back(&r).unwrap_err(), VersoError::HistoryUnderflow);
    }

    #[test]
    fn drop_head_collapses_forward() {
        let (h, r) = history(0);
        h.append(Epoch(10), 1, &r).unwrap();
        h.drop_entry(Epoch(0), &r).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.value_at(Epoch(5)), 1);
        h.validate().unwrap();
    }

    #[test]
    fn drop_interior_stitches_predecessor() {
        let (h, r) = history(0);
        h.append(Epoch(10), 1, &r).unwrap();
        h.append(Epoch(20), 2, &r).unwrap();
        // Entry for value 1 spans [10, 20); dropping it extends value 0 to 20.
        h.drop_entry(Epoch(10), &r).unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h.value_at(Epoch(15)), 0);
        assert_eq!(h.value_at(Epoch(20)), 2);
        h.validate().unwrap();
    }

    #[test]
    fn drop_missing_entry_is_an_invariant_violation() {
        let (h, r) = history(0);
        h.append(Epoch(10), 1, &r).unwrap();
        let err = h.drop_entry(Epoch(99), &r).unwrap_err();
        assert!(matches!(err, VersoError::InvariantViolation { .. }));
    }

    #[test]
    fn drop_below_two_entries_underflows() {
        let (h, r) = history(0);
        assert_eq!(
            h.drop_entry(Epoch(0), &r).unwrap_err(),
            VersoError::HistoryUnderflow
        );
    }

    #[test]
    fn capacity_cannot_shrink_below_size() {
        let entries = vec![
            VersionEntry {
                valid_to: Epoch(5),
                value: 1,
            },
            VersionEntry {
                valid_to: Epoch::SENTINEL,
                value: 2,
            },
        ];
        let err = HistoryBlock::with_capacity(1, entries).unwrap_err();
        assert!(matches!(err, VersoError::CapacityViolation { .. }));
    }

    #[test]
    fn rename_preserves_order_and_rejects_violations() {
        let (h, r) = history(0);
        h.append(Epoch(100), 1, &r).unwrap();
        h.append(Epoch(200), 2, &r).unwrap();

        // 100 -> 2 keeps 2 < 200.
        assert_eq!(h.rename_valid_to(Epoch(100), Epoch(2)).unwrap(), Epoch(2));
        assert_eq!(h.value_at(Epoch(1)), 0);
        assert_eq!(h.value_at(Epoch(2)), 1);

        // 200 -> 1 would land below the (renamed) predecessor.
        let err = h.rename_valid_to(Epoch(200), Epoch(1)).unwrap_err();
        assert!(matches!(err, VersoError::InvariantViolation { .. }));

        assert_eq!(h.rename_valid_to(Epoch(200), Epoch(3)).unwrap(), Epoch(3));
        assert_eq!(h.value_at(Epoch(3)), 2);
        h.validate().unwrap();
    }

    #[test]
    fn boundaries_exclude_the_tail() {
        let (h, r) = history(0);
        h.append(Epoch(10), 1, &r).unwrap();
        h.append(Epoch(20), 2, &r).unwrap();
        assert_eq!(h.boundary_epochs(), vec![Epoch(10), Epoch(20)]);
    }

    #[test]
    fn concurrent_readers_see_old_or_new_never_torn() {
        use std::sync::Barrier;
        use std::thread;

        let h = Arc::new(VersionHistory::new(0_i32, HistoryConfig::default()));
        let r = Arc::new(EpochReclaimer::default());
        let barrier = Arc::new(Barrier::new(5));

        let writer = {
            let h = Arc::clone(&h);
            let r = Arc::clone(&r);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 1..=100_u64 {
                    h.append(Epoch(i), i32::try_from(i).unwrap(), &r).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let h = Arc::clone(&h);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..2_000 {
                        // Epoch 50 must resolve to 49, 50, or an older value
                        // not yet split, but never garbage.
                        let v = h.value_at(Epoch(50));
                        assert!((0..=50).contains(&v), "torn read: {v}");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(h.value_at(Epoch(50)), 50);
        assert_eq!(h.value_at(Epoch(100)), 100);
    }
}
