//! Epoch-ordered tracking of live snapshots and obsolete-version cleanups.
//!
//! Every obsolete version sits on the cleanup list of exactly one registry
//! entry: the latest snapshot epoch that can still observe it. When that
//! epoch's last snapshot disappears, each pair is either transferred to the
//! predecessor entry (some earlier snapshot still needs the version) or
//! destroyed.
//!
//! Cleanup callbacks reenter per-object code, so they run with the registry
//! lock released; objects are never locked under the registry lock.

use crate::clock::EpochClock;
use crate::object::VersionedObject;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};
use verso_error::{Result, VersoError};
use verso_types::{Epoch, SnapshotId, SnapshotStatus};

/// Snapshot fields shared with the registry.
///
/// The epoch lives in a cell rather than a plain field because epoch
/// compression rewrites the epochs of *live* snapshots in place.
#[derive(Debug)]
pub(crate) struct SnapshotState {
    epoch: AtomicU64,
    status: Mutex<SnapshotStatus>,
}

impl SnapshotState {
    pub(crate) fn epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::Acquire))
    }

    pub(crate) fn set_epoch(&self, epoch: Epoch) {
        self.epoch.store(epoch.0, Ordering::Release);
    }

    fn status(&self) -> SnapshotStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: SnapshotStatus) {
        *self.status.lock() = status;
    }
}

/// A fixed-epoch read view. A transaction holds exactly one.
#[derive(Debug)]
pub struct Snapshot {
    id: SnapshotId,
    state: Arc<SnapshotState>,
}

impl Snapshot {
    pub(crate) fn new(id: SnapshotId) -> Self {
        Self {
            id,
            state: Arc::new(SnapshotState {
                epoch: AtomicU64::new(0),
                status: Mutex::new(SnapshotStatus::Uninitialized),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    /// The epoch this snapshot reads at.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.state.epoch()
    }

    #[must_use]
    pub fn status(&self) -> SnapshotStatus {
        self.state.status()
    }

    pub(crate) fn set_status(&self, status: SnapshotStatus) {
        self.state.set_status(status);
    }
}

pub(crate) struct CleanupEntry {
    pub(crate) object: Arc<dyn VersionedObject>,
    pub(crate) valid_from: Epoch,
}

#[derive(Default)]
pub(crate) struct EpochEntry {
    pub(crate) snapshots: BTreeMap<SnapshotId, Arc<SnapshotState>>,
    pub(crate) cleanups: Vec<CleanupEntry>,
}

#[derive(Default)]
pub(crate) struct RegistryState {
    pub(crate) entries: BTreeMap<Epoch, EpochEntry>,
}

pub struct SnapshotRegistry {
    clock: Arc<EpochClock>,
    inner: Mutex<RegistryState>,
    /// Held for read by in-flight destroy phases (which run with the registry
    /// lock released) and for write by epoch compression, which must not
    /// overlap them. Both sides acquire it while still holding the registry
    /// lock, keeping the order registry > fence.
    cleanup_fence: RwLock<()>,
}

impl SnapshotRegistry {
    pub(crate) fn new(clock: Arc<EpochClock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(RegistryState::default()),
            cleanup_fence: RwLock::new(()),
        }
    }

    /// Register `snapshot` at the current epoch and return that epoch.
    pub(crate) fn register_snapshot(&self, snapshot: &Snapshot) -> Epoch {
        let mut state = self.inner.lock();
        let epoch = self.clock.current();
        snapshot.state.set_epoch(epoch);
        snapshot.set_status(SnapshotStatus::Initialized);

        let previous_tail = state.entries.keys().next_back().copied();
        state
            .entries
            .entry(epoch)
            .or_default()
            .snapshots
            .insert(snapshot.id, Arc::clone(&snapshot.state));

        // A new snapshot is issued at the current epoch, so its entry must
        // now be the ordered tail.
        if state.entries.keys().next_back() != Some(&epoch) {
            self.fatal(&state, &format!("stale snapshot registered at epoch {epoch}"));
        }
        trace!(
            target: "verso::registry",
            snapshot = %snapshot.id,
            epoch = epoch.0,
            "snapshot_register"
        );

        // The previous tail is exempt from cleanup while it is the most
        // recent entry; if it was vacated in the meantime, settle it now.
        if let Some(prev) = previous_tail {
            if prev != epoch
                && state
                    .entries
                    .get(&prev)
                    .is_some_and(|entry| entry.snapshots.is_empty())
            {
                self.perform_cleanup(state, prev);
                return epoch;
            }
        }
        epoch
    }

    /// Detach `snapshot` from its entry; the last detach at an epoch settles
    /// that entry's cleanup list.
    pub(crate) fn remove_snapshot(&self, snapshot: &Snapshot) {
        snapshot.set_status(SnapshotStatus::Restarting0);
        let mut state = self.inner.lock();
        snapshot.set_status(SnapshotStatus::Restarting0A);

        if state.entries.is_empty() {
            self.fatal(&state, "remove_snapshot on an empty registry");
        }
        let epoch = snapshot.epoch();
        if !state.entries.contains_key(&epoch) {
            self.fatal(
                &state,
                &format!("snapshot {} not found at epoch {epoch}", snapshot.id),
            );
        }
        let (removed, now_empty) = {
            let entry = state
                .entries
                .get_mut(&epoch)
                .expect("registry entry was just checked");
            let removed = entry.snapshots.remove(&snapshot.id).is_some();
            (removed, entry.snapshots.is_empty())
        };
        if !removed {
            self.fatal(
                &state,
                &format!("snapshot {} out of sync at epoch {epoch}", snapshot.id),
            );
        }
        snapshot.set_status(SnapshotStatus::Restarting0B);
        trace!(
            target: "verso::registry",
            snapshot = %snapshot.id,
            epoch = epoch.0,
            "snapshot_remove"
        );

        if now_empty {
            self.perform_cleanup(state, epoch);
        } else {
            drop(state);
        }
        snapshot.set_status(SnapshotStatus::Restarted);
    }

    /// Move `snapshot` to the current epoch after a commit. Registration at
    /// the new epoch happens before the old entry is vacated so the registry
    /// never looks empty and newly enqueued cleanups land on the new tail.
    pub(crate) fn restart_snapshot(&self, snapshot: &Snapshot) {
        snapshot.set_status(SnapshotStatus::Restarting2);
        let mut state = self.inner.lock();
        let old_epoch = snapshot.epoch();
        let new_epoch = self.clock.current();
        if old_epoch == new_epoch {
            snapshot.set_status(SnapshotStatus::Restarted);
            return;
        }

        state
            .entries
            .entry(new_epoch)
            .or_default()
            .snapshots
            .insert(snapshot.id, Arc::clone(&snapshot.state));
        if state.entries.keys().next_back() != Some(&new_epoch) {
            self.fatal(
                &state,
                &format!("stale snapshot restarted at epoch {new_epoch}"),
            );
        }
        snapshot.state.set_epoch(new_epoch);

        if !state.entries.contains_key(&old_epoch) {
            self.fatal(
                &state,
                &format!("snapshot {} not found at epoch {old_epoch}", snapshot.id),
            );
        }
        let (removed, now_empty) = {
            let entry = state
                .entries
                .get_mut(&old_epoch)
                .expect("registry entry was just checked");
            let removed = entry.snapshots.remove(&snapshot.id).is_some();
            (removed, entry.snapshots.is_empty())
        };
        if !removed {
            self.fatal(
                &state,
                &format!("snapshot {} out of sync at epoch {old_epoch}", snapshot.id),
            );
        }
        trace!(
            target: "verso::registry",
            snapshot = %snapshot.id,
            old_epoch = old_epoch.0,
            new_epoch = new_epoch.0,
            "snapshot_restart"
        );

        if now_empty {
            self.perform_cleanup(state, old_epoch);
        } else {
            drop(state);
        }
        snapshot.set_status(SnapshotStatus::Restarted);
    }

    /// Enqueue the version of `object` starting at `valid_from` for
    /// destruction once the latest live snapshot epoch disappears.
    ///
    /// # Errors
    ///
    /// `NoActiveSnapshot` when the registry holds no entries at all.
    pub(crate) fn register_cleanup(
        &self,
        object: Arc<dyn VersionedObject>,
        valid_from: Epoch,
    ) -> Result<()> {
        let mut state = self.inner.lock();
        let Some((epoch, entry)) = state.entries.iter_mut().next_back() else {
            return Err(VersoError::NoActiveSnapshot);
        };
        trace!(
            target: "verso::registry",
            object = %object.object_id(),
            valid_from = valid_from.0,
            entry_epoch = epoch.0,
            "cleanup_register"
        );
        entry.cleanups.push(CleanupEntry { object, valid_from });
        Ok(())
    }

    /// Settle the vacated entry at `epoch`: transfer each cleanup pair to the
    /// predecessor entry if an earlier snapshot still needs the version,
    /// destroy it otherwise. Consumes the registry guard; destruction runs
    /// with the lock released.
    fn perform_cleanup(&self, mut state: MutexGuard<'_, RegistryState>, epoch: Epoch) {
        let Some(entry) = state.entries.remove(&epoch) else {
            self.fatal(&state, &format!("cleanup of missing entry at epoch {epoch}"));
        };
        if !entry.snapshots.is_empty() {
            self.fatal(
                &state,
                &format!("cleanup at epoch {epoch} with live snapshots"),
            );
        }

        let predecessor = state.entries.range(..epoch).next_back().map(|(e, _)| *e);
        let mut destroy = Vec::new();
        let mut transferred = 0_usize;
        if let Some(prev_epoch) = predecessor {
            let prev = state
                .entries
                .get_mut(&prev_epoch)
                .expect("predecessor entry was just observed");
            for cleanup in entry.cleanups {
                if prev_epoch >= cleanup.valid_from {
                    prev.cleanups.push(cleanup);
                    transferred += 1;
                } else {
                    destroy.push(cleanup);
                }
            }
        } else {
            destroy = entry.cleanups;
            let new_earliest = state
                .entries
                .keys()
                .next()
                .copied()
                .unwrap_or_else(|| self.clock.current());
            self.clock.set_earliest(new_earliest);
        }
        debug!(
            target: "verso::registry",
            epoch = epoch.0,
            transferred,
            destroying = destroy.len(),
            "entry_settled"
        );

        if destroy.is_empty() {
            drop(state);
            return;
        }

        // Take the fence before releasing the registry lock so compression
        // cannot start renaming epochs under an in-flight destroy phase.
        let fence = self.cleanup_fence.read();
        drop(state);

        for cleanup in destroy {
            if let Err(err) = cleanup.object.cleanup(cleanup.valid_from, epoch) {
                // Best-effort: one bad version must not block the rest.
                let failure = VersoError::CleanupFailure {
                    valid_from: cleanup.valid_from,
                    detail: err.to_string(),
                };
                let mut dump = String::new();
                cleanup.object.dump_into(&mut dump);
                error!(
                    target: "verso::registry",
                    object = %cleanup.object.object_id(),
                    trigger_epoch = epoch.0,
                    error = %failure,
                    "cleanup_failed\n{dump}"
                );
            }
        }
        drop(fence);
    }

    /// Number of epochs with live registry entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Lock the registry and exclude in-flight destroy phases. Used by epoch
    /// compression to freeze the snapshot space.
    pub(crate) fn freeze(&self) -> (MutexGuard<'_, RegistryState>, RwLockWriteGuard<'_, ()>) {
        let state = self.inner.lock();
        let fence = self.cleanup_fence.write();
        (state, fence)
    }

    pub(crate) fn dump_into(&self, out: &mut String) {
        let state = self.inner.lock();
        Self::dump_state(&self.clock, &state, out);
    }

    fn dump_state(clock: &EpochClock, state: &RegistryState, out: &mut String) {
        let _ = writeln!(out, "global state:");
        let _ = writeln!(out, "  current_epoch: {}", clock.current());
        let _ = writeln!(out, "  earliest_epoch: {}", clock.earliest());
        let _ = writeln!(out, "  snapshot epochs: {}", state.entries.len());
        for (i, (epoch, entry)) in state.entries.iter().enumerate() {
            let _ = writeln!(out, "  {i} at epoch {epoch}");
            let _ = writeln!(out, "    {} snapshots", entry.snapshots.len());
            for (j, (id, snapshot)) in entry.snapshots.iter().enumerate() {
                let _ = writeln!(out, "      {j} {id} status {}", snapshot.status());
            }
            let _ = writeln!(out, "    {} cleanups", entry.cleanups.len());
            for (j, cleanup) in entry.cleanups.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "      {j}: object {} with version {}",
                    cleanup.object.object_id(),
                    cleanup.valid_from
                );
            }
        }
    }

    /// Check the registry invariants: `earliest_epoch` equals the minimum
    /// entry epoch, or the current epoch when the registry is empty.
    pub(crate) fn validate(&self) -> Result<()> {
        let state = self.inner.lock();
        let earliest = self.clock.earliest();
        match state.entries.keys().next() {
            Some(&min) if min != earliest => Err(VersoError::invariant(format!(
                "earliest epoch {earliest} does not match registry head {min}"
            ))),
            None if earliest != self.clock.current() => Err(VersoError::invariant(format!(
                "empty registry with earliest epoch {earliest} != current {}",
                self.clock.current()
            ))),
            _ => Ok(()),
        }
    }

    fn fatal(&self, state: &RegistryState, detail: &str) -> ! {
        let mut dump = String::new();
        Self::dump_state(&self.clock, state, &mut dump);
        error!(target: "verso::registry", detail, "registry invariant violated\n{dump}");
        panic!("registry invariant violated: {detail}\n{dump}");
    }
}

#[cfg(test)]
mod tests {
    use crate::{Epoch, MvccRuntime, Versioned};

    #[test]
    fn entries_share_an_epoch_until_a_commit_moves_it() {
        let runtime = MvccRuntime::with_start_epoch(Epoch(50));
        let a = runtime.begin();
        let b = runtime.begin();
        assert_eq!(runtime.entry_count(), 1);
        assert_eq!(a.epoch(), b.epoch());

        let mut c = runtime.begin();
        let var = Versioned::new(&runtime, 0_u8);
        *var.mutate_in(&mut c) = 1;
        assert!(c.commit());
        assert_eq!(c.epoch(), Epoch(51));
        assert_eq!(runtime.entry_count(), 2);

        drop(c);
        drop(b);
        drop(a);
        assert_eq!(runtime.entry_count(), 0);
        runtime.validate().unwrap();
    }

    #[test]
    fn earliest_epoch_follows_the_registry_head() {
        let runtime = MvccRuntime::with_start_epoch(Epoch(10));
        let old = runtime.begin();
        let var = Versioned::new(&runtime, 0_u8);

        let mut w = runtime.begin();
        *var.mutate_in(&mut w) = 1;
        assert!(w.commit());
        drop(w);

        assert_eq!(runtime.earliest_epoch(), Epoch(10));
        drop(old);
        assert_eq!(runtime.earliest_epoch(), runtime.current_epoch());
        runtime.validate().unwrap();
    }

    #[test]
    fn dump_lists_snapshots_and_cleanups() {
        let runtime = MvccRuntime::with_start_epoch(Epoch(7));
        let pin = runtime.begin();
        let var = Versioned::new(&runtime, 3_u8);

        let mut w = runtime.begin();
        *var.mutate_in(&mut w) = 4;
        assert!(w.commit());
        drop(w);

        let dump = runtime.dump();
        assert!(dump.contains("earliest_epoch: 7"), "{dump}");
        assert!(dump.contains("1 cleanups"), "{dump}");
        drop(pin);
    }
}
