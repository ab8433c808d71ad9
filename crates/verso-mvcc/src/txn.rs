//! Transactions: per-caller staging plus the optimistic commit protocol.
//!
//! A transaction pairs a snapshot with a map of staged local values. Commit
//! serializes behind the process-wide commit lock: phase A asks every staged
//! object to set up a tentative version; any refusal rolls the prefix back
//! and reports contention as `false`. Phase B advances the epoch, moves the
//! snapshot forward, and makes the tentative versions definitive.
//!
//! After a commit, successful or not, the transaction is live again at the
//! then-current epoch with an empty staging area, so callers can retry or
//! continue without re-creating it.

use crate::object::{LocalValue, ObjectId, VersionedObject};
use crate::registry::Snapshot;
use crate::RuntimeInner;
use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, trace};
use verso_types::{Epoch, SnapshotId, SnapshotStatus, TxnId};

thread_local! {
    static CURRENT: RefCell<Option<Transaction>> = const { RefCell::new(None) };
}

/// Run `f` against the thread-bound transaction, if any.
pub(crate) fn with_current<R>(f: impl FnOnce(&Transaction) -> R) -> Option<R> {
    CURRENT.with(|slot| slot.borrow().as_ref().map(f))
}

/// Run `f` against the thread-bound transaction mutably, if any.
pub(crate) fn with_current_mut<R>(f: impl FnOnce(&mut Transaction) -> R) -> Option<R> {
    CURRENT.with(|slot| slot.borrow_mut().as_mut().map(f))
}

pub(crate) fn bind_current(txn: Transaction) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(
            slot.is_none(),
            "a transaction is already bound to this thread"
        );
        *slot = Some(txn);
    });
}

pub(crate) fn take_current() -> Option<Transaction> {
    CURRENT.with(|slot| slot.borrow_mut().take())
}

struct StagedWrite {
    object: Arc<dyn VersionedObject>,
    local: LocalValue,
}

/// A staging scope for writes plus its snapshot.
pub struct Transaction {
    inner: Arc<RuntimeInner>,
    id: TxnId,
    snapshot: Snapshot,
    writes: BTreeMap<ObjectId, StagedWrite>,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<RuntimeInner>, id: TxnId, snapshot_id: SnapshotId) -> Self {
        let snapshot = Snapshot::new(snapshot_id);
        inner.registry.register_snapshot(&snapshot);
        trace!(
            target: "verso::txn",
            txn = %id,
            snapshot = %snapshot.id(),
            epoch = snapshot.epoch().0,
            "txn_begin"
        );
        Self {
            inner,
            id,
            snapshot,
            writes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// The epoch this transaction's snapshot reads at.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.snapshot.epoch()
    }

    #[must_use]
    pub fn status(&self) -> SnapshotStatus {
        self.snapshot.status()
    }

    /// Number of objects with staged local values.
    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.writes.len()
    }

    pub(crate) fn staged_ref<T: 'static>(&self, id: ObjectId) -> Option<&T> {
        self.writes.get(&id).map(|staged| {
            staged
                .local
                .downcast_ref::<T>()
                .expect("staged value type is fixed per object")
        })
    }

    /// Mutable handle to the staged value for `object`, materializing it via
    /// `init` on first touch.
    pub(crate) fn stage<T: Send + 'static>(
        &mut self,
        object: Arc<dyn VersionedObject>,
        init: impl FnOnce() -> T,
    ) -> &mut T {
        let id = object.object_id();
        let staged = match self.writes.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                trace!(target: "verso::txn", txn = %self.id, object = %id, "txn_stage");
                slot.insert(StagedWrite {
                    object,
                    local: LocalValue::new(init()),
                })
            }
        };
        staged
            .local
            .downcast_mut::<T>()
            .expect("staged value type is fixed per object")
    }

    /// Attempt to commit every staged write atomically.
    ///
    /// Returns `false` on a write-write conflict: another transaction
    /// committed one of the touched objects after this snapshot was taken.
    /// Nothing is installed and the epoch does not advance; the staging area
    /// is cleared and the snapshot moves to the current epoch so the caller
    /// can retry.
    pub fn commit(&mut self) -> bool {
        if self.writes.is_empty() {
            self.snapshot.set_status(SnapshotStatus::Committed);
            return true;
        }
        self.snapshot.set_status(SnapshotStatus::Committing);
        let inner = Arc::clone(&self.inner);
        let guard = inner.commit_lock.lock();

        let old_epoch = self.snapshot.epoch();
        let new_epoch = inner.clock.current().next();
        let staged: Vec<StagedWrite> = std::mem::take(&mut self.writes).into_values().collect();
        let staged_count = staged.len();

        let mut prepared: Vec<StagedWrite> = Vec::with_capacity(staged_count);
        let mut conflicted = false;
        for write in staged {
            match write.object.setup(old_epoch, new_epoch, &write.local) {
                Ok(true) => prepared.push(write),
                Ok(false) => {
                    conflicted = true;
                    break;
                }
                Err(err) => {
                    let mut dump = String::new();
                    write.object.dump_into(&mut dump);
                    error!(
                        target: "verso::txn",
                        txn = %self.id,
                        object = %write.object.object_id(),
                        error = %err,
                        "setup invariant violated\n{dump}"
                    );
                    panic!("setup failed for {}: {err}\n{dump}", write.object.object_id());
                }
            }
        }

        if conflicted {
            for write in prepared.into_iter().rev() {
                write.object.rollback(new_epoch, write.local);
            }
            inner.registry.restart_snapshot(&self.snapshot);
            self.snapshot.set_status(SnapshotStatus::Failed);
            drop(guard);
            debug!(
                target: "verso::txn",
                txn = %self.id,
                old_epoch = old_epoch.0,
                staged = staged_count,
                "commit_conflict"
            );
            return false;
        }

        inner.clock.advance();
        // Move the snapshot forward before enqueueing cleanups so they land
        // on the new tail entry and outlive this transaction's old epoch.
        inner.registry.restart_snapshot(&self.snapshot);
        for write in prepared {
            Arc::clone(&write.object).commit(new_epoch, &inner.registry);
        }
        self.snapshot.set_status(SnapshotStatus::Committed);
        drop(guard);
        debug!(
            target: "verso::txn",
            txn = %self.id,
            new_epoch = new_epoch.0,
            committed = staged_count,
            "commit_ok"
        );
        true
    }

    /// Discard all staged writes, keeping the transaction and its snapshot.
    pub fn clear(&mut self) {
        self.writes.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        trace!(target: "verso::txn", txn = %self.id, "txn_drop");
        self.inner.registry.remove_snapshot(&self.snapshot);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("epoch", &self.epoch())
            .field("status", &self.status())
            .field("staged", &self.writes.len())
            .finish()
    }
}
