//! The polymorphic contract between the registry, transactions, and each
//! versioned cell, plus the generic [`Versioned<T>`] implementation.
//!
//! `Versioned<T>` suits objects where a full copy per version is acceptable.
//! Types that can share state between versions implement [`VersionedObject`]
//! directly instead.

use crate::clock::EpochClock;
use crate::compress::CompressionFence;
use crate::history::{HistoryConfig, VersionHistory};
use crate::reclaim::EpochReclaimer;
use crate::registry::SnapshotRegistry;
use crate::txn::{self, Transaction};
use crate::MvccRuntime;
use std::any::Any;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, trace};
use verso_error::{Result, VersoError};
use verso_types::Epoch;

/// Identity of a versioned object, stable for the object's lifetime.
///
/// Derived from the address of the object's shared core, which both the
/// transaction staging map and the registry cleanup lists key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A transaction-local staged value, type-erased so the commit protocol and
/// the registry can handle heterogeneous objects uniformly.
pub struct LocalValue(Box<dyn Any + Send>);

impl LocalValue {
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self(Box::new(value))
    }

    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut()
    }
}

impl fmt::Debug for LocalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocalValue(..)")
    }
}

/// Capability set every object touched by a transaction must provide.
///
/// `setup`/`commit`/`rollback` run under the commit lock. `cleanup` is invoked
/// by the registry with no registry lock held. `commit` and `rollback` must
/// not fail: by the time they run, the commit decision is already made.
pub trait VersionedObject: Send + Sync {
    fn object_id(&self) -> ObjectId;

    /// Optimistically stage `staged` as a tentative new tail at `new_epoch`.
    /// Returns `Ok(false)` when another writer committed after `old_epoch`.
    fn setup(&self, old_epoch: Epoch, new_epoch: Epoch, staged: &LocalValue) -> Result<bool>;

    /// Make the tentative tail definitive and enqueue the superseded version
    /// on the registry's cleanup list.
    fn commit(self: Arc<Self>, new_epoch: Epoch, registry: &SnapshotRegistry);

    /// Discard the tentative tail installed by `setup`.
    fn rollback(&self, new_epoch: Epoch, staged: LocalValue);

    /// Destroy the version whose validity begins at `valid_from`.
    /// `trigger_epoch` names the snapshot epoch whose disappearance caused it.
    fn cleanup(&self, valid_from: Epoch, trigger_epoch: Epoch) -> Result<()>;

    /// Rewrite one boundary during epoch compression. Must reject renames
    /// that would break the strictly-increasing boundary order.
    fn rename_epoch(&self, old_valid_from: Epoch, new_valid_from: Epoch) -> Result<Epoch>;

    /// The stored boundaries of this object's history, oldest first. Epoch
    /// compression enumerates these to drive `rename_epoch`.
    fn boundary_epochs(&self) -> Vec<Epoch>;

    fn dump_into(&self, out: &mut String);
}

pub(crate) struct VersionedCore<T> {
    history: VersionHistory<T>,
    clock: Arc<EpochClock>,
    reclaimer: Arc<EpochReclaimer>,
    fence: Arc<CompressionFence>,
}

impl<T> VersionedCore<T> {
    fn id(&self) -> ObjectId {
        ObjectId(std::ptr::from_ref(self).cast::<()>() as usize)
    }
}

impl<T> VersionedObject for VersionedCore<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn object_id(&self) -> ObjectId {
        self.id()
    }

    fn setup(&self, old_epoch: Epoch, new_epoch: Epoch, staged: &LocalValue) -> Result<bool> {
        if new_epoch != self.clock.current().next() {
            return Err(VersoError::invariant(format!(
                "setup at epoch {new_epoch} with current epoch {}",
                self.clock.current()
            )));
        }
        if self.history.tail_valid_from() > old_epoch {
            trace!(
                target: "verso::object",
                object = %self.id(),
                old_epoch = old_epoch.0,
                tail_valid_from = self.history.tail_valid_from().0,
                "setup_conflict"
            );
            return Ok(false);
        }
        let value = staged
            .downcast_ref::<T>()
            .ok_or_else(|| VersoError::invariant("staged value has the wrong type"))?
            .clone();
        self.history.append(new_epoch, value, &self.reclaimer)?;
        Ok(true)
    }

    fn commit(self: Arc<Self>, new_epoch: Epoch, registry: &SnapshotRegistry) {
        let prior_valid_from = self.history.prior_valid_from();
        trace!(
            target: "verso::object",
            object = %self.id(),
            new_epoch = new_epoch.0,
            prior_valid_from = prior_valid_from.0,
            "commit_version"
        );
        let object: Arc<dyn VersionedObject> = self;
        if let Err(err) = registry.register_cleanup(Arc::clone(&object), prior_valid_from) {
            let mut dump = String::new();
            object.dump_into(&mut dump);
            error!(target: "verso::object", error = %err, "commit could not enqueue cleanup");
            panic!("commit could not enqueue cleanup: {err}\n{dump}");
        }
    }

    fn rollback(&self, new_epoch: Epoch, staged: LocalValue) {
        drop(staged);
        if let Err(err) = self.history.pop_back(&self.reclaimer) {
            let mut dump = String::new();
            self.dump_into(&mut dump);
            error!(
                target: "verso::object",
                error = %err,
                new_epoch = new_epoch.0,
                "rollback of tentative version failed"
            );
            panic!("rollback of tentative version failed: {err}\n{dump}");
        }
    }

    fn cleanup(&self, valid_from: Epoch, trigger_epoch: Epoch) -> Result<()> {
        trace!(
            target: "verso::object",
            object = %self.id(),
            valid_from = valid_from.0,
            trigger_epoch = trigger_epoch.0,
            "cleanup_version"
        );
        self.history.drop_entry(valid_from, &self.reclaimer)
    }

    fn rename_epoch(&self, old_valid_from: Epoch, new_valid_from: Epoch) -> Result<Epoch> {
        self.history.rename_valid_to(old_valid_from, new_valid_from)
    }

    fn boundary_epochs(&self) -> Vec<Epoch> {
        self.history.boundary_epochs()
    }

    fn dump_into(&self, out: &mut String) {
        let _ = writeln!(out, "object {}", self.id());
        self.history.dump_into(out, 2);
    }
}

/// A typed, versioned cell.
///
/// Cheap to clone; clones share the same underlying history. Reads outside a
/// transaction observe the committed value at the current epoch; reads and
/// writes inside a transaction go through its staging area.
pub struct Versioned<T> {
    core: Arc<VersionedCore<T>>,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Versioned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioned")
            .field("object", &self.core.id())
            .finish_non_exhaustive()
    }
}

impl<T> Versioned<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    pub fn new(runtime: &MvccRuntime, initial: T) -> Self {
        Self::with_config(runtime, initial, HistoryConfig::default())
    }

    pub fn with_config(runtime: &MvccRuntime, initial: T, config: HistoryConfig) -> Self {
        let inner = runtime.inner();
        Self {
            core: Arc::new(VersionedCore {
                history: VersionHistory::new(initial, config),
                clock: Arc::clone(&inner.clock),
                reclaimer: Arc::clone(&inner.reclaimer),
                fence: Arc::clone(&inner.fence),
            }),
        }
    }

    /// This cell's identity in staging maps and cleanup lists.
    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        self.core.id()
    }

    /// Read through the thread-bound transaction if one is in scope,
    /// otherwise the committed value at the current epoch.
    #[must_use]
    pub fn read(&self) -> T {
        if let Some(value) = txn::with_current(|t| self.read_in(t)) {
            return value;
        }
        let core = &self.core;
        core.fence
            .read(|| core.history.value_at(core.clock.current()))
    }

    /// Read at `txn`'s snapshot, honoring its staged writes.
    #[must_use]
    pub fn read_in(&self, txn: &Transaction) -> T {
        if let Some(staged) = txn.staged_ref::<T>(self.object_id()) {
            return staged.clone();
        }
        let core = &self.core;
        core.fence.read(|| core.history.value_at(txn.epoch()))
    }

    /// Mutable handle to this cell's staged value in `txn`, materializing it
    /// from the snapshot-visible value on first touch.
    pub fn mutate_in<'a>(&self, txn: &'a mut Transaction) -> &'a mut T {
        let core = Arc::clone(&self.core);
        let object: Arc<dyn VersionedObject> = Arc::clone(&self.core) as Arc<dyn VersionedObject>;
        let epoch = txn.epoch();
        txn.stage(object, move || {
            core.fence.read(|| core.history.value_at(epoch))
        })
    }

    /// Stage `value` as this cell's new content in `txn`.
    pub fn write_in(&self, txn: &mut Transaction, value: T) {
        *self.mutate_in(txn) = value;
    }

    /// Stage `value` in the thread-bound transaction.
    ///
    /// # Errors
    ///
    /// `NoActiveTransaction` when no transaction is bound to this thread.
    pub fn write(&self, value: T) -> Result<()> {
        txn::with_current_mut(|t| self.write_in(t, value))
            .ok_or(VersoError::NoActiveTransaction)
    }

    /// Apply `f` to this cell's staged value in the thread-bound transaction.
    ///
    /// `f` runs with the bound transaction borrowed, so it must not touch
    /// other cells through the thread-bound API; use explicit handles for
    /// multi-cell updates.
    ///
    /// # Errors
    ///
    /// `NoActiveTransaction` when no transaction is bound to this thread.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> Result<()> {
        txn::with_current_mut(|t| f(self.mutate_in(t))).ok_or(VersoError::NoActiveTransaction)
    }

    /// Number of superseded versions still held (excludes the current value).
    #[must_use]
    pub fn history_size(&self) -> usize {
        self.core.history.len() - 1
    }

    /// Check this cell's structural invariants.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` when the boundary order is corrupted.
    pub fn validate(&self) -> Result<()> {
        self.core.history.validate()
    }

    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.core.dump_into(&mut out);
        out
    }
}
