#![forbid(unsafe_code)]
//! Optimistic MVCC over in-memory versioned cells.
//!
//! An [`MvccRuntime`] owns the process-wide pieces: the epoch clock, the
//! commit lock, the snapshot registry, and the deferred reclaimer. Cells are
//! [`Versioned<T>`] values scoped to a runtime; callers stage changes in a
//! [`Transaction`] and commit optimistically.
//!
//! ```
//! use verso_mvcc::{MvccRuntime, Versioned};
//!
//! let runtime = MvccRuntime::new();
//! let counter = Versioned::new(&runtime, 0_i32);
//!
//! let mut txn = runtime.begin();
//! *counter.mutate_in(&mut txn) += 1;
//! assert!(txn.commit());
//! drop(txn);
//!
//! assert_eq!(counter.read(), 1);
//! ```
//!
//! Readers never block: a transaction observes a consistent snapshot taken
//! at its start, and a write-write conflict surfaces as `commit() == false`
//! rather than an error; retrying with a fresh snapshot is the caller's
//! policy.

pub mod clock;
pub mod compress;
pub mod history;
pub mod object;
pub mod reclaim;
pub mod registry;
pub mod txn;

use clock::EpochClock;
use compress::CompressionFence;
use parking_lot::Mutex;
use registry::SnapshotRegistry;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use compress::CompressionConfig;
pub use history::HistoryConfig;
pub use object::{LocalValue, ObjectId, Versioned, VersionedObject};
pub use reclaim::{EpochReclaimer, ReclaimStats};
pub use registry::Snapshot;
pub use txn::Transaction;
pub use verso_error::{Result, VersoError};
pub use verso_types::{Epoch, SnapshotId, SnapshotStatus, TxnId};

pub(crate) struct RuntimeInner {
    pub(crate) clock: Arc<EpochClock>,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) registry: SnapshotRegistry,
    pub(crate) reclaimer: Arc<EpochReclaimer>,
    pub(crate) fence: Arc<CompressionFence>,
    compression: CompressionConfig,
    next_txn: AtomicU64,
    next_snapshot: AtomicU64,
}

/// Handle to one MVCC runtime. Cheap to clone; clones share state.
///
/// The epoch clock and the snapshot registry are logically inseparable and
/// share this value's lifetime. Everything a cell or transaction needs is
/// reached through here; there are no process-wide globals.
#[derive(Clone)]
pub struct MvccRuntime {
    inner: Arc<RuntimeInner>,
}

impl Default for MvccRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MvccRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::with_start_epoch(Epoch(1))
    }

    /// Start the clock at `epoch` instead of 1. Diagnostic and test hook;
    /// also the way to exercise clock ranges near overflow.
    #[must_use]
    pub fn with_start_epoch(epoch: Epoch) -> Self {
        Self::with_config(epoch, CompressionConfig::default())
    }

    #[must_use]
    pub fn with_config(start_epoch: Epoch, compression: CompressionConfig) -> Self {
        let clock = Arc::new(EpochClock::new(start_epoch));
        let registry = SnapshotRegistry::new(Arc::clone(&clock));
        Self {
            inner: Arc::new(RuntimeInner {
                clock,
                commit_lock: Mutex::new(()),
                registry,
                reclaimer: Arc::new(EpochReclaimer::default()),
                fence: Arc::new(CompressionFence::default()),
                compression,
                next_txn: AtomicU64::new(1),
                next_snapshot: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// The next epoch to be assigned.
    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.inner.clock.current()
    }

    /// Lower bound on epochs any live snapshot may observe.
    #[must_use]
    pub fn earliest_epoch(&self) -> Epoch {
        self.inner.clock.earliest()
    }

    /// Open a transaction at the current epoch.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        let txn_id = TxnId(self.inner.next_txn.fetch_add(1, Ordering::Relaxed));
        let snapshot_id = SnapshotId(self.inner.next_snapshot.fetch_add(1, Ordering::Relaxed));
        Transaction::new(Arc::clone(&self.inner), txn_id, snapshot_id)
    }

    /// Run `f` with a transaction bound to this thread, then commit it.
    ///
    /// Inside `f`, [`Versioned::read`], [`Versioned::write`], and
    /// [`Versioned::update`] address the bound transaction without an
    /// explicit handle. Returns `f`'s result and whether the commit landed.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already bound to this thread.
    pub fn in_transaction<R>(&self, f: impl FnOnce() -> R) -> (R, bool) {
        struct Unbind;
        impl Drop for Unbind {
            fn drop(&mut self) {
                drop(txn::take_current());
            }
        }

        txn::bind_current(self.begin());
        // Aborts the bound transaction if `f` unwinds; a no-op otherwise
        // because the slot is already empty by the time it drops.
        let _unbind = Unbind;
        let result = f();
        let mut transaction = txn::take_current()
            .expect("the thread-bound transaction disappeared during in_transaction");
        let committed = transaction.commit();
        (result, committed)
    }

    /// Number of epochs with live snapshots.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.registry.entry_count()
    }

    /// Rename the live epoch space into a small dense range.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if a boundary rename would break an object's
    /// strictly-increasing order: corrupted state, not a recoverable
    /// condition.
    pub fn compress_epochs(&self) -> Result<()> {
        compress::compress_epochs(&self.inner)
    }

    /// Compress if `current_epoch` has reached the configured threshold.
    /// Returns whether compression ran.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::compress_epochs`] failures.
    pub fn maybe_compress_epochs(&self) -> Result<bool> {
        if self.current_epoch() >= self.inner.compression.min_current_epoch {
            self.compress_epochs()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Deferred-reclamation counters.
    #[must_use]
    pub fn reclaim_stats(&self) -> ReclaimStats {
        self.inner.reclaimer.stats()
    }

    /// Best-effort pass flushing deferred destructors.
    pub fn collect(&self) {
        self.inner.reclaimer.collect();
    }

    /// Diagnostic dump of the registry and the global epochs.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.inner.registry.dump_into(&mut out);
        let stats = self.reclaim_stats();
        let _ = writeln!(
            out,
            "reclaimer: {} retired, {} reclaimed, {} pending",
            stats.retired,
            stats.reclaimed,
            stats.pending()
        );
        out
    }

    /// Check the registry invariants.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        self.inner.registry.validate()
    }
}

impl std::fmt::Debug for MvccRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MvccRuntime")
            .field("current_epoch", &self.current_epoch())
            .field("earliest_epoch", &self.earliest_epoch())
            .field("entry_count", &self.entry_count())
            .finish()
    }
}
