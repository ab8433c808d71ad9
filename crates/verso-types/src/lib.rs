#![forbid(unsafe_code)]
//! Shared newtypes for the verso MVCC runtime.
//!
//! Everything here is a plain value type: logical timestamps, process-unique
//! identifiers, and the snapshot lifecycle status. The runtime crate
//! (`verso-mvcc`) builds on these.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic process-wide logical timestamp.
///
/// Epochs are assigned to snapshots at creation and to commits as they occur.
/// `Epoch::SENTINEL` marks the tail entry of a version history: the current
/// value has no upper validity bound.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Tail marker: the newest version is valid for every future epoch.
    ///
    /// Stored as 0 so that a freshly constructed history needs no special
    /// casing; ordering comparisons against it are never meaningful and the
    /// history code treats the tail entry specially instead.
    pub const SENTINEL: Epoch = Epoch(0);

    #[must_use]
    pub fn next(self) -> Epoch {
        Epoch(self.0.saturating_add(1))
    }

    #[must_use]
    pub fn is_sentinel(self) -> bool {
        self == Self::SENTINEL
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sentinel() {
            write!(f, "∞")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Process-unique identifier for a registered snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Process-unique identifier for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Lifecycle status of a snapshot.
///
/// The `Restarting*` ladder records progress through snapshot removal and
/// re-registration; the diagnostic dump prints the last state a snapshot
/// reached, which narrows down where a stuck or corrupted snapshot was last
/// seen alive.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum SnapshotStatus {
    #[default]
    Uninitialized,
    Initialized,
    Restarting,
    /// Removal requested; registry lock not yet taken.
    Restarting0,
    /// Registry entry located, snapshot about to be detached.
    Restarting0A,
    /// Snapshot detached, cleanup pending.
    Restarting0B,
    /// Re-registration underway.
    Restarting2,
    Restarted,
    Committing,
    Committed,
    Failed,
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapshotStatus::Uninitialized => "UNINITIALIZED",
            SnapshotStatus::Initialized => "INITIALIZED",
            SnapshotStatus::Restarting => "RESTARTING",
            SnapshotStatus::Restarting0 => "RESTARTING0",
            SnapshotStatus::Restarting0A => "RESTARTING0A",
            SnapshotStatus::Restarting0B => "RESTARTING0B",
            SnapshotStatus::Restarting2 => "RESTARTING2",
            SnapshotStatus::Restarted => "RESTARTED",
            SnapshotStatus::Committing => "COMMITTING",
            SnapshotStatus::Committed => "COMMITTED",
            SnapshotStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

impl SnapshotStatus {
    /// Whether the snapshot has reached a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SnapshotStatus::Committed | SnapshotStatus::Failed | SnapshotStatus::Restarted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_ordering_and_next() {
        assert!(Epoch(5) < Epoch(6));
        assert_eq!(Epoch(5).next(), Epoch(6));
        assert_eq!(Epoch(u64::MAX).next(), Epoch(u64::MAX));
    }

    #[test]
    fn sentinel_displays_as_infinity() {
        assert_eq!(Epoch::SENTINEL.to_string(), "∞");
        assert_eq!(Epoch(601).to_string(), "601");
        assert!(Epoch::SENTINEL.is_sentinel());
        assert!(!Epoch(1).is_sentinel());
    }

    #[test]
    fn status_display_matches_names() {
        assert_eq!(SnapshotStatus::Restarting0A.to_string(), "RESTARTING0A");
        assert_eq!(SnapshotStatus::Committed.to_string(), "COMMITTED");
        assert!(SnapshotStatus::Failed.is_terminal());
        assert!(!SnapshotStatus::Committing.is_terminal());
    }
}
