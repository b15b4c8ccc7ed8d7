// quarry-core/src/index/build.rs
//! Two-phase index build state.
//!
//! ```text
//! Scanning ──> Draining ──> Committing ──> Committed
//!     │            │             │
//!     └────────────┴─────────────┴──────> Aborted
//! ```
//!
//! While a build is in progress, writers do not touch the new index tree.
//! They push [`SideWrite`]s onto a lock-free queue instead; the builder
//! applies each one once the owning transaction has committed (at its commit
//! timestamp) and discards those whose transaction aborted.

use std::sync::Arc;

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::error::{QuarryError, Result};
use crate::log_debug;
use crate::storage::RecordId;
use crate::txn::{Timestamp, TxnShared, TxnState};

use super::key::IndexKey;
use super::tree::IndexTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Scanning,
    Draining,
    Committing,
    Committed,
    Aborted,
}

impl BuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Scanning => "scanning",
            BuildPhase::Draining => "draining",
            BuildPhase::Committing => "committing",
            BuildPhase::Committed => "committed",
            BuildPhase::Aborted => "aborted",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, BuildPhase::Committed | BuildPhase::Aborted)
    }

    fn can_advance_to(&self, next: BuildPhase) -> bool {
        matches!(
            (self, next),
            (BuildPhase::Scanning, BuildPhase::Draining)
                | (BuildPhase::Draining, BuildPhase::Committing)
                | (BuildPhase::Committing, BuildPhase::Committed)
        )
    }
}

/// A key change made by a writer while the build was running.
pub struct SideWrite {
    pub key: IndexKey,
    pub rid: RecordId,
    pub insert: bool,
    pub txn: Arc<TxnShared>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub applied: usize,
    pub discarded: usize,
    /// Still owned by an unresolved transaction and requeued.
    pub pending: usize,
}

struct BuildState {
    phase: BuildPhase,
    abort_reason: Option<String>,
}

pub struct IndexBuild {
    pub id: u64,
    pub ns: String,
    pub index_name: String,
    /// Snapshot the collection scan reads at.
    pub scan_ts: Timestamp,
    state: Mutex<BuildState>,
    side_writes: SegQueue<SideWrite>,
}

impl IndexBuild {
    pub fn new(id: u64, ns: impl Into<String>, index_name: impl Into<String>, scan_ts: Timestamp) -> Self {
        IndexBuild {
            id,
            ns: ns.into(),
            index_name: index_name.into(),
            scan_ts,
            state: Mutex::new(BuildState {
                phase: BuildPhase::Scanning,
                abort_reason: None,
            }),
            side_writes: SegQueue::new(),
        }
    }

    pub fn phase(&self) -> BuildPhase {
        self.state.lock().phase
    }

    /// Fail with `IndexBuildAborted` once the build has been aborted.
    pub fn check_not_aborted(&self) -> Result<()> {
        let state = self.state.lock();
        match state.phase {
            BuildPhase::Aborted => Err(QuarryError::IndexBuildAborted(
                state
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| format!("index build {} aborted", self.index_name)),
            )),
            _ => Ok(()),
        }
    }

    /// Move to the next phase. Fails if the build was aborted meanwhile or
    /// the transition skips a phase.
    pub fn advance(&self, next: BuildPhase) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase == BuildPhase::Aborted {
            drop(state);
            return self.check_not_aborted();
        }
        if !state.phase.can_advance_to(next) {
            return Err(QuarryError::new(
                crate::error::ErrorCode::IllegalOperation,
                format!(
                    "index build {} cannot move from {} to {}",
                    self.index_name,
                    state.phase.as_str(),
                    next.as_str()
                ),
            ));
        }
        log_debug!(
            "index build {} on {}: {} -> {}",
            self.index_name,
            self.ns,
            state.phase.as_str(),
            next.as_str()
        );
        state.phase = next;
        Ok(())
    }

    /// Abort unless already terminal. Returns whether this call aborted it.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return false;
        }
        state.phase = BuildPhase::Aborted;
        state.abort_reason = Some(reason.into());
        while self.side_writes.pop().is_some() {}
        true
    }

    pub fn push_side_write(&self, write: SideWrite) {
        self.side_writes.push(write);
    }

    pub fn side_writes_len(&self) -> usize {
        self.side_writes.len()
    }

    /// Apply every side write whose transaction has resolved.
    pub fn drain(&self, tree: &IndexTree) -> DrainStats {
        let mut stats = DrainStats::default();
        let mut requeue = Vec::new();
        while let Some(write) = self.side_writes.pop() {
            match write.txn.state() {
                TxnState::Committed => {
                    let ts = write.txn.commit_ts().unwrap_or(self.scan_ts);
                    tree.apply_committed(write.key, write.rid, ts, write.insert);
                    stats.applied += 1;
                }
                TxnState::Aborted => stats.discarded += 1,
                TxnState::Active | TxnState::Prepared => requeue.push(write),
            }
        }
        stats.pending = requeue.len();
        for write in requeue {
            self.side_writes.push(write);
        }
        stats
    }
}

impl std::fmt::Debug for IndexBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexBuild")
            .field("id", &self.id)
            .field("ns", &self.ns)
            .field("index", &self.index_name)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::index::key::KeyPart;
    use crate::txn::ReadView;
    use crate::value::Value;

    fn key(v: i32) -> IndexKey {
        IndexKey(vec![KeyPart::Asc(Value::Int32(v))])
    }

    #[test]
    fn test_phases_advance_in_order() {
        let build = IndexBuild::new(1, "test.c", "a_1", 5);
        assert!(build.advance(BuildPhase::Committing).is_err());
        build.advance(BuildPhase::Draining).unwrap();
        build.advance(BuildPhase::Committing).unwrap();
        build.advance(BuildPhase::Committed).unwrap();
        assert!(!build.abort("late"));
        assert_eq!(build.phase(), BuildPhase::Committed);
    }

    #[test]
    fn test_abort_is_observed() {
        let build = IndexBuild::new(1, "test.c", "a_1", 5);
        assert!(build.abort("dropped"));
        let err = build.advance(BuildPhase::Draining).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IndexBuildAborted);
        assert!(err.to_string().contains("dropped"));
    }

    #[test]
    fn test_drain_applies_only_resolved_writes() {
        let build = IndexBuild::new(1, "test.c", "a_1", 5);
        let tree = IndexTree::new();
        let committed = TxnShared::new_for_test(1, 5);
        committed.set_commit_ts(8);
        committed.set_state(TxnState::Committed);
        let aborted = TxnShared::new_for_test(2, 5);
        aborted.set_state(TxnState::Aborted);
        let active = TxnShared::new_for_test(3, 5);

        build.push_side_write(SideWrite { key: key(1), rid: 1, insert: true, txn: committed });
        build.push_side_write(SideWrite { key: key(2), rid: 2, insert: true, txn: aborted });
        build.push_side_write(SideWrite { key: key(3), rid: 3, insert: true, txn: active.clone() });

        let stats = build.drain(&tree);
        assert_eq!(stats, DrainStats { applied: 1, discarded: 1, pending: 1 });
        assert_eq!(tree.visible_entries(&ReadView { read_ts: 8, reader: None }), vec![(key(1), 1)]);
        assert!(tree.visible_entries(&ReadView { read_ts: 7, reader: None }).is_empty());

        active.set_commit_ts(9);
        active.set_state(TxnState::Committed);
        assert_eq!(build.drain(&tree).applied, 1);
        assert_eq!(build.side_writes_len(), 0);
    }
}
