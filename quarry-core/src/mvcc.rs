// quarry-core/src/mvcc.rs
//! Multi-version chains shared by the record store and index trees.
//!
//! A chain holds committed versions in ascending timestamp order plus at most
//! one uncommitted intent. The intent belongs to exactly one transaction;
//! any other writer touching the chain while the intent exists conflicts
//! (first writer wins), or waits if the owner is prepared.

use std::sync::Arc;

use crate::txn::{ReadView, Timestamp, TxnId, TxnShared, TxnState};

#[derive(Debug, Clone)]
pub struct CommittedVersion<T> {
    pub ts: Timestamp,
    /// `None` is a tombstone.
    pub value: Option<T>,
}

pub struct Intent<T> {
    pub owner: Arc<TxnShared>,
    pub value: Option<T>,
}

/// Outcome of asking whether a transaction may write a chain.
pub enum WriteCheck {
    Allowed,
    /// Another active writer holds an intent, or a newer version was
    /// committed after the writer's snapshot.
    Conflict,
    /// The intent owner is prepared; the writer must wait for it to resolve.
    Prepared(Arc<TxnShared>),
}

pub struct VersionChain<T> {
    versions: Vec<CommittedVersion<T>>,
    intent: Option<Intent<T>>,
}

impl<T: Clone> Default for VersionChain<T> {
    fn default() -> Self {
        VersionChain::new()
    }
}

impl<T: Clone> VersionChain<T> {
    pub fn new() -> Self {
        VersionChain {
            versions: Vec::new(),
            intent: None,
        }
    }

    pub fn committed(ts: Timestamp, value: Option<T>) -> Self {
        VersionChain {
            versions: vec![CommittedVersion { ts, value }],
            intent: None,
        }
    }

    /// Value visible to `view`: the reader's own intent first, then the
    /// newest committed version at or below the read timestamp.
    pub fn read(&self, view: &ReadView) -> Option<&T> {
        if let (Some(intent), Some(reader)) = (&self.intent, view.reader) {
            if intent.owner.id == reader {
                return intent.value.as_ref();
            }
        }
        self.versions
            .iter()
            .rev()
            .find(|v| v.ts <= view.read_ts)
            .and_then(|v| v.value.as_ref())
    }

    /// Newest committed value regardless of snapshot.
    pub fn latest(&self) -> Option<&T> {
        self.versions.last().and_then(|v| v.value.as_ref())
    }

    pub fn newest_ts(&self) -> Option<Timestamp> {
        self.versions.last().map(|v| v.ts)
    }

    pub fn intent_owner(&self) -> Option<&Arc<TxnShared>> {
        self.intent.as_ref().map(|i| &i.owner)
    }

    pub fn check_write(&self, txn: &TxnShared) -> WriteCheck {
        if let Some(intent) = &self.intent {
            if intent.owner.id == txn.id {
                return WriteCheck::Allowed;
            }
            return match intent.owner.state() {
                TxnState::Prepared => WriteCheck::Prepared(intent.owner.clone()),
                _ => WriteCheck::Conflict,
            };
        }
        match self.newest_ts() {
            Some(ts) if ts > txn.read_ts => WriteCheck::Conflict,
            _ => WriteCheck::Allowed,
        }
    }

    /// Install or overwrite the writer's intent. Returns true when the intent
    /// is new, meaning the caller must register it with the transaction.
    pub fn set_intent(&mut self, owner: &Arc<TxnShared>, value: Option<T>) -> bool {
        match &mut self.intent {
            Some(intent) if intent.owner.id == owner.id => {
                intent.value = value;
                false
            }
            _ => {
                self.intent = Some(Intent {
                    owner: owner.clone(),
                    value,
                });
                true
            }
        }
    }

    pub fn commit_intent(&mut self, txn: TxnId, ts: Timestamp) {
        if self.intent.as_ref().map(|i| i.owner.id) == Some(txn) {
            if let Some(intent) = self.intent.take() {
                self.insert_committed(ts, intent.value);
            }
        }
    }

    pub fn abort_intent(&mut self, txn: TxnId) {
        if self.intent.as_ref().map(|i| i.owner.id) == Some(txn) {
            self.intent = None;
        }
    }

    /// Insert a committed version keeping timestamp order. A version equal to
    /// an existing timestamp replaces it.
    pub fn insert_committed(&mut self, ts: Timestamp, value: Option<T>) {
        let pos = self.versions.partition_point(|v| v.ts < ts);
        if pos < self.versions.len() && self.versions[pos].ts == ts {
            self.versions[pos].value = value;
        } else {
            self.versions.insert(pos, CommittedVersion { ts, value });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.intent.is_none()
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Drop versions no snapshot at or above `floor` can see. Returns the
    /// number of versions reclaimed.
    pub fn prune(&mut self, floor: Timestamp) -> usize {
        // Newest version at or below the floor is still visible to readers at the floor.
        let keep_from = match self.versions.iter().rposition(|v| v.ts <= floor) {
            Some(pos) => pos,
            None => return 0,
        };
        let mut reclaimed = keep_from;
        self.versions.drain(..keep_from);
        if self.intent.is_none()
            && self.versions.len() == 1
            && self.versions[0].value.is_none()
            && self.versions[0].ts <= floor
        {
            self.versions.clear();
            reclaimed += 1;
        }
        reclaimed
    }
}
