// quarry-core/src/storage/record_store.rs
//! Multi-versioned record storage for one collection.
//!
//! # Architecture
//!
//! ```text
//! RecordStore
//!   └── RwLock<BTreeMap<RecordId, VersionChain<Arc<Document>>>>
//!         committed versions (ascending ts) + at most one intent
//! ```
//!
//! Record ids are allocated monotonically, so ascending id order is natural
//! (insertion) order. Writers install intents; the owning transaction turns
//! them into committed versions at its commit timestamp or discards them on
//! abort. Readers never take more than the read lock and never wait on
//! writers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::mvcc::{VersionChain, WriteCheck};
use crate::txn::{PendingWrite, ReadView, Timestamp, TxnId, WriteContext};

pub type RecordId = u64;

/// Direction of a natural-order scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

#[derive(Default)]
pub struct RecordStore {
    records: RwLock<BTreeMap<RecordId, VersionChain<Arc<Document>>>>,
    next_id: AtomicU64,
}

impl RecordStore {
    pub fn new() -> Self {
        RecordStore {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    // ========== READS ==========

    pub fn find(&self, rid: RecordId, view: &ReadView) -> Option<Arc<Document>> {
        self.records.read().get(&rid).and_then(|chain| chain.read(view).cloned())
    }

    /// Up to `limit` visible records after the resume token `after`
    /// (exclusive), in natural order or its reverse.
    pub fn scan_batch(
        &self,
        view: &ReadView,
        after: Option<RecordId>,
        direction: ScanDirection,
        limit: usize,
    ) -> Vec<(RecordId, Arc<Document>)> {
        use std::ops::Bound::{Excluded, Unbounded};

        let records = self.records.read();
        let mut batch = Vec::with_capacity(limit.min(256));
        let visible = |(rid, chain): (&RecordId, &VersionChain<Arc<Document>>)| {
            chain.read(view).map(|doc| (*rid, doc.clone()))
        };
        match direction {
            ScanDirection::Forward => {
                let lower = after.map(Excluded).unwrap_or(Unbounded);
                batch.extend(records.range((lower, Unbounded)).filter_map(visible).take(limit));
            }
            ScanDirection::Backward => {
                let upper = after.map(Excluded).unwrap_or(Unbounded);
                batch.extend(records.range((Unbounded, upper)).rev().filter_map(visible).take(limit));
            }
        }
        batch
    }

    /// Number of records visible at `view`.
    pub fn count(&self, view: &ReadView) -> usize {
        self.records.read().values().filter(|c| c.read(view).is_some()).count()
    }

    /// Physical record chains, including tombstones not yet reclaimed.
    pub fn chain_count(&self) -> usize {
        self.records.read().len()
    }

    pub fn version_count(&self) -> usize {
        self.records.read().values().map(|c| c.version_count()).sum()
    }

    // ========== WRITES ==========

    pub fn insert(self: &Arc<Self>, w: &WriteContext<'_>, doc: Document) -> Result<RecordId> {
        let rid = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut chain = VersionChain::new();
        chain.set_intent(w.txn, Some(Arc::new(doc)));
        self.records.write().insert(rid, chain);
        w.txn.register_write(PendingWrite::Record {
            store: self.clone(),
            rid,
        });
        Ok(rid)
    }

    /// Replace the record's visible version, returning the previous one.
    pub fn update(self: &Arc<Self>, w: &WriteContext<'_>, rid: RecordId, doc: Document) -> Result<Arc<Document>> {
        self.write_version(w, rid, Some(Arc::new(doc)))
    }

    /// Tombstone the record, returning the removed version.
    pub fn remove(self: &Arc<Self>, w: &WriteContext<'_>, rid: RecordId) -> Result<Arc<Document>> {
        self.write_version(w, rid, None)
    }

    fn write_version(
        self: &Arc<Self>,
        w: &WriteContext<'_>,
        rid: RecordId,
        value: Option<Arc<Document>>,
    ) -> Result<Arc<Document>> {
        loop {
            let owner = {
                let mut records = self.records.write();
                let chain = records.get_mut(&rid).ok_or_else(|| record_missing(rid))?;
                match chain.check_write(w.txn) {
                    WriteCheck::Allowed => {
                        let old = chain.read(&w.txn.view()).cloned().ok_or_else(|| record_missing(rid))?;
                        if chain.set_intent(w.txn, value) {
                            drop(records);
                            w.txn.register_write(PendingWrite::Record {
                                store: self.clone(),
                                rid,
                            });
                        }
                        return Ok(old);
                    }
                    WriteCheck::Conflict => return Err(QuarryError::WriteConflict),
                    WriteCheck::Prepared(owner) => owner,
                }
            };
            w.wait_for_prepared(&owner)?;
        }
    }

    pub(crate) fn commit_intent(&self, rid: RecordId, txn: TxnId, ts: Timestamp) {
        if let Some(chain) = self.records.write().get_mut(&rid) {
            chain.commit_intent(txn, ts);
        }
    }

    pub(crate) fn abort_intent(&self, rid: RecordId, txn: TxnId) {
        let mut records = self.records.write();
        if let Some(chain) = records.get_mut(&rid) {
            chain.abort_intent(txn);
            if chain.is_empty() {
                records.remove(&rid);
            }
        }
    }

    /// Install a committed version directly (recovery and checkpoint load).
    pub(crate) fn insert_committed(&self, rid: RecordId, ts: Timestamp, doc: Option<Document>) {
        self.next_id.fetch_max(rid + 1, Ordering::SeqCst);
        self.records
            .write()
            .entry(rid)
            .or_default()
            .insert_committed(ts, doc.map(Arc::new));
    }

    /// Reclaim versions no reader at or above `floor` can see.
    pub fn gc(&self, floor: Timestamp) -> usize {
        let mut records = self.records.write();
        let mut reclaimed = 0;
        records.retain(|_, chain| {
            reclaimed += chain.prune(floor);
            !chain.is_empty()
        });
        reclaimed
    }
}

fn record_missing(rid: RecordId) -> QuarryError {
    QuarryError::new(ErrorCode::NoSuchKey, format!("record {} is not visible", rid))
}
