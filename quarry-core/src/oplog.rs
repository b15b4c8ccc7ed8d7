// quarry-core/src/oplog.rs
//! Change records produced by committed writes.
//!
//! Writers stage one [`StagedOp`] per logical change inside their
//! transaction. At commit the coordinator journals the staged ops (durability)
//! and then publishes them as [`OplogEntry`] values sharing the commit
//! timestamp, while that timestamp is still in flight. A reader whose
//! snapshot includes a commit therefore also sees its oplog entries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::storage::Journal;
use crate::txn::{Timestamp, TxnId};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "i",
            OpKind::Update => "u",
            OpKind::Delete => "d",
            OpKind::Command => "c",
            OpKind::Noop => "n",
        }
    }
}

/// One change staged by a transaction. Updates carry the full post-image in
/// `o` and the document key in `o2`; deletes carry the document key in `o`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedOp {
    pub kind: OpKind,
    pub ns: String,
    pub o: Document,
    pub o2: Option<Document>,
}

impl StagedOp {
    pub fn new(kind: OpKind, ns: impl Into<String>, o: Document, o2: Option<Document>) -> Self {
        StagedOp {
            kind,
            ns: ns.into(),
            o,
            o2,
        }
    }
}

/// Durable record written to the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    Commit {
        ts: Timestamp,
        txn_id: TxnId,
        ops: Vec<StagedOp>,
    },
    Prepare {
        txn_id: TxnId,
        read_ts: Timestamp,
        prepare_ts: Timestamp,
        ops: Vec<StagedOp>,
    },
    CommitPrepared {
        txn_id: TxnId,
        commit_ts: Timestamp,
    },
    AbortPrepared {
        txn_id: TxnId,
    },
}

#[derive(Debug, Clone)]
pub struct OplogEntry {
    pub ts: Timestamp,
    pub seq: u32,
    pub op: OpKind,
    pub ns: String,
    pub o: Document,
    pub o2: Option<Document>,
    pub txn_id: Option<TxnId>,
    /// Wall clock milliseconds at publication.
    pub wall: i64,
}

impl OplogEntry {
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("ts", Value::Int64(self.ts as i64));
        doc.insert("seq", Value::Int32(self.seq as i32));
        doc.insert("op", self.op.as_str());
        doc.insert("ns", self.ns.as_str());
        doc.insert("o", self.o.clone());
        if let Some(o2) = &self.o2 {
            doc.insert("o2", o2.clone());
        }
        if let Some(txn) = self.txn_id {
            doc.insert("txnNumber", Value::Int64(txn as i64));
        }
        doc.insert("wall", Value::Date(self.wall));
        doc
    }
}

pub struct Oplog {
    entries: RwLock<BTreeMap<(Timestamp, u32), OplogEntry>>,
    max_entries: usize,
    journal: Option<Mutex<Journal>>,
    replaying: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Oplog {
    pub fn in_memory(max_entries: usize, metrics: Arc<Metrics>) -> Self {
        Oplog {
            entries: RwLock::new(BTreeMap::new()),
            max_entries: max_entries.max(1),
            journal: None,
            replaying: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn with_journal(journal: Journal, max_entries: usize, metrics: Arc<Metrics>) -> Self {
        Oplog {
            journal: Some(Mutex::new(journal)),
            ..Oplog::in_memory(max_entries, metrics)
        }
    }

    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    /// While replaying, journal writes are suppressed.
    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.replaying.store(replaying, Ordering::SeqCst);
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    pub(crate) fn journal(&self, record: &JournalRecord) -> Result<()> {
        if self.is_replaying() {
            return Ok(());
        }
        match &self.journal {
            Some(journal) => journal.lock().append(record),
            None => Ok(()),
        }
    }

    pub(crate) fn read_journal(&self) -> Result<Vec<JournalRecord>> {
        match &self.journal {
            Some(journal) => journal.lock().read_all(),
            None => Ok(Vec::new()),
        }
    }

    /// Rewrite the journal with the records `keep` selects, holding the
    /// journal lock so no commit can slip in between read and rewrite.
    /// Returns the number of records kept.
    pub(crate) fn compact_journal<F>(&self, keep: F) -> Result<usize>
    where
        F: FnOnce(Vec<JournalRecord>) -> Vec<JournalRecord>,
    {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let mut journal = journal.lock();
        let kept = keep(journal.read_all()?);
        journal.rewrite(&kept)?;
        Ok(kept.len())
    }

    pub fn flush(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.lock().flush(),
            None => Ok(()),
        }
    }

    /// Publish the ops of one commit at `ts`.
    pub(crate) fn publish(&self, ts: Timestamp, txn_id: Option<TxnId>, ops: &[StagedOp]) {
        if ops.is_empty() {
            return;
        }
        let wall = chrono::Utc::now().timestamp_millis();
        let mut entries = self.entries.write();
        let mut seq = entries
            .range((ts, 0)..=(ts, u32::MAX))
            .next_back()
            .map(|((_, s), _)| s + 1)
            .unwrap_or(0);
        for op in ops {
            entries.insert(
                (ts, seq),
                OplogEntry {
                    ts,
                    seq,
                    op: op.kind,
                    ns: op.ns.clone(),
                    o: op.o.clone(),
                    o2: op.o2.clone(),
                    txn_id,
                    wall,
                },
            );
            seq += 1;
        }
        while entries.len() > self.max_entries {
            entries.pop_first();
        }
        self.metrics.oplog_entries.add(ops.len() as u64);
    }

    /// Entries strictly after `after` and at or below `up_to`, optionally
    /// restricted to one exact namespace.
    pub fn entries_between(
        &self,
        after: Option<(Timestamp, u32)>,
        up_to: Timestamp,
        ns: Option<&str>,
        limit: usize,
    ) -> Vec<OplogEntry> {
        let entries = self.entries.read();
        let iter: Box<dyn Iterator<Item = (&(Timestamp, u32), &OplogEntry)>> = match after {
            Some(pos) => Box::new(entries.range((std::ops::Bound::Excluded(pos), std::ops::Bound::Unbounded))),
            None => Box::new(entries.iter()),
        };
        iter.take_while(|((ts, _), _)| *ts <= up_to)
            .filter(|(_, e)| match ns {
                Some(ns) => e.ns == ns,
                None => true,
            })
            .map(|(_, e)| e.clone())
            .take(limit)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn latest_ts(&self) -> Option<Timestamp> {
        self.entries.read().keys().next_back().map(|(ts, _)| *ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn oplog(max: usize) -> Oplog {
        Oplog::in_memory(max, Arc::new(Metrics::new()))
    }

    #[test]
    fn test_entries_share_commit_ts() {
        let log = oplog(100);
        let ops = vec![
            StagedOp::new(OpKind::Insert, "test.a", doc!({"_id": 1}), None),
            StagedOp::new(OpKind::Insert, "test.b", doc!({"_id": 2}), None),
        ];
        log.publish(7, Some(3), &ops);
        let all = log.entries_between(None, u64::MAX, None, usize::MAX);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|e| e.ts == 7));
        assert_eq!(all[0].seq, 0);
        assert_eq!(all[1].seq, 1);
        assert_eq!(all[0].to_document().get("op"), Some(&Value::from("i")));
    }

    #[test]
    fn test_filtering_and_bounds() {
        let log = oplog(100);
        for ts in 1..=5u64 {
            let ns = if ts % 2 == 0 { "test.even" } else { "test.odd" };
            log.publish(ts, None, &[StagedOp::new(OpKind::Insert, ns, doc!({"_id": ts as i64}), None)]);
        }
        let odd = log.entries_between(None, 4, Some("test.odd"), usize::MAX);
        assert_eq!(odd.iter().map(|e| e.ts).collect::<Vec<_>>(), vec![1, 3]);
        let after = log.entries_between(Some((2, 0)), u64::MAX, None, usize::MAX);
        assert_eq!(after.iter().map(|e| e.ts).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn test_retention_cap() {
        let log = oplog(3);
        for ts in 1..=10u64 {
            log.publish(ts, None, &[StagedOp::new(OpKind::Noop, "", Document::new(), None)]);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.entries_between(None, u64::MAX, None, 10)[0].ts, 8);
    }
}
