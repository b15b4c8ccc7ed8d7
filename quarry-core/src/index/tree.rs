// quarry-core/src/index/tree.rs
//! Versioned ordered index storage.
//!
//! Entries are `(key, record id)` pairs, each with its own version chain, so
//! a reader at any snapshot sees exactly the keys of the document versions
//! visible at that snapshot. Non-unique keys tie-break by record id.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{QuarryError, Result};
use crate::mvcc::{VersionChain, WriteCheck};
use crate::storage::RecordId;
use crate::txn::{PendingWrite, ReadView, Timestamp, TxnId, TxnShared, WriteContext};

use super::bounds::{upper_sentinel, IndexBounds};
use super::key::{Direction, IndexKey};

pub type IndexEntryKey = (IndexKey, RecordId);

/// Identity used to report a duplicate key.
pub struct UniqueConstraint<'a> {
    pub ns: &'a str,
    pub index_name: &'a str,
    pub describe: &'a dyn Fn(&IndexKey) -> String,
}

/// One page of an index scan.
#[derive(Debug, Default)]
pub struct ScanBatch {
    pub entries: Vec<IndexEntryKey>,
    pub keys_examined: usize,
    /// True when the bounds are exhausted.
    pub done: bool,
}

enum Attempt {
    Done { fresh: bool },
    Wait(Arc<TxnShared>),
}

#[derive(Default)]
pub struct IndexTree {
    entries: RwLock<BTreeMap<IndexEntryKey, VersionChain<()>>>,
}

impl IndexTree {
    pub fn new() -> Self {
        IndexTree::default()
    }

    // ========== WRITES ==========

    /// Add `key -> rid` as an intent of the writing transaction. With a unique
    /// constraint, every other record holding the same key decides the
    /// outcome: an active foreign intent or a change committed after the
    /// writer's snapshot is a write conflict, a prepared owner is waited for,
    /// and a key visible at the snapshot is a duplicate.
    pub fn insert_key(
        self: &Arc<Self>,
        w: &WriteContext<'_>,
        key: IndexKey,
        rid: RecordId,
        unique: Option<&UniqueConstraint<'_>>,
    ) -> Result<()> {
        loop {
            let attempt = {
                let mut entries = self.entries.write();
                let mut wait = None;
                if let Some(constraint) = unique {
                    wait = check_unique(&entries, w.txn, &key, rid, constraint)?;
                }
                match wait {
                    Some(owner) => Attempt::Wait(owner),
                    None => {
                        let chain = entries.entry((key.clone(), rid)).or_default();
                        match chain.check_write(w.txn) {
                            WriteCheck::Allowed => Attempt::Done {
                                fresh: chain.set_intent(w.txn, Some(())),
                            },
                            WriteCheck::Conflict => return Err(QuarryError::WriteConflict),
                            WriteCheck::Prepared(owner) => Attempt::Wait(owner),
                        }
                    }
                }
            };
            match attempt {
                Attempt::Done { fresh } => {
                    if fresh {
                        w.txn.register_write(PendingWrite::IndexKey {
                            tree: self.clone(),
                            key,
                            rid,
                        });
                    }
                    return Ok(());
                }
                Attempt::Wait(owner) => w.wait_for_prepared(&owner)?,
            }
        }
    }

    /// Remove `key -> rid` as an intent of the writing transaction.
    pub fn remove_key(self: &Arc<Self>, w: &WriteContext<'_>, key: IndexKey, rid: RecordId) -> Result<()> {
        loop {
            let attempt = {
                let mut entries = self.entries.write();
                let Some(chain) = entries.get_mut(&(key.clone(), rid)) else {
                    return Ok(());
                };
                match chain.check_write(w.txn) {
                    WriteCheck::Allowed => Attempt::Done {
                        fresh: chain.set_intent(w.txn, None),
                    },
                    WriteCheck::Conflict => return Err(QuarryError::WriteConflict),
                    WriteCheck::Prepared(owner) => Attempt::Wait(owner),
                }
            };
            match attempt {
                Attempt::Done { fresh } => {
                    if fresh {
                        w.txn.register_write(PendingWrite::IndexKey {
                            tree: self.clone(),
                            key,
                            rid,
                        });
                    }
                    return Ok(());
                }
                Attempt::Wait(owner) => w.wait_for_prepared(&owner)?,
            }
        }
    }

    pub(crate) fn commit_intent(&self, key: &IndexKey, rid: RecordId, txn: TxnId, ts: Timestamp) {
        if let Some(chain) = self.entries.write().get_mut(&(key.clone(), rid)) {
            chain.commit_intent(txn, ts);
        }
    }

    pub(crate) fn abort_intent(&self, key: &IndexKey, rid: RecordId, txn: TxnId) {
        let mut entries = self.entries.write();
        let entry = (key.clone(), rid);
        if let Some(chain) = entries.get_mut(&entry) {
            chain.abort_intent(txn);
            if chain.is_empty() {
                entries.remove(&entry);
            }
        }
    }

    /// Record a committed presence (`present`) or absence of `key -> rid` at
    /// `ts`. Used by bulk loads, side-write drains and recovery.
    pub(crate) fn apply_committed(&self, key: IndexKey, rid: RecordId, ts: Timestamp, present: bool) {
        let mut entries = self.entries.write();
        entries
            .entry((key, rid))
            .or_default()
            .insert_committed(ts, present.then_some(()));
    }

    /// Bulk-load already sorted entries at `ts`.
    pub(crate) fn bulk_load<I>(&self, ts: Timestamp, sorted: I)
    where
        I: IntoIterator<Item = IndexEntryKey>,
    {
        let mut entries = self.entries.write();
        for entry in sorted {
            entries.insert(entry, VersionChain::committed(ts, Some(())));
        }
    }

    // ========== READS ==========

    /// Scan up to `limit` visible entries within `bounds`, in key order
    /// (`Ascending`) or reverse key order, strictly after `resume`.
    pub fn scan_batch(
        &self,
        view: &ReadView,
        bounds: &IndexBounds,
        directions: &[Direction],
        forward: bool,
        resume: Option<&IndexEntryKey>,
        limit: usize,
    ) -> ScanBatch {
        let entries = self.entries.read();
        let mut batch = ScanBatch::default();
        let mut ranges = bounds.first_field_ranges(directions);
        if !forward {
            ranges.reverse();
        }
        for (lo_key, hi_key) in ranges {
            let mut lower: Bound<IndexEntryKey> = Bound::Included((lo_key, 0));
            let mut upper: Bound<IndexEntryKey> = Bound::Included((hi_key, RecordId::MAX));
            if let Some(resume) = resume {
                if forward {
                    if bound_key(&upper).map_or(false, |u| u <= resume) {
                        continue;
                    }
                    if bound_key(&lower).map_or(true, |l| l <= resume) {
                        lower = Bound::Excluded(resume.clone());
                    }
                } else {
                    if bound_key(&lower).map_or(false, |l| l >= resume) {
                        continue;
                    }
                    if bound_key(&upper).map_or(true, |u| u >= resume) {
                        upper = Bound::Excluded(resume.clone());
                    }
                }
            }
            if !valid_range(&lower, &upper) {
                continue;
            }
            let range = entries.range((lower, upper));
            let iter: Box<dyn Iterator<Item = (&IndexEntryKey, &VersionChain<()>)>> =
                if forward { Box::new(range) } else { Box::new(range.rev()) };
            for (entry, chain) in iter {
                batch.keys_examined += 1;
                if chain.read(view).is_none() || !bounds.contains(&entry.0) {
                    continue;
                }
                batch.entries.push(entry.clone());
                if batch.entries.len() >= limit {
                    return batch;
                }
            }
        }
        batch.done = true;
        batch
    }

    /// Resume token that skips every remaining entry sharing `key`'s first
    /// component (used by distinct scans).
    pub fn skip_token(key: &IndexKey, width: usize, forward: bool) -> Option<IndexEntryKey> {
        let first = key.parts().first()?.clone();
        if forward {
            Some((upper_sentinel(first, width), RecordId::MAX))
        } else {
            Some((IndexKey(vec![first]), 0))
        }
    }

    pub fn visible_entries(&self, view: &ReadView) -> Vec<IndexEntryKey> {
        self.entries
            .read()
            .iter()
            .filter(|(_, chain)| chain.read(view).is_some())
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    /// Whether any key is present for two different records at `view`.
    pub fn find_duplicate(&self, view: &ReadView) -> Option<IndexKey> {
        let entries = self.entries.read();
        let mut previous: Option<&IndexKey> = None;
        for ((key, _), chain) in entries.iter() {
            if chain.read(view).is_none() {
                continue;
            }
            if previous == Some(key) {
                return Some(key.clone());
            }
            previous = Some(key);
        }
        None
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn gc(&self, floor: Timestamp) -> usize {
        let mut entries = self.entries.write();
        let mut reclaimed = 0;
        entries.retain(|_, chain| {
            reclaimed += chain.prune(floor);
            !chain.is_empty()
        });
        reclaimed
    }
}

fn check_unique(
    entries: &BTreeMap<IndexEntryKey, VersionChain<()>>,
    txn: &Arc<TxnShared>,
    key: &IndexKey,
    rid: RecordId,
    constraint: &UniqueConstraint<'_>,
) -> Result<Option<Arc<TxnShared>>> {
    let view = txn.view();
    for ((_, other), chain) in entries.range((key.clone(), 0)..=(key.clone(), RecordId::MAX)) {
        if *other == rid {
            continue;
        }
        match chain.check_write(txn) {
            WriteCheck::Conflict => return Err(QuarryError::WriteConflict),
            WriteCheck::Prepared(owner) => return Ok(Some(owner)),
            WriteCheck::Allowed => {}
        }
        if chain.read(&view).is_some() {
            return Err(QuarryError::DuplicateKey {
                ns: constraint.ns.to_string(),
                index: constraint.index_name.to_string(),
                key: (constraint.describe)(key),
            });
        }
    }
    Ok(None)
}

fn bound_key<T>(bound: &Bound<T>) -> Option<&T> {
    match bound {
        Bound::Included(k) | Bound::Excluded(k) => Some(k),
        Bound::Unbounded => None,
    }
}

fn valid_range(lower: &Bound<IndexEntryKey>, upper: &Bound<IndexEntryKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l <= u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l < u,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::index::bounds::{Interval, OrderedIntervalList};
    use crate::index::key::KeyPart;
    use crate::interrupt::OperationContext;
    use crate::metrics::Metrics;
    use crate::value::Value;
    use std::time::Duration;

    fn key(v: i32) -> IndexKey {
        IndexKey(vec![KeyPart::Asc(Value::Int32(v))])
    }

    fn commit(txn: &Arc<TxnShared>, ts: Timestamp) {
        let writes = std::mem::take(&mut txn.inner.lock().writes);
        for write in &writes {
            write.commit(txn.id, ts);
        }
    }

    fn describe(k: &IndexKey) -> String {
        k.to_string()
    }

    struct Env {
        op: OperationContext,
        metrics: Metrics,
    }

    impl Env {
        fn new() -> Self {
            Env {
                op: OperationContext::new(),
                metrics: Metrics::new(),
            }
        }

        fn w<'a>(&'a self, txn: &'a Arc<TxnShared>) -> WriteContext<'a> {
            WriteContext {
                txn,
                op: &self.op,
                wait_slice: Duration::from_millis(5),
                metrics: &self.metrics,
            }
        }
    }

    #[test]
    fn test_unique_conflicts_and_duplicates() {
        let env = Env::new();
        let tree = Arc::new(IndexTree::new());
        let constraint = UniqueConstraint {
            ns: "test.c",
            index_name: "a_1",
            describe: &describe,
        };
        let t1 = TxnShared::new_for_test(1, 0);
        let t2 = TxnShared::new_for_test(2, 0);
        tree.insert_key(&env.w(&t1), key(1), 10, Some(&constraint)).unwrap();

        let err = tree.insert_key(&env.w(&t2), key(1), 11, Some(&constraint)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WriteConflict);

        commit(&t1, 1);
        // Snapshot older than the commit: conflict, not duplicate.
        let err = tree.insert_key(&env.w(&t2), key(1), 11, Some(&constraint)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WriteConflict);

        let t3 = TxnShared::new_for_test(3, 1);
        let err = tree.insert_key(&env.w(&t3), key(1), 12, Some(&constraint)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
    }

    #[test]
    fn test_non_unique_tie_break_by_record() {
        let env = Env::new();
        let tree = Arc::new(IndexTree::new());
        let t = TxnShared::new_for_test(1, 0);
        for rid in [3, 1, 2] {
            tree.insert_key(&env.w(&t), key(7), rid, None).unwrap();
        }
        commit(&t, 1);
        let view = ReadView { read_ts: 1, reader: None };
        let batch = tree.scan_batch(&view, &IndexBounds::all(1), &[Direction::Ascending], true, None, 10);
        assert_eq!(batch.entries.iter().map(|e| e.1).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(batch.done);
    }

    #[test]
    fn test_scan_bounds_union_and_resume() {
        let tree = IndexTree::new();
        tree.bulk_load(1, (0..20).map(|i| (key(i), i as RecordId)));
        let view = ReadView { read_ts: 1, reader: None };
        let bounds = IndexBounds {
            fields: vec![OrderedIntervalList::new(vec![
                Interval::point(Value::Int32(3)),
                Interval::new(Value::Int32(10), false, Value::Int32(13), true),
            ])],
        };
        let first = tree.scan_batch(&view, &bounds, &[Direction::Ascending], true, None, 2);
        assert_eq!(first.entries.iter().map(|e| e.1).collect::<Vec<_>>(), vec![3, 11]);
        assert!(!first.done);
        let rest = tree.scan_batch(&view, &bounds, &[Direction::Ascending], true, first.entries.last(), 10);
        assert_eq!(rest.entries.iter().map(|e| e.1).collect::<Vec<_>>(), vec![12, 13]);

        let back = tree.scan_batch(&view, &bounds, &[Direction::Ascending], false, None, 10);
        assert_eq!(back.entries.iter().map(|e| e.1).collect::<Vec<_>>(), vec![13, 12, 11, 3]);
    }

    #[test]
    fn test_descending_pattern_scan() {
        let tree = IndexTree::new();
        tree.bulk_load(
            1,
            (0..5).map(|i| (IndexKey(vec![KeyPart::Desc(Value::Int32(i))]), i as RecordId)),
        );
        let view = ReadView { read_ts: 1, reader: None };
        let bounds = IndexBounds {
            fields: vec![OrderedIntervalList::new(vec![Interval::new(
                Value::Int32(1),
                true,
                Value::Int32(3),
                true,
            )])],
        };
        let batch = tree.scan_batch(&view, &bounds, &[Direction::Descending], true, None, 10);
        assert_eq!(batch.entries.iter().map(|e| e.1).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn test_skip_token_for_distinct() {
        let tree = IndexTree::new();
        tree.bulk_load(1, vec![(key(1), 1), (key(1), 2), (key(2), 3)]);
        let view = ReadView { read_ts: 1, reader: None };
        let first = tree.scan_batch(&view, &IndexBounds::all(1), &[Direction::Ascending], true, None, 1);
        let token = IndexTree::skip_token(&first.entries[0].0, 1, true).unwrap();
        let next = tree.scan_batch(&view, &IndexBounds::all(1), &[Direction::Ascending], true, Some(&token), 1);
        assert_eq!(next.entries[0].1, 3);
    }

    #[test]
    fn test_find_duplicate() {
        let tree = IndexTree::new();
        tree.bulk_load(1, vec![(key(1), 1), (key(2), 2)]);
        assert!(tree.find_duplicate(&ReadView::latest()).is_none());
        tree.apply_committed(key(2), 3, 2, true);
        assert_eq!(tree.find_duplicate(&ReadView::latest()), Some(key(2)));
        tree.apply_committed(key(2), 3, 3, false);
        assert!(tree.find_duplicate(&ReadView::latest()).is_none());
    }
}
