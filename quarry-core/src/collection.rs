// quarry-core/src/collection.rs
//! Document writes against one collection.
//!
//! A [`CollectionWriter`] performs every change of a single document inside
//! the caller's transaction: the record store version, the key diff of every
//! index and the staged oplog op. All three become visible together at the
//! transaction's commit timestamp.
//!
//! ```text
//! insert(doc)
//!   ├── RecordStore::insert            intent on a fresh chain
//!   ├── for each index
//!   │     ├── multikey? -> Catalog::set_multikey (published first)
//!   │     ├── Ready     -> IndexTree::insert_key (unique check)
//!   │     └── Building  -> IndexBuild::push_side_write
//!   └── stage OpKind::Insert
//! ```

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::catalog::{CollectionEntry, IndexEntry, IndexState};
use crate::document::Document;
use crate::engine::EngineShared;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::index::{IndexBounds, IndexKey, Interval, OrderedIntervalList, SideWrite, UniqueConstraint};
use crate::interrupt::OperationContext;
use crate::oplog::{OpKind, StagedOp};
use crate::storage::RecordId;
use crate::txn::{Transaction, WriteContext};
use crate::value::{compare_values, Value};
use crate::{log_debug, log_trace};

pub struct CollectionWriter<'a> {
    shared: &'a EngineShared,
    txn: &'a Transaction,
    op: &'a OperationContext,
    entry: Arc<CollectionEntry>,
}

impl<'a> CollectionWriter<'a> {
    /// Open an existing collection for writing inside `txn`. The collection
    /// gate is entered in shared mode and held until the transaction ends,
    /// so the index set cannot change underneath the writer.
    pub fn open(shared: &'a EngineShared, txn: &'a Transaction, op: &'a OperationContext, ns: &str) -> Result<Self> {
        txn.ensure_active()?;
        let entry = shared
            .catalog
            .get(ns)
            .ok_or_else(|| QuarryError::NamespaceNotFound(ns.to_string()))?;
        txn.shared().enter_gate(&entry.gate, shared.lock_timeout())?;
        let entry = match shared.catalog.get(ns) {
            Some(current) if Arc::ptr_eq(&current.gate, &entry.gate) => current,
            // Dropped and possibly recreated while we waited.
            _ => return Err(QuarryError::WriteConflict),
        };
        if !entry.visible_at(txn.read_ts()) {
            return Err(QuarryError::WriteConflict);
        }
        Ok(CollectionWriter { shared, txn, op, entry })
    }

    pub fn entry(&self) -> &Arc<CollectionEntry> {
        &self.entry
    }

    fn write_context(&self) -> WriteContext<'_> {
        WriteContext {
            txn: self.txn.shared(),
            op: self.op,
            wait_slice: self.shared.prepared_wait_slice(),
            metrics: &self.shared.metrics,
        }
    }

    fn check_size(&self, doc: &Document) -> Result<()> {
        let limit = self.shared.params.max_document_bytes() as usize;
        let size = doc.bson_size();
        if size > limit {
            return Err(QuarryError::BsonObjectTooLarge { size, limit });
        }
        Ok(())
    }

    // ========== WRITES ==========

    /// Insert `doc`, generating an `_id` when absent. Returns the `_id`.
    pub fn insert(&self, mut doc: Document) -> Result<Value> {
        let id = doc.ensure_id();
        if matches!(id, Value::Array(_)) {
            return Err(QuarryError::BadValue("can't use an array for _id".into()));
        }
        self.check_size(&doc)?;
        let w = self.write_context();
        let rid = self.entry.records.insert(&w, doc.clone())?;
        for index in &self.entry.indexes {
            let keys = self.keys_for(index, &doc)?;
            for key in keys {
                self.add_key(&w, index, key, rid)?;
            }
        }
        self.txn
            .shared()
            .stage_op(StagedOp::new(OpKind::Insert, self.entry.ns.as_str(), doc, None));
        self.shared.metrics.documents_inserted.incr();
        log_trace!("insert into {} rid {}", self.entry.ns, rid);
        Ok(id)
    }

    /// Replace the record `rid` (currently `old`) with `new`.
    pub fn update(&self, rid: RecordId, old: &Document, mut new: Document) -> Result<Document> {
        match (old.id(), new.id()) {
            (Some(before), Some(after)) if compare_values(before, after, None) != Ordering::Equal => {
                return Err(QuarryError::new(
                    ErrorCode::ImmutableField,
                    format!(
                        "performing an update on the path '_id' would modify the immutable field '_id' ({} -> {})",
                        before, after
                    ),
                ));
            }
            (Some(before), None) => {
                let mut with_id = Document::with_capacity(new.len() + 1);
                with_id.insert("_id", before.clone());
                for (k, v) in new {
                    with_id.insert(k, v);
                }
                new = with_id;
            }
            _ => {}
        }
        self.check_size(&new)?;
        let w = self.write_context();
        let previous = self.entry.records.update(&w, rid, new.clone())?;
        for index in &self.entry.indexes {
            let before = self.keys_for(index, &previous)?;
            let after = self.keys_for(index, &new)?;
            for key in before.iter().filter(|k| !after.contains(k)) {
                self.remove_key(&w, index, key.clone(), rid)?;
            }
            for key in after.iter().filter(|k| !before.contains(k)) {
                self.add_key(&w, index, key.clone(), rid)?;
            }
        }
        self.txn.shared().stage_op(StagedOp::new(
            OpKind::Update,
            self.entry.ns.as_str(),
            new.clone(),
            Some(id_document(&new)),
        ));
        self.shared.metrics.documents_updated.incr();
        Ok(new)
    }

    /// Delete the record `rid`.
    pub fn delete(&self, rid: RecordId) -> Result<Arc<Document>> {
        let w = self.write_context();
        let previous = self.entry.records.remove(&w, rid)?;
        for index in &self.entry.indexes {
            for key in self.keys_for(index, &previous)? {
                self.remove_key(&w, index, key, rid)?;
            }
        }
        self.txn.shared().stage_op(StagedOp::new(
            OpKind::Delete,
            self.entry.ns.as_str(),
            id_document(&previous),
            None,
        ));
        self.shared.metrics.documents_deleted.incr();
        Ok(previous)
    }

    // ========== INDEX MAINTENANCE ==========

    /// Keys of `doc` for `index`, publishing the multikey flag before any
    /// multikey key can be installed.
    fn keys_for(&self, index: &Arc<IndexEntry>, doc: &Document) -> Result<Vec<IndexKey>> {
        let generated = index.descriptor.keys(doc)?;
        if generated.multikey && !index.multikey {
            self.shared.catalog.set_multikey(&self.entry.ns, index.name())?;
            log_debug!("index {} on {} is now multikey", index.name(), self.entry.ns);
        }
        Ok(generated.keys)
    }

    fn add_key(&self, w: &WriteContext<'_>, index: &Arc<IndexEntry>, key: IndexKey, rid: RecordId) -> Result<()> {
        match &index.state {
            IndexState::Ready { .. } => {
                if index.descriptor.unique {
                    let describe = |k: &IndexKey| index.descriptor.describe_key(k);
                    let constraint = UniqueConstraint {
                        ns: &self.entry.ns,
                        index_name: index.name(),
                        describe: &describe,
                    };
                    index.tree.insert_key(w, key, rid, Some(&constraint))
                } else {
                    index.tree.insert_key(w, key, rid, None)
                }
            }
            IndexState::Building(build) => {
                build.push_side_write(SideWrite {
                    key,
                    rid,
                    insert: true,
                    txn: self.txn.shared().clone(),
                });
                Ok(())
            }
        }
    }

    fn remove_key(&self, w: &WriteContext<'_>, index: &Arc<IndexEntry>, key: IndexKey, rid: RecordId) -> Result<()> {
        match &index.state {
            IndexState::Ready { .. } => index.tree.remove_key(w, key, rid),
            IndexState::Building(build) => {
                build.push_side_write(SideWrite {
                    key,
                    rid,
                    insert: false,
                    txn: self.txn.shared().clone(),
                });
                Ok(())
            }
        }
    }

    // ========== LOOKUP ==========

    /// The record whose `_id` equals `id`, as seen by this transaction.
    pub fn find_by_id(&self, id: &Value) -> Result<Option<(RecordId, Arc<Document>)>> {
        find_by_id(&self.entry, id, &self.txn.view())
    }
}

fn id_document(doc: &Document) -> Document {
    let mut key = Document::new();
    if let Some(id) = doc.id() {
        key.insert("_id", id.clone());
    }
    key
}

/// Point lookup through the `_id` index.
pub fn find_by_id(
    entry: &CollectionEntry,
    id: &Value,
    view: &crate::txn::ReadView,
) -> Result<Option<(RecordId, Arc<Document>)>> {
    let index = entry.id_index()?;
    let key = match &index.descriptor.collation {
        Some(collation) => collation.comparison_key(id),
        None => id.clone(),
    };
    let bounds = IndexBounds {
        fields: vec![OrderedIntervalList::new(vec![Interval::point(key)])],
    };
    let directions: Vec<_> = index.descriptor.pattern.fields().iter().map(|(_, d)| *d).collect();
    let batch = index.tree.scan_batch(view, &bounds, &directions, true, None, 1);
    Ok(batch
        .entries
        .first()
        .and_then(|(_, rid)| entry.records.find(*rid, view).map(|doc| (*rid, doc))))
}

// ========== RETRY ==========

/// Run `body` in a fresh auto-commit transaction and commit it, retrying
/// write conflicts up to `writeConflictRetryLimit` times with a short
/// randomized backoff.
pub fn with_write_retry<T, F>(shared: &EngineShared, op: &OperationContext, mut body: F) -> Result<T>
where
    F: FnMut(&Transaction) -> Result<T>,
{
    let limit = shared.params.write_conflict_retry_limit();
    let mut attempt: u64 = 0;
    loop {
        op.check_for_interrupt()?;
        let txn = shared.coordinator.begin(false);
        let outcome = body(&txn).and_then(|value| txn.commit(None).map(|_| value));
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.code() == ErrorCode::WriteConflict => {
                shared.metrics.write_conflicts.incr();
                if attempt >= limit {
                    log_debug!("giving up after {} write conflict retries", attempt);
                    return Err(err);
                }
                drop(txn);
                attempt += 1;
                shared.metrics.write_conflict_retries.incr();
                let backoff = rand::thread_rng().gen_range(0..=attempt.min(10));
                std::thread::sleep(Duration::from_millis(backoff));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run `body` inside an explicit transaction. Any failure aborts it.
pub fn in_transaction<T, F>(shared: &EngineShared, txn: &Transaction, body: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    match body(txn) {
        Ok(value) => Ok(value),
        Err(err) => {
            if err.code() == ErrorCode::WriteConflict {
                shared.metrics.write_conflicts.incr();
            }
            if txn.state() == crate::txn::TxnState::Active {
                txn.abort()?;
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::engine::Engine;

    #[test]
    fn test_insert_maintains_id_index() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        crate::ddl::create_collection(shared, "test.c", &Document::new(), &OperationContext::new()).unwrap();
        let op = OperationContext::new();
        with_write_retry(shared, &op, |txn| {
            let writer = CollectionWriter::open(shared, txn, &op, "test.c")?;
            writer.insert(doc!({"_id": 1, "a": "x"}))?;
            Ok(())
        })
        .unwrap();

        let entry = shared.catalog.get("test.c").unwrap();
        let view = shared.coordinator.begin(false).view();
        let (_, found) = find_by_id(&entry, &Value::Int32(1), &view).unwrap().unwrap();
        assert_eq!(found.get("a"), Some(&Value::from("x")));
        assert!(find_by_id(&entry, &Value::Int32(2), &view).unwrap().is_none());
    }

    #[test]
    fn test_update_cannot_change_id() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        crate::ddl::create_collection(shared, "test.c", &Document::new(), &OperationContext::new()).unwrap();
        let op = OperationContext::new();
        let err = with_write_retry(shared, &op, |txn| {
            let writer = CollectionWriter::open(shared, txn, &op, "test.c")?;
            writer.insert(doc!({"_id": 1}))?;
            let (rid, old) = writer.find_by_id(&Value::Int32(1))?.unwrap();
            writer.update(rid, &old, doc!({"_id": 2}))?;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ImmutableField);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        crate::ddl::create_collection(shared, "test.c", &Document::new(), &OperationContext::new()).unwrap();
        let op = OperationContext::new();
        let insert = |doc: Document| {
            with_write_retry(shared, &op, |txn| {
                CollectionWriter::open(shared, txn, &op, "test.c")?.insert(doc.clone())
            })
        };
        insert(doc!({"_id": 1})).unwrap();
        let err = insert(doc!({"_id": 1})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
    }
}
