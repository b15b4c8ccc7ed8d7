// quarry-core/src/recovery.rs
//! Checkpoints and journal replay.
//!
//! On open, the latest checkpoint (if any) is loaded and every journal record
//! newer than it is replayed in order:
//!
//! ```text
//! Commit          re-run the ops under the original txn id, commit at ts
//! Prepare         re-run the ops, prepare at the original prepare ts
//! CommitPrepared  commit the restored prepared txn at commit_ts
//! AbortPrepared   abort it
//! ```
//!
//! Prepared transactions with no resolution in the journal stay prepared and
//! can be resolved through `commitTransaction`/`abortTransaction`.
//!
//! A checkpoint fixes a timestamp with catalog changes held off, writes every
//! collection as seen at that timestamp, and then rewrites the journal to the
//! records the image does not already contain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::catalog::{parse_create_options, CollectionEntry, IndexEntry, IndexState};
use crate::collection::CollectionWriter;
use crate::document::Document;
use crate::engine::EngineShared;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::index::{IndexDescriptor, IndexTree};
use crate::interrupt::OperationContext;
use crate::oplog::{JournalRecord, OpKind, StagedOp};
use crate::storage::checkpoint::{read_checkpoint, write_checkpoint};
use crate::storage::{CollectionImage, IndexImage, ScanDirection};
use crate::txn::{ReadView, Timestamp, Transaction, TxnId};
use crate::value::Value;
use crate::{log_debug, log_info, log_warn};

const LOAD_BATCH: usize = 1024;

/// What recovery did.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    pub checkpoint_ts: Option<Timestamp>,
    pub collections_loaded: usize,
    pub documents_loaded: usize,
    pub records_replayed: usize,
    /// Journal records already covered by the checkpoint.
    pub records_skipped: usize,
    pub prepared_restored: usize,
}

/// What a checkpoint wrote.
#[derive(Debug, Clone)]
pub struct CheckpointStats {
    pub ts: Timestamp,
    pub collections: usize,
    pub documents: usize,
    pub journal_records_kept: usize,
}

fn corrupt(message: String) -> QuarryError {
    QuarryError::new(ErrorCode::DataCorruptionDetected, message)
}

// ========== CHECKPOINT ==========

/// Write a checkpoint to `path` and compact the journal.
pub fn checkpoint(shared: &EngineShared, path: &Path) -> Result<CheckpointStats> {
    let (pin, epoch) = {
        let _ddl = shared.ddl_lock.write();
        let pin = shared.coordinator.pin_history(None)?;
        (pin, shared.catalog.snapshot())
    };
    let images = epoch
        .collections()
        .filter(|entry| entry.visible_at(pin.ts))
        .map(|entry| collection_image(entry, pin.ts))
        .collect::<Vec<_>>();
    shared.coordinator.release_pin(pin)?;
    let ts = pin.ts;
    let documents = images.iter().map(|image| image.records.len()).sum();

    write_checkpoint(path, ts, shared.coordinator.next_txn_id(), &images)?;
    let kept = shared
        .coordinator
        .oplog()
        .compact_journal(|records| records_after(records, ts))?;
    log_info!(
        "checkpoint at ts {}: {} collections, {} documents, {} journal records kept",
        ts,
        images.len(),
        documents,
        kept
    );
    Ok(CheckpointStats {
        ts,
        collections: images.len(),
        documents,
        journal_records_kept: kept,
    })
}

fn collection_image(entry: &CollectionEntry, ts: Timestamp) -> CollectionImage {
    let view = ReadView { read_ts: ts, reader: None };
    let mut records = Vec::new();
    let mut after = None;
    loop {
        let batch = entry.records.scan_batch(&view, after, ScanDirection::Forward, LOAD_BATCH);
        let Some((last, _)) = batch.last() else {
            break;
        };
        after = Some(*last);
        records.extend(batch.into_iter().map(|(rid, doc)| (rid, (*doc).clone())));
    }
    let indexes = entry
        .indexes
        .iter()
        .filter(|index| !index.descriptor.is_id() && index.usable_at(ts))
        .map(|index| IndexImage {
            spec: index.descriptor.to_spec(),
            multikey: index.multikey,
        })
        .collect();
    CollectionImage {
        ns: entry.ns.clone(),
        uuid: entry.uuid.to_string(),
        created_ts: entry.created_ts,
        options: entry.options.clone(),
        indexes,
        records,
    }
}

/// How each prepared transaction in `records` was resolved: its commit
/// timestamp, or `None` when it aborted.
fn resolutions(records: &[JournalRecord]) -> HashMap<TxnId, Option<Timestamp>> {
    let mut resolved = HashMap::new();
    for record in records {
        match record {
            JournalRecord::CommitPrepared { txn_id, commit_ts } => {
                resolved.insert(*txn_id, Some(*commit_ts));
            }
            JournalRecord::AbortPrepared { txn_id } => {
                resolved.insert(*txn_id, None);
            }
            _ => {}
        }
    }
    resolved
}

/// Journal records whose effects are not contained in a checkpoint at `ts`.
fn records_after(records: Vec<JournalRecord>, ts: Timestamp) -> Vec<JournalRecord> {
    let resolved = resolutions(&records);
    records
        .into_iter()
        .filter(|record| match record {
            JournalRecord::Commit { ts: commit_ts, .. } => *commit_ts > ts,
            JournalRecord::Prepare { txn_id, .. }
            | JournalRecord::CommitPrepared { txn_id, .. }
            | JournalRecord::AbortPrepared { txn_id } => match resolved.get(txn_id) {
                None => true,
                Some(Some(commit_ts)) => *commit_ts > ts,
                Some(None) => false,
            },
        })
        .collect()
}

// ========== RECOVERY ==========

/// Load the checkpoint at `checkpoint_path` and replay the journal.
pub fn recover(shared: &EngineShared, checkpoint_path: &Path) -> Result<RecoveryStats> {
    let oplog = shared.coordinator.oplog();
    oplog.set_replaying(true);
    let result = replay(shared, checkpoint_path);
    oplog.set_replaying(false);
    result
}

fn replay(shared: &EngineShared, checkpoint_path: &Path) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    let mut floor = 0;
    if let Some((header, images)) = read_checkpoint(checkpoint_path)? {
        for image in images {
            stats.documents_loaded += image.records.len();
            load_collection(shared, image, header.ts)?;
            stats.collections_loaded += 1;
        }
        shared.coordinator.advance_clock(header.ts);
        shared.coordinator.raise_history_horizon(header.ts);
        shared.coordinator.advance_txn_ids(header.next_txn_id.saturating_sub(1));
        floor = header.ts;
        stats.checkpoint_ts = Some(header.ts);
        log_debug!("loaded checkpoint at ts {} ({} collections)", header.ts, stats.collections_loaded);
    }

    let records = shared.coordinator.oplog().read_journal()?;
    let resolved = resolutions(&records);
    let op = OperationContext::new();
    let mut prepared: HashMap<TxnId, Transaction> = HashMap::new();
    for record in records {
        match record {
            JournalRecord::Commit { ts, txn_id, ops } => {
                if ts <= floor {
                    stats.records_skipped += 1;
                    continue;
                }
                replay_commit(shared, ts, txn_id, &ops, &op)?;
            }
            JournalRecord::Prepare {
                txn_id,
                read_ts,
                prepare_ts,
                ops,
            } => {
                if matches!(resolved.get(&txn_id), Some(Some(commit_ts)) if *commit_ts <= floor) {
                    stats.records_skipped += 1;
                    continue;
                }
                // Versions loaded from a checkpoint carry its timestamp.
                let txn = shared.coordinator.begin_replayed(txn_id, read_ts.max(floor));
                apply_data_ops(shared, &txn, &ops, &op)?;
                shared.coordinator.prepare_at(txn.shared(), prepare_ts)?;
                prepared.insert(txn_id, txn);
            }
            JournalRecord::CommitPrepared { txn_id, commit_ts } => match prepared.remove(&txn_id) {
                Some(txn) => {
                    shared.coordinator.commit_replayed(txn.shared(), commit_ts, |_| Ok(()))?;
                }
                None => {
                    stats.records_skipped += 1;
                    continue;
                }
            },
            JournalRecord::AbortPrepared { txn_id } => match prepared.remove(&txn_id) {
                Some(txn) => txn.abort()?,
                None => {
                    stats.records_skipped += 1;
                    continue;
                }
            },
        }
        stats.records_replayed += 1;
    }
    stats.prepared_restored = prepared.len();
    for id in prepared.keys() {
        log_info!("restored prepared transaction {}", id);
    }
    Ok(stats)
}

fn replay_commit(shared: &EngineShared, ts: Timestamp, txn_id: TxnId, ops: &[StagedOp], op: &OperationContext) -> Result<()> {
    let txn = shared.coordinator.begin_replayed(txn_id, ts.saturating_sub(1));
    if ops.iter().all(|o| o.kind == OpKind::Command) {
        for o in ops {
            txn.shared().stage_op(o.clone());
        }
        shared.coordinator.commit_replayed(txn.shared(), ts, |ts| {
            for o in ops {
                apply_command(shared, o, ts)?;
            }
            Ok(())
        })?;
    } else {
        apply_data_ops(shared, &txn, ops, op)?;
        shared.coordinator.commit_replayed(txn.shared(), ts, |_| Ok(()))?;
    }
    Ok(())
}

/// Re-run document writes inside `txn`.
fn apply_data_ops(shared: &EngineShared, txn: &Transaction, ops: &[StagedOp], op: &OperationContext) -> Result<()> {
    for o in ops {
        if matches!(o.kind, OpKind::Command | OpKind::Noop) {
            continue;
        }
        let writer = CollectionWriter::open(shared, txn, op, &o.ns)?;
        match o.kind {
            OpKind::Insert => {
                writer.insert(o.o.clone())?;
            }
            OpKind::Update => {
                let id = o
                    .o2
                    .as_ref()
                    .and_then(Document::id)
                    .or_else(|| o.o.id())
                    .ok_or_else(|| corrupt(format!("journaled update on {} has no _id", o.ns)))?;
                let (rid, old) = writer
                    .find_by_id(id)?
                    .ok_or_else(|| corrupt(format!("journaled update of missing document {} in {}", id, o.ns)))?;
                writer.update(rid, &old, o.o.clone())?;
            }
            OpKind::Delete => {
                let id = o
                    .o
                    .id()
                    .ok_or_else(|| corrupt(format!("journaled delete on {} has no _id", o.ns)))?;
                match writer.find_by_id(id)? {
                    Some((rid, _)) => {
                        writer.delete(rid)?;
                    }
                    None => log_warn!("journaled delete of missing document {} in {}", id, o.ns),
                }
            }
            OpKind::Command | OpKind::Noop => {}
        }
    }
    Ok(())
}

/// Re-apply one catalog change at `ts`. Changes that no longer fit the
/// catalog (e.g. a drop of a collection that is already gone) are skipped.
fn apply_command(shared: &EngineShared, o: &StagedOp, ts: Timestamp) -> Result<()> {
    let db = o.ns.split_once('.').map(|(db, _)| db).unwrap_or(&o.ns);
    let Some((name, target)) = o.o.iter().next() else {
        return Err(corrupt(format!("empty journaled command on {}", o.ns)));
    };
    let coll_ns = |value: &Value| -> Result<String> {
        value
            .as_str()
            .map(|coll| format!("{}.{}", db, coll))
            .ok_or_else(|| corrupt(format!("journaled {} has a non-string target", name)))
    };
    match name.as_str() {
        "create" => {
            let ns = coll_ns(target)?;
            let mut options = o.o.clone();
            options.remove("create");
            let collation = parse_create_options(&options)?;
            shared.catalog.modify(|collections| {
                if collections.contains_key(&ns) {
                    log_warn!("replayed create of existing collection {}", ns);
                } else {
                    collections.insert(ns.clone(), Arc::new(CollectionEntry::new(&ns, ts, options, collation)));
                }
                Ok(())
            })?;
        }
        "drop" => {
            let ns = coll_ns(target)?;
            shared.catalog.modify(|collections| {
                collections.remove(&ns);
                Ok(())
            })?;
            shared.plan_cache.evict_namespace(&ns);
        }
        "renameCollection" => {
            let from = target
                .as_str()
                .ok_or_else(|| corrupt("journaled rename has no source".into()))?
                .to_string();
            let to = o
                .o
                .get("to")
                .and_then(Value::as_str)
                .ok_or_else(|| corrupt("journaled rename has no target".into()))?
                .to_string();
            shared.catalog.modify(|collections| {
                match collections.remove(&from) {
                    Some(current) => {
                        let mut renamed = (*current).clone();
                        renamed.ns = to.clone();
                        renamed.created_ts = ts;
                        renamed.index_generation += 1;
                        collections.insert(to.clone(), Arc::new(renamed));
                    }
                    None => log_warn!("replayed rename of missing collection {}", from),
                }
                Ok(())
            })?;
            shared.plan_cache.evict_namespace(&from);
            shared.plan_cache.evict_namespace(&to);
        }
        "createIndexes" => {
            let ns = coll_ns(target)?;
            let spec = o
                .o
                .get("spec")
                .and_then(Value::as_document)
                .ok_or_else(|| corrupt(format!("journaled createIndexes on {} has no spec", ns)))?;
            if shared.catalog.get(&ns).is_none() {
                log_warn!("replayed index build on missing collection {}", ns);
                return Ok(());
            }
            shared.catalog.modify_collection(&ns, |entry| {
                let descriptor = IndexDescriptor::from_spec(spec, entry.collation.as_ref())?;
                entry.indexes.retain(|i| i.descriptor.name != descriptor.name);
                let index = load_index(entry, descriptor, ts, ts, false)?;
                entry.indexes.push(Arc::new(index));
                entry.index_generation += 1;
                Ok(())
            })?;
            shared.plan_cache.evict_namespace(&ns);
        }
        "dropIndexes" => {
            let ns = coll_ns(target)?;
            let index = o.o.get("index").and_then(Value::as_str).unwrap_or_default().to_string();
            if shared.catalog.get(&ns).is_some() {
                shared.catalog.modify_collection(&ns, |entry| {
                    entry.indexes.retain(|i| i.descriptor.name != index);
                    entry.index_generation += 1;
                    Ok(())
                })?;
                shared.plan_cache.evict_namespace(&ns);
            }
        }
        other => log_warn!("skipping unknown journaled command {}", other),
    }
    Ok(())
}

/// Build a ready index over the records currently in `entry`.
fn load_index(
    entry: &CollectionEntry,
    descriptor: IndexDescriptor,
    keys_ts: Timestamp,
    ready_ts: Timestamp,
    multikey: bool,
) -> Result<IndexEntry> {
    let view = ReadView::latest();
    let mut keys = Vec::new();
    let mut multikey = multikey;
    let mut after = None;
    loop {
        let batch = entry.records.scan_batch(&view, after, ScanDirection::Forward, LOAD_BATCH);
        let Some((last, _)) = batch.last() else {
            break;
        };
        after = Some(*last);
        for (rid, doc) in &batch {
            let generated = descriptor.keys(doc)?;
            multikey |= generated.multikey;
            keys.extend(generated.keys.into_iter().map(|key| (key, *rid)));
        }
    }
    keys.sort();
    let tree = IndexTree::new();
    tree.bulk_load(keys_ts, keys);
    Ok(IndexEntry {
        descriptor,
        tree: Arc::new(tree),
        state: IndexState::Ready { ready_ts },
        multikey,
    })
}

fn load_collection(shared: &EngineShared, image: CollectionImage, ts: Timestamp) -> Result<()> {
    let collation = parse_create_options(&image.options)?;
    let mut entry = CollectionEntry::new(&image.ns, image.created_ts, image.options, collation);
    if let Ok(uuid) = Uuid::parse_str(&image.uuid) {
        entry.uuid = uuid;
    }
    for (rid, doc) in image.records {
        entry.records.insert_committed(rid, ts, Some(doc));
    }
    let id_descriptor = IndexDescriptor::id_index(entry.collation.as_ref());
    let mut indexes = vec![Arc::new(load_index(&entry, id_descriptor, ts, image.created_ts, false)?)];
    for index in image.indexes {
        let descriptor = IndexDescriptor::from_spec(&index.spec, entry.collation.as_ref())?;
        indexes.push(Arc::new(load_index(&entry, descriptor, ts, ts, index.multikey)?));
    }
    entry.indexes = indexes;
    let ns = image.ns;
    shared.catalog.modify(|collections| {
        collections.insert(ns, Arc::new(entry));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::doc;
    use crate::engine::Engine;

    fn op_insert(ns: &str, doc: Document) -> StagedOp {
        StagedOp::new(OpKind::Insert, ns, doc, None)
    }

    #[test]
    fn test_records_after_checkpoint() {
        let records = vec![
            JournalRecord::Commit {
                ts: 3,
                txn_id: 1,
                ops: vec![op_insert("test.c", doc!({"_id": 1}))],
            },
            JournalRecord::Prepare {
                txn_id: 2,
                read_ts: 3,
                prepare_ts: 4,
                ops: vec![],
            },
            JournalRecord::Prepare {
                txn_id: 3,
                read_ts: 3,
                prepare_ts: 5,
                ops: vec![],
            },
            JournalRecord::Commit {
                ts: 6,
                txn_id: 4,
                ops: vec![op_insert("test.c", doc!({"_id": 2}))],
            },
            JournalRecord::AbortPrepared { txn_id: 3 },
        ];
        let kept = records_after(records, 5);
        assert_eq!(kept.len(), 2);
        assert!(matches!(kept[0], JournalRecord::Prepare { txn_id: 2, .. }));
        assert!(matches!(kept[1], JournalRecord::Commit { ts: 6, .. }));
    }

    #[test]
    fn test_reopen_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(EngineConfig::with_data_dir(dir.path())).unwrap();
            for (i, cmd) in [
                serde_json::json!({"insert": "c", "documents": [{"_id": 1, "a": 1}, {"_id": 2, "a": 2}]}),
                serde_json::json!({"createIndexes": "c", "indexes": [{"key": {"a": 1}, "name": "a_1", "unique": true}]}),
                serde_json::json!({"update": "c", "updates": [{"q": {"_id": 1}, "u": {"$set": {"a": 10}}}]}),
                serde_json::json!({"delete": "c", "deletes": [{"q": {"_id": 2}, "limit": 1}]}),
            ]
            .iter()
            .enumerate()
            {
                let reply = engine.execute(cmd);
                assert_eq!(reply["ok"], 1.0, "command {} failed: {}", i, reply);
            }
        }
        let engine = Engine::open(EngineConfig::with_data_dir(dir.path())).unwrap();
        assert!(engine.recovery_stats().records_replayed >= 5);
        let entry = engine.shared().catalog.get("test.c").unwrap();
        assert!(entry.index("a_1").unwrap().is_ready());
        let docs = engine.execute(&serde_json::json!({"find": "c"}));
        assert_eq!(docs["cursor"]["firstBatch"], serde_json::json!([{"_id": 1, "a": 10}]));
    }

    #[test]
    fn test_checkpoint_then_journal_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(EngineConfig::with_data_dir(dir.path())).unwrap();
            engine.execute(&serde_json::json!({"insert": "c", "documents": [{"_id": 1}]}));
            engine.execute(&serde_json::json!({"createIndexes": "c", "indexes": [{"key": {"b": 1}, "name": "b_1"}]}));
            let stats = engine.checkpoint().unwrap();
            assert_eq!(stats.collections, 1);
            assert_eq!(stats.journal_records_kept, 0);
            engine.execute(&serde_json::json!({"insert": "c", "documents": [{"_id": 2, "b": [1, 2]}]}));
        }
        let engine = Engine::open(EngineConfig::with_data_dir(dir.path())).unwrap();
        let stats = engine.recovery_stats();
        assert_eq!(stats.collections_loaded, 1);
        assert_eq!(stats.records_replayed, 1);
        let entry = engine.shared().catalog.get("test.c").unwrap();
        assert_eq!(entry.records.count(&ReadView::latest()), 2);
        assert!(entry.index("b_1").unwrap().multikey);
    }

    #[test]
    fn test_prepared_transaction_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let txn_id = {
            let engine = Engine::open(EngineConfig::with_data_dir(dir.path())).unwrap();
            let shared = engine.shared();
            let op = OperationContext::new();
            crate::ddl::ensure_collection(shared, "test.c", &op).unwrap();
            let txn = shared.coordinator.begin(true);
            CollectionWriter::open(shared, &txn, &op, "test.c")
                .unwrap()
                .insert(doc!({"_id": 1}))
                .unwrap();
            txn.prepare().unwrap();
            txn.id()
        };
        let engine = Engine::open(EngineConfig::with_data_dir(dir.path())).unwrap();
        let shared = engine.shared();
        assert_eq!(engine.recovery_stats().prepared_restored, 1);
        assert_eq!(shared.coordinator.prepared_ids(), vec![txn_id]);
        let txn = shared.coordinator.prepared_transaction(txn_id).unwrap();
        let prepare_ts = txn.shared().prepare_ts().unwrap();
        txn.commit(Some(prepare_ts + 1)).unwrap();
        let entry = shared.catalog.get("test.c").unwrap();
        assert_eq!(entry.records.count(&ReadView::latest()), 1);
    }
}
