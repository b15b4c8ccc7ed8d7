// quarry-core/src/ddl.rs
//! Catalog changes: collection create/drop and index create/drop.
//!
//! Every change commits through a transaction that stages a command op, so
//! the change gets its own commit timestamp, is journaled and appears in the
//! oplog. The catalog edit itself runs in the commit hook, while the
//! timestamp is reserved but not yet visible.
//!
//! Index builds run in three phases:
//!
//! ```text
//! start    exclusive gate: register Building entry, fix scan_ts
//! scan     snapshot scan at scan_ts -> external sort -> bulk load
//! drain    apply side writes of resolved writers (repeatable)
//! commit   exclusive gate: final drain, unique check, publish Ready
//! ```
//!
//! Any phase may fail or be aborted by `dropIndexes`; the Building entry is
//! then removed and nothing of the build remains visible.

use std::sync::Arc;

use crate::catalog::{parse_create_options, stored_options, validate_namespace, CollectionEntry, IndexEntry, IndexState};
use crate::document::Document;
use crate::engine::EngineShared;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::index::{BuildPhase, IndexBuild, IndexDescriptor, IndexEntryKey, IndexTree, ID_INDEX_NAME};
use crate::interrupt::OperationContext;
use crate::oplog::{OpKind, StagedOp};
use crate::storage::{ScanDirection, Sorter};
use crate::txn::{CollectionGate, ReadView};
use crate::value::Value;
use crate::{log_debug, log_info, log_warn};

const BUILD_SCAN_BATCH: usize = 512;

/// Holds a collection gate exclusively until dropped.
struct ExclusiveGate<'a>(&'a CollectionGate);

impl<'a> ExclusiveGate<'a> {
    fn enter(gate: &'a CollectionGate, op: &OperationContext) -> Result<Self> {
        gate.enter_exclusive(op)?;
        Ok(ExclusiveGate(gate))
    }
}

impl Drop for ExclusiveGate<'_> {
    fn drop(&mut self) {
        self.0.exit_exclusive();
    }
}

/// Commit a catalog change described by `ops`, running `apply` with the
/// commit timestamp.
fn commit_catalog_change<F>(shared: &EngineShared, ops: Vec<StagedOp>, apply: F) -> Result<u64>
where
    F: FnOnce(u64) -> Result<()>,
{
    let _ddl = shared.ddl_lock.read();
    let txn = shared.coordinator.begin(false);
    for op in ops {
        txn.shared().stage_op(op);
    }
    shared.coordinator.commit_with(txn.shared(), apply)
}

fn command_op(ns: &str, command: Document) -> StagedOp {
    let db = ns.split_once('.').map(|(db, _)| db).unwrap_or(ns);
    StagedOp::new(OpKind::Command, format!("{}.$cmd", db), command, None)
}

fn coll_name(ns: &str) -> &str {
    ns.split_once('.').map(|(_, c)| c).unwrap_or(ns)
}

// ========== COLLECTIONS ==========

/// Create `ns`. Fails with `NamespaceExists` when it is already present.
pub fn create_collection(
    shared: &EngineShared,
    ns: &str,
    options: &Document,
    _op: &OperationContext,
) -> Result<Arc<CollectionEntry>> {
    validate_namespace(ns)?;
    let collation = parse_create_options(options)?;
    let stored = stored_options(collation.as_ref());
    if shared.catalog.get(ns).is_some() {
        return Err(namespace_exists(ns));
    }
    let mut command = Document::new();
    command.insert("create", coll_name(ns));
    for (k, v) in stored.iter() {
        command.insert(k.clone(), v.clone());
    }
    commit_catalog_change(shared, vec![command_op(ns, command)], |ts| {
        shared.catalog.modify(|collections| {
            if collections.contains_key(ns) {
                return Err(namespace_exists(ns));
            }
            collections.insert(
                ns.to_string(),
                Arc::new(CollectionEntry::new(ns, ts, stored.clone(), collation.clone())),
            );
            Ok(())
        })
    })?;
    log_info!("created collection {}", ns);
    shared
        .catalog
        .get(ns)
        .ok_or_else(|| QuarryError::NamespaceNotFound(ns.to_string()))
}

fn namespace_exists(ns: &str) -> QuarryError {
    QuarryError::new(ErrorCode::NamespaceExists, format!("Collection {} already exists.", ns))
}

/// The collection `ns`, created with default options when missing. Returns
/// whether it was created by this call.
pub fn ensure_collection(shared: &EngineShared, ns: &str, op: &OperationContext) -> Result<(Arc<CollectionEntry>, bool)> {
    if let Some(entry) = shared.catalog.get(ns) {
        return Ok((entry, false));
    }
    match create_collection(shared, ns, &Document::new(), op) {
        Ok(entry) => Ok((entry, true)),
        Err(err) if err.code() == ErrorCode::NamespaceExists => shared
            .catalog
            .get(ns)
            .map(|entry| (entry, false))
            .ok_or_else(|| QuarryError::NamespaceNotFound(ns.to_string())),
        Err(err) => Err(err),
    }
}

/// Drop `ns`. Dropping a missing collection succeeds and reports `false`.
pub fn drop_collection(shared: &EngineShared, ns: &str, op: &OperationContext) -> Result<bool> {
    let Some(entry) = shared.catalog.get(ns) else {
        return Ok(false);
    };
    for index in &entry.indexes {
        if let Some(build) = index.build() {
            build.abort(format!("collection {} dropped", ns));
        }
    }
    let _gate = ExclusiveGate::enter(&entry.gate, op)?;
    let mut command = Document::new();
    command.insert("drop", coll_name(ns));
    commit_catalog_change(shared, vec![command_op(ns, command)], |_| {
        shared.catalog.modify(|collections| {
            collections.remove(ns);
            Ok(())
        })?;
        shared.plan_cache.evict_namespace(ns);
        Ok(())
    })?;
    log_info!("dropped collection {}", ns);
    Ok(true)
}

/// Rename `from` to `to` in one catalog change, replacing `to` when
/// `drop_target` is set. Records and indexes move with the entry.
pub fn rename_collection(shared: &EngineShared, from: &str, to: &str, drop_target: bool, op: &OperationContext) -> Result<()> {
    validate_namespace(to)?;
    let source = shared
        .catalog
        .get(from)
        .ok_or_else(|| QuarryError::NamespaceNotFound(from.to_string()))?;
    let target = shared.catalog.get(to);
    if target.is_some() && !drop_target {
        return Err(namespace_exists(to));
    }
    let _source_gate = ExclusiveGate::enter(&source.gate, op)?;
    let _target_gate = match &target {
        Some(target) => Some(ExclusiveGate::enter(&target.gate, op)?),
        None => None,
    };
    let mut command = Document::new();
    command.insert("renameCollection", from);
    command.insert("to", to);
    command.insert("dropTarget", drop_target);
    commit_catalog_change(shared, vec![command_op(from, command)], |ts| {
        shared.catalog.modify(|collections| {
            let current = collections
                .remove(from)
                .ok_or_else(|| QuarryError::NamespaceNotFound(from.to_string()))?;
            if collections.contains_key(to) && !drop_target {
                return Err(namespace_exists(to));
            }
            let mut renamed = (*current).clone();
            renamed.ns = to.to_string();
            renamed.created_ts = ts;
            renamed.index_generation += 1;
            collections.insert(to.to_string(), Arc::new(renamed));
            Ok(())
        })?;
        shared.plan_cache.evict_namespace(from);
        shared.plan_cache.evict_namespace(to);
        Ok(())
    })?;
    log_info!("renamed collection {} to {}", from, to);
    Ok(())
}

// ========== INDEX BUILDS ==========

/// Outcome of `createIndexes`.
#[derive(Debug, Clone, Default)]
pub struct CreateIndexesOutcome {
    pub created_collection_automatically: bool,
    pub num_indexes_before: usize,
    pub num_indexes_after: usize,
    pub note: Option<String>,
}

/// Build every index in `specs` on `ns`, creating the collection if needed.
pub fn create_indexes(
    shared: &EngineShared,
    ns: &str,
    specs: &[Document],
    op: &OperationContext,
) -> Result<CreateIndexesOutcome> {
    if specs.is_empty() {
        return Err(QuarryError::BadValue("must specify at least one index".into()));
    }
    validate_namespace(ns)?;
    let (entry, created) = ensure_collection(shared, ns, op)?;
    let before = entry.indexes.iter().filter(|i| i.is_ready()).count();

    let mut wanted: Vec<IndexDescriptor> = Vec::new();
    for spec in specs {
        let descriptor = IndexDescriptor::from_spec(spec, entry.collation.as_ref())?;
        let mut exists = false;
        for existing in entry.indexes.iter().map(|i| &i.descriptor).chain(wanted.iter()) {
            exists |= descriptor.check_against(existing)?;
        }
        if !exists {
            wanted.push(descriptor);
        }
    }
    if wanted.is_empty() {
        return Ok(CreateIndexesOutcome {
            created_collection_automatically: created,
            num_indexes_before: before,
            num_indexes_after: before,
            note: Some("all indexes already exist".into()),
        });
    }

    let mut builders = Vec::with_capacity(wanted.len());
    for descriptor in wanted {
        builders.push(IndexBuilder::start(shared, ns, descriptor, op)?);
    }
    for builder in &builders {
        builder.run(op)?;
    }
    let after = shared
        .catalog
        .get(ns)
        .map(|e| e.indexes.iter().filter(|i| i.is_ready()).count())
        .unwrap_or(before);
    Ok(CreateIndexesOutcome {
        created_collection_automatically: created,
        num_indexes_before: before,
        num_indexes_after: after,
        note: None,
    })
}

/// One in-progress index build, driven phase by phase.
pub struct IndexBuilder<'a> {
    shared: &'a EngineShared,
    ns: String,
    descriptor: IndexDescriptor,
    tree: Arc<IndexTree>,
    build: Arc<IndexBuild>,
    gate: Arc<CollectionGate>,
}

impl<'a> IndexBuilder<'a> {
    /// Register a Building entry for `descriptor` under the exclusive gate.
    pub fn start(shared: &'a EngineShared, ns: &str, descriptor: IndexDescriptor, op: &OperationContext) -> Result<Self> {
        let entry = shared
            .catalog
            .get(ns)
            .ok_or_else(|| QuarryError::NamespaceNotFound(ns.to_string()))?;
        let _gate = ExclusiveGate::enter(&entry.gate, op)?;
        let scan_ts = shared.coordinator.current_ts();
        let build = Arc::new(IndexBuild::new(shared.next_build_id(), ns, descriptor.name.as_str(), scan_ts));
        let tree = Arc::new(IndexTree::new());
        let index = IndexEntry {
            descriptor: descriptor.clone(),
            tree: tree.clone(),
            state: IndexState::Building(build.clone()),
            multikey: false,
        };
        shared.catalog.modify_collection(ns, |entry| {
            if entry.index(&descriptor.name).is_some() {
                return Err(QuarryError::new(
                    ErrorCode::IndexOptionsConflict,
                    format!("an index named {} already exists or is being built", descriptor.name),
                ));
            }
            entry.indexes.push(Arc::new(index));
            entry.index_generation += 1;
            Ok(())
        })?;
        shared.metrics.index_builds_started.incr();
        log_info!("index build {} started: {} on {} at ts {}", build.id, descriptor.name, ns, scan_ts);
        Ok(IndexBuilder {
            shared,
            ns: ns.to_string(),
            descriptor,
            tree,
            build,
            gate: entry.gate.clone(),
        })
    }

    pub fn build(&self) -> &Arc<IndexBuild> {
        &self.build
    }

    /// Run every remaining phase, cleaning up on failure.
    pub fn run(&self, op: &OperationContext) -> Result<()> {
        let result = self.scan(op).and_then(|_| self.drain()).and_then(|_| self.commit(op));
        if let Err(err) = &result {
            self.abort(&err.to_string());
        }
        result
    }

    /// Collection scan at the build snapshot, sorted externally and bulk
    /// loaded into the new tree.
    pub fn scan(&self, op: &OperationContext) -> Result<()> {
        self.build.check_not_aborted()?;
        let entry = self
            .shared
            .catalog
            .get(&self.ns)
            .ok_or_else(|| QuarryError::NamespaceNotFound(self.ns.clone()))?;
        let pin = self.shared.coordinator.pin_history(Some(self.build.scan_ts))?;
        let scanned = self.scan_pinned(&entry, op);
        self.shared.coordinator.release_pin(pin)?;
        let keys = scanned?;
        self.tree.bulk_load(self.build.scan_ts, keys);
        self.build.advance(BuildPhase::Draining)
    }

    fn scan_pinned(&self, entry: &CollectionEntry, op: &OperationContext) -> Result<Vec<IndexEntryKey>> {
        let view = ReadView {
            read_ts: self.build.scan_ts,
            reader: None,
        };
        let mut sorter: Sorter<IndexEntryKey, ()> = Sorter::new("index build", self.shared.sorter_options(true));
        let mut multikey = false;
        let mut after = None;
        loop {
            self.build.check_not_aborted()?;
            let batch = entry.records.scan_batch(&view, after, ScanDirection::Forward, BUILD_SCAN_BATCH);
            let Some((last, _)) = batch.last() else {
                break;
            };
            after = Some(*last);
            for (rid, doc) in &batch {
                op.check_periodically()?;
                let generated = self.descriptor.keys(doc)?;
                multikey |= generated.multikey;
                for key in generated.keys {
                    let size = key.values().map(Value::bson_size).sum::<usize>() + 16;
                    sorter.push((key, *rid), (), size)?;
                }
            }
        }
        if multikey {
            self.shared.catalog.set_multikey(&self.ns, &self.descriptor.name)?;
        }
        let mut stream = sorter.finish()?;
        let mut keys = Vec::new();
        while let Some((key, ())) = stream.next_record()? {
            keys.push(key);
        }
        log_debug!("index build {} scanned {} keys", self.build.id, keys.len());
        Ok(keys)
    }

    /// Apply side writes of writers that have resolved.
    pub fn drain(&self) -> Result<()> {
        self.build.check_not_aborted()?;
        let stats = self.build.drain(&self.tree);
        log_debug!(
            "index build {} drained: {} applied, {} discarded, {} pending",
            self.build.id,
            stats.applied,
            stats.discarded,
            stats.pending
        );
        Ok(())
    }

    /// Final drain under the exclusive gate, unique check, and publication.
    pub fn commit(&self, op: &OperationContext) -> Result<()> {
        let _gate = ExclusiveGate::enter(&self.gate, op)?;
        self.build.check_not_aborted()?;
        let stats = self.build.drain(&self.tree);
        if stats.pending > 0 {
            return Err(QuarryError::new(
                ErrorCode::InternalError,
                format!("{} side writes still pending at index commit", stats.pending),
            ));
        }
        self.build.advance(BuildPhase::Committing)?;
        if self.descriptor.unique {
            if let Some(key) = self.tree.find_duplicate(&ReadView::latest()) {
                return Err(QuarryError::DuplicateKey {
                    ns: self.ns.clone(),
                    index: self.descriptor.name.clone(),
                    key: self.descriptor.describe_key(&key),
                });
            }
        }
        let mut command = Document::new();
        command.insert("createIndexes", coll_name(&self.ns));
        command.insert("spec", self.descriptor.to_spec());
        let build_id = self.build.id;
        commit_catalog_change(self.shared, vec![command_op(&self.ns, command)], |ts| {
            self.shared.catalog.modify_collection(&self.ns, |entry| {
                let position = entry
                    .indexes
                    .iter()
                    .position(|i| i.build().map(|b| b.id) == Some(build_id))
                    .ok_or_else(|| QuarryError::IndexBuildAborted(format!("index {} was dropped", self.descriptor.name)))?;
                let current = &entry.indexes[position];
                entry.indexes[position] = Arc::new(IndexEntry {
                    descriptor: current.descriptor.clone(),
                    tree: current.tree.clone(),
                    state: IndexState::Ready { ready_ts: ts },
                    multikey: current.multikey,
                });
                entry.index_generation += 1;
                Ok(())
            })?;
            self.shared.plan_cache.evict_namespace(&self.ns);
            Ok(())
        })?;
        self.build.advance(BuildPhase::Committed)?;
        self.shared.metrics.index_builds_committed.incr();
        log_info!("index build {} committed: {} on {}", build_id, self.descriptor.name, self.ns);
        Ok(())
    }

    /// Abort the build and remove its catalog entry.
    pub fn abort(&self, reason: &str) {
        self.build.abort(reason);
        let build_id = self.build.id;
        let removed = self.shared.catalog.modify_collection(&self.ns, |entry| {
            let before = entry.indexes.len();
            entry.indexes.retain(|i| i.build().map(|b| b.id) != Some(build_id));
            if entry.indexes.len() != before {
                entry.index_generation += 1;
            }
            Ok(())
        });
        if let Err(err) = removed {
            log_debug!("index build {} cleanup: {}", build_id, err);
        }
        self.shared.metrics.index_builds_aborted.incr();
        log_warn!("index build {} aborted: {}", build_id, reason);
    }
}

// ========== DROP INDEXES ==========

/// Resolve a `dropIndexes.index` argument to index names.
fn resolve_targets(entry: &CollectionEntry, target: &Value) -> Result<Vec<String>> {
    let by_name = |name: &str| -> Result<String> {
        if name == ID_INDEX_NAME {
            return Err(QuarryError::InvalidOptions("cannot drop _id index".into()));
        }
        entry
            .index(name)
            .map(|i| i.descriptor.name.clone())
            .ok_or_else(|| QuarryError::IndexNotFound(name.to_string()))
    };
    match target {
        Value::String(s) if s == "*" => Ok(entry
            .indexes
            .iter()
            .filter(|i| !i.descriptor.is_id())
            .map(|i| i.descriptor.name.clone())
            .collect()),
        Value::String(name) => Ok(vec![by_name(name)?]),
        Value::Array(names) => names
            .iter()
            .map(|n| {
                n.as_str()
                    .ok_or_else(|| QuarryError::TypeMismatch("index names must be strings".into()))
                    .and_then(by_name)
            })
            .collect(),
        Value::Document(pattern) => {
            let pattern = crate::index::KeyPattern::parse(pattern)?;
            let index = entry
                .indexes
                .iter()
                .find(|i| i.descriptor.pattern == pattern)
                .ok_or_else(|| QuarryError::IndexNotFound(pattern.default_name()))?;
            if index.descriptor.is_id() {
                return Err(QuarryError::InvalidOptions("cannot drop _id index".into()));
            }
            Ok(vec![index.descriptor.name.clone()])
        }
        other => Err(QuarryError::TypeMismatch(format!(
            "dropIndexes 'index' must be a string, array or object, not {}",
            other.type_name()
        ))),
    }
}

/// Drop indexes from `ns`, returning how many indexes existed before.
/// In-progress builds among the targets are aborted.
pub fn drop_indexes(shared: &EngineShared, ns: &str, target: &Value, op: &OperationContext) -> Result<usize> {
    let entry = shared
        .catalog
        .get(ns)
        .ok_or_else(|| QuarryError::NamespaceNotFound(ns.to_string()))?;
    let before = entry.indexes.len();
    let names = resolve_targets(&entry, target)?;
    if names.is_empty() {
        return Ok(before);
    }
    for name in &names {
        if let Some(build) = entry.index(name).and_then(|i| i.build()) {
            build.abort(format!("index {} dropped while building", name));
        }
    }
    let _gate = ExclusiveGate::enter(&entry.gate, op)?;
    let ops = names
        .iter()
        .map(|name| {
            let mut command = Document::new();
            command.insert("dropIndexes", coll_name(ns));
            command.insert("index", name.as_str());
            command_op(ns, command)
        })
        .collect();
    commit_catalog_change(shared, ops, |_| {
        shared.catalog.modify_collection(ns, |entry| {
            entry.indexes.retain(|i| !names.contains(&i.descriptor.name));
            entry.index_generation += 1;
            Ok(())
        })?;
        shared.plan_cache.evict_namespace(ns);
        Ok(())
    })?;
    log_info!("dropped indexes {:?} on {}", names, ns);
    Ok(before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{with_write_retry, CollectionWriter};
    use crate::doc;
    use crate::engine::Engine;

    fn insert(shared: &EngineShared, ns: &str, doc: Document) -> Result<Value> {
        let op = OperationContext::new();
        with_write_retry(shared, &op, |txn| CollectionWriter::open(shared, txn, &op, ns)?.insert(doc.clone()))
    }

    #[test]
    fn test_create_twice_fails() {
        let engine = Engine::in_memory();
        let op = OperationContext::new();
        create_collection(engine.shared(), "test.c", &Document::new(), &op).unwrap();
        let err = create_collection(engine.shared(), "test.c", &Document::new(), &op).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NamespaceExists);
        assert!(drop_collection(engine.shared(), "test.c", &op).unwrap());
        assert!(!drop_collection(engine.shared(), "test.c", &op).unwrap());
    }

    #[test]
    fn test_build_with_interleaved_writes() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let op = OperationContext::new();
        create_collection(shared, "test.c", &Document::new(), &op).unwrap();
        for i in 0..10 {
            insert(shared, "test.c", doc!({"_id": i, "a": i})).unwrap();
        }
        let descriptor = IndexDescriptor::from_spec(&doc!({"key": {"a": 1}, "name": "a_1"}), None).unwrap();
        let builder = IndexBuilder::start(shared, "test.c", descriptor, &op).unwrap();
        insert(shared, "test.c", doc!({"_id": 10, "a": [10, 11]})).unwrap();
        builder.scan(&op).unwrap();
        insert(shared, "test.c", doc!({"_id": 11, "a": 12})).unwrap();
        builder.drain().unwrap();
        builder.commit(&op).unwrap();

        let entry = shared.catalog.get("test.c").unwrap();
        let index = entry.index("a_1").unwrap();
        assert!(index.is_ready());
        assert!(index.multikey);
        // 10 scanned + 2 from the array + 1 late insert.
        assert_eq!(index.tree.visible_entries(&ReadView::latest()).len(), 13);
    }

    #[test]
    fn test_unique_build_fails_on_duplicates() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let op = OperationContext::new();
        create_collection(shared, "test.c", &Document::new(), &op).unwrap();
        insert(shared, "test.c", doc!({"_id": 1, "a": 1})).unwrap();
        insert(shared, "test.c", doc!({"_id": 2, "a": 1})).unwrap();
        let err = create_indexes(shared, "test.c", &[doc!({"key": {"a": 1}, "name": "a_1", "unique": true})], &op)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
        assert!(shared.catalog.get("test.c").unwrap().index("a_1").is_none());
    }

    #[test]
    fn test_drop_index_aborts_build() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let op = OperationContext::new();
        create_collection(shared, "test.c", &Document::new(), &op).unwrap();
        insert(shared, "test.c", doc!({"_id": 1, "a": 1})).unwrap();
        let descriptor = IndexDescriptor::from_spec(&doc!({"key": {"a": 1}}), None).unwrap();
        let builder = IndexBuilder::start(shared, "test.c", descriptor, &op).unwrap();
        drop_indexes(shared, "test.c", &Value::from("a_1"), &op).unwrap();
        let err = builder.run(&op).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IndexBuildAborted);
    }

    #[test]
    fn test_drop_id_index_rejected() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let op = OperationContext::new();
        create_collection(shared, "test.c", &Document::new(), &op).unwrap();
        let err = drop_indexes(shared, "test.c", &Value::from("_id_"), &op).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOptions);
        let err = drop_indexes(shared, "test.c", &Value::from("nope"), &op).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IndexNotFound);
    }

    #[test]
    fn test_rename_replaces_target() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let op = OperationContext::new();
        create_collection(shared, "test.tmp", &Document::new(), &op).unwrap();
        create_collection(shared, "test.out", &Document::new(), &op).unwrap();
        insert(shared, "test.tmp", doc!({"_id": 1})).unwrap();
        insert(shared, "test.out", doc!({"_id": 2})).unwrap();
        let err = rename_collection(shared, "test.tmp", "test.out", false, &op).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NamespaceExists);
        rename_collection(shared, "test.tmp", "test.out", true, &op).unwrap();
        assert!(shared.catalog.get("test.tmp").is_none());
        let entry = shared.catalog.get("test.out").unwrap();
        assert_eq!(entry.records.count(&ReadView::latest()), 1);
        insert(shared, "test.out", doc!({"_id": 3})).unwrap();
    }
}
