// quarry-core/src/pipeline/lookup.rs
//! Correlated stages reading a second collection: `$lookup` and `$unionWith`.
//!
//! Equality `$lookup` picks one join strategy when it first runs:
//!
//! ```text
//! foreign field indexed, same collation  -> index probe per outer document
//! otherwise                              -> hash table built once
//!   table over the memory limit          -> QueryExceededMemoryLimitNoDiskUseAllowed
//!                                           or hash partitions spilled to disk
//! ```
//!
//! The pipeline form re-runs its sub-pipeline from scratch for every outer
//! document with that document's `let` bindings. Nothing computed for one
//! outer document is reused for the next.

use std::collections::BTreeSet;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::{AHashMap, RandomState};

use crate::catalog::CollectionEntry;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::query::planner::{distinct_values_of, plan_find, FindQuery};
use crate::storage::{SpillFile, SpillWriter};
use crate::value::Value;
use crate::{log_debug, log_trace};

use super::{
    bind_let, build_chain, expect_document, run_to_vec, stage_doc, DocumentSource, Nesting, ParseOptions, Pipeline,
    PipelineContext,
};

const SPILL_PARTITIONS: usize = 16;

fn collection_name(stage: &str, field: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) if !s.is_empty() && !s.starts_with('$') && !s.contains('\0') => Ok(s.clone()),
        Value::String(_) => Err(QuarryError::BadValue(format!("invalid '{}' collection for {}", field, stage))),
        Value::Document(_) => Err(QuarryError::BadValue(format!(
            "{} from another database is not supported",
            stage
        ))),
        other => Err(QuarryError::TypeMismatch(format!(
            "{} '{}' must be a string, found {}",
            stage,
            field,
            other.type_name()
        ))),
    }
}

fn field_path(stage: &str, name: &str, value: &Value) -> Result<String> {
    match value.as_str() {
        Some(s) if !s.is_empty() && !s.starts_with('$') => Ok(s.to_string()),
        _ => Err(QuarryError::BadValue(format!("{} '{}' must be a non-empty field path", stage, name))),
    }
}

// ========== $lookup ==========

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub from: String,
    pub as_field: String,
    pub local_field: Option<String>,
    pub foreign_field: Option<String>,
    pub let_vars: Option<Document>,
    pub pipeline: Option<Pipeline>,
    spec: Document,
}

impl LookupSpec {
    pub fn parse(spec: &Document, opts: &ParseOptions) -> Result<Self> {
        let mut from = None;
        let mut as_field = None;
        let mut local_field = None;
        let mut foreign_field = None;
        let mut let_vars = None;
        let mut pipeline = None;
        for (key, value) in spec.iter() {
            match key.as_str() {
                "from" => from = Some(collection_name("$lookup", "from", value)?),
                "as" => as_field = Some(field_path("$lookup", "as", value)?),
                "localField" => local_field = Some(field_path("$lookup", "localField", value)?),
                "foreignField" => foreign_field = Some(field_path("$lookup", "foreignField", value)?),
                "let" => let_vars = Some(expect_document("$lookup let", value)?.clone()),
                "pipeline" => pipeline = Some(Pipeline::parse_value(value, &opts.nested(Nesting::SubPipeline))?),
                other => {
                    return Err(QuarryError::new(
                        ErrorCode::UnknownField,
                        format!("unknown argument to $lookup: {}", other),
                    ))
                }
            }
        }
        let from = from.ok_or_else(|| QuarryError::BadValue("$lookup requires a 'from' collection".into()))?;
        let as_field = as_field.ok_or_else(|| QuarryError::BadValue("must specify 'as' field for a $lookup".into()))?;
        if local_field.is_some() != foreign_field.is_some() {
            return Err(QuarryError::BadValue(
                "$lookup requires both or neither of 'localField' and 'foreignField'".into(),
            ));
        }
        if local_field.is_none() && pipeline.is_none() {
            return Err(QuarryError::BadValue(
                "$lookup requires either 'pipeline' or both 'localField' and 'foreignField'".into(),
            ));
        }
        if let_vars.is_some() && pipeline.is_none() {
            return Err(QuarryError::BadValue("$lookup with 'let' must also specify a 'pipeline'".into()));
        }
        Ok(LookupSpec {
            from,
            as_field,
            local_field,
            foreign_field,
            let_vars,
            pipeline,
            spec: spec.clone(),
        })
    }
}

/// Values of `field` in `doc` used to probe the foreign side. Arrays
/// contribute their elements; a missing field probes for null.
fn local_values(doc: &Document, field: &str) -> Vec<Value> {
    let mut values = distinct_values_of(doc, field);
    if let Some(Value::Array(items)) = doc.get_path(field) {
        if items.is_empty() {
            values.push(Value::Null);
        }
    }
    if values.is_empty() {
        values.push(Value::Null);
    }
    values
}

fn in_filter(field: &str, values: Vec<Value>) -> Document {
    let mut condition = Document::new();
    condition.insert("$in", Value::Array(values));
    let mut filter = Document::new();
    filter.insert(field, condition);
    filter
}

/// Foreign documents, hashed by the collated value of the foreign field.
struct HashTable {
    docs: Vec<Document>,
    buckets: AHashMap<Value, Vec<usize>>,
}

/// Hash table too large for memory: `(seq, document)` records in
/// partitions chosen by key hash.
struct SpilledTable {
    partitions: Vec<SpillFile>,
    hasher: RandomState,
}

enum JoinStrategy {
    IndexProbe { index: String },
    Memory(HashTable),
    Spilled(SpilledTable),
}

pub struct LookupStage {
    source: Box<dyn DocumentSource>,
    spec: LookupSpec,
    strategy: Option<JoinStrategy>,
}

impl LookupStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: LookupSpec) -> Self {
        LookupStage {
            source,
            spec,
            strategy: None,
        }
    }

    fn foreign_entry(&self, ctx: &PipelineContext<'_>) -> Option<std::sync::Arc<CollectionEntry>> {
        ctx.shared
            .catalog
            .get(&ctx.env.namespace(&self.spec.from))
            .filter(|e| e.visible_at(ctx.env.view.read_ts))
    }

    fn key(value: &Value, ctx: &PipelineContext<'_>) -> Value {
        match ctx.collation() {
            Some(collation) => collation.comparison_key(value),
            None => value.clone(),
        }
    }

    fn choose_strategy(&self, ctx: &PipelineContext<'_>, foreign_field: &str) -> Result<JoinStrategy> {
        let entry = self.foreign_entry(ctx);
        if let Some(entry) = &entry {
            let probe = entry.usable_indexes(ctx.env.view.read_ts).find(|index| {
                let d = &index.descriptor;
                d.pattern.first_field() == foreign_field
                    && !d.sparse
                    && d.partial_filter.is_none()
                    && d.collation.as_ref().filter(|c| !c.is_simple()) == ctx.collation()
            });
            if let Some(index) = probe {
                log_debug!("$lookup from {} probing index {}", self.spec.from, index.descriptor.name);
                return Ok(JoinStrategy::IndexProbe {
                    index: index.descriptor.name.clone(),
                });
            }
        }
        let ns = ctx.env.namespace(&self.spec.from);
        let query = FindQuery {
            collation: ctx.env.collation.clone(),
            ..FindQuery::default()
        };
        let mut scan = plan_find(ctx.shared, entry, &query, ctx.env.view, ctx.op)?;
        let limit = ctx.memory_limit();
        let mut table = HashTable {
            docs: Vec::new(),
            buckets: AHashMap::new(),
        };
        let mut bytes = 0u64;
        while let Some(doc) = scan.next_document(ctx.shared, ctx.op)? {
            ctx.op.check_periodically()?;
            bytes += doc.bson_size() as u64;
            if bytes > limit {
                if !ctx.env.allow_disk_use {
                    return Err(crate::storage::memory_limit_error("$lookup", limit));
                }
                log_debug!("$lookup from {} spilling hash table to disk", ns);
                return self.spill_table(ctx, table.docs, doc, scan, foreign_field).map(JoinStrategy::Spilled);
            }
            let seq = table.docs.len();
            for value in local_values(&doc, foreign_field) {
                table.buckets.entry(Self::key(&value, ctx)).or_default().push(seq);
            }
            table.docs.push(doc);
        }
        Ok(JoinStrategy::Memory(table))
    }

    fn spill_table(
        &self,
        ctx: &PipelineContext<'_>,
        loaded: Vec<Document>,
        current: Document,
        mut scan: crate::query::PlanExecutor,
        foreign_field: &str,
    ) -> Result<SpilledTable> {
        let hasher = RandomState::new();
        let dir = ctx.shared.spill_dir();
        let mut writers = (0..SPILL_PARTITIONS)
            .map(|_| SpillWriter::create(&dir))
            .collect::<Result<Vec<_>>>()?;
        let mut seq = 0u64;
        let mut write = |doc: Document, writers: &mut Vec<SpillWriter>| -> Result<()> {
            let mut targets = BTreeSet::new();
            for value in local_values(&doc, foreign_field) {
                targets.insert(partition_of(&hasher, &Self::key(&value, ctx)));
            }
            for target in targets {
                writers[target].write(&(seq, &doc))?;
            }
            seq += 1;
            Ok(())
        };
        for doc in loaded {
            write(doc, &mut writers)?;
        }
        write(current, &mut writers)?;
        while let Some(doc) = scan.next_document(ctx.shared, ctx.op)? {
            ctx.op.check_periodically()?;
            write(doc, &mut writers)?;
        }
        let partitions = writers
            .into_iter()
            .map(|w| w.finish(Some(ctx.shared.metrics.as_ref())))
            .collect::<Result<Vec<_>>>()?;
        Ok(SpilledTable { partitions, hasher })
    }

    fn equality_matches(&self, outer: &Document, ctx: &PipelineContext<'_>) -> Result<Vec<Document>> {
        let (Some(local_field), Some(foreign_field)) = (&self.spec.local_field, &self.spec.foreign_field) else {
            return Ok(Vec::new());
        };
        let values = local_values(outer, local_field);
        match &self.strategy {
            Some(JoinStrategy::IndexProbe { index }) => {
                let query = FindQuery {
                    filter: in_filter(foreign_field, values),
                    hint: Some(Value::from(index.as_str())),
                    collation: ctx.env.collation.clone(),
                    ..FindQuery::default()
                };
                let entry = self.foreign_entry(ctx);
                plan_find(ctx.shared, entry, &query, ctx.env.view, ctx.op)?.collect_documents(ctx.shared, ctx.op)
            }
            Some(JoinStrategy::Memory(table)) => {
                let mut hits = BTreeSet::new();
                for value in &values {
                    if let Some(seqs) = table.buckets.get(&Self::key(value, ctx)) {
                        hits.extend(seqs.iter().copied());
                    }
                }
                Ok(hits.into_iter().map(|seq| table.docs[seq].clone()).collect())
            }
            Some(JoinStrategy::Spilled(table)) => {
                let wanted: BTreeSet<Value> = values.iter().map(|v| Self::key(v, ctx)).collect();
                let partitions: BTreeSet<usize> = wanted.iter().map(|k| partition_of(&table.hasher, k)).collect();
                let mut hits = std::collections::BTreeMap::new();
                for partition in partitions {
                    let mut reader = table.partitions[partition].reader::<(u64, Document)>();
                    while let Some((seq, doc)) = reader.next_record()? {
                        let matched = local_values(&doc, foreign_field)
                            .iter()
                            .any(|v| wanted.contains(&Self::key(v, ctx)));
                        if matched {
                            hits.insert(seq, doc);
                        }
                    }
                }
                Ok(hits.into_values().collect())
            }
            None => Ok(Vec::new()),
        }
    }

    fn pipeline_matches(&self, outer: &Document, ctx: &PipelineContext<'_>) -> Result<Vec<Document>> {
        let Some(pipeline) = &self.spec.pipeline else {
            return Ok(Vec::new());
        };
        let vars = match &self.spec.let_vars {
            Some(let_vars) => bind_let(ctx.vars(), let_vars, outer)?,
            None => ctx.vars().clone(),
        };
        let env = ctx.env.with_vars(vars);
        let sub_ctx = PipelineContext {
            shared: ctx.shared,
            op: ctx.op,
            env: &env,
        };
        let ns = ctx.env.namespace(&self.spec.from);
        let pipeline = match (&self.spec.local_field, &self.spec.foreign_field) {
            (Some(local_field), Some(foreign_field)) => {
                let mut stages = vec![Value::Document(stage_doc(
                    "$match",
                    in_filter(foreign_field, local_values(outer, local_field)),
                ))];
                stages.extend(pipeline.to_values());
                let opts = ParseOptions {
                    collation: ctx.env.collation.clone(),
                    nesting: Nesting::SubPipeline,
                    explicit_txn: ctx.env.explicit_txn,
                };
                Pipeline::parse(&stages, &opts)?
            }
            _ => pipeline.clone(),
        };
        log_trace!("$lookup running sub-pipeline on {}", ns);
        run_to_vec(&sub_ctx, &ns, &pipeline)
    }
}

fn partition_of(hasher: &RandomState, key: &Value) -> usize {
    let mut state = hasher.build_hasher();
    key.hash(&mut state);
    (state.finish() as usize) % SPILL_PARTITIONS
}

impl DocumentSource for LookupStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        let Some(mut outer) = self.source.get_next(ctx)? else {
            return Ok(None);
        };
        let matches = if self.spec.pipeline.is_some() {
            self.pipeline_matches(&outer, ctx)?
        } else {
            if self.strategy.is_none() {
                let foreign_field = self.spec.foreign_field.clone().unwrap_or_default();
                self.strategy = Some(self.choose_strategy(ctx, &foreign_field)?);
            }
            self.equality_matches(&outer, ctx)?
        };
        outer.set_path(&self.spec.as_field, Value::Array(matches.into_iter().map(Value::Document).collect()))?;
        let size = outer.bson_size();
        let limit = ctx.shared.params.max_document_bytes() as usize;
        if size > limit {
            return Err(QuarryError::BsonObjectTooLarge { size, limit });
        }
        Ok(Some(outer))
    }

    fn name(&self) -> &'static str {
        "$lookup"
    }

    fn explain(&self) -> Document {
        let mut doc = stage_doc("$lookup", self.spec.spec.clone());
        let strategy = match &self.strategy {
            Some(JoinStrategy::IndexProbe { index }) => Some(format!("IndexedLoopJoin({})", index)),
            Some(JoinStrategy::Memory(_)) => Some("HashJoin".to_string()),
            Some(JoinStrategy::Spilled(_)) => Some("HashJoin(spilled)".to_string()),
            None if self.spec.pipeline.is_some() => Some("NestedLoopJoin".to_string()),
            None => None,
        };
        if let Some(strategy) = strategy {
            doc.insert("strategy", strategy);
        }
        doc
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $unionWith ==========

#[derive(Debug, Clone)]
pub struct UnionWithSpec {
    pub coll: String,
    pub pipeline: Pipeline,
    spec: Value,
}

impl UnionWithSpec {
    pub fn parse(spec: &Value, opts: &ParseOptions) -> Result<Self> {
        let sub_opts = opts.nested(Nesting::SubPipeline);
        match spec {
            Value::String(_) => Ok(UnionWithSpec {
                coll: collection_name("$unionWith", "coll", spec)?,
                pipeline: Pipeline::default(),
                spec: spec.clone(),
            }),
            Value::Document(doc) => {
                let mut coll = None;
                let mut pipeline = Pipeline::default();
                for (key, value) in doc.iter() {
                    match key.as_str() {
                        "coll" => coll = Some(collection_name("$unionWith", "coll", value)?),
                        "pipeline" => pipeline = Pipeline::parse_value(value, &sub_opts)?,
                        other => {
                            return Err(QuarryError::new(
                                ErrorCode::UnknownField,
                                format!("unknown argument to $unionWith: {}", other),
                            ))
                        }
                    }
                }
                let coll = coll.ok_or_else(|| QuarryError::BadValue("$unionWith requires a 'coll'".into()))?;
                Ok(UnionWithSpec {
                    coll,
                    pipeline,
                    spec: spec.clone(),
                })
            }
            other => Err(QuarryError::TypeMismatch(format!(
                "$unionWith must be a string or an object, found {}",
                other.type_name()
            ))),
        }
    }
}

pub struct UnionWithStage {
    source: Box<dyn DocumentSource>,
    spec: UnionWithSpec,
    source_done: bool,
    union: Option<Box<dyn DocumentSource>>,
}

impl UnionWithStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: UnionWithSpec) -> Self {
        UnionWithStage {
            source,
            spec,
            source_done: false,
            union: None,
        }
    }
}

impl DocumentSource for UnionWithStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        if !self.source_done {
            if let Some(doc) = self.source.get_next(ctx)? {
                return Ok(Some(doc));
            }
            self.source_done = true;
        }
        if self.union.is_none() {
            let ns = ctx.env.namespace(&self.spec.coll);
            let entry = ctx.shared.catalog.get(&ns).filter(|e| e.visible_at(ctx.env.view.read_ts));
            self.union = Some(build_chain(ctx.shared, ctx.env, &ns, entry, &self.spec.pipeline, ctx.op)?);
        }
        match &mut self.union {
            Some(union) => union.get_next(ctx),
            None => Ok(None),
        }
    }

    fn name(&self) -> &'static str {
        "$unionWith"
    }

    fn explain(&self) -> Document {
        stage_doc("$unionWith", self.spec.spec.clone())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{with_write_retry, CollectionWriter};
    use crate::doc;
    use crate::engine::{Engine, EngineShared};
    use crate::interrupt::OperationContext;
    use crate::pipeline::{AggregateRequest, PipelineExecutor};

    fn seed(shared: &EngineShared, ns: &str, docs: Vec<Document>) {
        let op = OperationContext::new();
        crate::ddl::ensure_collection(shared, ns, &op).unwrap();
        with_write_retry(shared, &op, |txn| {
            let writer = CollectionWriter::open(shared, txn, &op, ns)?;
            for doc in &docs {
                writer.insert(doc.clone())?;
            }
            Ok(())
        })
        .unwrap();
    }

    fn aggregate(shared: &EngineShared, ns: &str, pipeline: serde_json::Value, disk: bool) -> Result<Vec<Document>> {
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let pipeline = match Value::from_json(&pipeline)? {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        let request = AggregateRequest {
            ns: ns.to_string(),
            pipeline,
            allow_disk_use: disk,
            ..AggregateRequest::default()
        };
        PipelineExecutor::prepare(shared, &request, txn.view(), &op)?.collect(shared, &op)
    }

    fn orders_and_items(shared: &EngineShared) {
        seed(
            shared,
            "test.orders",
            vec![
                doc!({"_id": 1, "item": "a", "qty": 2}),
                doc!({"_id": 2, "item": "b", "qty": 1}),
                doc!({"_id": 3, "qty": 9}),
            ],
        );
        seed(
            shared,
            "test.items",
            vec![
                doc!({"_id": 10, "sku": "a", "price": 5}),
                doc!({"_id": 11, "sku": "c", "price": 7}),
                doc!({"_id": 12, "price": 1}),
            ],
        );
    }

    fn joined_ids(docs: &[Document]) -> Vec<Vec<i64>> {
        docs.iter()
            .map(|d| {
                d.get("inv")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|x| x.as_document()?.id()?.as_i64()).collect())
                    .unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn test_equality_lookup_hash_and_index() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        orders_and_items(shared);
        let pipeline = serde_json::json!([
            {"$lookup": {"from": "items", "localField": "item", "foreignField": "sku", "as": "inv"}}
        ]);
        let hashed = aggregate(shared, "test.orders", pipeline.clone(), false).unwrap();
        assert_eq!(joined_ids(&hashed), vec![vec![10], vec![], vec![12]]);

        let op = OperationContext::new();
        crate::ddl::create_indexes(shared, "test.items", &[doc!({"key": {"sku": 1}, "name": "sku_1"})], &op).unwrap();
        let probed = aggregate(shared, "test.orders", pipeline, false).unwrap();
        assert_eq!(joined_ids(&probed), vec![vec![10], vec![], vec![12]]);
    }

    #[test]
    fn test_hash_join_spills_when_allowed() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        orders_and_items(shared);
        shared
            .params
            .set("internalQueryMaxBlockingMemoryBytes", &serde_json::json!(40))
            .unwrap();
        let pipeline = serde_json::json!([
            {"$lookup": {"from": "items", "localField": "item", "foreignField": "sku", "as": "inv"}}
        ]);
        let err = aggregate(shared, "test.orders", pipeline.clone(), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueryExceededMemoryLimitNoDiskUseAllowed);
        let spilled = aggregate(shared, "test.orders", pipeline, true).unwrap();
        assert_eq!(joined_ids(&spilled), vec![vec![10], vec![], vec![12]]);
    }

    #[test]
    fn test_correlated_pipeline_runs_per_document() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        orders_and_items(shared);
        let docs = aggregate(
            shared,
            "test.orders",
            serde_json::json!([
                {"$lookup": {
                    "from": "items",
                    "let": {"q": "$qty"},
                    "pipeline": [
                        {"$match": {"$expr": {"$gt": ["$price", "$$q"]}}},
                        {"$project": {"_id": 1}}
                    ],
                    "as": "inv"
                }}
            ]),
            false,
        )
        .unwrap();
        assert_eq!(joined_ids(&docs), vec![vec![10, 11], vec![10, 11], vec![]]);
    }

    #[test]
    fn test_union_with() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        orders_and_items(shared);
        let docs = aggregate(
            shared,
            "test.orders",
            serde_json::json!([
                {"$project": {"_id": 1}},
                {"$unionWith": {"coll": "items", "pipeline": [{"$match": {"price": {"$gt": 4}}}, {"$project": {"_id": 1}}]}}
            ]),
            false,
        )
        .unwrap();
        let ids: Vec<i64> = docs.iter().filter_map(|d| d.id().and_then(Value::as_i64)).collect();
        assert_eq!(ids, vec![1, 2, 3, 10, 11]);
        let err = UnionWithSpec::parse(&Value::from("$bad"), &ParseOptions::top(None, false)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
    }
}
