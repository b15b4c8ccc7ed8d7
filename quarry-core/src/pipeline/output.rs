// quarry-core/src/pipeline/output.rs
//! Write-terminal stages. Both drain the pipeline below them and return no
//! documents.
//!
//! `$out` writes into a temporary collection carrying the target's indexes,
//! then renames it over the target in one catalog change; readers see either
//! the old contents or the new, never a mix. `$merge` folds the pipeline
//! output into the target inside a single auto-commit transaction.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::collection::{with_write_retry, CollectionWriter};
use crate::ddl;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::query::planner::{plan_find, FindQuery};
use crate::storage::RecordId;
use crate::txn::Transaction;
use crate::value::Value;
use crate::{log_debug, log_info, log_warn};

use super::{
    bind_let, chain_over, expect_document, stage_doc, DocumentSource, Nesting, ParseOptions, Pipeline, PipelineContext,
};

/// Target of `$out` / `$merge`: a collection name, or `{db, coll}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub db: Option<String>,
    pub coll: String,
}

impl OutputTarget {
    fn parse(stage: &str, value: &Value) -> Result<Self> {
        let name = |v: &Value, what: &str| -> Result<String> {
            match v.as_str() {
                Some(s) if !s.is_empty() && !s.starts_with('$') && !s.contains('\0') => Ok(s.to_string()),
                _ => Err(QuarryError::BadValue(format!("invalid {} '{}' for {}", what, v, stage))),
            }
        };
        match value {
            Value::String(_) => Ok(OutputTarget {
                db: None,
                coll: name(value, "collection")?,
            }),
            Value::Document(doc) => {
                let mut target = OutputTarget {
                    db: None,
                    coll: String::new(),
                };
                for (key, v) in doc.iter() {
                    match key.as_str() {
                        "db" => target.db = Some(name(v, "database")?),
                        "coll" => target.coll = name(v, "collection")?,
                        other => {
                            return Err(QuarryError::new(
                                ErrorCode::UnknownField,
                                format!("unknown field in {} target: {}", stage, other),
                            ))
                        }
                    }
                }
                if target.coll.is_empty() {
                    return Err(QuarryError::BadValue(format!("{} target requires a 'coll'", stage)));
                }
                Ok(target)
            }
            other => Err(QuarryError::TypeMismatch(format!(
                "{} target must be a string or an object, found {}",
                stage,
                other.type_name()
            ))),
        }
    }

    fn namespace(&self, ctx: &PipelineContext<'_>) -> String {
        format!("{}.{}", self.db.as_deref().unwrap_or(&ctx.env.db), self.coll)
    }
}

// ========== $out ==========

#[derive(Debug, Clone)]
pub struct OutSpec {
    pub target: OutputTarget,
    spec: Value,
}

impl OutSpec {
    pub fn parse(spec: &Value) -> Result<Self> {
        Ok(OutSpec {
            target: OutputTarget::parse("$out", spec)?,
            spec: spec.clone(),
        })
    }
}

pub struct OutStage {
    source: Box<dyn DocumentSource>,
    spec: OutSpec,
    done: bool,
}

impl OutStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: OutSpec) -> Self {
        OutStage {
            source,
            spec,
            done: false,
        }
    }

    fn write_temp(&mut self, ctx: &PipelineContext<'_>, target: &str, temp: &str) -> Result<u64> {
        let existing = ctx.shared.catalog.get(target);
        let options = existing.as_ref().map(|e| e.options.clone()).unwrap_or_default();
        ddl::create_collection(ctx.shared, temp, &options, ctx.op)?;
        if let Some(existing) = &existing {
            let specs: Vec<Document> = existing
                .indexes
                .iter()
                .filter(|i| i.is_ready() && !i.descriptor.is_id())
                .map(|i| i.descriptor.to_spec())
                .collect();
            if !specs.is_empty() {
                ddl::create_indexes(ctx.shared, temp, &specs, ctx.op)?;
            }
        }
        // The temporary collection has no other writers.
        let txn = ctx.shared.coordinator.begin(false);
        let writer = CollectionWriter::open(ctx.shared, &txn, ctx.op, temp)?;
        let mut written = 0u64;
        while let Some(doc) = self.source.get_next(ctx)? {
            writer.insert(doc)?;
            written += 1;
        }
        txn.commit(None)?;
        Ok(written)
    }
}

impl DocumentSource for OutStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let target = self.spec.target.namespace(ctx);
        let db = target.split_once('.').map(|(db, _)| db).unwrap_or(&ctx.env.db).to_string();
        let temp = format!("{}.tmp.agg_out.{}", db, Uuid::new_v4().simple());
        let outcome = self
            .write_temp(ctx, &target, &temp)
            .and_then(|written| ddl::rename_collection(ctx.shared, &temp, &target, true, ctx.op).map(|_| written));
        match outcome {
            Ok(written) => {
                log_info!("$out replaced {} with {} documents", target, written);
                Ok(None)
            }
            Err(err) => {
                if let Err(cleanup) = ddl::drop_collection(ctx.shared, &temp, ctx.op) {
                    log_warn!("failed to drop temporary collection {}: {}", temp, cleanup);
                }
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "$out"
    }

    fn explain(&self) -> Document {
        stage_doc("$out", self.spec.spec.clone())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $merge ==========

#[derive(Debug, Clone)]
pub enum WhenMatched {
    Replace,
    KeepExisting,
    Merge,
    Fail,
    Pipeline(Pipeline),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenNotMatched {
    Insert,
    Discard,
    Fail,
}

#[derive(Debug, Clone)]
pub struct MergeSpec {
    pub target: OutputTarget,
    pub on: Vec<String>,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
    pub let_vars: Option<Document>,
    spec: Value,
}

impl MergeSpec {
    pub fn parse(spec: &Value, opts: &ParseOptions) -> Result<Self> {
        if let Value::String(_) = spec {
            return Ok(MergeSpec {
                target: OutputTarget::parse("$merge", spec)?,
                on: vec!["_id".to_string()],
                when_matched: WhenMatched::Merge,
                when_not_matched: WhenNotMatched::Insert,
                let_vars: None,
                spec: spec.clone(),
            });
        }
        let doc = expect_document("$merge", spec)?;
        let mut target = None;
        let mut on = vec!["_id".to_string()];
        let mut when_matched = WhenMatched::Merge;
        let mut when_not_matched = WhenNotMatched::Insert;
        let mut let_vars = None;
        for (key, value) in doc.iter() {
            match key.as_str() {
                "into" => target = Some(OutputTarget::parse("$merge", value)?),
                "on" => on = parse_on(value)?,
                "whenMatched" => {
                    when_matched = match value {
                        Value::String(s) => match s.as_str() {
                            "replace" => WhenMatched::Replace,
                            "keepExisting" => WhenMatched::KeepExisting,
                            "merge" => WhenMatched::Merge,
                            "fail" => WhenMatched::Fail,
                            other => {
                                return Err(QuarryError::BadValue(format!(
                                    "unknown whenMatched mode for $merge: '{}'",
                                    other
                                )))
                            }
                        },
                        Value::Array(_) => {
                            WhenMatched::Pipeline(Pipeline::parse_value(value, &opts.nested(Nesting::MergeUpdate))?)
                        }
                        other => {
                            return Err(QuarryError::TypeMismatch(format!(
                                "$merge whenMatched must be a string or an array, found {}",
                                other.type_name()
                            )))
                        }
                    }
                }
                "whenNotMatched" => {
                    when_not_matched = match value.as_str() {
                        Some("insert") => WhenNotMatched::Insert,
                        Some("discard") => WhenNotMatched::Discard,
                        Some("fail") => WhenNotMatched::Fail,
                        _ => {
                            return Err(QuarryError::BadValue(format!(
                                "unknown whenNotMatched mode for $merge: {}",
                                value
                            )))
                        }
                    }
                }
                "let" => let_vars = Some(expect_document("$merge let", value)?.clone()),
                other => {
                    return Err(QuarryError::new(
                        ErrorCode::UnknownField,
                        format!("unknown field in $merge specification: {}", other),
                    ))
                }
            }
        }
        let target = target.ok_or_else(|| QuarryError::BadValue("$merge requires an 'into' target".into()))?;
        if let_vars.is_some() && !matches!(when_matched, WhenMatched::Pipeline(_)) {
            return Err(QuarryError::BadValue(
                "cannot use 'let' variables with a whenMatched mode other than a pipeline".into(),
            ));
        }
        Ok(MergeSpec {
            target,
            on,
            when_matched,
            when_not_matched,
            let_vars,
            spec: spec.clone(),
        })
    }
}

fn parse_on(value: &Value) -> Result<Vec<String>> {
    let fields: Vec<String> = match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<_>>()
            .ok_or_else(|| QuarryError::TypeMismatch("$merge 'on' must be a string or an array of strings".into()))?,
        _ => {
            return Err(QuarryError::TypeMismatch(
                "$merge 'on' must be a string or a non-empty array of strings".into(),
            ))
        }
    };
    let mut seen = std::collections::BTreeSet::new();
    for field in &fields {
        if field.is_empty() || field.starts_with('$') || !seen.insert(field.as_str()) {
            return Err(QuarryError::BadValue(format!("invalid $merge 'on' field '{}'", field)));
        }
    }
    Ok(fields)
}

/// Yields one document, then ends. Feeds `whenMatched` pipelines.
struct SingleDocument(Option<Document>);

impl DocumentSource for SingleDocument {
    fn get_next(&mut self, _ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        Ok(self.0.take())
    }

    fn name(&self) -> &'static str {
        "$documents"
    }

    fn explain(&self) -> Document {
        Document::new()
    }
}

pub struct MergeStage {
    source: Box<dyn DocumentSource>,
    spec: MergeSpec,
    done: bool,
}

impl MergeStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: MergeSpec) -> Self {
        MergeStage {
            source,
            spec,
            done: false,
        }
    }

    fn is_id_only(&self) -> bool {
        self.spec.on.len() == 1 && self.spec.on[0] == "_id"
    }

    /// Name of the unique index backing the `on` fields.
    fn on_index(&self, ctx: &PipelineContext<'_>, ns: &str) -> Result<String> {
        let entry = ctx
            .shared
            .catalog
            .get(ns)
            .ok_or_else(|| QuarryError::NamespaceNotFound(ns.to_string()))?;
        let mut wanted: Vec<&str> = self.spec.on.iter().map(String::as_str).collect();
        wanted.sort_unstable();
        entry
            .indexes
            .iter()
            .filter(|i| i.is_ready() && i.descriptor.unique && !i.descriptor.is_partial())
            .find(|i| {
                let mut fields: Vec<&str> = i.descriptor.pattern.fields().iter().map(|(f, _)| f.as_str()).collect();
                fields.sort_unstable();
                fields == wanted
            })
            .map(|i| i.descriptor.name.clone())
            .ok_or_else(|| {
                QuarryError::new(
                    ErrorCode::MergeOnFieldsNotUnique,
                    "cannot find index to verify that join fields will be unique",
                )
            })
    }

    /// Equality filter on the `on` fields of `doc`.
    /// The `on` fields of `doc`, which must all be present and scalar.
    fn on_values(&self, doc: &Document) -> Result<Document> {
        let mut values = Document::new();
        for field in &self.spec.on {
            match doc.get_path(field) {
                Some(Value::Null) | None => {
                    return Err(QuarryError::BadValue(format!(
                        "$merge write error: 'on' field '{}' cannot be missing, null or undefined",
                        field
                    )))
                }
                Some(Value::Array(_)) => {
                    return Err(QuarryError::BadValue(format!(
                        "$merge write error: 'on' field '{}' cannot be an array",
                        field
                    )))
                }
                Some(value) => {
                    values.insert(field.as_str(), value.clone());
                }
            }
        }
        Ok(values)
    }

    fn on_filter(&self, doc: &Document) -> Result<Document> {
        let mut filter = Document::new();
        for (field, value) in self.on_values(doc)? {
            let mut eq = Document::new();
            eq.insert("$eq", value);
            filter.insert(field, eq);
        }
        Ok(filter)
    }

    fn find_match(
        &self,
        ctx: &PipelineContext<'_>,
        writer: &CollectionWriter<'_>,
        txn: &Transaction,
        index: &str,
        doc: &Document,
    ) -> Result<Option<(RecordId, Document)>> {
        if self.is_id_only() {
            let Some(id) = doc.id() else {
                return Ok(None);
            };
            return Ok(writer.find_by_id(id)?.map(|(rid, found)| (rid, (*found).clone())));
        }
        let query = FindQuery {
            filter: self.on_filter(doc)?,
            hint: Some(Value::from(index)),
            collation: writer.entry().collation.clone(),
            limit: Some(1),
            ..FindQuery::default()
        };
        let mut executor = plan_find(ctx.shared, Some(writer.entry().clone()), &query, txn.view(), ctx.op)?;
        while let Some(member) = executor.next(ctx.shared, ctx.op)? {
            if let (Some(rid), Some(found)) = (member.rid, member.doc) {
                return Ok(Some((rid, (*found).clone())));
            }
        }
        Ok(None)
    }

    fn apply_pipeline(
        &self,
        ctx: &PipelineContext<'_>,
        pipeline: &Pipeline,
        existing: &Document,
        incoming: &Document,
    ) -> Result<Document> {
        let mut vars = ctx.vars().bind("new", Value::Document(incoming.clone()));
        if let Some(let_vars) = &self.spec.let_vars {
            vars = bind_let(&vars, let_vars, incoming)?;
        }
        let env = ctx.env.with_vars(vars);
        let sub_ctx = PipelineContext {
            shared: ctx.shared,
            op: ctx.op,
            env: &env,
        };
        let mut chain = chain_over(Box::new(SingleDocument(Some(existing.clone()))), pipeline)?;
        let updated = chain.get_next(&sub_ctx)?.ok_or_else(|| {
            QuarryError::BadValue("$merge whenMatched pipeline must produce a document".into())
        })?;
        Ok(updated)
    }

    fn merge_one(
        &self,
        ctx: &PipelineContext<'_>,
        writer: &CollectionWriter<'_>,
        txn: &Transaction,
        index: &str,
        mut doc: Document,
    ) -> Result<()> {
        if self.is_id_only() {
            doc.ensure_id();
        }
        match self.find_match(ctx, writer, txn, index, &doc)? {
            Some((rid, existing)) => {
                let replacement = match &self.spec.when_matched {
                    WhenMatched::KeepExisting => return Ok(()),
                    WhenMatched::Fail => {
                        return Err(QuarryError::DuplicateKey {
                            ns: writer.entry().ns.clone(),
                            index: index.to_string(),
                            key: self.on_values(&doc)?.to_string(),
                        })
                    }
                    WhenMatched::Replace => doc,
                    WhenMatched::Merge => {
                        let mut merged = existing.clone();
                        for (key, value) in doc {
                            merged.insert(key, value);
                        }
                        merged
                    }
                    WhenMatched::Pipeline(pipeline) => self.apply_pipeline(ctx, pipeline, &existing, &doc)?,
                };
                writer.update(rid, &existing, replacement)?;
            }
            None => match self.spec.when_not_matched {
                WhenNotMatched::Insert => {
                    writer.insert(doc)?;
                }
                WhenNotMatched::Discard => {}
                WhenNotMatched::Fail => {
                    return Err(QuarryError::new(
                        ErrorCode::MergeStageNoMatchingDocument,
                        "$merge could not find a matching document in the target collection for at least one document in the source collection",
                    ))
                }
            },
        }
        Ok(())
    }
}

impl DocumentSource for MergeStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let ns = self.spec.target.namespace(ctx);
        let (_, created) = ddl::ensure_collection(ctx.shared, &ns, ctx.op)?;
        let index = if self.is_id_only() {
            crate::index::ID_INDEX_NAME.to_string()
        } else {
            self.on_index(ctx, &ns)?
        };
        let mut pending = VecDeque::new();
        while let Some(doc) = self.source.get_next(ctx)? {
            pending.push_back(doc);
        }
        log_debug!(
            "$merge into {} ({} documents, collection created: {})",
            ns,
            pending.len(),
            created
        );
        with_write_retry(ctx.shared, ctx.op, |txn| {
            let writer = CollectionWriter::open(ctx.shared, txn, ctx.op, &ns)?;
            for doc in &pending {
                ctx.op.check_periodically()?;
                self.merge_one(ctx, &writer, txn, &index, doc.clone())?;
            }
            Ok(())
        })?;
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "$merge"
    }

    fn explain(&self) -> Document {
        stage_doc("$merge", self.spec.spec.clone())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::engine::{Engine, EngineShared};
    use crate::interrupt::OperationContext;
    use crate::pipeline::{AggregateRequest, PipelineExecutor};

    fn seed(shared: &EngineShared, ns: &str, docs: Vec<Document>) {
        let op = OperationContext::new();
        ddl::ensure_collection(shared, ns, &op).unwrap();
        with_write_retry(shared, &op, |txn| {
            let writer = CollectionWriter::open(shared, txn, &op, ns)?;
            for doc in &docs {
                writer.insert(doc.clone())?;
            }
            Ok(())
        })
        .unwrap();
    }

    fn aggregate(shared: &EngineShared, ns: &str, pipeline: serde_json::Value) -> Result<Vec<Document>> {
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let pipeline = match Value::from_json(&pipeline)? {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        let request = AggregateRequest {
            ns: ns.to_string(),
            pipeline,
            ..AggregateRequest::default()
        };
        PipelineExecutor::prepare(shared, &request, txn.view(), &op)?.collect(shared, &op)
    }

    fn contents(shared: &EngineShared, ns: &str) -> Vec<Document> {
        aggregate(shared, ns, serde_json::json!([{"$sort": {"_id": 1}}])).unwrap()
    }

    #[test]
    fn test_out_replaces_target_and_keeps_indexes() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, "test.src", (0..5).map(|i| doc!({"_id": i, "v": i * 10})).collect());
        seed(shared, "test.dst", vec![doc!({"_id": 99, "v": -1})]);
        let op = OperationContext::new();
        ddl::create_indexes(shared, "test.dst", &[doc!({"key": {"v": 1}, "name": "v_1"})], &op).unwrap();

        let out = aggregate(shared, "test.src", serde_json::json!([{"$match": {"v": {"$gte": 20}}}, {"$out": "dst"}])).unwrap();
        assert!(out.is_empty());
        let ids: Vec<i64> = contents(shared, "test.dst").iter().filter_map(|d| d.id()?.as_i64()).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        let entry = shared.catalog.get("test.dst").unwrap();
        assert!(entry.index("v_1").is_some());
        assert!(shared.catalog.snapshot().in_db("test").all(|e| !e.coll().starts_with("tmp.agg_out")));
    }

    #[test]
    fn test_out_failure_leaves_target_untouched() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, "test.src", vec![doc!({"_id": 1, "k": 1}), doc!({"_id": 2, "k": 1})]);
        seed(shared, "test.dst", vec![doc!({"_id": 7})]);
        let err = aggregate(
            shared,
            "test.src",
            serde_json::json!([{"$project": {"_id": "$k"}}, {"$out": "dst"}]),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
        assert_eq!(contents(shared, "test.dst"), vec![doc!({"_id": 7})]);
        assert!(shared.catalog.snapshot().in_db("test").all(|e| !e.coll().starts_with("tmp.agg_out")));
    }

    #[test]
    fn test_merge_modes() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, "test.src", vec![doc!({"_id": 1, "a": 10}), doc!({"_id": 2, "a": 20})]);
        seed(shared, "test.dst", vec![doc!({"_id": 1, "a": 0, "b": 5})]);

        aggregate(shared, "test.src", serde_json::json!([{"$merge": {"into": "dst"}}])).unwrap();
        assert_eq!(
            contents(shared, "test.dst"),
            vec![doc!({"_id": 1, "a": 10, "b": 5}), doc!({"_id": 2, "a": 20})]
        );

        aggregate(
            shared,
            "test.src",
            serde_json::json!([{"$merge": {"into": "dst", "whenMatched": [{"$set": {"b": {"$add": ["$b", "$$new.a"]}}}]}}]),
        )
        .unwrap();
        assert_eq!(
            contents(shared, "test.dst"),
            vec![doc!({"_id": 1, "a": 10, "b": 15}), doc!({"_id": 2, "a": 20, "b": null})]
        );

        let err = aggregate(
            shared,
            "test.src",
            serde_json::json!([{"$merge": {"into": "dst", "whenMatched": "fail"}}]),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
        assert_eq!(err.to_reply()["keyValue"], serde_json::json!({"_id": 1}));

        let err = aggregate(
            shared,
            "test.src",
            serde_json::json!([{"$merge": {"into": "fresh", "whenNotMatched": "fail"}}]),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MergeStageNoMatchingDocument);
    }

    #[test]
    fn test_merge_on_requires_unique_index() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, "test.src", vec![doc!({"_id": 1, "sku": "x", "n": 1})]);
        seed(shared, "test.dst", vec![doc!({"_id": 50, "sku": "x", "n": 0})]);
        let pipeline = serde_json::json!([
            {"$project": {"_id": 0}},
            {"$merge": {"into": "dst", "on": "sku", "whenMatched": "replace"}}
        ]);
        let err = aggregate(shared, "test.src", pipeline.clone()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MergeOnFieldsNotUnique);

        let op = OperationContext::new();
        ddl::create_indexes(shared, "test.dst", &[doc!({"key": {"sku": 1}, "name": "sku_1", "unique": true})], &op)
            .unwrap();
        aggregate(shared, "test.src", pipeline).unwrap();
        assert_eq!(contents(shared, "test.dst"), vec![doc!({"_id": 50, "sku": "x", "n": 1})]);
    }
}
