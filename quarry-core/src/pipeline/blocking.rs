// quarry-core/src/pipeline/blocking.rs
//! Blocking stages: `$sort`, `$group` and `$bucketAuto` consume their whole
//! input before producing anything.
//!
//! All three hold at most `maxBlockingMemoryBytes` in memory. Past that they
//! either fail with `QueryExceededMemoryLimitNoDiskUseAllowed` or, when the
//! request allows disk use, spill sorted runs through the external sorter.

use ahash::AHashMap;

use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::index::IndexKey;
use crate::query::SortSpec;
use crate::storage::{memory_limit_error, SortedStream, Sorter};
use crate::value::Value;
use crate::log_debug;

use super::accumulator::{parse_accumulators, AccState, Accumulator};
use super::expression::Expression;
use super::{stage_doc, DocumentSource, PipelineContext};

/// Fixed per-group bookkeeping cost added to the key and state sizes.
const GROUP_OVERHEAD_BYTES: usize = 64;

fn collated_key(value: &Value, ctx: &PipelineContext<'_>) -> Value {
    match ctx.collation() {
        Some(collation) => collation.comparison_key(value),
        None => value.clone(),
    }
}

// ========== $sort ==========

enum SortPhase {
    Collecting(Sorter<IndexKey, Document>),
    Streaming(SortedStream<IndexKey, Document>),
    Done,
}

pub struct SortStage {
    source: Box<dyn DocumentSource>,
    spec: SortSpec,
    limit: Option<usize>,
    phase: Option<SortPhase>,
    used_disk: bool,
}

impl SortStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: SortSpec, limit: Option<usize>) -> Self {
        SortStage {
            source,
            spec,
            limit,
            phase: None,
            used_disk: false,
        }
    }
}

impl DocumentSource for SortStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        loop {
            match self.phase.take() {
                None => {
                    let options = ctx.sorter_options().with_limit(self.limit);
                    self.phase = Some(SortPhase::Collecting(Sorter::new("$sort", options)));
                }
                Some(SortPhase::Collecting(mut sorter)) => {
                    while let Some(doc) = self.source.get_next(ctx)? {
                        ctx.op.check_periodically()?;
                        let key = self.spec.key(&doc, ctx.collation());
                        let size = doc.bson_size();
                        sorter.push(key, doc, size)?;
                    }
                    self.used_disk = sorter.spilled_runs() > 0;
                    self.phase = Some(SortPhase::Streaming(sorter.finish()?));
                }
                Some(SortPhase::Streaming(mut stream)) => {
                    let next = stream.next_record()?;
                    self.phase = Some(if next.is_some() {
                        SortPhase::Streaming(stream)
                    } else {
                        SortPhase::Done
                    });
                    return Ok(next.map(|(_, doc)| doc));
                }
                Some(SortPhase::Done) => {
                    self.phase = Some(SortPhase::Done);
                    return Ok(None);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "$sort"
    }

    fn explain(&self) -> Document {
        let mut spec = Document::new();
        spec.insert("sortKey", self.spec.to_document());
        if let Some(limit) = self.limit {
            spec.insert("limit", limit as i64);
        }
        if self.used_disk {
            spec.insert("usedDisk", true);
        }
        stage_doc("$sort", spec)
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $group ==========

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub id: Expression,
    pub accumulators: Vec<Accumulator>,
    spec: Document,
}

impl GroupSpec {
    pub fn parse(spec: &Document) -> Result<Self> {
        let id = spec
            .get("_id")
            .ok_or_else(|| QuarryError::BadValue("a group specification must include an _id".into()))?;
        Ok(GroupSpec {
            id: Expression::parse(id)?,
            accumulators: parse_accumulators(spec, "_id")?,
            spec: spec.clone(),
        })
    }

    /// `{_id: <expr>, count: {$sum: 1}}`, the grouping half of `$sortByCount`.
    pub fn count_by(id: Expression) -> Self {
        let mut sum = Document::new();
        sum.insert("$sum", 1);
        let spec_value = Value::Document(sum);
        let count = Accumulator::parse("count", &spec_value);
        let mut spec = Document::new();
        spec.insert("_id", Value::Null);
        spec.insert("count", spec_value);
        GroupSpec {
            id,
            accumulators: count.into_iter().collect(),
            spec,
        }
    }

    fn output(&self, id: Value, states: Vec<AccState>) -> Document {
        let mut doc = Document::with_capacity(self.accumulators.len() + 1);
        doc.insert("_id", id);
        for (acc, state) in self.accumulators.iter().zip(states) {
            doc.insert(acc.field.as_str(), state.finalize());
        }
        doc
    }
}

type Partial = (Value, Vec<AccState>);

enum GroupPhase {
    Collecting,
    Memory(std::vec::IntoIter<Partial>),
    Spilled {
        stream: SortedStream<Value, Partial>,
        pending: Option<(Value, Partial)>,
    },
    Done,
}

pub struct GroupStage {
    source: Box<dyn DocumentSource>,
    spec: GroupSpec,
    /// Collated key -> position in `groups`; `groups` keeps first-seen order.
    index: AHashMap<Value, usize>,
    groups: Vec<(Value, Partial)>,
    bytes: usize,
    sorter: Option<Sorter<Value, Partial>>,
    phase: GroupPhase,
    used_disk: bool,
}

impl GroupStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: GroupSpec) -> Self {
        GroupStage {
            source,
            spec,
            index: AHashMap::new(),
            groups: Vec::new(),
            bytes: 0,
            sorter: None,
            phase: GroupPhase::Collecting,
            used_disk: false,
        }
    }

    fn absorb(&mut self, doc: &Document, ctx: &PipelineContext<'_>) -> Result<()> {
        let id = self.spec.id.evaluate_opt(doc, ctx.vars())?.unwrap_or(Value::Null);
        let key = collated_key(&id, ctx);
        let slot = match self.index.get(&key) {
            Some(slot) => *slot,
            None => {
                self.bytes += key.bson_size() + id.bson_size() + GROUP_OVERHEAD_BYTES;
                let states = self.spec.accumulators.iter().map(Accumulator::init).collect();
                self.groups.push((key.clone(), (id, states)));
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        let (_, (_, states)) = &mut self.groups[slot];
        for (acc, state) in self.spec.accumulators.iter().zip(states.iter_mut()) {
            self.bytes += acc.process(state, doc, ctx.vars())?;
        }
        if self.bytes as u64 > ctx.memory_limit() {
            self.spill(ctx)?;
        }
        Ok(())
    }

    fn spill(&mut self, ctx: &PipelineContext<'_>) -> Result<()> {
        if !ctx.env.allow_disk_use {
            return Err(memory_limit_error("$group", ctx.memory_limit()));
        }
        let groups = std::mem::take(&mut self.groups);
        log_debug!("$group spilling {} partial groups ({} bytes)", groups.len(), self.bytes);
        let sorter = self
            .sorter
            .get_or_insert_with(|| Sorter::new("$group", ctx.sorter_options()));
        let per_group = self.bytes / groups.len().max(1);
        for (key, partial) in groups {
            sorter.push(key, partial, per_group)?;
        }
        self.index.clear();
        self.bytes = 0;
        self.used_disk = true;
        Ok(())
    }

    fn finish_input(&mut self, ctx: &PipelineContext<'_>) -> Result<()> {
        if self.sorter.is_none() {
            let groups: Vec<Partial> = std::mem::take(&mut self.groups).into_iter().map(|(_, p)| p).collect();
            self.phase = GroupPhase::Memory(groups.into_iter());
            return Ok(());
        }
        self.spill(ctx)?;
        let Some(sorter) = self.sorter.take() else {
            self.phase = GroupPhase::Done;
            return Ok(());
        };
        let mut stream = sorter.finish()?;
        let pending = stream.next_record()?;
        self.phase = GroupPhase::Spilled { stream, pending };
        Ok(())
    }

    /// Merge all partial states of the next key out of the sorted runs.
    fn next_merged(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Partial>> {
        let GroupPhase::Spilled { stream, pending } = &mut self.phase else {
            return Ok(None);
        };
        let Some((key, (id, mut states))) = pending.take() else {
            return Ok(None);
        };
        loop {
            match stream.next_record()? {
                Some((next_key, (_, later))) if next_key == key => {
                    for (state, later) in states.iter_mut().zip(later) {
                        state.merge(later, ctx.collation())?;
                    }
                }
                other => {
                    *pending = other;
                    return Ok(Some((id, states)));
                }
            }
        }
    }
}

impl DocumentSource for GroupStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        if let GroupPhase::Collecting = self.phase {
            while let Some(doc) = self.source.get_next(ctx)? {
                ctx.op.check_periodically()?;
                self.absorb(&doc, ctx)?;
            }
            self.finish_input(ctx)?;
        }
        let next = if let GroupPhase::Memory(groups) = &mut self.phase {
            groups.next()
        } else {
            self.next_merged(ctx)?
        };
        match next {
            Some((id, states)) => Ok(Some(self.spec.output(id, states))),
            None => {
                self.phase = GroupPhase::Done;
                Ok(None)
            }
        }
    }

    fn name(&self) -> &'static str {
        "$group"
    }

    fn explain(&self) -> Document {
        let mut doc = stage_doc("$group", self.spec.spec.clone());
        if self.used_disk {
            doc.insert("usedDisk", true);
        }
        doc
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

// ========== $bucketAuto ==========

#[derive(Debug, Clone)]
pub struct BucketAutoSpec {
    pub group_by: Expression,
    pub buckets: usize,
    pub output: Vec<Accumulator>,
    spec: Document,
}

impl BucketAutoSpec {
    pub fn parse(spec: &Document) -> Result<Self> {
        let mut group_by = None;
        let mut buckets = None;
        let mut output = None;
        for (key, value) in spec.iter() {
            match key.as_str() {
                "groupBy" => {
                    let valid = match value {
                        Value::String(s) => s.starts_with('$'),
                        Value::Document(_) => true,
                        _ => false,
                    };
                    if !valid {
                        return Err(QuarryError::BadValue(
                            "$bucketAuto 'groupBy' must be a $-prefixed path or an expression object".into(),
                        ));
                    }
                    group_by = Some(Expression::parse(value)?);
                }
                "buckets" => {
                    let n = match value {
                        Value::Int32(_) | Value::Int64(_) => value.as_i64(),
                        Value::Double(d) if d.fract() == 0.0 => Some(*d as i64),
                        _ => None,
                    }
                    .ok_or_else(|| QuarryError::TypeMismatch("$bucketAuto 'buckets' must be an integer".into()))?;
                    if n <= 0 || n > i32::MAX as i64 {
                        return Err(QuarryError::BadValue(format!(
                            "$bucketAuto 'buckets' field must be greater than 0, but found: {}",
                            n
                        )));
                    }
                    buckets = Some(n as usize);
                }
                "output" => {
                    let doc = value
                        .as_document()
                        .ok_or_else(|| QuarryError::TypeMismatch("$bucketAuto 'output' must be an object".into()))?;
                    output = Some(parse_accumulators(doc, "")?);
                }
                "granularity" => {
                    return Err(QuarryError::BadValue(
                        "$bucketAuto 'granularity' is not supported".into(),
                    ))
                }
                other => {
                    return Err(QuarryError::new(
                        ErrorCode::UnknownField,
                        format!("unrecognized option to $bucketAuto: {}", other),
                    ))
                }
            }
        }
        let group_by =
            group_by.ok_or_else(|| QuarryError::BadValue("$bucketAuto requires 'groupBy' and 'buckets'".into()))?;
        let buckets =
            buckets.ok_or_else(|| QuarryError::BadValue("$bucketAuto requires 'groupBy' and 'buckets'".into()))?;
        let output = match output {
            Some(output) => output,
            None => GroupSpec::count_by(Expression::constant(Value::Null)).accumulators,
        };
        Ok(BucketAutoSpec {
            group_by,
            buckets,
            output,
            spec: spec.clone(),
        })
    }
}

/// Sorted record: collated key -> (original value, document).
type BucketRecord = (Value, (Value, Document));

enum BucketPhase {
    Collecting,
    Emitting {
        stream: SortedStream<Value, (Value, Document)>,
        peek: Option<BucketRecord>,
        approx_size: usize,
        emitted: usize,
    },
    Done,
}

pub struct BucketAutoStage {
    source: Box<dyn DocumentSource>,
    spec: BucketAutoSpec,
    phase: BucketPhase,
    used_disk: bool,
}

impl BucketAutoStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: BucketAutoSpec) -> Self {
        BucketAutoStage {
            source,
            spec,
            phase: BucketPhase::Collecting,
            used_disk: false,
        }
    }

    fn collect(&mut self, ctx: &PipelineContext<'_>) -> Result<()> {
        let mut sorter = Sorter::new("$bucketAuto", ctx.sorter_options());
        let mut count = 0usize;
        while let Some(doc) = self.source.get_next(ctx)? {
            ctx.op.check_periodically()?;
            let value = self.spec.group_by.evaluate_opt(&doc, ctx.vars())?.unwrap_or(Value::Null);
            let key = collated_key(&value, ctx);
            let size = doc.bson_size() + key.bson_size() + value.bson_size();
            sorter.push(key, (value, doc), size)?;
            count += 1;
        }
        self.used_disk = sorter.spilled_runs() > 0;
        let mut stream = sorter.finish()?;
        let peek = stream.next_record()?;
        let approx_size = ((count as f64) / (self.spec.buckets as f64)).round().max(1.0) as usize;
        self.phase = BucketPhase::Emitting {
            stream,
            peek,
            approx_size,
            emitted: 0,
        };
        Ok(())
    }

    /// Fill the next bucket. Equal values never straddle two buckets and the
    /// last bucket takes everything left.
    fn next_bucket(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        let buckets = self.spec.buckets;
        let BucketPhase::Emitting {
            stream,
            peek,
            approx_size,
            emitted,
        } = &mut self.phase
        else {
            return Ok(None);
        };
        let Some((first_key, (min, first_doc))) = peek.take() else {
            return Ok(None);
        };
        let last_bucket = *emitted + 1 >= buckets;
        let mut states: Vec<AccState> = self.spec.output.iter().map(Accumulator::init).collect();
        for (acc, state) in self.spec.output.iter().zip(states.iter_mut()) {
            acc.process(state, &first_doc, ctx.vars())?;
        }
        let mut last_key = first_key;
        let mut last_value = min.clone();
        let mut taken = 1usize;
        while let Some((key, (value, doc))) = stream.next_record()? {
            if !last_bucket && taken >= *approx_size && key != last_key {
                *peek = Some((key, (value, doc)));
                break;
            }
            for (acc, state) in self.spec.output.iter().zip(states.iter_mut()) {
                acc.process(state, &doc, ctx.vars())?;
            }
            taken += 1;
            last_key = key;
            last_value = value;
        }
        *emitted += 1;
        let max = match peek {
            Some((_, (next_min, _))) => next_min.clone(),
            None => last_value,
        };
        let mut bounds = Document::new();
        bounds.insert("min", min);
        bounds.insert("max", max);
        let mut out = Document::with_capacity(states.len() + 1);
        out.insert("_id", bounds);
        for (acc, state) in self.spec.output.iter().zip(states) {
            out.insert(acc.field.as_str(), state.finalize());
        }
        Ok(Some(out))
    }
}

impl DocumentSource for BucketAutoStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        if let BucketPhase::Collecting = self.phase {
            self.collect(ctx)?;
        }
        let next = self.next_bucket(ctx)?;
        if next.is_none() {
            self.phase = BucketPhase::Done;
        }
        Ok(next)
    }

    fn name(&self) -> &'static str {
        "$bucketAuto"
    }

    fn explain(&self) -> Document {
        let mut doc = stage_doc("$bucketAuto", self.spec.spec.clone());
        if self.used_disk {
            doc.insert("usedDisk", true);
        }
        doc
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::collation::Collation;
    use crate::doc;
    use crate::engine::Engine;
    use crate::interrupt::OperationContext;
    use crate::pipeline::expression::Variables;
    use crate::pipeline::PipelineEnv;
    use crate::txn::ReadView;

    /// Feeds a fixed list of documents.
    struct Docs(VecDeque<Document>);

    impl DocumentSource for Docs {
        fn get_next(&mut self, _ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
            Ok(self.0.pop_front())
        }

        fn name(&self) -> &'static str {
            "$documents"
        }

        fn explain(&self) -> Document {
            Document::new()
        }
    }

    fn source(docs: Vec<Document>) -> Box<dyn DocumentSource> {
        Box::new(Docs(docs.into_iter().collect()))
    }

    fn env(collation: Option<Collation>, allow_disk_use: bool) -> PipelineEnv {
        PipelineEnv {
            db: "test".into(),
            view: ReadView::latest(),
            vars: Variables::new(collation.clone()),
            collation,
            allow_disk_use,
            explicit_txn: false,
        }
    }

    fn drain(stage: &mut dyn DocumentSource, env: &PipelineEnv, engine: &Engine) -> Result<Vec<Document>> {
        let op = OperationContext::new();
        let ctx = PipelineContext {
            shared: engine.shared(),
            op: &op,
            env,
        };
        let mut out = Vec::new();
        while let Some(doc) = stage.get_next(&ctx)? {
            out.push(doc);
        }
        Ok(out)
    }

    fn group(spec: serde_json::Value) -> GroupSpec {
        GroupSpec::parse(&Document::from_json(&spec).unwrap()).unwrap()
    }

    #[test]
    fn test_group_keeps_first_seen_order() {
        let engine = Engine::in_memory();
        let docs = vec![
            doc!({"k": "b", "x": 1}),
            doc!({"k": "a", "x": 2}),
            doc!({"k": "b", "x": 3}),
            doc!({"x": 4}),
        ];
        let mut stage = GroupStage::new(source(docs), group(serde_json::json!({"_id": "$k", "t": {"$sum": "$x"}})));
        let out = drain(&mut stage, &env(None, false), &engine).unwrap();
        assert_eq!(
            out,
            vec![
                doc!({"_id": "b", "t": 4}),
                doc!({"_id": "a", "t": 2}),
                doc!({"_id": null, "t": 4}),
            ]
        );
    }

    #[test]
    fn test_group_collated_keys() {
        let engine = Engine::in_memory();
        let collation = Collation::from_document(&doc!({"locale": "en", "strength": 2})).unwrap();
        let docs = vec![doc!({"k": "Apple"}), doc!({"k": "apple"}), doc!({"k": "APPLE"})];
        let mut stage = GroupStage::new(source(docs), group(serde_json::json!({"_id": "$k", "n": {"$count": {}}})));
        let out = drain(&mut stage, &env(Some(collation), false), &engine).unwrap();
        assert_eq!(out, vec![doc!({"_id": "Apple", "n": 3})]);
    }

    #[test]
    fn test_group_memory_limit_and_spill() {
        let engine = Engine::in_memory();
        engine
            .shared()
            .params
            .set("internalQueryMaxBlockingMemoryBytes", &serde_json::json!(2048))
            .unwrap();
        let docs: Vec<Document> = (0..300).map(|i| doc!({"k": i % 100, "v": i})).collect();
        let spec = serde_json::json!({"_id": "$k", "n": {"$sum": 1}, "first": {"$first": "$v"}});

        let mut stage = GroupStage::new(source(docs.clone()), group(spec.clone()));
        let err = drain(&mut stage, &env(None, false), &engine).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueryExceededMemoryLimitNoDiskUseAllowed);

        let mut stage = GroupStage::new(source(docs), group(spec));
        let out = drain(&mut stage, &env(None, true), &engine).unwrap();
        assert_eq!(out.len(), 100);
        for doc in &out {
            let k = doc.get("_id").and_then(Value::as_i64).unwrap();
            assert_eq!(doc.get("n"), Some(&Value::Int32(3)));
            assert_eq!(doc.get("first").and_then(Value::as_i64), Some(k));
        }
        assert!(stage.explain().contains_key("usedDisk"));
    }

    #[test]
    fn test_sort_stage_top_k() {
        let engine = Engine::in_memory();
        let docs: Vec<Document> = (0..50).map(|i| doc!({"_id": i, "v": (i * 7) % 50})).collect();
        let spec = SortSpec::parse(&doc!({"v": -1})).unwrap();
        let mut stage = SortStage::new(source(docs), spec, Some(3));
        let out = drain(&mut stage, &env(None, false), &engine).unwrap();
        let values: Vec<i64> = out.iter().filter_map(|d| d.get("v").and_then(Value::as_i64)).collect();
        assert_eq!(values, vec![49, 48, 47]);
    }

    #[test]
    fn test_bucket_auto_numeric_strings() {
        let engine = Engine::in_memory();
        let collation = Collation::from_document(&doc!({"locale": "en_US", "numericOrdering": true})).unwrap();
        let docs: Vec<Document> = ["1", "5", "100", "9", "10", "50", "99", "200", "500"]
            .iter()
            .map(|n| doc!({"n": n}))
            .collect();
        let spec = BucketAutoSpec::parse(&doc!({"groupBy": "$n", "buckets": 3})).unwrap();
        let mut stage = BucketAutoStage::new(source(docs), spec);
        let out = drain(&mut stage, &env(Some(collation), false), &engine).unwrap();
        assert_eq!(
            out,
            vec![
                doc!({"_id": {"min": "1", "max": "10"}, "count": 3}),
                doc!({"_id": {"min": "10", "max": "100"}, "count": 3}),
                doc!({"_id": {"min": "100", "max": "500"}, "count": 3}),
            ]
        );
    }

    #[test]
    fn test_bucket_auto_keeps_equal_values_together() {
        let engine = Engine::in_memory();
        let docs: Vec<Document> = [1, 1, 1, 1, 2, 3].iter().map(|n| doc!({"n": n})).collect();
        let spec = BucketAutoSpec::parse(&doc!({"groupBy": "$n", "buckets": 3, "output": {"s": {"$sum": "$n"}}})).unwrap();
        let mut stage = BucketAutoStage::new(source(docs), spec);
        let out = drain(&mut stage, &env(None, false), &engine).unwrap();
        assert_eq!(
            out,
            vec![
                doc!({"_id": {"min": 1, "max": 2}, "s": 4}),
                doc!({"_id": {"min": 2, "max": 3}, "s": 5}),
            ]
        );
        assert!(BucketAutoSpec::parse(&doc!({"groupBy": "$n", "buckets": 2, "granularity": "R5"})).is_err());
        assert!(BucketAutoSpec::parse(&doc!({"groupBy": "$n", "buckets": 0})).is_err());
    }
}
