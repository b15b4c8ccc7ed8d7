// quarry-core/src/pipeline/window.rs
//! `$setWindowFields`: per-partition computations over sorted documents.
//!
//! Input is sorted by (partition key, sortBy key) through the external
//! sorter, then read back one partition at a time. A partition is held in
//! memory while its output fields are computed, so a single partition larger
//! than the blocking memory limit fails even with `allowDiskUse`.

use std::collections::VecDeque;

use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::index::IndexKey;
use crate::query::SortSpec;
use crate::storage::{memory_limit_error, SortedStream, Sorter};
use crate::value::Value;

use super::accumulator::{Accumulator, AccumulatorOp};
use super::expression::Expression;
use super::{expect_document, stage_doc, DocumentSource, PipelineContext};

// ========== SPEC ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Unbounded,
    Current,
    Offset(i64),
}

impl Bound {
    fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if s == "unbounded" => Ok(Bound::Unbounded),
            Value::String(s) if s == "current" => Ok(Bound::Current),
            Value::Int32(_) | Value::Int64(_) => Ok(Bound::Offset(value.as_i64().unwrap_or(0))),
            Value::Double(d) if d.fract() == 0.0 => Ok(Bound::Offset(*d as i64)),
            other => Err(QuarryError::BadValue(format!(
                "window bounds must be 'unbounded', 'current' or an integer, found {}",
                other.type_name()
            ))),
        }
    }

    /// Position this bound refers to for the document at `current`, clamped
    /// to `[0, len)` (`None` when it falls outside on the wrong side).
    fn resolve(self, current: usize, len: usize, lower: bool) -> Option<usize> {
        let pos = match self {
            Bound::Unbounded => return Some(if lower { 0 } else { len.saturating_sub(1) }),
            Bound::Current => current as i64,
            Bound::Offset(n) => current as i64 + n,
        };
        if lower {
            (pos < len as i64).then(|| pos.max(0) as usize)
        } else {
            (pos >= 0).then(|| pos.min(len as i64 - 1) as usize)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentWindow {
    pub lower: Bound,
    pub upper: Bound,
}

impl Default for DocumentWindow {
    fn default() -> Self {
        DocumentWindow {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }
}

impl DocumentWindow {
    fn parse(spec: &Value) -> Result<Self> {
        let doc = expect_document("window", spec)?;
        let mut window = DocumentWindow::default();
        for (key, value) in doc.iter() {
            match key.as_str() {
                "documents" => {
                    let bounds = value
                        .as_array()
                        .filter(|b| b.len() == 2)
                        .ok_or_else(|| QuarryError::BadValue("'documents' window must be an array of two bounds".into()))?;
                    window.lower = Bound::parse(&bounds[0])?;
                    window.upper = Bound::parse(&bounds[1])?;
                    let ordered = match (window.lower, window.upper) {
                        (Bound::Unbounded, _) | (_, Bound::Unbounded) | (Bound::Current, Bound::Current) => true,
                        (Bound::Current, Bound::Offset(n)) => n >= 0,
                        (Bound::Offset(n), Bound::Current) => n <= 0,
                        (Bound::Offset(a), Bound::Offset(b)) => a <= b,
                    };
                    if !ordered {
                        return Err(QuarryError::BadValue("lower window bound must not exceed the upper bound".into()));
                    }
                }
                "range" => {
                    return Err(QuarryError::BadValue("'range' windows are not supported".into()));
                }
                other => {
                    return Err(QuarryError::new(
                        ErrorCode::UnknownField,
                        format!("unrecognized window option '{}'", other),
                    ))
                }
            }
        }
        Ok(window)
    }

    fn is_whole_partition(&self) -> bool {
        self.lower == Bound::Unbounded && self.upper == Bound::Unbounded
    }
}

#[derive(Debug, Clone)]
pub enum WindowFunction {
    Accumulate { acc: Accumulator, window: DocumentWindow },
    Rank,
    DenseRank,
    DocumentNumber,
    Shift { output: Expression, by: i64, default: Expression },
}

#[derive(Debug, Clone)]
pub struct WindowOutput {
    pub field: String,
    pub function: WindowFunction,
}

impl WindowOutput {
    fn parse(field: &str, spec: &Value, has_sort: bool) -> Result<Self> {
        let doc = expect_document("window output", spec)?;
        let mut window = None;
        let mut function = None;
        for (key, value) in doc.iter() {
            if key == "window" {
                window = Some(DocumentWindow::parse(value)?);
                continue;
            }
            if function.is_some() {
                return Err(QuarryError::BadValue(format!(
                    "window output '{}' must specify exactly one function",
                    field
                )));
            }
            function = Some((key.as_str(), value));
        }
        let (name, arg) = function
            .ok_or_else(|| QuarryError::BadValue(format!("window output '{}' must specify a function", field)))?;
        let needs_sort = |name: &str| -> Result<()> {
            if !has_sort {
                return Err(QuarryError::BadValue(format!("{} requires a sortBy", name)));
            }
            if window.is_some() {
                return Err(QuarryError::BadValue(format!("{} does not accept a window", name)));
            }
            Ok(())
        };
        let function = match name {
            "$rank" => {
                needs_sort(name)?;
                WindowFunction::Rank
            }
            "$denseRank" => {
                needs_sort(name)?;
                WindowFunction::DenseRank
            }
            "$documentNumber" => {
                needs_sort(name)?;
                WindowFunction::DocumentNumber
            }
            "$shift" => {
                needs_sort(name)?;
                let args = expect_document("$shift", arg)?;
                let output = args
                    .get("output")
                    .ok_or_else(|| QuarryError::BadValue("$shift requires an 'output' expression".into()))?;
                let by = args
                    .get("by")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| QuarryError::BadValue("$shift requires an integer 'by'".into()))?;
                let default = args.get("default").cloned().unwrap_or(Value::Null);
                WindowFunction::Shift {
                    output: Expression::parse(output)?,
                    by,
                    default: Expression::parse(&default)?,
                }
            }
            _ => {
                let mut single = Document::new();
                single.insert(name, arg.clone());
                let mut acc = Accumulator::parse("output", &Value::Document(single))?;
                acc.field = field.to_string();
                let window = window.unwrap_or_default();
                if !window.is_whole_partition() && !has_sort {
                    return Err(QuarryError::BadValue(
                        "document-based bounded windows require a sortBy".into(),
                    ));
                }
                WindowFunction::Accumulate { acc, window }
            }
        };
        Ok(WindowOutput {
            field: field.to_string(),
            function,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub partition_by: Option<Expression>,
    pub sort_by: Option<SortSpec>,
    pub outputs: Vec<WindowOutput>,
    spec: Document,
}

impl WindowSpec {
    pub fn parse(spec: &Document) -> Result<Self> {
        let mut partition_by = None;
        let mut sort_by = None;
        let mut output = None;
        for (key, value) in spec.iter() {
            match key.as_str() {
                "partitionBy" => partition_by = Some(Expression::parse(value)?),
                "sortBy" => sort_by = Some(SortSpec::parse(expect_document("sortBy", value)?)?),
                "output" => output = Some(expect_document("output", value)?),
                other => {
                    return Err(QuarryError::new(
                        ErrorCode::UnknownField,
                        format!("unrecognized option to $setWindowFields: {}", other),
                    ))
                }
            }
        }
        let output = output.ok_or_else(|| QuarryError::BadValue("$setWindowFields requires 'output'".into()))?;
        let outputs = output
            .iter()
            .map(|(field, value)| WindowOutput::parse(field, value, sort_by.is_some()))
            .collect::<Result<Vec<_>>>()?;
        Ok(WindowSpec {
            partition_by,
            sort_by,
            outputs,
            spec: spec.clone(),
        })
    }
}

// ========== STAGE ==========

type WindowKey = (Value, IndexKey);

enum WindowPhase {
    Collecting,
    Emitting {
        stream: SortedStream<WindowKey, Document>,
        peek: Option<(WindowKey, Document)>,
    },
    Done,
}

pub struct SetWindowFieldsStage {
    source: Box<dyn DocumentSource>,
    spec: WindowSpec,
    phase: WindowPhase,
    ready: VecDeque<Document>,
}

impl SetWindowFieldsStage {
    pub fn new(source: Box<dyn DocumentSource>, spec: WindowSpec) -> Self {
        SetWindowFieldsStage {
            source,
            spec,
            phase: WindowPhase::Collecting,
            ready: VecDeque::new(),
        }
    }

    fn collect(&mut self, ctx: &PipelineContext<'_>) -> Result<()> {
        let mut sorter = Sorter::new("$setWindowFields", ctx.sorter_options());
        while let Some(doc) = self.source.get_next(ctx)? {
            ctx.op.check_periodically()?;
            let partition = match &self.spec.partition_by {
                Some(expr) => {
                    let value = expr.evaluate_opt(&doc, ctx.vars())?.unwrap_or(Value::Null);
                    match ctx.collation() {
                        Some(collation) => collation.comparison_key(&value),
                        None => value,
                    }
                }
                None => Value::Null,
            };
            let order = match &self.spec.sort_by {
                Some(sort) => sort.key(&doc, ctx.collation()),
                None => IndexKey(Vec::new()),
            };
            let size = doc.bson_size();
            sorter.push((partition, order), doc, size)?;
        }
        let mut stream = sorter.finish()?;
        let peek = stream.next_record()?;
        self.phase = WindowPhase::Emitting { stream, peek };
        Ok(())
    }

    /// Read the next partition off the sorted stream.
    fn next_partition(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Vec<(IndexKey, Document)>>> {
        let WindowPhase::Emitting { stream, peek } = &mut self.phase else {
            return Ok(None);
        };
        let Some(((partition, order), doc)) = peek.take() else {
            return Ok(None);
        };
        let limit = ctx.memory_limit();
        let mut bytes = doc.bson_size() as u64;
        let mut rows = vec![(order, doc)];
        while let Some(((next_partition, order), doc)) = stream.next_record()? {
            if next_partition != partition {
                *peek = Some(((next_partition, order), doc));
                break;
            }
            bytes += doc.bson_size() as u64;
            if bytes > limit {
                return Err(memory_limit_error("$setWindowFields partition", limit));
            }
            rows.push((order, doc));
        }
        Ok(Some(rows))
    }

    fn compute(&self, rows: Vec<(IndexKey, Document)>, ctx: &PipelineContext<'_>) -> Result<Vec<Document>> {
        let len = rows.len();
        let mut columns: Vec<Vec<Value>> = Vec::with_capacity(self.spec.outputs.len());
        for output in &self.spec.outputs {
            let mut column = Vec::with_capacity(len);
            match &output.function {
                WindowFunction::DocumentNumber => {
                    column.extend((1..=len).map(|n| Value::Int64(n as i64)));
                }
                WindowFunction::Rank | WindowFunction::DenseRank => {
                    let dense = matches!(output.function, WindowFunction::DenseRank);
                    let mut rank = 0i64;
                    for i in 0..len {
                        if i == 0 || rows[i].0 != rows[i - 1].0 {
                            rank = if dense { rank + 1 } else { i as i64 + 1 };
                        }
                        column.push(Value::Int64(rank));
                    }
                }
                WindowFunction::Shift { output, by, default } => {
                    for i in 0..len {
                        let target = i as i64 + by;
                        let value = if target >= 0 && (target as usize) < len {
                            output.evaluate(&rows[target as usize].1, ctx.vars())?
                        } else {
                            default.evaluate(&rows[i].1, ctx.vars())?
                        };
                        column.push(value);
                    }
                }
                WindowFunction::Accumulate { acc, window } => {
                    if window.is_whole_partition() {
                        let value = accumulate(acc, rows.iter().map(|(_, d)| d), ctx)?;
                        column.resize(len, value);
                    } else {
                        for i in 0..len {
                            let lower = window.lower.resolve(i, len, true);
                            let upper = window.upper.resolve(i, len, false);
                            let value = match (lower, upper) {
                                (Some(lo), Some(hi)) if lo <= hi => {
                                    accumulate(acc, rows[lo..=hi].iter().map(|(_, d)| d), ctx)?
                                }
                                _ => empty_window_value(acc.op),
                            };
                            column.push(value);
                        }
                    }
                }
            }
            columns.push(column);
        }
        let mut out = Vec::with_capacity(len);
        for (i, (_, mut doc)) in rows.into_iter().enumerate() {
            for (output, column) in self.spec.outputs.iter().zip(columns.iter_mut()) {
                let value = std::mem::replace(&mut column[i], Value::Null);
                doc.set_path(&output.field, value)?;
            }
            out.push(doc);
        }
        Ok(out)
    }
}

fn accumulate<'a>(
    acc: &Accumulator,
    docs: impl Iterator<Item = &'a Document>,
    ctx: &PipelineContext<'_>,
) -> Result<Value> {
    let mut state = acc.init();
    for doc in docs {
        acc.process(&mut state, doc, ctx.vars())?;
    }
    Ok(state.finalize())
}

fn empty_window_value(op: AccumulatorOp) -> Value {
    match op {
        AccumulatorOp::Sum | AccumulatorOp::Count => Value::Int32(0),
        AccumulatorOp::Push | AccumulatorOp::AddToSet => Value::Array(Vec::new()),
        _ => Value::Null,
    }
}

impl DocumentSource for SetWindowFieldsStage {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>> {
        if let WindowPhase::Collecting = self.phase {
            self.collect(ctx)?;
        }
        loop {
            if let Some(doc) = self.ready.pop_front() {
                return Ok(Some(doc));
            }
            match self.next_partition(ctx)? {
                Some(rows) => {
                    let computed = self.compute(rows, ctx)?;
                    self.ready.extend(computed);
                }
                None => {
                    self.phase = WindowPhase::Done;
                    return Ok(None);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "$setWindowFields"
    }

    fn explain(&self) -> Document {
        stage_doc("$setWindowFields", self.spec.spec.clone())
    }

    fn source(&self) -> Option<&dyn DocumentSource> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::engine::Engine;
    use crate::interrupt::OperationContext;
    use crate::pipeline::expression::Variables;
    use crate::pipeline::PipelineEnv;
    use crate::txn::ReadView;

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

    fn run(spec: serde_json::Value, docs: Vec<Document>) -> Result<Vec<Document>> {
        let engine = Engine::in_memory();
        let spec = WindowSpec::parse(&Document::from_json(&spec)?)?;
        let mut stage = SetWindowFieldsStage::new(Box::new(Docs(docs.into_iter().collect())), spec);
        let env = PipelineEnv {
            db: "test".into(),
            view: ReadView::latest(),
            vars: Variables::default(),
            collation: None,
            allow_disk_use: false,
            explicit_txn: false,
        };
        let op = OperationContext::new();
        let ctx = PipelineContext {
            shared: engine.shared(),
            op: &op,
            env: &env,
        };
        let mut out = Vec::new();
        while let Some(doc) = stage.get_next(&ctx)? {
            out.push(doc);
        }
        Ok(out)
    }

    fn sales() -> Vec<Document> {
        vec![
            doc!({"_id": 1, "store": "a", "day": 1, "qty": 5}),
            doc!({"_id": 2, "store": "b", "day": 1, "qty": 7}),
            doc!({"_id": 3, "store": "a", "day": 2, "qty": 3}),
            doc!({"_id": 4, "store": "a", "day": 3, "qty": 3}),
            doc!({"_id": 5, "store": "b", "day": 2, "qty": 1}),
        ]
    }

    #[test]
    fn test_running_total_per_partition() {
        let out = run(
            serde_json::json!({
                "partitionBy": "$store",
                "sortBy": {"day": 1},
                "output": {
                    "running": {"$sum": "$qty", "window": {"documents": ["unbounded", "current"]}},
                    "total": {"$sum": "$qty"}
                }
            }),
            sales(),
        )
        .unwrap();
        let summary: Vec<(i64, i64, i64)> = out
            .iter()
            .map(|d| {
                (
                    d.get("_id").and_then(Value::as_i64).unwrap(),
                    d.get("running").and_then(Value::as_i64).unwrap(),
                    d.get("total").and_then(Value::as_i64).unwrap(),
                )
            })
            .collect();
        assert_eq!(summary, vec![(1, 5, 11), (3, 8, 11), (4, 11, 11), (2, 7, 8), (5, 8, 8)]);
    }

    #[test]
    fn test_rank_and_shift() {
        let out = run(
            serde_json::json!({
                "partitionBy": "$store",
                "sortBy": {"qty": -1},
                "output": {
                    "rank": {"$rank": {}},
                    "dense": {"$denseRank": {}},
                    "n": {"$documentNumber": {}},
                    "prev": {"$shift": {"output": "$_id", "by": -1, "default": 0}}
                }
            }),
            sales(),
        )
        .unwrap();
        let a: Vec<&Document> = out.iter().filter(|d| d.get("store") == Some(&Value::from("a"))).collect();
        let ranks: Vec<(i64, i64, i64, i64)> = a
            .iter()
            .map(|d| {
                (
                    d.get("rank").and_then(Value::as_i64).unwrap(),
                    d.get("dense").and_then(Value::as_i64).unwrap(),
                    d.get("n").and_then(Value::as_i64).unwrap(),
                    d.get("prev").and_then(Value::as_i64).unwrap(),
                )
            })
            .collect();
        assert_eq!(ranks, vec![(1, 1, 1, 0), (2, 2, 2, 1), (2, 2, 3, 3)]);
    }

    #[test]
    fn test_sliding_window_and_rejects() {
        let out = run(
            serde_json::json!({
                "sortBy": {"_id": 1},
                "output": {"avg": {"$avg": "$qty", "window": {"documents": [-1, 1]}}}
            }),
            sales(),
        )
        .unwrap();
        let first = out[0].get("avg").and_then(Value::as_f64).unwrap();
        assert!((first - 6.0).abs() < 1e-9);

        let err = run(serde_json::json!({"output": {"r": {"$rank": {}}}}), sales()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
        let err = run(
            serde_json::json!({"sortBy": {"_id": 1}, "output": {"x": {"$sum": 1, "window": {"documents": [1, -1]}}}}),
            sales(),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
    }
}
