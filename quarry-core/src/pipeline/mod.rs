// quarry-core/src/pipeline/mod.rs
//! Aggregation pipelines.
//!
//! A pipeline is parsed and validated in full before anything reads
//! storage. Execution is a pull chain of [`DocumentSource`]s:
//!
//! ```text
//! $merge / $out            write-terminal, drains everything below
//!   $lookup / $unionWith   correlated: a fresh sub-pipeline per call
//!     $group / $sort ...   blocking: consume all input, may spill
//!       $project ...       streaming
//!         $cursor          plan_find() with $match/$sort/$skip/$limit pushed down
//!         | $changeStream  oplog reader (tailable)
//! ```
//!
//! Sources own their state and receive the engine, operation and variable
//! scope through a [`PipelineContext`] on every call, so a partially run
//! pipeline can be parked in a cursor between `getMore`s.

pub mod accumulator;
pub mod blocking;
pub mod change_stream;
pub mod expression;
pub mod lookup;
pub mod output;
pub mod transform;
pub mod window;

use std::sync::Arc;

use crate::catalog::CollectionEntry;
use crate::collation::Collation;
use crate::document::Document;
use crate::engine::EngineShared;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::interrupt::OperationContext;
use crate::query::planner::{plan_distinct_documents, plan_find, FindQuery};
use crate::query::{Matcher, Projection, SortSpec};
use crate::storage::SorterOptions;
use crate::txn::{ReadView, Transaction};
use crate::value::Value;
use crate::log_debug;

use self::accumulator::AccumulatorOp;
use self::blocking::{BucketAutoSpec, GroupSpec};
use self::change_stream::ChangeStreamSpec;
use self::expression::{validate_variable_name, Expression, Variables};
use self::lookup::{LookupSpec, UnionWithSpec};
use self::output::{MergeSpec, OutSpec};
use self::transform::UnwindSpec;
use self::window::WindowSpec;

/// Collection name used by collection-less `{aggregate: 1}` requests.
pub const COLLECTIONLESS: &str = "$cmd.aggregate";

// ========== CONTEXT ==========

/// Static settings of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineEnv {
    pub db: String,
    pub view: ReadView,
    pub vars: Variables,
    pub collation: Option<Collation>,
    pub allow_disk_use: bool,
    pub explicit_txn: bool,
}

impl PipelineEnv {
    /// Same settings with `vars` as the variable scope.
    pub fn with_vars(&self, vars: Variables) -> PipelineEnv {
        PipelineEnv {
            vars,
            ..self.clone()
        }
    }

    pub fn namespace(&self, coll: &str) -> String {
        format!("{}.{}", self.db, coll)
    }
}

pub struct PipelineContext<'a> {
    pub shared: &'a EngineShared,
    pub op: &'a OperationContext,
    pub env: &'a PipelineEnv,
}

impl PipelineContext<'_> {
    pub fn vars(&self) -> &Variables {
        &self.env.vars
    }

    pub fn collation(&self) -> Option<&Collation> {
        self.env.collation.as_ref()
    }

    pub fn sorter_options(&self) -> SorterOptions {
        self.shared.sorter_options(self.env.allow_disk_use)
    }

    /// Bytes a blocking stage may hold before spilling.
    pub fn memory_limit(&self) -> u64 {
        self.shared.params.max_blocking_memory_bytes()
    }
}

pub trait DocumentSource: Send {
    fn get_next(&mut self, ctx: &PipelineContext<'_>) -> Result<Option<Document>>;

    fn name(&self) -> &'static str;

    /// Explain entry for this stage alone.
    fn explain(&self) -> Document;

    /// The stage this one pulls from.
    fn source(&self) -> Option<&dyn DocumentSource> {
        None
    }
}

/// Explain entries of a chain, in pipeline order.
pub fn explain_chain(root: &dyn DocumentSource) -> Vec<Document> {
    let mut out = vec![root.explain()];
    let mut current = root.source();
    while let Some(stage) = current {
        out.push(stage.explain());
        current = stage.source();
    }
    out.reverse();
    out
}

/// Wrap a stage's spec as `{name: spec}`.
pub(crate) fn stage_doc(name: &str, spec: impl Into<Value>) -> Document {
    let mut doc = Document::new();
    doc.insert(name, spec);
    doc
}

// ========== PARSING ==========

/// Where a pipeline appears; each place restricts what it may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nesting {
    Top,
    /// `$lookup` or `$unionWith` sub-pipeline.
    SubPipeline,
    /// `$merge` `whenMatched` update pipeline.
    MergeUpdate,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub collation: Option<Collation>,
    pub nesting: Nesting,
    pub explicit_txn: bool,
}

impl ParseOptions {
    pub fn top(collation: Option<Collation>, explicit_txn: bool) -> Self {
        ParseOptions {
            collation,
            nesting: Nesting::Top,
            explicit_txn,
        }
    }

    pub fn nested(&self, nesting: Nesting) -> Self {
        ParseOptions {
            nesting,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub enum StageKind {
    Match(Matcher),
    Project(Projection),
    AddFields(Vec<(String, Expression)>),
    Unset(Projection),
    ReplaceRoot(Expression),
    Unwind(UnwindSpec),
    Sort(SortSpec),
    Skip(u64),
    Limit(u64),
    Count(String),
    Group(GroupSpec),
    SortByCount(Expression),
    BucketAuto(BucketAutoSpec),
    SetWindowFields(WindowSpec),
    Lookup(LookupSpec),
    UnionWith(UnionWithSpec),
    Out(OutSpec),
    Merge(MergeSpec),
    ChangeStream(ChangeStreamSpec),
}

/// Stages that may follow `$changeStream` or appear in a `$merge` update
/// pipeline.
const DOCUMENT_SHAPING_STAGES: &[&str] = &[
    "$match",
    "$project",
    "$addFields",
    "$set",
    "$unset",
    "$replaceRoot",
    "$replaceWith",
];

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub spec: Value,
    pub kind: StageKind,
}

impl Stage {
    fn is_write(&self) -> bool {
        matches!(self.kind, StageKind::Out(_) | StageKind::Merge(_))
    }

    pub fn to_document(&self) -> Document {
        stage_doc(&self.name, self.spec.clone())
    }
}

pub(crate) fn expect_document<'a>(stage: &str, value: &'a Value) -> Result<&'a Document> {
    value
        .as_document()
        .ok_or_else(|| QuarryError::TypeMismatch(format!("the {} stage specification must be an object", stage)))
}

fn non_negative(stage: &str, value: &Value) -> Result<u64> {
    let n = match value {
        Value::Int32(_) | Value::Int64(_) => value.as_i64(),
        Value::Double(d) if d.fract() == 0.0 => Some(*d as i64),
        _ => None,
    }
    .ok_or_else(|| QuarryError::TypeMismatch(format!("invalid argument to {} stage: expected an integer", stage)))?;
    u64::try_from(n).map_err(|_| QuarryError::BadValue(format!("invalid argument to {} stage: cannot be negative", stage)))
}

fn parse_add_fields(spec: &Document) -> Result<Vec<(String, Expression)>> {
    if spec.is_empty() {
        return Err(QuarryError::BadValue("$addFields specification must have at least one field".into()));
    }
    let mut fields = Vec::with_capacity(spec.len());
    for (path, value) in spec.iter() {
        if path.starts_with('$') || path.split('.').any(str::is_empty) {
            return Err(QuarryError::BadValue(format!("invalid $addFields field path '{}'", path)));
        }
        fields.push((path.clone(), Expression::parse(value)?));
    }
    Ok(fields)
}

fn parse_count_field(value: &Value) -> Result<String> {
    let name = value
        .as_str()
        .ok_or_else(|| QuarryError::TypeMismatch("the count field must be a non-empty string".into()))?;
    if name.is_empty() || name.starts_with('$') || name.contains('.') || name.contains('\0') {
        return Err(QuarryError::BadValue(format!("invalid $count field name '{}'", name)));
    }
    Ok(name.to_string())
}

impl StageKind {
    fn parse(name: &str, spec: &Value, opts: &ParseOptions) -> Result<StageKind> {
        Ok(match name {
            "$match" => StageKind::Match(Matcher::new(expect_document(name, spec)?, opts.collation.as_ref())?),
            "$project" => StageKind::Project(Projection::parse(expect_document(name, spec)?)?),
            "$addFields" | "$set" => StageKind::AddFields(parse_add_fields(expect_document(name, spec)?)?),
            "$unset" => {
                let paths: Vec<String> = match spec {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) if !items.is_empty() => items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| QuarryError::TypeMismatch("$unset specification must be a string or an array of strings".into()))?,
                    _ => {
                        return Err(QuarryError::TypeMismatch(
                            "$unset specification must be a string or an array of strings".into(),
                        ))
                    }
                };
                StageKind::Unset(Projection::exclusion(&paths)?)
            }
            "$replaceRoot" => {
                let doc = expect_document(name, spec)?;
                let new_root = doc
                    .get("newRoot")
                    .ok_or_else(|| QuarryError::BadValue("no newRoot specified for the $replaceRoot stage".into()))?;
                if doc.len() != 1 {
                    return Err(QuarryError::new(
                        ErrorCode::UnknownField,
                        "unrecognized option to $replaceRoot stage",
                    ));
                }
                StageKind::ReplaceRoot(Expression::parse(new_root)?)
            }
            "$replaceWith" => StageKind::ReplaceRoot(Expression::parse(spec)?),
            "$unwind" => StageKind::Unwind(UnwindSpec::parse(spec)?),
            "$sort" => StageKind::Sort(SortSpec::parse(expect_document(name, spec)?)?),
            "$skip" => StageKind::Skip(non_negative(name, spec)?),
            "$limit" => {
                let n = non_negative(name, spec)?;
                if n == 0 {
                    return Err(QuarryError::BadValue("the limit must be positive".into()));
                }
                StageKind::Limit(n)
            }
            "$count" => StageKind::Count(parse_count_field(spec)?),
            "$group" => StageKind::Group(GroupSpec::parse(expect_document(name, spec)?)?),
            "$sortByCount" => {
                let valid = match spec {
                    Value::String(s) => s.starts_with('$'),
                    Value::Document(d) => d.len() == 1 && d.keys().all(|k| k.starts_with('$')),
                    _ => false,
                };
                if !valid {
                    return Err(QuarryError::BadValue(
                        "the argument to $sortByCount must be a $-prefixed path or an expression object".into(),
                    ));
                }
                StageKind::SortByCount(Expression::parse(spec)?)
            }
            "$bucketAuto" => StageKind::BucketAuto(BucketAutoSpec::parse(expect_document(name, spec)?)?),
            "$setWindowFields" => StageKind::SetWindowFields(WindowSpec::parse(expect_document(name, spec)?)?),
            "$lookup" => StageKind::Lookup(LookupSpec::parse(expect_document(name, spec)?, opts)?),
            "$unionWith" => StageKind::UnionWith(UnionWithSpec::parse(spec, opts)?),
            "$out" => StageKind::Out(OutSpec::parse(spec)?),
            "$merge" => StageKind::Merge(MergeSpec::parse(spec, opts)?),
            "$changeStream" => StageKind::ChangeStream(ChangeStreamSpec::parse(expect_document(name, spec)?)?),
            other => {
                return Err(QuarryError::new(
                    ErrorCode::UnrecognizedPipelineStage,
                    format!("Unrecognized pipeline stage name: '{}'", other),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn parse(specs: &[Value], opts: &ParseOptions) -> Result<Pipeline> {
        let mut stages = Vec::with_capacity(specs.len());
        for raw in specs {
            let doc = raw
                .as_document()
                .ok_or_else(|| QuarryError::TypeMismatch("each element of the 'pipeline' array must be an object".into()))?;
            if doc.len() != 1 {
                return Err(QuarryError::BadValue(
                    "a pipeline stage specification object must contain exactly one field".into(),
                ));
            }
            let Some((name, spec)) = doc.iter().next() else {
                continue;
            };
            let kind = StageKind::parse(name, spec, opts)?;
            stages.push(Stage {
                name: name.clone(),
                spec: spec.clone(),
                kind,
            });
        }
        let pipeline = Pipeline { stages };
        pipeline.validate(opts)?;
        Ok(pipeline)
    }

    /// Parse a `pipeline` field that must be an array.
    pub fn parse_value(value: &Value, opts: &ParseOptions) -> Result<Pipeline> {
        let specs = value
            .as_array()
            .ok_or_else(|| QuarryError::TypeMismatch("'pipeline' must be an array".into()))?;
        Pipeline::parse(specs, opts)
    }

    fn validate(&self, opts: &ParseOptions) -> Result<()> {
        let last = self.stages.len().saturating_sub(1);
        let change_stream = matches!(self.stages.first().map(|s| &s.kind), Some(StageKind::ChangeStream(_)));
        for (position, stage) in self.stages.iter().enumerate() {
            if opts.nesting == Nesting::MergeUpdate && !DOCUMENT_SHAPING_STAGES.contains(&stage.name.as_str()) {
                return Err(QuarryError::BadValue(format!(
                    "{} is not allowed to be used within a $merge update pipeline",
                    stage.name
                )));
            }
            if stage.is_write() {
                if opts.nesting == Nesting::SubPipeline {
                    return Err(QuarryError::new(
                        ErrorCode::LookupSubPipelineWrite,
                        format!("{} is not allowed to be used within a $lookup or $unionWith sub-pipeline", stage.name),
                    ));
                }
                if position != last {
                    return Err(QuarryError::new(
                        ErrorCode::StageMustBeLast,
                        format!("{} can only be the final stage in the pipeline", stage.name),
                    ));
                }
                if opts.explicit_txn {
                    return Err(QuarryError::new(
                        ErrorCode::OperationNotSupportedInTransaction,
                        format!("{} cannot be used in a transaction", stage.name),
                    ));
                }
            }
            if let StageKind::ChangeStream(_) = stage.kind {
                if position != 0 || opts.nesting != Nesting::Top {
                    return Err(QuarryError::BadValue(
                        "$changeStream is only valid as the first stage in a pipeline".into(),
                    ));
                }
                if opts.explicit_txn {
                    return Err(QuarryError::new(
                        ErrorCode::OperationNotSupportedInTransaction,
                        "$changeStream cannot be used in a transaction",
                    ));
                }
            } else if change_stream && !DOCUMENT_SHAPING_STAGES.contains(&stage.name.as_str()) {
                return Err(QuarryError::new(
                    ErrorCode::IllegalOperation,
                    format!("stage {} is not permitted in a $changeStream pipeline", stage.name),
                ));
            }
        }
        Ok(())
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn is_change_stream(&self) -> bool {
        matches!(self.stages.first().map(|s| &s.kind), Some(StageKind::ChangeStream(_)))
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.stages.iter().map(|s| Value::Document(s.to_document())).collect()
    }
}

// ========== BUILDING ==========

/// A parsed `aggregate` request.
#[derive(Debug, Clone, Default)]
pub struct AggregateRequest {
    /// `db.coll`, or `db.$cmd.aggregate` for collection-less pipelines.
    pub ns: String,
    pub pipeline: Vec<Value>,
    pub collation: Option<Collation>,
    pub allow_disk_use: bool,
    pub let_vars: Option<Document>,
    pub explicit_txn: bool,
}

/// Bind `let` variables, each evaluated once up front.
pub fn bind_let(vars: &Variables, let_vars: &Document, root: &Document) -> Result<Variables> {
    let mut scope = vars.clone();
    for (name, expr) in let_vars.iter() {
        validate_variable_name(name)?;
        let value = Expression::parse(expr)?.evaluate(root, vars)?;
        scope = scope.bind(name.clone(), value);
    }
    Ok(scope)
}

/// `$group: {_id: "$f", ...}` with only `$first` accumulators.
fn distinct_group_field(spec: &GroupSpec) -> Option<&str> {
    let Expression::FieldPath(path) = &spec.id else {
        return None;
    };
    spec.accumulators
        .iter()
        .all(|a| a.op == AccumulatorOp::First)
        .then_some(path.as_str())
}

/// Build the source chain running `pipeline` over `ns` (`entry` is `None`
/// when the collection does not exist).
pub fn build_chain(
    shared: &EngineShared,
    env: &PipelineEnv,
    ns: &str,
    entry: Option<Arc<CollectionEntry>>,
    pipeline: &Pipeline,
    op: &OperationContext,
) -> Result<Box<dyn DocumentSource>> {
    let stages = pipeline.stages();
    let mut next = 0;
    let mut source: Box<dyn DocumentSource> = match stages.first().map(|s| &s.kind) {
        Some(StageKind::ChangeStream(spec)) => {
            next = 1;
            Box::new(change_stream::ChangeStreamSource::new(shared, ns, spec.clone())?)
        }
        _ => {
            let mut query = FindQuery {
                collation: env.collation.clone(),
                allow_disk_use: env.allow_disk_use,
                ..FindQuery::default()
            };
            if let Some(StageKind::Match(matcher)) = stages.get(next).map(|s| &s.kind) {
                if !matcher.expr().contains_expr() {
                    query.filter = matcher.filter().clone();
                    next += 1;
                }
            }
            if let Some(StageKind::Sort(sort)) = stages.get(next).map(|s| &s.kind) {
                query.sort = Some(sort.to_document());
                next += 1;
            }
            if let Some(StageKind::Skip(n)) = stages.get(next).map(|s| &s.kind) {
                query.skip = *n;
                next += 1;
            }
            if let Some(StageKind::Limit(n)) = stages.get(next).map(|s| &s.kind) {
                query.limit = Some(*n);
                next += 1;
            }
            let distinct = match (stages.get(next).map(|s| &s.kind), &entry) {
                (Some(StageKind::Group(group)), Some(entry)) if query.skip == 0 && query.limit.is_none() => {
                    match distinct_group_field(group) {
                        Some(field) => plan_distinct_documents(entry, field, &query, env.view)?,
                        None => None,
                    }
                }
                _ => None,
            };
            let executor = match distinct {
                Some(executor) => {
                    log_debug!("using DISTINCT_SCAN for $group on {}", ns);
                    executor
                }
                None => plan_find(shared, entry, &query, env.view, op)?,
            };
            Box::new(transform::CursorSource::new(executor))
        }
    };

    for position in next..stages.len() {
        let following = stages.get(position + 1).map(|s| &s.kind);
        source = wrap_stage(source, &stages[position], following)?;
    }
    Ok(source)
}

/// Stack every stage of `pipeline` on top of `source`.
pub(crate) fn chain_over(mut source: Box<dyn DocumentSource>, pipeline: &Pipeline) -> Result<Box<dyn DocumentSource>> {
    let stages = pipeline.stages();
    for (position, stage) in stages.iter().enumerate() {
        source = wrap_stage(source, stage, stages.get(position + 1).map(|s| &s.kind))?;
    }
    Ok(source)
}

fn wrap_stage(
    source: Box<dyn DocumentSource>,
    stage: &Stage,
    following: Option<&StageKind>,
) -> Result<Box<dyn DocumentSource>> {
    use self::blocking::{BucketAutoStage, GroupStage, SortStage};
    use self::transform::{
        AddFieldsStage, CountStage, LimitStage, MatchStage, ProjectStage, ReplaceRootStage, SkipStage, UnwindStage,
    };

    Ok(match &stage.kind {
        StageKind::Match(matcher) => Box::new(MatchStage::new(source, matcher.clone())),
        StageKind::Project(projection) => Box::new(ProjectStage::new(source, "$project", projection.clone(), stage.spec.clone())),
        StageKind::Unset(projection) => Box::new(ProjectStage::new(source, "$unset", projection.clone(), stage.spec.clone())),
        StageKind::AddFields(fields) => Box::new(AddFieldsStage::new(source, fields.clone(), stage.spec.clone())),
        StageKind::ReplaceRoot(expr) => Box::new(ReplaceRootStage::new(source, expr.clone(), stage.spec.clone())),
        StageKind::Unwind(spec) => Box::new(UnwindStage::new(source, spec.clone())),
        StageKind::Sort(spec) => {
            let limit = match following {
                Some(StageKind::Limit(n)) => Some(*n as usize),
                _ => None,
            };
            Box::new(SortStage::new(source, spec.clone(), limit))
        }
        StageKind::Skip(n) => Box::new(SkipStage::new(source, *n)),
        StageKind::Limit(n) => Box::new(LimitStage::new(source, *n)),
        StageKind::Count(field) => Box::new(CountStage::new(source, field.clone())),
        StageKind::Group(spec) => Box::new(GroupStage::new(source, spec.clone())),
        StageKind::SortByCount(expr) => {
            let group = Box::new(GroupStage::new(source, GroupSpec::count_by(expr.clone())));
            let mut order = Document::new();
            order.insert("count", -1);
            Box::new(SortStage::new(group, SortSpec::parse(&order)?, None))
        }
        StageKind::BucketAuto(spec) => Box::new(BucketAutoStage::new(source, spec.clone())),
        StageKind::SetWindowFields(spec) => Box::new(window::SetWindowFieldsStage::new(source, spec.clone())),
        StageKind::Lookup(spec) => Box::new(lookup::LookupStage::new(source, spec.clone())),
        StageKind::UnionWith(spec) => Box::new(lookup::UnionWithStage::new(source, spec.clone())),
        StageKind::Out(spec) => Box::new(output::OutStage::new(source, spec.clone())),
        StageKind::Merge(spec) => Box::new(output::MergeStage::new(source, spec.clone())),
        StageKind::ChangeStream(_) => {
            return Err(QuarryError::BadValue(
                "$changeStream is only valid as the first stage in a pipeline".into(),
            ))
        }
    })
}

/// Run `pipeline` over `ns` to completion, collecting its output.
pub fn run_to_vec(
    ctx: &PipelineContext<'_>,
    ns: &str,
    pipeline: &Pipeline,
) -> Result<Vec<Document>> {
    let entry = ctx
        .shared
        .catalog
        .get(ns)
        .filter(|e| e.visible_at(ctx.env.view.read_ts));
    let mut chain = build_chain(ctx.shared, ctx.env, ns, entry, pipeline, ctx.op)?;
    let mut out = Vec::new();
    while let Some(doc) = chain.get_next(ctx)? {
        out.push(doc);
    }
    Ok(out)
}

// ========== EXECUTOR ==========

/// A running pipeline, resumable across `getMore`s.
pub struct PipelineExecutor {
    ns: String,
    root: Box<dyn DocumentSource>,
    env: PipelineEnv,
    snapshot: Option<Transaction>,
    tailable: bool,
    exhausted: bool,
}

impl PipelineExecutor {
    /// Parse, validate and plan `request` at `view`.
    pub fn prepare(
        shared: &EngineShared,
        request: &AggregateRequest,
        view: ReadView,
        op: &OperationContext,
    ) -> Result<PipelineExecutor> {
        let (db, coll) = request
            .ns
            .split_once('.')
            .ok_or_else(|| QuarryError::new(ErrorCode::InvalidNamespace, format!("invalid namespace '{}'", request.ns)))?;
        let entry = shared.catalog.get(&request.ns).filter(|e| e.visible_at(view.read_ts));
        let collation = request
            .collation
            .clone()
            .or_else(|| entry.as_ref().and_then(|e| e.collation.clone()))
            .filter(|c| !c.is_simple());
        let mut vars = Variables::new(collation.clone());
        if let Some(let_vars) = &request.let_vars {
            vars = bind_let(&vars, let_vars, &Document::new())?;
        }
        let opts = ParseOptions::top(collation.clone(), request.explicit_txn);
        let pipeline = Pipeline::parse(&request.pipeline, &opts)?;
        if coll == COLLECTIONLESS && !pipeline.is_change_stream() {
            return Err(QuarryError::new(
                ErrorCode::InvalidNamespace,
                "{aggregate: 1} is only valid with a leading $changeStream stage",
            ));
        }
        let env = PipelineEnv {
            db: db.to_string(),
            view,
            vars,
            collation,
            allow_disk_use: request.allow_disk_use,
            explicit_txn: request.explicit_txn,
        };
        let scope = if coll == COLLECTIONLESS { db } else { request.ns.as_str() };
        let root = build_chain(shared, &env, scope, entry, &pipeline, op)?;
        Ok(PipelineExecutor {
            ns: request.ns.clone(),
            root,
            env,
            snapshot: None,
            tailable: pipeline.is_change_stream(),
            exhausted: false,
        })
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn view(&self) -> ReadView {
        self.env.view
    }

    pub fn attach_snapshot(&mut self, txn: Transaction) {
        self.snapshot = Some(txn);
    }

    /// Tailable executors stay open after running dry.
    pub fn is_tailable(&self) -> bool {
        self.tailable
    }

    pub fn is_eof(&self) -> bool {
        self.exhausted && !self.tailable
    }

    pub fn next(&mut self, shared: &EngineShared, op: &OperationContext) -> Result<Option<Document>> {
        if self.exhausted && !self.tailable {
            return Ok(None);
        }
        let ctx = PipelineContext {
            shared,
            op,
            env: &self.env,
        };
        let next = self.root.get_next(&ctx)?;
        if next.is_none() {
            self.exhausted = true;
        }
        Ok(next)
    }

    pub fn collect(&mut self, shared: &EngineShared, op: &OperationContext) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next(shared, op)? {
            out.push(doc);
        }
        Ok(out)
    }

    pub fn explain(&self) -> Document {
        let stages: Vec<Value> = explain_chain(self.root.as_ref()).into_iter().map(Value::Document).collect();
        let mut doc = Document::new();
        doc.insert("stages", Value::Array(stages));
        doc
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("ns", &self.ns)
            .field("root", &self.root.name())
            .field("tailable", &self.tailable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{with_write_retry, CollectionWriter};
    use crate::doc;
    use crate::engine::Engine;

    fn v(json: serde_json::Value) -> Vec<Value> {
        match Value::from_json(&json).unwrap() {
            Value::Array(items) => items,
            other => vec![other],
        }
    }

    fn parse(json: serde_json::Value) -> Result<Pipeline> {
        Pipeline::parse(&v(json), &ParseOptions::top(None, false))
    }

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

    fn aggregate(shared: &EngineShared, ns: &str, pipeline: serde_json::Value) -> Result<Vec<Document>> {
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let request = AggregateRequest {
            ns: ns.to_string(),
            pipeline: v(pipeline),
            ..AggregateRequest::default()
        };
        let mut executor = PipelineExecutor::prepare(shared, &request, txn.view(), &op)?;
        executor.collect(shared, &op)
    }

    #[test]
    fn test_validation_errors() {
        let err = parse(serde_json::json!([{"$bogus": {}}])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnrecognizedPipelineStage);
        let err = parse(serde_json::json!([{"$out": "x"}, {"$match": {}}])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StageMustBeLast);
        let err = parse(serde_json::json!([{"$changeStream": {}}, {"$group": {"_id": null}}])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IllegalOperation);
        let err = parse(serde_json::json!([{"$match": {}, "$limit": 1}])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
        let err = Pipeline::parse(&v(serde_json::json!([{"$out": "x"}])), &ParseOptions::top(None, true)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OperationNotSupportedInTransaction);
        let err = parse(serde_json::json!([
            {"$lookup": {"from": "b", "as": "j", "pipeline": [{"$merge": {"into": "c"}}]}}
        ]))
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::LookupSubPipelineWrite);
        assert!(parse(serde_json::json!([{"$changeStream": {}}, {"$match": {"operationType": "insert"}}])).is_ok());
    }

    #[test]
    fn test_skip_limit_pushdown() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, "test.c", (0..100).map(|i| doc!({"_id": i, "mod": i % 2})).collect());
        let docs = aggregate(shared, "test.c", serde_json::json!([{"$skip": 6}, {"$limit": 3}])).unwrap();
        let ids: Vec<i64> = docs.iter().filter_map(|d| d.id().and_then(Value::as_i64)).collect();
        assert_eq!(ids, vec![6, 7, 8]);
    }

    #[test]
    fn test_streaming_and_blocking_stages() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(
            shared,
            "test.c",
            (0..20).map(|i| doc!({"_id": i, "g": i % 3, "tags": ["a", "b"]})).collect(),
        );
        let docs = aggregate(
            shared,
            "test.c",
            serde_json::json!([
                {"$match": {"g": {"$lt": 2}}},
                {"$unwind": "$tags"},
                {"$group": {"_id": "$g", "n": {"$sum": 1}}},
                {"$sort": {"_id": 1}},
                {"$set": {"double": {"$multiply": ["$n", 2]}}},
                {"$project": {"_id": 0, "g": "$_id", "double": 1}}
            ]),
        )
        .unwrap();
        assert_eq!(docs, vec![doc!({"double": 28, "g": 0}), doc!({"double": 28, "g": 1})]);
    }

    #[test]
    fn test_count_and_sort_by_count() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, "test.c", (0..10).map(|i| doc!({"_id": i, "k": if i < 7 { "x" } else { "y" }})).collect());
        let docs = aggregate(shared, "test.c", serde_json::json!([{"$count": "total"}])).unwrap();
        assert_eq!(docs, vec![doc!({"total": 10})]);
        let docs = aggregate(shared, "test.c", serde_json::json!([{"$sortByCount": "$k"}])).unwrap();
        assert_eq!(docs, vec![doc!({"_id": "x", "count": 7}), doc!({"_id": "y", "count": 3})]);
    }

    #[test]
    fn test_missing_collection_is_empty() {
        let engine = Engine::in_memory();
        let docs = aggregate(engine.shared(), "test.none", serde_json::json!([{"$match": {}}])).unwrap();
        assert!(docs.is_empty());
        let err = aggregate(engine.shared(), "test.$cmd.aggregate", serde_json::json!([{"$match": {}}])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidNamespace);
    }

    #[test]
    fn test_explain_lists_stages() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, "test.c", vec![doc!({"_id": 1})]);
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let request = AggregateRequest {
            ns: "test.c".into(),
            pipeline: v(serde_json::json!([{"$match": {"_id": 1}}, {"$group": {"_id": null, "n": {"$sum": 1}}}])),
            ..AggregateRequest::default()
        };
        let executor = PipelineExecutor::prepare(shared, &request, txn.view(), &op).unwrap();
        let explain = executor.explain();
        let stages = explain.get("stages").and_then(Value::as_array).unwrap();
        assert_eq!(stages.len(), 2);
        assert!(stages[0].as_document().unwrap().contains_key("$cursor"));
        assert!(stages[1].as_document().unwrap().contains_key("$group"));
    }
}
