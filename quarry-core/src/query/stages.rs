// quarry-core/src/query/stages.rs
//! Plan stages: the pull-based execution tree.
//!
//! ```text
//! PROJECTION
//!   └── LIMIT ── SKIP
//!                  └── SORT
//!                        └── FETCH (filter)
//!                              └── IXSCAN | OR(IXSCAN, ...)
//! COLLSCAN (filter) | DISTINCT_SCAN | EOF
//! ```
//!
//! Every call to [`PlanStage::work`] does a bounded amount of work and
//! reports `Advanced`, `NeedTime` or `Eof`. Stages own all their state and
//! borrow nothing: the read view, operation and catalog arrive through an
//! [`ExecContext`] on each call, so a half-run plan can wait inside a cursor
//! between batches and the multi-planner can interleave candidates.
//!
//! Scans re-check the catalog whenever they fetch a batch. If the
//! collection or index they read was dropped meanwhile the plan dies with
//! `QueryPlanKilled` rather than silently returning partial results.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::catalog::{Catalog, CollectionEntry, IndexEntry};
use crate::collation::Collation;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::index::{Direction, IndexBounds, IndexEntryKey, IndexKey, IndexTree};
use crate::interrupt::OperationContext;
use crate::metrics::Metrics;
use crate::pipeline::expression::Variables;
use crate::storage::{RecordId, ScanDirection, SortedStream, Sorter, SorterOptions};
use crate::txn::ReadView;
use crate::value::Value;

use super::matcher::Matcher;
use super::projection::Projection;
use super::sort::SortSpec;

/// Records and index entries fetched per storage call.
const SCAN_BATCH: usize = 64;

// ========== CORE TYPES ==========

/// One unit flowing between stages.
#[derive(Debug, Clone, Default)]
pub struct Member {
    pub rid: Option<RecordId>,
    pub doc: Option<Arc<Document>>,
    pub key: Option<IndexKey>,
}

impl Member {
    pub fn document(&self) -> Option<&Document> {
        self.doc.as_deref()
    }

    /// Take the document out, cloning only if it is still shared.
    pub fn into_document(self) -> Option<Document> {
        self.doc.map(|doc| Arc::try_unwrap(doc).unwrap_or_else(|shared| (*shared).clone()))
    }
}

#[derive(Debug)]
pub enum StageState {
    Advanced(Member),
    NeedTime,
    Eof,
}

/// Everything a stage may touch while working.
pub struct ExecContext<'a> {
    pub op: &'a OperationContext,
    pub view: ReadView,
    pub catalog: &'a Catalog,
    pub metrics: &'a Metrics,
}

#[derive(Debug, Clone, Default)]
pub struct StageStats {
    pub works: u64,
    pub advanced: u64,
    pub needs_time: u64,
    pub is_eof: bool,
    pub keys_examined: u64,
    pub docs_examined: u64,
    pub used_disk: bool,
}

pub trait PlanStage: Send {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState>;

    fn name(&self) -> &'static str;

    fn stats(&self) -> &StageStats;

    fn stats_mut(&mut self) -> &mut StageStats;

    /// Stage-specific explain fields.
    fn details(&self) -> Document {
        Document::new()
    }

    fn children(&self) -> Vec<&dyn PlanStage> {
        Vec::new()
    }

    fn work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        let state = self.do_work(ctx)?;
        let stats = self.stats_mut();
        stats.works += 1;
        match &state {
            StageState::Advanced(_) => stats.advanced += 1,
            StageState::NeedTime => stats.needs_time += 1,
            StageState::Eof => stats.is_eof = true,
        }
        Ok(state)
    }
}

/// Explain document for the tree rooted at `stage`.
pub fn explain_tree(stage: &dyn PlanStage, with_stats: bool) -> Document {
    let mut doc = Document::new();
    doc.insert("stage", stage.name());
    for (key, value) in stage.details() {
        doc.insert(key, value);
    }
    if with_stats {
        let stats = stage.stats();
        doc.insert("nReturned", stats.advanced as i64);
        doc.insert("works", stats.works as i64);
        doc.insert("needTime", stats.needs_time as i64);
        doc.insert("isEOF", stats.is_eof);
        if stats.keys_examined > 0 || stage.name() == "IXSCAN" || stage.name() == "DISTINCT_SCAN" {
            doc.insert("keysExamined", stats.keys_examined as i64);
        }
        if stats.docs_examined > 0 || stage.name() == "FETCH" || stage.name() == "COLLSCAN" {
            doc.insert("docsExamined", stats.docs_examined as i64);
        }
        if stage.name() == "SORT" {
            doc.insert("usedDisk", stats.used_disk);
        }
    }
    let children = stage.children();
    match children.len() {
        0 => {}
        1 => {
            doc.insert("inputStage", explain_tree(children[0], with_stats));
        }
        _ => {
            doc.insert(
                "inputStages",
                Value::Array(
                    children
                        .into_iter()
                        .map(|c| Value::Document(explain_tree(c, with_stats)))
                        .collect(),
                ),
            );
        }
    }
    doc
}

/// Keys and documents examined across the whole tree.
pub fn examined_totals(stage: &dyn PlanStage) -> (u64, u64) {
    let stats = stage.stats();
    let (mut keys, mut docs) = (stats.keys_examined, stats.docs_examined);
    for child in stage.children() {
        let (k, d) = examined_totals(child);
        keys += k;
        docs += d;
    }
    (keys, docs)
}

fn plan_killed(message: String) -> QuarryError {
    QuarryError::new(ErrorCode::QueryPlanKilled, message)
}

fn check_collection(ctx: &ExecContext<'_>, entry: &CollectionEntry) -> Result<()> {
    match ctx.catalog.get(&entry.ns) {
        Some(current) if Arc::ptr_eq(&current.records, &entry.records) => Ok(()),
        _ => Err(plan_killed(format!("collection {} was dropped during the query", entry.ns))),
    }
}

fn check_index(ctx: &ExecContext<'_>, ns: &str, index: &IndexEntry) -> Result<()> {
    let alive = ctx
        .catalog
        .get(ns)
        .and_then(|entry| entry.index(index.name()).map(|current| Arc::ptr_eq(&current.tree, &index.tree)))
        .unwrap_or(false);
    if alive {
        Ok(())
    } else {
        Err(plan_killed(format!("index '{}' on {} was dropped during the query", index.name(), ns)))
    }
}

fn direction_name(forward: bool) -> &'static str {
    if forward {
        "forward"
    } else {
        "backward"
    }
}

fn index_details(index: &IndexEntry, bounds: &IndexBounds, forward: bool) -> Document {
    let pattern = &index.descriptor.pattern;
    let names: Vec<String> = pattern.fields().iter().map(|(f, _)| f.clone()).collect();
    let mut doc = Document::new();
    doc.insert("keyPattern", pattern.to_document());
    doc.insert("indexName", index.name());
    doc.insert("isMultiKey", index.multikey);
    doc.insert("isUnique", index.descriptor.unique);
    doc.insert("isSparse", index.descriptor.sparse);
    doc.insert("isPartial", index.descriptor.partial_filter.is_some());
    doc.insert("direction", direction_name(forward));
    doc.insert("indexBounds", bounds.describe(&names));
    doc
}

// ========== LEAF STAGES ==========

pub struct EofStage {
    stats: StageStats,
}

impl EofStage {
    pub fn new() -> Self {
        EofStage {
            stats: StageStats::default(),
        }
    }
}

impl Default for EofStage {
    fn default() -> Self {
        EofStage::new()
    }
}

impl PlanStage for EofStage {
    fn do_work(&mut self, _ctx: &ExecContext<'_>) -> Result<StageState> {
        Ok(StageState::Eof)
    }

    fn name(&self) -> &'static str {
        "EOF"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }
}

/// Natural-order scan with an optional filter.
pub struct CollScan {
    entry: Arc<CollectionEntry>,
    forward: bool,
    filter: Option<Matcher>,
    buffer: VecDeque<(RecordId, Arc<Document>)>,
    resume: Option<RecordId>,
    exhausted: bool,
    stats: StageStats,
}

impl CollScan {
    pub fn new(entry: Arc<CollectionEntry>, forward: bool, filter: Option<Matcher>) -> Self {
        CollScan {
            entry,
            forward,
            filter: filter.filter(|m| !m.is_trivial()),
            buffer: VecDeque::new(),
            resume: None,
            exhausted: false,
            stats: StageStats::default(),
        }
    }
}

impl PlanStage for CollScan {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        ctx.op.check_periodically()?;
        if self.buffer.is_empty() {
            if self.exhausted {
                return Ok(StageState::Eof);
            }
            check_collection(ctx, &self.entry)?;
            let direction = if self.forward {
                ScanDirection::Forward
            } else {
                ScanDirection::Backward
            };
            let batch = self.entry.records.scan_batch(&ctx.view, self.resume, direction, SCAN_BATCH);
            if batch.len() < SCAN_BATCH {
                self.exhausted = true;
            }
            if let Some((rid, _)) = batch.last() {
                self.resume = Some(*rid);
            }
            self.buffer.extend(batch);
            if self.buffer.is_empty() {
                return Ok(StageState::Eof);
            }
        }
        let Some((rid, doc)) = self.buffer.pop_front() else {
            return Ok(StageState::NeedTime);
        };
        self.stats.docs_examined += 1;
        ctx.metrics.docs_examined.incr();
        if let Some(filter) = &self.filter {
            if !filter.matches(&doc)? {
                return Ok(StageState::NeedTime);
            }
        }
        Ok(StageState::Advanced(Member {
            rid: Some(rid),
            doc: Some(doc),
            key: None,
        }))
    }

    fn name(&self) -> &'static str {
        "COLLSCAN"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn details(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("direction", direction_name(self.forward));
        if let Some(filter) = &self.filter {
            doc.insert("filter", filter.filter().clone());
        }
        doc
    }
}

/// Ordered scan of index entries within bounds. Multikey indexes can yield
/// the same record under several keys; those repeats are dropped.
pub struct IndexScan {
    ns: String,
    index: Arc<IndexEntry>,
    bounds: IndexBounds,
    forward: bool,
    directions: Vec<Direction>,
    buffer: VecDeque<IndexEntryKey>,
    resume: Option<IndexEntryKey>,
    exhausted: bool,
    seen: Option<HashSet<RecordId>>,
    stats: StageStats,
}

impl IndexScan {
    pub fn new(ns: &str, index: Arc<IndexEntry>, bounds: IndexBounds, forward: bool) -> Self {
        let directions = index.descriptor.pattern.fields().iter().map(|(_, d)| *d).collect();
        let seen = index.multikey.then(HashSet::new);
        IndexScan {
            ns: ns.to_string(),
            index,
            bounds,
            forward,
            directions,
            buffer: VecDeque::new(),
            resume: None,
            exhausted: false,
            seen,
            stats: StageStats::default(),
        }
    }

    pub fn index_name(&self) -> &str {
        self.index.name()
    }
}

impl PlanStage for IndexScan {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        ctx.op.check_periodically()?;
        if self.buffer.is_empty() {
            if self.exhausted || self.bounds.is_empty() {
                return Ok(StageState::Eof);
            }
            check_index(ctx, &self.ns, &self.index)?;
            let batch = self.index.tree.scan_batch(
                &ctx.view,
                &self.bounds,
                &self.directions,
                self.forward,
                self.resume.as_ref(),
                SCAN_BATCH,
            );
            self.stats.keys_examined += batch.keys_examined as u64;
            ctx.metrics.keys_examined.add(batch.keys_examined as u64);
            self.exhausted = batch.done;
            if let Some(last) = batch.entries.last() {
                self.resume = Some(last.clone());
            }
            self.buffer.extend(batch.entries);
            if self.buffer.is_empty() {
                return Ok(if self.exhausted {
                    StageState::Eof
                } else {
                    StageState::NeedTime
                });
            }
        }
        let Some((key, rid)) = self.buffer.pop_front() else {
            return Ok(StageState::NeedTime);
        };
        if let Some(seen) = &mut self.seen {
            if !seen.insert(rid) {
                return Ok(StageState::NeedTime);
            }
        }
        Ok(StageState::Advanced(Member {
            rid: Some(rid),
            doc: None,
            key: Some(key),
        }))
    }

    fn name(&self) -> &'static str {
        "IXSCAN"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn details(&self) -> Document {
        index_details(&self.index, &self.bounds, self.forward)
    }
}

/// Visits one entry per distinct first key component, skipping the rest.
pub struct DistinctScan {
    ns: String,
    index: Arc<IndexEntry>,
    bounds: IndexBounds,
    forward: bool,
    directions: Vec<Direction>,
    resume: Option<IndexEntryKey>,
    done: bool,
    stats: StageStats,
}

impl DistinctScan {
    pub fn new(ns: &str, index: Arc<IndexEntry>, bounds: IndexBounds, forward: bool) -> Self {
        let directions = index.descriptor.pattern.fields().iter().map(|(_, d)| *d).collect();
        DistinctScan {
            ns: ns.to_string(),
            index,
            bounds,
            forward,
            directions,
            resume: None,
            done: false,
            stats: StageStats::default(),
        }
    }
}

impl PlanStage for DistinctScan {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        if self.done || self.bounds.is_empty() {
            return Ok(StageState::Eof);
        }
        ctx.op.check_periodically()?;
        check_index(ctx, &self.ns, &self.index)?;
        let batch = self.index.tree.scan_batch(
            &ctx.view,
            &self.bounds,
            &self.directions,
            self.forward,
            self.resume.as_ref(),
            1,
        );
        self.stats.keys_examined += batch.keys_examined as u64;
        ctx.metrics.keys_examined.add(batch.keys_examined as u64);
        match batch.entries.into_iter().next() {
            Some((key, rid)) => {
                self.resume = IndexTree::skip_token(&key, self.directions.len(), self.forward);
                if self.resume.is_none() {
                    self.done = true;
                }
                Ok(StageState::Advanced(Member {
                    rid: Some(rid),
                    doc: None,
                    key: Some(key),
                }))
            }
            None => {
                self.done = true;
                Ok(StageState::Eof)
            }
        }
    }

    fn name(&self) -> &'static str {
        "DISTINCT_SCAN"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn details(&self) -> Document {
        index_details(&self.index, &self.bounds, self.forward)
    }
}

// ========== INTERIOR STAGES ==========

/// Loads the record behind each index entry and applies the residual filter.
pub struct Fetch {
    child: Box<dyn PlanStage>,
    entry: Arc<CollectionEntry>,
    filter: Option<Matcher>,
    stats: StageStats,
}

impl Fetch {
    pub fn new(child: Box<dyn PlanStage>, entry: Arc<CollectionEntry>, filter: Option<Matcher>) -> Self {
        Fetch {
            child,
            entry,
            filter: filter.filter(|m| !m.is_trivial()),
            stats: StageStats::default(),
        }
    }
}

impl PlanStage for Fetch {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        let member = match self.child.work(ctx)? {
            StageState::Advanced(member) => member,
            other => return Ok(other),
        };
        let doc = match (&member.doc, member.rid) {
            (Some(doc), _) => doc.clone(),
            (None, Some(rid)) => match self.entry.records.find(rid, &ctx.view) {
                Some(doc) => doc,
                None => return Ok(StageState::NeedTime),
            },
            (None, None) => return Ok(StageState::NeedTime),
        };
        self.stats.docs_examined += 1;
        ctx.metrics.docs_examined.incr();
        if let Some(filter) = &self.filter {
            if !filter.matches(&doc)? {
                return Ok(StageState::NeedTime);
            }
        }
        Ok(StageState::Advanced(Member {
            rid: member.rid,
            doc: Some(doc),
            key: member.key,
        }))
    }

    fn name(&self) -> &'static str {
        "FETCH"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn details(&self) -> Document {
        let mut doc = Document::new();
        if let Some(filter) = &self.filter {
            doc.insert("filter", filter.filter().clone());
        }
        doc
    }

    fn children(&self) -> Vec<&dyn PlanStage> {
        vec![self.child.as_ref()]
    }
}

/// Union of child scans, each record returned once.
pub struct OrStage {
    children: Vec<Box<dyn PlanStage>>,
    current: usize,
    seen: HashSet<RecordId>,
    stats: StageStats,
}

impl OrStage {
    pub fn new(children: Vec<Box<dyn PlanStage>>) -> Self {
        OrStage {
            children,
            current: 0,
            seen: HashSet::new(),
            stats: StageStats::default(),
        }
    }
}

impl PlanStage for OrStage {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        let Some(child) = self.children.get_mut(self.current) else {
            return Ok(StageState::Eof);
        };
        match child.work(ctx)? {
            StageState::Advanced(member) => match member.rid {
                Some(rid) if !self.seen.insert(rid) => Ok(StageState::NeedTime),
                _ => Ok(StageState::Advanced(member)),
            },
            StageState::NeedTime => Ok(StageState::NeedTime),
            StageState::Eof => {
                self.current += 1;
                Ok(if self.current >= self.children.len() {
                    StageState::Eof
                } else {
                    StageState::NeedTime
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "OR"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn children(&self) -> Vec<&dyn PlanStage> {
        self.children.iter().map(|c| c.as_ref()).collect()
    }
}

enum SortPhase {
    Collecting(Sorter<IndexKey, (Option<RecordId>, Document)>),
    Streaming(SortedStream<IndexKey, (Option<RecordId>, Document)>),
    Done,
}

/// Blocking sort through the external sorter; spills when allowed.
pub struct SortStage {
    child: Box<dyn PlanStage>,
    spec: SortSpec,
    collation: Option<Collation>,
    limit: Option<usize>,
    phase: SortPhase,
    stats: StageStats,
}

impl SortStage {
    pub fn new(
        child: Box<dyn PlanStage>,
        spec: SortSpec,
        collation: Option<Collation>,
        options: SorterOptions,
        limit: Option<usize>,
    ) -> Self {
        let sorter = Sorter::new("$sort", options.with_limit(limit));
        SortStage {
            child,
            spec,
            collation,
            limit,
            phase: SortPhase::Collecting(sorter),
            stats: StageStats::default(),
        }
    }
}

impl PlanStage for SortStage {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        match &mut self.phase {
            SortPhase::Streaming(stream) => {
                ctx.op.check_periodically()?;
                match stream.next_record()? {
                    Some((_, (rid, doc))) => Ok(StageState::Advanced(Member {
                        rid,
                        doc: Some(Arc::new(doc)),
                        key: None,
                    })),
                    None => {
                        self.phase = SortPhase::Done;
                        Ok(StageState::Eof)
                    }
                }
            }
            SortPhase::Done => Ok(StageState::Eof),
            SortPhase::Collecting(sorter) => match self.child.work(ctx)? {
                StageState::Advanced(member) => {
                    let rid = member.rid;
                    let Some(doc) = member.into_document() else {
                        return Ok(StageState::NeedTime);
                    };
                    let key = self.spec.key(&doc, self.collation.as_ref());
                    let size = doc.bson_size();
                    sorter.push(key, (rid, doc), size)?;
                    Ok(StageState::NeedTime)
                }
                StageState::NeedTime => Ok(StageState::NeedTime),
                StageState::Eof => {
                    let SortPhase::Collecting(sorter) = std::mem::replace(&mut self.phase, SortPhase::Done) else {
                        return Ok(StageState::Eof);
                    };
                    if sorter.spilled_runs() > 0 {
                        self.stats.used_disk = true;
                    }
                    self.phase = SortPhase::Streaming(sorter.finish()?);
                    Ok(StageState::NeedTime)
                }
            },
        }
    }

    fn name(&self) -> &'static str {
        "SORT"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn details(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("sortPattern", self.spec.to_document());
        if let Some(limit) = self.limit {
            doc.insert("limitAmount", limit as i64);
        }
        doc
    }

    fn children(&self) -> Vec<&dyn PlanStage> {
        vec![self.child.as_ref()]
    }
}

pub struct SkipStage {
    child: Box<dyn PlanStage>,
    amount: u64,
    remaining: u64,
    stats: StageStats,
}

impl SkipStage {
    pub fn new(child: Box<dyn PlanStage>, amount: u64) -> Self {
        SkipStage {
            child,
            amount,
            remaining: amount,
            stats: StageStats::default(),
        }
    }
}

impl PlanStage for SkipStage {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        match self.child.work(ctx)? {
            StageState::Advanced(_) if self.remaining > 0 => {
                self.remaining -= 1;
                Ok(StageState::NeedTime)
            }
            other => Ok(other),
        }
    }

    fn name(&self) -> &'static str {
        "SKIP"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn details(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("skipAmount", self.amount as i64);
        doc
    }

    fn children(&self) -> Vec<&dyn PlanStage> {
        vec![self.child.as_ref()]
    }
}

pub struct LimitStage {
    child: Box<dyn PlanStage>,
    amount: u64,
    returned: u64,
    stats: StageStats,
}

impl LimitStage {
    pub fn new(child: Box<dyn PlanStage>, amount: u64) -> Self {
        LimitStage {
            child,
            amount,
            returned: 0,
            stats: StageStats::default(),
        }
    }
}

impl PlanStage for LimitStage {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        if self.returned >= self.amount {
            return Ok(StageState::Eof);
        }
        let state = self.child.work(ctx)?;
        if let StageState::Advanced(_) = state {
            self.returned += 1;
        }
        Ok(state)
    }

    fn name(&self) -> &'static str {
        "LIMIT"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn details(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("limitAmount", self.amount as i64);
        doc
    }

    fn children(&self) -> Vec<&dyn PlanStage> {
        vec![self.child.as_ref()]
    }
}

pub struct ProjectionStage {
    child: Box<dyn PlanStage>,
    spec: Document,
    projection: Projection,
    vars: Variables,
    stats: StageStats,
}

impl ProjectionStage {
    pub fn new(child: Box<dyn PlanStage>, spec: Document, projection: Projection, collation: Option<Collation>) -> Self {
        ProjectionStage {
            child,
            spec,
            projection,
            vars: Variables::new(collation),
            stats: StageStats::default(),
        }
    }
}

impl PlanStage for ProjectionStage {
    fn do_work(&mut self, ctx: &ExecContext<'_>) -> Result<StageState> {
        match self.child.work(ctx)? {
            StageState::Advanced(member) => {
                let Some(doc) = member.document() else {
                    return Ok(StageState::NeedTime);
                };
                let projected = self.projection.apply(doc, &self.vars)?;
                Ok(StageState::Advanced(Member {
                    rid: member.rid,
                    doc: Some(Arc::new(projected)),
                    key: None,
                }))
            }
            other => Ok(other),
        }
    }

    fn name(&self) -> &'static str {
        "PROJECTION"
    }

    fn stats(&self) -> &StageStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut StageStats {
        &mut self.stats
    }

    fn details(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("transformBy", self.spec.clone());
        doc
    }

    fn children(&self) -> Vec<&dyn PlanStage> {
        vec![self.child.as_ref()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{with_write_retry, CollectionWriter};
    use crate::doc;
    use crate::engine::{Engine, EngineShared};

    fn seed(shared: &EngineShared, n: i32) -> Arc<CollectionEntry> {
        let op = OperationContext::new();
        crate::ddl::create_collection(shared, "test.c", &Document::new(), &op).unwrap();
        with_write_retry(shared, &op, |txn| {
            let writer = CollectionWriter::open(shared, txn, &op, "test.c")?;
            for i in 0..n {
                writer.insert(doc!({"_id": i, "mod": i % 3}))?;
            }
            Ok(())
        })
        .unwrap();
        shared.catalog.get("test.c").unwrap()
    }

    fn drain(stage: &mut dyn PlanStage, shared: &EngineShared) -> Result<Vec<Member>> {
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let ctx = ExecContext {
            op: &op,
            view: txn.view(),
            catalog: &shared.catalog,
            metrics: &shared.metrics,
        };
        let mut out = Vec::new();
        loop {
            match stage.work(&ctx)? {
                StageState::Advanced(member) => out.push(member),
                StageState::NeedTime => {}
                StageState::Eof => return Ok(out),
            }
        }
    }

    fn ids(members: &[Member]) -> Vec<i64> {
        members
            .iter()
            .map(|m| m.document().and_then(|d| d.id()).and_then(Value::as_i64).unwrap())
            .collect()
    }

    #[test]
    fn test_collscan_filter_skip_limit() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let entry = seed(shared, 200);
        let filter = Matcher::new(&doc!({"mod": 0}), None).unwrap();
        let scan = CollScan::new(entry, true, Some(filter));
        let mut plan = LimitStage::new(Box::new(SkipStage::new(Box::new(scan), 2)), 3);
        let out = drain(&mut plan, shared).unwrap();
        assert_eq!(ids(&out), vec![6, 9, 12]);
    }

    #[test]
    fn test_backward_scan_and_sort() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let entry = seed(shared, 10);
        let scan = CollScan::new(entry.clone(), false, None);
        let out = drain(&mut LimitStage::new(Box::new(scan), 2), shared).unwrap();
        assert_eq!(ids(&out), vec![9, 8]);

        let spec = SortSpec::parse(&doc!({"mod": -1, "_id": 1})).unwrap();
        let scan = CollScan::new(entry, true, None);
        let mut sort = SortStage::new(Box::new(scan), spec, None, shared.sorter_options(false), None);
        let out = drain(&mut sort, shared).unwrap();
        assert_eq!(ids(&out), vec![2, 5, 8, 1, 4, 7, 0, 3, 6, 9]);
    }

    #[test]
    fn test_dropped_collection_kills_plan() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let entry = seed(shared, 300);
        let mut scan = CollScan::new(entry, true, None);
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let ctx = ExecContext {
            op: &op,
            view: txn.view(),
            catalog: &shared.catalog,
            metrics: &shared.metrics,
        };
        assert!(matches!(scan.work(&ctx).unwrap(), StageState::Advanced(_)));
        crate::ddl::drop_collection(shared, "test.c", &op).unwrap();
        let err = loop {
            match scan.work(&ctx) {
                Ok(StageState::Eof) => panic!("scan finished after drop"),
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        assert_eq!(err.code(), ErrorCode::QueryPlanKilled);
    }

    #[test]
    fn test_explain_tree_shape() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let entry = seed(shared, 5);
        let scan = CollScan::new(entry, true, None);
        let mut plan = LimitStage::new(Box::new(scan), 1);
        drain(&mut plan, shared).unwrap();
        let explain = explain_tree(&plan, true);
        assert_eq!(explain.get("stage"), Some(&Value::from("LIMIT")));
        let input = explain.get("inputStage").and_then(Value::as_document).unwrap();
        assert_eq!(input.get("stage"), Some(&Value::from("COLLSCAN")));
        assert_eq!(examined_totals(&plan), (0, 1));
    }
}
