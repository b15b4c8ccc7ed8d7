// quarry-core/src/query/planner.rs
//! Access-path selection and plan execution.
//!
//! ```text
//! plan_find(query)
//!   ├── hint?            -> that single plan
//!   ├── plan cache       -> Active entry: run it under a works budget,
//!   │                       fall back to re-planning if it overruns
//!   ├── enumerate        -> one IXSCAN per relevant index, OR plan, COLLSCAN
//!   ├── multi-plan trial -> round-robin `work()` until one candidate returns
//!   │                       K results or hits EOF, rank by productivity
//!   └── record winner    -> Inactive entry, Active after N confirmations
//! ```
//!
//! Bounds come from the top-level conjuncts of the filter. Whatever the
//! bounds do not capture exactly is re-checked by the FETCH filter, so an
//! index plan is always a superset scan followed by the full predicate.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::{CollectionEntry, IndexEntry};
use crate::collation::Collation;
use crate::document::Document;
use crate::engine::EngineShared;
use crate::error::{QuarryError, Result};
use crate::index::{IndexBounds, Interval, OrderedIntervalList};
use crate::interrupt::OperationContext;
use crate::txn::{ReadView, Transaction};
use crate::value::Value;
use crate::{log_debug, log_trace};

use super::matcher::{candidates, MatchExpr, Matcher};
use super::operators::Predicate;
use super::plan_cache::{CacheLookup, PlanChoice};
use super::projection::Projection;
use super::shape::QueryShape;
use super::sort::SortSpec;
use super::stages::{
    examined_totals, explain_tree, CollScan, DistinctScan, EofStage, ExecContext, Fetch, IndexScan, LimitStage,
    Member, OrStage, PlanStage, ProjectionStage, SkipStage, SortStage, StageState,
};

/// A cached plan may use this many times the works of its original trial
/// before it is considered stale and the query is re-planned.
const CACHED_PLAN_WORKS_FACTOR: u64 = 10;

// ========== QUERY ==========

/// A parsed `find`-style request.
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub filter: Document,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: u64,
    /// `None` (or 0) means no limit.
    pub limit: Option<u64>,
    pub hint: Option<Value>,
    pub collation: Option<Collation>,
    pub allow_disk_use: bool,
}

impl FindQuery {
    pub fn new(filter: Document) -> Self {
        FindQuery {
            filter,
            ..FindQuery::default()
        }
    }

    /// The collation comparisons use: the query's, else the collection default.
    pub fn effective_collation(&self, entry: Option<&CollectionEntry>) -> Option<Collation> {
        self.collation
            .clone()
            .or_else(|| entry.and_then(|e| e.collation.clone()))
            .filter(|c| !c.is_simple())
    }
}

struct Prepared {
    filter: Document,
    matcher: Matcher,
    sort: Option<SortSpec>,
    projection: Option<(Document, Projection)>,
    collation: Option<Collation>,
    skip: u64,
    limit: Option<u64>,
    allow_disk_use: bool,
}

impl Prepared {
    fn new(query: &FindQuery, entry: Option<&CollectionEntry>) -> Result<Self> {
        let collation = query.effective_collation(entry);
        let matcher = Matcher::new(&query.filter, collation.as_ref())?;
        let sort = match &query.sort {
            Some(spec) if !spec.is_empty() => Some(SortSpec::parse(spec)?),
            _ => None,
        };
        let projection = match &query.projection {
            Some(spec) if !spec.is_empty() => Some((spec.clone(), Projection::parse(spec)?)),
            _ => None,
        };
        Ok(Prepared {
            filter: query.filter.clone(),
            matcher,
            sort,
            projection,
            collation,
            skip: query.skip,
            limit: query.limit.filter(|l| *l > 0),
            allow_disk_use: query.allow_disk_use,
        })
    }
}

// ========== BOUNDS ==========

fn contains_string(value: &Value) -> bool {
    match value {
        Value::String(_) => true,
        Value::Array(items) => items.iter().any(contains_string),
        Value::Document(doc) => doc.iter().any(|(_, v)| contains_string(v)),
        _ => false,
    }
}

/// How predicate values map into an index's key space.
struct KeySpace<'a> {
    collation: Option<&'a Collation>,
    /// The query compares strings under a different collation than the index
    /// stores them with; string bounds are meaningless.
    collation_mismatch: bool,
}

impl KeySpace<'_> {
    fn key(&self, value: &Value) -> Option<Value> {
        if self.collation_mismatch && contains_string(value) {
            return None;
        }
        Some(match self.collation {
            Some(c) => c.comparison_key(value),
            None => value.clone(),
        })
    }

    fn equality(&self, value: &Value) -> Option<OrderedIntervalList> {
        let key = self.key(value)?;
        let mut intervals = vec![Interval::point(key.clone())];
        if let Value::Array(items) = &key {
            // Array equality also matches documents holding the array as an
            // element, keyed under its first element.
            if let Some(first) = items.first() {
                intervals.push(Interval::point(first.clone()));
            }
        }
        Some(OrderedIntervalList::new(intervals))
    }

    fn range(&self, value: &Value, lower: bool, inclusive: bool) -> Option<OrderedIntervalList> {
        let key = self.key(value)?;
        match key {
            Value::Array(_) => None,
            Value::Null if inclusive => Some(OrderedIntervalList::new(vec![Interval::point(Value::Null)])),
            Value::Null => Some(OrderedIntervalList::empty()),
            Value::MinKey | Value::MaxKey => Some(OrderedIntervalList::all()),
            key => {
                let bracket = Interval::type_bracket(&key);
                let interval = if lower {
                    Interval::new(key, inclusive, bracket.high, bracket.high_inclusive)
                } else {
                    Interval::new(bracket.low, bracket.low_inclusive, key, inclusive)
                };
                Some(OrderedIntervalList::new(vec![interval]))
            }
        }
    }

    fn regex(&self, regex: &super::operators::QueryRegex) -> Option<OrderedIntervalList> {
        if self.collation.is_some() || self.collation_mismatch {
            return None;
        }
        let strings = Interval::type_bracket(&Value::String(String::new()));
        let interval = match regex.literal_prefix() {
            Some(prefix) => match successor(&prefix) {
                Some(upper) => Interval::new(Value::String(prefix), true, Value::String(upper), false),
                None => Interval::new(Value::String(prefix), true, strings.high, strings.high_inclusive),
            },
            None => strings,
        };
        Some(OrderedIntervalList::new(vec![interval]))
    }

    /// Interval list covering every key a document matching `predicate` can
    /// have, or `None` when the predicate cannot narrow a scan.
    fn intervals(&self, predicate: &Predicate) -> Option<OrderedIntervalList> {
        match predicate {
            Predicate::Eq(value) => self.equality(value),
            Predicate::Gt(value) => self.range(value, true, false),
            Predicate::Gte(value) => self.range(value, true, true),
            Predicate::Lt(value) => self.range(value, false, false),
            Predicate::Lte(value) => self.range(value, false, true),
            Predicate::In { values, regexes } => {
                let mut list = OrderedIntervalList::empty();
                for value in values {
                    list = list.union(&self.equality(value)?);
                }
                for regex in regexes {
                    list = list.union(&self.regex(regex)?);
                }
                Some(list)
            }
            Predicate::Regex(regex) => self.regex(regex),
            Predicate::All(values) => values.first().and_then(|v| self.equality(v)),
            Predicate::ElemMatchValue(inner) => {
                let mut list: Option<OrderedIntervalList> = None;
                for predicate in inner {
                    if let Some(next) = self.intervals(predicate) {
                        list = Some(match list {
                            Some(current) => current.intersect(&next),
                            None => next,
                        });
                    }
                }
                list
            }
            _ => None,
        }
    }
}

fn key_space<'a>(index: &'a IndexEntry, query_collation: Option<&Collation>) -> KeySpace<'a> {
    let index_collation = index.descriptor.collation.as_ref();
    KeySpace {
        collation: index_collation,
        collation_mismatch: index_collation != query_collation,
    }
}

/// Smallest string greater than every string starting with `prefix`.
fn successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// Predicates that bounds capture exactly, so no residual filter is needed
/// on a non-multikey index.
fn is_exact(predicate: &Predicate) -> bool {
    match predicate {
        Predicate::Eq(value) => !matches!(value, Value::Array(_)),
        Predicate::Gt(_) | Predicate::Gte(_) | Predicate::Lt(_) | Predicate::Lte(_) => true,
        Predicate::In { values, regexes } => regexes.is_empty() && !values.iter().any(|v| matches!(v, Value::Array(_))),
        _ => false,
    }
}

/// Bounds for `index` from `conjuncts`, plus whether the first field was
/// constrained at all. Multikey indexes only constrain their first field
/// and never intersect two predicates on it.
fn bounds_for_index(
    index: &IndexEntry,
    conjuncts: &[&MatchExpr],
    query_collation: Option<&Collation>,
) -> (IndexBounds, bool) {
    let space = key_space(index, query_collation);
    let fields = index.descriptor.pattern.fields();
    let mut bounds = IndexBounds::all(fields.len());
    let mut first_constrained = false;
    for (position, (field, _)) in fields.iter().enumerate() {
        if index.multikey && position > 0 {
            break;
        }
        let mut constrained = false;
        for conjunct in conjuncts {
            let MatchExpr::Field { path, predicate } = conjunct else { continue };
            if path != field {
                continue;
            }
            let Some(list) = space.intervals(predicate) else { continue };
            if constrained && index.multikey {
                continue;
            }
            bounds.fields[position] = if constrained {
                bounds.fields[position].intersect(&list)
            } else {
                list
            };
            constrained = true;
        }
        if position == 0 {
            first_constrained = constrained;
        }
    }
    (bounds, first_constrained)
}

/// Whether scanning `index` within `bounds` yields `sort` order, and in which
/// direction. Leading fields pinned to a single point may be skipped.
fn provides_sort(index: &IndexEntry, bounds: &IndexBounds, sort: &SortSpec, query_collation: Option<&Collation>) -> Option<bool> {
    if index.multikey || index.descriptor.collation.as_ref() != query_collation {
        return None;
    }
    let pattern = &index.descriptor.pattern;
    if let Some(forward) = sort.provided_by(pattern) {
        return Some(forward);
    }
    let pinned = bounds
        .fields
        .iter()
        .take_while(|list| list.intervals().len() == 1 && list.is_points())
        .count();
    let rest = &pattern.fields()[pinned.min(pattern.len())..];
    if rest.len() < sort.fields().len() || sort.fields().is_empty() {
        return None;
    }
    let same = sort.fields().iter().zip(rest).all(|((a, da), (b, db))| a == b && da == db);
    if same {
        return Some(true);
    }
    let reversed = sort
        .fields()
        .iter()
        .zip(rest)
        .all(|((a, da), (b, db))| a == b && da.reverse() == *db);
    reversed.then_some(false)
}

/// Partial indexes answer a query only when the query repeats every clause
/// of the partial filter verbatim.
fn partial_filter_satisfied(index: &IndexEntry, filter: &Document) -> bool {
    match &index.descriptor.partial_filter {
        None => true,
        Some(partial) => partial.iter().all(|(k, v)| filter.get(k) == Some(v)),
    }
}

fn sparse_allows(index: &IndexEntry, bounds: &IndexBounds, constrained: bool) -> bool {
    if !index.descriptor.sparse {
        return true;
    }
    constrained && !bounds.fields.first().map(|l| l.contains(&Value::Null)).unwrap_or(true)
}

// ========== ACCESS PATHS ==========

#[derive(Clone)]
enum AccessPath {
    CollScan {
        forward: bool,
    },
    Index {
        index: Arc<IndexEntry>,
        bounds: IndexBounds,
        forward: bool,
        provides_sort: bool,
    },
    Or {
        branches: Vec<(Arc<IndexEntry>, IndexBounds)>,
    },
}

impl AccessPath {
    fn choice(&self) -> PlanChoice {
        match self {
            AccessPath::CollScan { forward } => PlanChoice::CollScan { forward: *forward },
            AccessPath::Index { index, forward, .. } => PlanChoice::IndexScan {
                index: index.name().to_string(),
                forward: *forward,
            },
            AccessPath::Or { branches } => PlanChoice::Or {
                indexes: branches.iter().map(|(i, _)| i.name().to_string()).collect(),
            },
        }
    }

    fn is_indexed(&self) -> bool {
        !matches!(self, AccessPath::CollScan { .. })
    }

    fn provides_sort(&self) -> bool {
        matches!(self, AccessPath::Index { provides_sort: true, .. })
    }
}

fn index_path(index: &Arc<IndexEntry>, prepared: &Prepared, conjuncts: &[&MatchExpr], hinted: bool) -> Option<AccessPath> {
    if !partial_filter_satisfied(index, &prepared.filter) {
        return None;
    }
    let (bounds, constrained) = bounds_for_index(index, conjuncts, prepared.collation.as_ref());
    let sort = prepared
        .sort
        .as_ref()
        .and_then(|s| provides_sort(index, &bounds, s, prepared.collation.as_ref()));
    if !hinted && !constrained && sort.is_none() {
        return None;
    }
    if !hinted && !sparse_allows(index, &bounds, constrained) {
        return None;
    }
    Some(AccessPath::Index {
        index: index.clone(),
        bounds,
        forward: sort.unwrap_or(true),
        provides_sort: sort.is_some(),
    })
}

/// An OR plan: every branch of a top-level `$or` answered by its own index.
fn or_path(entry: &CollectionEntry, prepared: &Prepared, conjuncts: &[&MatchExpr], read_ts: u64) -> Option<AccessPath> {
    let branches_expr = conjuncts.iter().find_map(|c| match c {
        MatchExpr::Or(children) => Some(children),
        _ => None,
    })?;
    let mut branches = Vec::with_capacity(branches_expr.len());
    for branch in branches_expr {
        let branch_conjuncts = branch.conjuncts();
        let mut best: Option<(usize, Arc<IndexEntry>, IndexBounds)> = None;
        for index in entry.usable_indexes(read_ts) {
            if index.descriptor.partial_filter.is_some() {
                continue;
            }
            let (bounds, constrained) = bounds_for_index(index, &branch_conjuncts, prepared.collation.as_ref());
            if !constrained || !sparse_allows(index, &bounds, constrained) {
                continue;
            }
            let narrowed = bounds.fields.iter().filter(|l| !l.is_all()).count();
            if best.as_ref().map_or(true, |(n, _, _)| narrowed > *n) {
                best = Some((narrowed, index.clone(), bounds));
            }
        }
        let (_, index, bounds) = best?;
        branches.push((index, bounds));
    }
    Some(AccessPath::Or { branches })
}

fn enumerate(entry: &CollectionEntry, prepared: &Prepared, read_ts: u64) -> Vec<AccessPath> {
    let conjuncts = prepared.matcher.expr().conjuncts();
    let mut paths: Vec<AccessPath> = entry
        .usable_indexes(read_ts)
        .filter_map(|index| index_path(index, prepared, &conjuncts, false))
        .collect();
    if let Some(or) = or_path(entry, prepared, &conjuncts, read_ts) {
        paths.push(or);
    }
    paths.push(AccessPath::CollScan { forward: true });
    paths
}

fn resolve_hint(entry: &CollectionEntry, prepared: &Prepared, hint: &Value, read_ts: u64) -> Result<AccessPath> {
    let bad_hint = || QuarryError::BadValue("hint provided does not correspond to an existing index".into());
    if let Some(doc) = hint.as_document() {
        if let Some(direction) = doc.get("$natural") {
            let forward = direction.as_f64().map(|d| d >= 0.0).unwrap_or(true);
            return Ok(AccessPath::CollScan { forward });
        }
    }
    let index = entry
        .usable_indexes(read_ts)
        .find(|index| match hint {
            Value::String(name) => index.name() == name,
            Value::Document(pattern) => index.descriptor.pattern.to_document() == *pattern,
            _ => false,
        })
        .ok_or_else(bad_hint)?;
    let conjuncts = prepared.matcher.expr().conjuncts();
    index_path(index, prepared, &conjuncts, true).ok_or_else(bad_hint)
}

/// Rebuild a cached choice with this query's bounds.
fn rebuild(entry: &CollectionEntry, prepared: &Prepared, choice: &PlanChoice, read_ts: u64) -> Option<AccessPath> {
    let conjuncts = prepared.matcher.expr().conjuncts();
    match choice {
        PlanChoice::CollScan { forward } => Some(AccessPath::CollScan { forward: *forward }),
        PlanChoice::IndexScan { index, .. } => {
            let index = entry.usable_indexes(read_ts).find(|i| i.name() == index)?;
            index_path(index, prepared, &conjuncts, false)
        }
        PlanChoice::Or { .. } => or_path(entry, prepared, &conjuncts, read_ts),
    }
}

// ========== STAGE TREES ==========

fn build_tree(
    shared: &EngineShared,
    entry: &Arc<CollectionEntry>,
    access: &AccessPath,
    prepared: &Prepared,
) -> Box<dyn PlanStage> {
    let filter = Some(prepared.matcher.clone());
    let mut root: Box<dyn PlanStage> = match access {
        AccessPath::CollScan { forward } => Box::new(CollScan::new(entry.clone(), *forward, filter)),
        AccessPath::Index { index, bounds, forward, .. } => {
            let scan = IndexScan::new(&entry.ns, index.clone(), bounds.clone(), *forward);
            Box::new(Fetch::new(Box::new(scan), entry.clone(), filter))
        }
        AccessPath::Or { branches } => {
            let children: Vec<Box<dyn PlanStage>> = branches
                .iter()
                .map(|(index, bounds)| {
                    Box::new(IndexScan::new(&entry.ns, index.clone(), bounds.clone(), true)) as Box<dyn PlanStage>
                })
                .collect();
            Box::new(Fetch::new(Box::new(OrStage::new(children)), entry.clone(), filter))
        }
    };
    if let Some(sort) = &prepared.sort {
        if !access.provides_sort() {
            let top_k = prepared.limit.map(|l| (l + prepared.skip) as usize);
            root = Box::new(SortStage::new(
                root,
                sort.clone(),
                prepared.collation.clone(),
                shared.sorter_options(prepared.allow_disk_use),
                top_k,
            ));
        }
    }
    if prepared.skip > 0 {
        root = Box::new(SkipStage::new(root, prepared.skip));
    }
    if let Some(limit) = prepared.limit {
        root = Box::new(LimitStage::new(root, limit));
    }
    if let Some((spec, projection)) = &prepared.projection {
        root = Box::new(ProjectionStage::new(
            root,
            spec.clone(),
            projection.clone(),
            prepared.collation.clone(),
        ));
    }
    root
}

// ========== MULTI-PLANNER ==========

struct Candidate {
    access: AccessPath,
    root: Box<dyn PlanStage>,
    results: VecDeque<Member>,
    eof: bool,
    failure: Option<QuarryError>,
}

impl Candidate {
    fn new(access: AccessPath, root: Box<dyn PlanStage>) -> Self {
        Candidate {
            access,
            root,
            results: VecDeque::new(),
            eof: false,
            failure: None,
        }
    }

    fn works(&self) -> u64 {
        self.root.stats().works
    }

    fn step(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        match self.root.work(ctx) {
            Ok(StageState::Advanced(member)) => self.results.push_back(member),
            Ok(StageState::NeedTime) => {}
            Ok(StageState::Eof) => self.eof = true,
            Err(err) if err.is_interruption() => return Err(err),
            Err(err) => {
                log_debug!("candidate plan {:?} failed during trial: {}", self.access.choice(), err);
                self.failure = Some(err);
            }
        }
        Ok(())
    }

    fn alive(&self) -> bool {
        !self.eof && self.failure.is_none()
    }

    fn score(&self) -> f64 {
        let works = self.works().max(1) as f64;
        let productivity = self.results.len() as f64 / works;
        let epsilon = (1.0 / (10.0 * works)).min(1e-4);
        let mut score = 1.0 + productivity;
        if self.eof {
            score += 1.0;
        }
        if self.access.is_indexed() {
            score += epsilon;
        }
        if self.access.provides_sort() {
            score += epsilon;
        }
        score
    }
}

/// Round-robin the candidates until one produces `target` results or hits
/// EOF, or every candidate used `max_works`. Returns the winner's position.
fn run_trial(candidates: &mut [Candidate], ctx: &ExecContext<'_>, target: usize, max_works: u64) -> Result<usize> {
    loop {
        let mut decided = false;
        let mut any_alive = false;
        for candidate in candidates.iter_mut() {
            if !candidate.alive() || candidate.works() >= max_works {
                continue;
            }
            any_alive = true;
            candidate.step(ctx)?;
            if candidate.eof || candidate.results.len() >= target {
                decided = true;
            }
        }
        if decided || !any_alive {
            break;
        }
    }
    let mut winner: Option<(usize, f64)> = None;
    for (position, candidate) in candidates.iter().enumerate() {
        if candidate.failure.is_some() {
            continue;
        }
        let score = candidate.score();
        if winner.map_or(true, |(_, best)| score > best) {
            winner = Some((position, score));
        }
    }
    match winner {
        Some((position, _)) => Ok(position),
        None => Err(candidates
            .iter_mut()
            .find_map(|c| c.failure.take())
            .unwrap_or_else(|| QuarryError::BadValue("no query plan could be chosen".into()))),
    }
}

// ========== EXECUTOR ==========

#[derive(Debug, Clone, Default)]
struct PlanSummary {
    parsed_query: Document,
    query_hash: Option<String>,
    plan_cache_key: Option<String>,
    rejected: Vec<Document>,
    from_cache: bool,
    cache_state: Option<&'static str>,
}

/// A chosen plan ready to produce results. Owns everything it needs, so it
/// can be parked in a cursor and resumed by `getMore`.
pub struct PlanExecutor {
    ns: String,
    root: Box<dyn PlanStage>,
    buffered: VecDeque<Member>,
    view: ReadView,
    snapshot: Option<Transaction>,
    summary: PlanSummary,
    returned: u64,
    started: Instant,
    eof: bool,
}

impl PlanExecutor {
    fn new(ns: &str, root: Box<dyn PlanStage>, view: ReadView, summary: PlanSummary) -> Self {
        PlanExecutor {
            ns: ns.to_string(),
            root,
            buffered: VecDeque::new(),
            view,
            snapshot: None,
            summary,
            returned: 0,
            started: Instant::now(),
            eof: false,
        }
    }

    /// An executor over no collection.
    pub fn empty(ns: &str, view: ReadView) -> Self {
        PlanExecutor::new(ns, Box::new(EofStage::new()), view, PlanSummary::default())
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn view(&self) -> ReadView {
        self.view
    }

    /// Keep `txn` (a read-only snapshot) registered for as long as the
    /// executor lives.
    pub fn attach_snapshot(&mut self, txn: Transaction) {
        self.snapshot = Some(txn);
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.buffered.is_empty()
    }

    pub fn next(&mut self, shared: &EngineShared, op: &OperationContext) -> Result<Option<Member>> {
        if let Some(member) = self.buffered.pop_front() {
            self.returned += 1;
            return Ok(Some(member));
        }
        if self.eof {
            return Ok(None);
        }
        let ctx = ExecContext {
            op,
            view: self.view,
            catalog: &shared.catalog,
            metrics: &shared.metrics,
        };
        loop {
            match self.root.work(&ctx)? {
                StageState::Advanced(member) => {
                    self.returned += 1;
                    return Ok(Some(member));
                }
                StageState::NeedTime => continue,
                StageState::Eof => {
                    self.eof = true;
                    return Ok(None);
                }
            }
        }
    }

    pub fn next_document(&mut self, shared: &EngineShared, op: &OperationContext) -> Result<Option<Document>> {
        loop {
            match self.next(shared, op)? {
                Some(member) => {
                    if let Some(doc) = member.into_document() {
                        return Ok(Some(doc));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// Drain into a vector.
    pub fn collect_documents(&mut self, shared: &EngineShared, op: &OperationContext) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next_document(shared, op)? {
            out.push(doc);
        }
        Ok(out)
    }

    pub fn winning_plan(&self) -> Document {
        explain_tree(self.root.as_ref(), false)
    }

    /// `explain` output. With `with_stats`, includes execution statistics
    /// of the work done so far.
    pub fn explain(&self, with_stats: bool) -> Document {
        let mut planner = Document::new();
        planner.insert("namespace", self.ns.as_str());
        planner.insert("parsedQuery", self.summary.parsed_query.clone());
        if let Some(hash) = &self.summary.query_hash {
            planner.insert("queryHash", hash.as_str());
        }
        if let Some(key) = &self.summary.plan_cache_key {
            planner.insert("planCacheKey", key.as_str());
        }
        planner.insert("fromPlanCache", self.summary.from_cache);
        if let Some(state) = self.summary.cache_state {
            planner.insert("planCacheState", state);
        }
        planner.insert("winningPlan", self.winning_plan());
        planner.insert(
            "rejectedPlans",
            Value::Array(self.summary.rejected.iter().cloned().map(Value::Document).collect()),
        );
        let mut out = Document::new();
        out.insert("queryPlanner", planner);
        if with_stats {
            let (keys, docs) = examined_totals(self.root.as_ref());
            let mut stats = Document::new();
            stats.insert("nReturned", self.returned as i64);
            stats.insert("executionTimeMillis", self.started.elapsed().as_millis() as i64);
            stats.insert("totalKeysExamined", keys as i64);
            stats.insert("totalDocsExamined", docs as i64);
            stats.insert("executionStages", explain_tree(self.root.as_ref(), true));
            out.insert("executionStats", stats);
        }
        out
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("ns", &self.ns)
            .field("stage", &self.root.name())
            .field("returned", &self.returned)
            .finish()
    }
}

// ========== PLANNING ENTRY POINTS ==========

/// Plan a find-style query over `entry` at `view`. `entry` is `None` for a
/// collection that does not exist, which yields an empty plan.
pub fn plan_find(
    shared: &EngineShared,
    entry: Option<Arc<CollectionEntry>>,
    query: &FindQuery,
    view: ReadView,
    op: &OperationContext,
) -> Result<PlanExecutor> {
    let prepared = Prepared::new(query, entry.as_deref())?;
    let Some(entry) = entry else {
        let mut executor = PlanExecutor::empty("", view);
        executor.summary.parsed_query = prepared.filter.clone();
        return Ok(executor);
    };
    let mut summary = PlanSummary {
        parsed_query: prepared.filter.clone(),
        ..PlanSummary::default()
    };
    let ctx = ExecContext {
        op,
        view,
        catalog: &shared.catalog,
        metrics: &shared.metrics,
    };

    if let Some(hint) = &query.hint {
        let access = resolve_hint(&entry, &prepared, hint, view.read_ts)?;
        let root = build_tree(shared, &entry, &access, &prepared);
        return Ok(PlanExecutor::new(&entry.ns, root, view, summary));
    }

    let shape = QueryShape::new(
        &entry.ns,
        "find",
        &prepared.filter,
        query.sort.as_ref(),
        query.projection.as_ref(),
        prepared.collation.as_ref(),
    );
    summary.query_hash = Some(shape.hash_hex());
    summary.plan_cache_key = Some(format!("{}:{}", shape.hash_hex(), entry.index_generation));

    let generation = entry.index_generation;
    let target = shared.params.plan_trial_results() as usize;
    let max_works = shared.params.plan_trial_max_works();

    if let CacheLookup::Active(cached) = shared.plan_cache.lookup(&shape, generation) {
        if let Some(access) = rebuild(&entry, &prepared, &cached.choice, view.read_ts) {
            let root = build_tree(shared, &entry, &access, &prepared);
            let mut candidate = Candidate::new(access, root);
            let budget = cached.works.max(1) * CACHED_PLAN_WORKS_FACTOR;
            while candidate.alive() && candidate.results.len() < target && candidate.works() < budget {
                candidate.step(&ctx)?;
            }
            if let Some(err) = candidate.failure.take() {
                return Err(err);
            }
            if candidate.eof || candidate.results.len() >= target {
                log_trace!("using active cached plan {:?} for {}", cached.choice, entry.ns);
                summary.from_cache = true;
                summary.cache_state = Some("active");
                let mut executor = PlanExecutor::new(&entry.ns, candidate.root, view, summary);
                executor.buffered = candidate.results;
                executor.eof = candidate.eof;
                return Ok(executor);
            }
            log_debug!(
                "cached plan {:?} for {} exceeded {} works, replanning",
                cached.choice,
                entry.ns,
                budget
            );
        }
        shared.plan_cache.deactivate(&shape);
    }

    let paths = enumerate(&entry, &prepared, view.read_ts);
    if paths.len() == 1 {
        let root = build_tree(shared, &entry, &paths[0], &prepared);
        return Ok(PlanExecutor::new(&entry.ns, root, view, summary));
    }

    shared.metrics.multi_planner_runs.incr();
    let mut candidates: Vec<Candidate> = paths
        .into_iter()
        .map(|access| {
            let root = build_tree(shared, &entry, &access, &prepared);
            Candidate::new(access, root)
        })
        .collect();
    let winner = run_trial(&mut candidates, &ctx, target, max_works)?;
    let chosen = candidates.swap_remove(winner);
    let state = shared.plan_cache.record_trial(
        &shape,
        chosen.access.choice(),
        chosen.works(),
        generation,
        shared.params.plan_cache_activation_confirmations(),
    );
    log_debug!(
        "multi-planner chose {:?} for {} after {} works ({} candidates)",
        chosen.access.choice(),
        entry.ns,
        chosen.works(),
        candidates.len() + 1
    );
    summary.cache_state = Some(state.as_str());
    summary.rejected = candidates
        .iter()
        .map(|c| explain_tree(c.root.as_ref(), false))
        .collect();
    let mut executor = PlanExecutor::new(&entry.ns, chosen.root, view, summary);
    executor.buffered = chosen.results;
    executor.eof = chosen.eof;
    Ok(executor)
}

// ========== DISTINCT ==========

/// Index usable for a DISTINCT_SCAN over `field`: its first field is
/// `field`, it is not multikey, the filter is answered exactly by its bounds
/// and `sort` (if any) is its own order.
fn distinct_index(
    entry: &CollectionEntry,
    field: &str,
    matcher: &Matcher,
    sort: Option<&SortSpec>,
    collation: Option<&Collation>,
    read_ts: u64,
) -> Option<(Arc<IndexEntry>, IndexBounds, bool)> {
    let conjuncts = matcher.expr().conjuncts();
    let filter_on_field = conjuncts.iter().all(|c| match c {
        MatchExpr::Field { path, predicate } => path == field && is_exact(predicate),
        _ => false,
    });
    if !filter_on_field {
        return None;
    }
    if let Some(sort) = sort {
        if sort.fields().first().map(|(f, _)| f.as_str()) != Some(field) {
            return None;
        }
    }
    for index in entry.usable_indexes(read_ts) {
        let descriptor = &index.descriptor;
        if index.multikey
            || descriptor.pattern.first_field() != field
            || descriptor.partial_filter.is_some()
            || descriptor.sparse
            || descriptor.collation.as_ref() != collation
        {
            continue;
        }
        let (bounds, _) = bounds_for_index(index, &conjuncts, collation);
        let forward = match sort {
            Some(sort) => match sort.provided_by(&descriptor.pattern) {
                Some(forward) => forward,
                None => continue,
            },
            None => true,
        };
        return Some((index.clone(), bounds, forward));
    }
    None
}

/// Plan `$group: {_id: "$field", ...$first}` style queries: one document per
/// distinct `field` value, the first in index order. `None` when no index
/// qualifies.
pub fn plan_distinct_documents(
    entry: &Arc<CollectionEntry>,
    field: &str,
    query: &FindQuery,
    view: ReadView,
) -> Result<Option<PlanExecutor>> {
    let prepared = Prepared::new(query, Some(entry))?;
    let Some((index, bounds, forward)) = distinct_index(
        entry,
        field,
        &prepared.matcher,
        prepared.sort.as_ref(),
        prepared.collation.as_ref(),
        view.read_ts,
    ) else {
        return Ok(None);
    };
    let scan = DistinctScan::new(&entry.ns, index, bounds, forward);
    let root = Box::new(Fetch::new(Box::new(scan), entry.clone(), None));
    let summary = PlanSummary {
        parsed_query: prepared.filter.clone(),
        ..PlanSummary::default()
    };
    Ok(Some(PlanExecutor::new(&entry.ns, root, view, summary)))
}

/// Values `field` takes in `doc`, arrays unwound one level.
pub fn distinct_values_of(doc: &Document, field: &str) -> Vec<Value> {
    candidates(doc, field)
        .into_iter()
        .filter_map(|c| match c.value {
            Some(Value::Array(_)) if !c.element => None,
            Some(value) => Some(value.clone()),
            None => None,
        })
        .collect()
}

/// The `distinct` command: sorted distinct values of `field` among documents
/// matching the query, plus the winning plan for explain.
pub fn distinct(
    shared: &EngineShared,
    entry: Option<Arc<CollectionEntry>>,
    field: &str,
    query: &FindQuery,
    view: ReadView,
    op: &OperationContext,
) -> Result<(Vec<Value>, Document)> {
    let Some(entry) = entry else {
        return Ok((Vec::new(), PlanExecutor::empty("", view).winning_plan()));
    };
    let prepared = Prepared::new(query, Some(&entry))?;
    let collation = prepared.collation.clone();
    let mut seen: BTreeMap<Value, Value> = BTreeMap::new();
    let mut add = |value: Value| {
        let key = match &collation {
            Some(c) => c.comparison_key(&value),
            None => value.clone(),
        };
        seen.entry(key).or_insert(value);
    };

    let index_plan = distinct_index(&entry, field, &prepared.matcher, None, collation.as_ref(), view.read_ts);
    let plan = match index_plan {
        Some((index, bounds, forward)) => {
            let ctx = ExecContext {
                op,
                view,
                catalog: &shared.catalog,
                metrics: &shared.metrics,
            };
            let mut scan = DistinctScan::new(&entry.ns, index.clone(), bounds, forward);
            loop {
                match scan.work(&ctx)? {
                    StageState::Advanced(member) => {
                        let Some(rid) = member.rid else { continue };
                        // Keys hold comparison keys; read the stored value.
                        // A null key also stands for documents missing the
                        // field, which distinct does not report.
                        let Some(doc) = entry.records.find(rid, &view) else { continue };
                        let values = distinct_values_of(&doc, field);
                        if values.is_empty() {
                            if has_explicit_null(&entry, &index, field, &ctx)? {
                                add(Value::Null);
                            }
                            continue;
                        }
                        for value in values {
                            add(value);
                        }
                    }
                    StageState::NeedTime => {}
                    StageState::Eof => break,
                }
            }
            explain_tree(&scan, false)
        }
        None => {
            let find = FindQuery {
                projection: None,
                sort: None,
                skip: 0,
                limit: None,
                ..query.clone()
            };
            let mut executor = plan_find(shared, Some(entry.clone()), &find, view, op)?;
            while let Some(doc) = executor.next_document(shared, op)? {
                for value in distinct_values_of(&doc, field) {
                    add(value);
                }
            }
            executor.winning_plan()
        }
    };
    Ok((seen.into_values().collect(), plan))
}

/// Whether any document keyed under null in `index` holds an explicit null.
fn has_explicit_null(
    entry: &Arc<CollectionEntry>,
    index: &Arc<IndexEntry>,
    field: &str,
    ctx: &ExecContext<'_>,
) -> Result<bool> {
    let mut bounds = IndexBounds::all(index.descriptor.pattern.len());
    bounds.fields[0] = OrderedIntervalList::new(vec![Interval::point(Value::Null)]);
    let mut scan = Fetch::new(
        Box::new(IndexScan::new(&entry.ns, index.clone(), bounds, true)),
        entry.clone(),
        None,
    );
    loop {
        match scan.work(ctx)? {
            StageState::Advanced(member) => {
                let explicit = member
                    .document()
                    .map(|doc| candidates(doc, field).iter().any(|c| matches!(c.value, Some(Value::Null))))
                    .unwrap_or(false);
                if explicit {
                    return Ok(true);
                }
            }
            StageState::NeedTime => {}
            StageState::Eof => return Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{with_write_retry, CollectionWriter};
    use crate::doc;
    use crate::engine::Engine;

    fn seed(shared: &EngineShared, docs: Vec<Document>) {
        let op = OperationContext::new();
        crate::ddl::ensure_collection(shared, "test.c", &op).unwrap();
        with_write_retry(shared, &op, |txn| {
            let writer = CollectionWriter::open(shared, txn, &op, "test.c")?;
            for doc in &docs {
                writer.insert(doc.clone())?;
            }
            Ok(())
        })
        .unwrap();
    }

    fn index(shared: &EngineShared, spec: Document) {
        crate::ddl::create_indexes(shared, "test.c", &[spec], &OperationContext::new()).unwrap();
    }

    fn run(shared: &EngineShared, query: FindQuery) -> (Vec<Document>, Document) {
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let entry = shared.catalog.get("test.c");
        let mut executor = plan_find(shared, entry, &query, txn.view(), &op).unwrap();
        let docs = executor.collect_documents(shared, &op).unwrap();
        (docs, executor.explain(true))
    }

    fn stage_of(explain: &Document) -> String {
        let mut plan = explain
            .get("queryPlanner")
            .and_then(Value::as_document)
            .and_then(|p| p.get("winningPlan"))
            .and_then(Value::as_document)
            .cloned()
            .unwrap();
        let mut names = Vec::new();
        loop {
            names.push(plan.get("stage").and_then(Value::as_str).unwrap().to_string());
            match plan.get("inputStage").and_then(Value::as_document) {
                Some(next) => plan = next.clone(),
                None => break,
            }
        }
        names.join(">")
    }

    fn numbered(n: i32) -> Vec<Document> {
        (0..n).map(|i| doc!({"_id": i, "a": i % 10, "b": i})).collect()
    }

    #[test]
    fn test_index_plan_beats_collscan() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, numbered(500));
        index(shared, doc!({"key": {"a": 1}, "name": "a_1"}));
        let (docs, explain) = run(shared, FindQuery::new(doc!({"a": 3})));
        assert_eq!(docs.len(), 50);
        assert_eq!(stage_of(&explain), "FETCH>IXSCAN");
        let rejected = explain
            .get("queryPlanner")
            .and_then(Value::as_document)
            .and_then(|p| p.get("rejectedPlans"))
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn test_range_and_in_bounds() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, numbered(100));
        index(shared, doc!({"key": {"b": 1}}));
        let (docs, _) = run(shared, FindQuery::new(doc!({"b": {"$gte": 10, "$lt": 13}})));
        assert_eq!(docs.len(), 3);
        let (docs, _) = run(shared, FindQuery::new(doc!({"b": {"$in": [1, 50, 99, 1000]}})));
        assert_eq!(docs.len(), 3);
        let (docs, _) = run(shared, FindQuery::new(doc!({"b": {"$gt": "x"}})));
        assert!(docs.is_empty());
    }

    #[test]
    fn test_sort_provided_by_index_avoids_blocking_sort() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, numbered(50));
        index(shared, doc!({"key": {"b": -1}}));
        let query = FindQuery {
            sort: Some(doc!({"b": 1})),
            limit: Some(3),
            ..FindQuery::default()
        };
        let (docs, explain) = run(shared, query);
        let ids: Vec<i64> = docs.iter().map(|d| d.id().and_then(Value::as_i64).unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(stage_of(&explain), "LIMIT>FETCH>IXSCAN");
    }

    #[test]
    fn test_plan_cache_activation_and_eviction() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, numbered(300));
        index(shared, doc!({"key": {"a": 1}}));
        index(shared, doc!({"key": {"b": 1}}));
        let query = |a: i32| FindQuery::new(doc!({"a": a, "b": {"$gte": 0}}));
        for i in 0..3 {
            run(shared, query(i));
        }
        assert_eq!(shared.metrics.plan_cache_activations.get(), 1);
        let (docs, explain) = run(shared, query(4));
        assert_eq!(docs.len(), 30);
        let planner = explain.get("queryPlanner").and_then(Value::as_document).unwrap();
        assert_eq!(planner.get("fromPlanCache"), Some(&Value::Bool(true)));

        crate::ddl::drop_indexes(shared, "test.c", &Value::from("a_1"), &OperationContext::new()).unwrap();
        assert!(shared.plan_cache.is_empty());
        let (docs, _) = run(shared, query(4));
        assert_eq!(docs.len(), 30);
    }

    #[test]
    fn test_hint_and_natural() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, numbered(20));
        index(shared, doc!({"key": {"a": 1}}));
        let hinted = FindQuery {
            hint: Some(Value::from("a_1")),
            ..FindQuery::new(doc!({"b": 5}))
        };
        let (docs, explain) = run(shared, hinted);
        assert_eq!(docs.len(), 1);
        assert_eq!(stage_of(&explain), "FETCH>IXSCAN");
        let natural = FindQuery {
            hint: Some(Value::Document(doc!({"$natural": -1}))),
            limit: Some(1),
            ..FindQuery::default()
        };
        let (docs, _) = run(shared, natural);
        assert_eq!(docs[0].id(), Some(&Value::Int32(19)));

        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let bad = FindQuery {
            hint: Some(Value::from("nope")),
            ..FindQuery::default()
        };
        let err = plan_find(shared, shared.catalog.get("test.c"), &bad, txn.view(), &op).unwrap_err();
        assert!(matches!(err, QuarryError::BadValue(_)));
    }

    #[test]
    fn test_multikey_bounds_not_intersected() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, vec![doc!({"_id": 1, "a": [3, 12]}), doc!({"_id": 2, "a": [7]})]);
        index(shared, doc!({"key": {"a": 1}}));
        let (docs, _) = run(shared, FindQuery::new(doc!({"a": {"$gt": 5, "$lt": 10}})));
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_or_plan_dedups() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        seed(shared, numbered(200));
        index(shared, doc!({"key": {"a": 1}}));
        index(shared, doc!({"key": {"b": 1}}));
        let (docs, _) = run(shared, FindQuery::new(doc!({"$or": [{"a": 1}, {"b": {"$lt": 20}}]})));
        // a == 1: 20 docs; b < 20: 20 docs; overlap {1, 11}.
        assert_eq!(docs.len(), 38);
    }

    #[test]
    fn test_distinct_uses_distinct_scan() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let mut docs = numbered(100);
        docs.push(doc!({"_id": 1000}));
        seed(shared, docs);
        index(shared, doc!({"key": {"a": 1}}));
        let op = OperationContext::new();
        let txn = shared.coordinator.begin(false);
        let (values, plan) = distinct(shared, shared.catalog.get("test.c"), "a", &FindQuery::default(), txn.view(), &op).unwrap();
        assert_eq!(values.len(), 10);
        assert_eq!(plan.get("stage"), Some(&Value::from("DISTINCT_SCAN")));

        seed(shared, vec![doc!({"_id": 2000, "a": null})]);
        let txn = shared.coordinator.begin(false);
        let (values, _) = distinct(shared, shared.catalog.get("test.c"), "a", &FindQuery::default(), txn.view(), &op).unwrap();
        assert_eq!(values.len(), 11);
        assert_eq!(values[0], Value::Null);
    }

    #[test]
    fn test_successor() {
        assert_eq!(successor("ab").as_deref(), Some("ac"));
        assert_eq!(successor(""), None);
    }
}
