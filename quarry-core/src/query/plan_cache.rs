// quarry-core/src/query/plan_cache.rs
//! Plan cache keyed by query shape.
//!
//! Entries start `Inactive` after a multi-planner run. Each later run of the
//! same shape re-plans and, when the same plan wins again, confirms the
//! entry; after enough confirmations it becomes `Active` and later runs use
//! it without a trial. Entries remember the index-set generation they were
//! planned under and are ignored once it changes.
//!
//! A reverse index (namespace -> shapes) lets DDL evict exactly the entries
//! of one collection. Every mutation happens under the cache write lock, so
//! readers see either the state before or after it.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;

use crate::document::Document;
use crate::metrics::Metrics;
use crate::value::Value;

use super::shape::QueryShape;

/// Access path a cached entry replays. Bounds are recomputed from each
/// query's literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanChoice {
    CollScan { forward: bool },
    IndexScan { index: String, forward: bool },
    Or { indexes: Vec<String> },
}

impl PlanChoice {
    pub fn describe(&self) -> Document {
        let mut doc = Document::new();
        match self {
            PlanChoice::CollScan { forward } => {
                doc.insert("stage", "COLLSCAN");
                doc.insert("direction", if *forward { "forward" } else { "backward" });
            }
            PlanChoice::IndexScan { index, forward } => {
                doc.insert("stage", "IXSCAN");
                doc.insert("indexName", index.as_str());
                doc.insert("direction", if *forward { "forward" } else { "backward" });
            }
            PlanChoice::Or { indexes } => {
                doc.insert("stage", "OR");
                doc.insert(
                    "indexes",
                    Value::Array(indexes.iter().map(|i| Value::from(i.as_str())).collect()),
                );
            }
        }
        doc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Inactive,
    Active,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Inactive => "inactive",
            CacheState::Active => "active",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanCacheEntry {
    pub choice: PlanChoice,
    pub state: CacheState,
    pub confirmations: u64,
    /// Works the winning plan needed during its trial.
    pub works: u64,
    pub generation: u64,
}

/// What a lookup found.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Miss,
    /// Re-plan, then report the winner through [`PlanCache::record_trial`].
    Inactive(PlanCacheEntry),
    Active(PlanCacheEntry),
}

pub struct PlanCache {
    cache: RwLock<LruCache<QueryShape, PlanCacheEntry>>,
    by_namespace: RwLock<HashMap<String, HashSet<QueryShape>>>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl PlanCache {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let capacity = capacity.max(1);
        PlanCache {
            cache: RwLock::new(LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))),
            by_namespace: RwLock::new(HashMap::new()),
            capacity,
            metrics,
        }
    }

    /// Look up `shape`. Entries planned under another index generation are
    /// dropped and reported as a miss.
    pub fn lookup(&self, shape: &QueryShape, generation: u64) -> CacheLookup {
        let mut cache = self.cache.write();
        let found = cache.get(shape).cloned();
        match found {
            Some(entry) if entry.generation == generation => match entry.state {
                CacheState::Active => {
                    self.metrics.plan_cache_hits.incr();
                    CacheLookup::Active(entry)
                }
                CacheState::Inactive => {
                    self.metrics.plan_cache_misses.incr();
                    CacheLookup::Inactive(entry)
                }
            },
            Some(_) => {
                cache.pop(shape);
                drop(cache);
                self.forget(shape);
                self.metrics.plan_cache_evictions.incr();
                self.metrics.plan_cache_misses.incr();
                CacheLookup::Miss
            }
            None => {
                self.metrics.plan_cache_misses.incr();
                CacheLookup::Miss
            }
        }
    }

    /// Record the winner of a multi-planner run for `shape`. The same winner
    /// as the cached entry counts as a confirmation; a different winner
    /// replaces the entry. Returns the resulting state.
    pub fn record_trial(
        &self,
        shape: &QueryShape,
        choice: PlanChoice,
        works: u64,
        generation: u64,
        activation_confirmations: u64,
    ) -> CacheState {
        let mut cache = self.cache.write();
        let next = match cache.get(shape) {
            Some(existing) if existing.choice == choice && existing.generation == generation => {
                let mut entry = existing.clone();
                entry.confirmations += 1;
                entry.works = entry.works.max(works);
                if entry.state == CacheState::Inactive && entry.confirmations >= activation_confirmations {
                    entry.state = CacheState::Active;
                    self.metrics.plan_cache_activations.incr();
                }
                entry
            }
            _ => PlanCacheEntry {
                choice,
                state: CacheState::Inactive,
                confirmations: 0,
                works,
                generation,
            },
        };
        let state = next.state;
        let evicted = if cache.len() >= self.capacity && !cache.contains(shape) {
            cache.pop_lru().map(|(shape, _)| shape)
        } else {
            None
        };
        cache.put(shape.clone(), next);
        drop(cache);

        let mut by_namespace = self.by_namespace.write();
        if let Some(evicted) = evicted {
            if let Some(shapes) = by_namespace.get_mut(&evicted.ns) {
                shapes.remove(&evicted);
            }
            self.metrics.plan_cache_evictions.incr();
        }
        by_namespace.entry(shape.ns.clone()).or_default().insert(shape.clone());
        state
    }

    /// Demote or drop an active entry whose plan turned out much worse than
    /// its trial.
    pub fn deactivate(&self, shape: &QueryShape) {
        if let Some(entry) = self.cache.write().get_mut(shape) {
            entry.state = CacheState::Inactive;
            entry.confirmations = 0;
        }
    }

    fn forget(&self, shape: &QueryShape) {
        if let Some(shapes) = self.by_namespace.write().get_mut(&shape.ns) {
            shapes.remove(shape);
        }
    }

    /// Evict every entry of `ns`. Returns how many were removed.
    pub fn evict_namespace(&self, ns: &str) -> usize {
        let shapes = self.by_namespace.write().remove(ns);
        let Some(shapes) = shapes else {
            return 0;
        };
        let mut cache = self.cache.write();
        let mut removed = 0;
        for shape in shapes {
            if cache.pop(&shape).is_some() {
                removed += 1;
            }
        }
        self.metrics.plan_cache_evictions.add(removed as u64);
        removed
    }

    pub fn entry(&self, shape: &QueryShape) -> Option<PlanCacheEntry> {
        self.cache.read().peek(shape).cloned()
    }

    /// Entries of `ns`, for `planCacheListShapes`-style inspection.
    pub fn entries_for(&self, ns: &str) -> Vec<(QueryShape, PlanCacheEntry)> {
        let shapes: Vec<QueryShape> = self
            .by_namespace
            .read()
            .get(ns)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        let cache = self.cache.read();
        shapes
            .into_iter()
            .filter_map(|shape| cache.peek(&shape).cloned().map(|entry| (shape, entry)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}
