// quarry-core/src/metrics.rs
// serverStatus-style counters

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::{json, Value as JsonValue};

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct CommandCounter {
    total: Counter,
    failed: Counter,
}

/// Read-only observability counters, exported through `serverStatus`.
#[derive(Default)]
pub struct Metrics {
    pub op_insert: Counter,
    pub op_query: Counter,
    pub op_update: Counter,
    pub op_delete: Counter,
    pub op_getmore: Counter,
    pub op_command: Counter,

    pub documents_inserted: Counter,
    pub documents_updated: Counter,
    pub documents_deleted: Counter,
    pub documents_returned: Counter,
    pub keys_examined: Counter,
    pub docs_examined: Counter,

    pub plan_cache_hits: Counter,
    pub plan_cache_misses: Counter,
    pub plan_cache_activations: Counter,
    pub plan_cache_evictions: Counter,
    pub multi_planner_runs: Counter,

    pub write_conflicts: Counter,
    pub write_conflict_retries: Counter,
    pub prepare_conflict_waits: Counter,
    pub transactions_committed: Counter,
    pub transactions_aborted: Counter,
    pub transactions_prepared: Counter,

    pub spills: Counter,
    pub spilled_bytes: Counter,
    pub spilled_records: Counter,

    pub index_builds_started: Counter,
    pub index_builds_committed: Counter,
    pub index_builds_aborted: Counter,

    pub oplog_entries: Counter,
    pub gc_passes: Counter,
    pub gc_versions_reclaimed: Counter,
    pub interrupted_operations: Counter,
    pub cursors_opened: Counter,
    pub cursors_timed_out: Counter,

    commands: DashMap<String, CommandCounter>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_command(&self, name: &str, ok: bool) {
        self.op_command.incr();
        let entry = self.commands.entry(name.to_string()).or_default();
        entry.total.incr();
        if !ok {
            entry.failed.incr();
        }
    }

    pub fn command_total(&self, name: &str) -> u64 {
        self.commands.get(name).map(|c| c.total.get()).unwrap_or(0)
    }

    pub fn record_spill(&self, bytes: u64, records: u64) {
        self.spills.incr();
        self.spilled_bytes.add(bytes);
        self.spilled_records.add(records);
    }

    /// Snapshot of every counter. `open_cursors` is passed in by the engine.
    pub fn snapshot(&self, open_cursors: usize) -> JsonValue {
        let mut commands = serde_json::Map::new();
        for entry in self.commands.iter() {
            commands.insert(
                entry.key().clone(),
                json!({"total": entry.total.get(), "failed": entry.failed.get()}),
            );
        }
        json!({
            "opcounters": {
                "insert": self.op_insert.get(),
                "query": self.op_query.get(),
                "update": self.op_update.get(),
                "delete": self.op_delete.get(),
                "getmore": self.op_getmore.get(),
                "command": self.op_command.get(),
            },
            "metrics": {
                "commands": commands,
                "document": {
                    "inserted": self.documents_inserted.get(),
                    "updated": self.documents_updated.get(),
                    "deleted": self.documents_deleted.get(),
                    "returned": self.documents_returned.get(),
                },
                "queryExecutor": {
                    "scanned": self.keys_examined.get(),
                    "scannedObjects": self.docs_examined.get(),
                },
                "query": {
                    "planCache": {
                        "hits": self.plan_cache_hits.get(),
                        "misses": self.plan_cache_misses.get(),
                        "activations": self.plan_cache_activations.get(),
                        "evictions": self.plan_cache_evictions.get(),
                    },
                    "multiPlanner": {"runs": self.multi_planner_runs.get()},
                    "spill": {
                        "count": self.spills.get(),
                        "bytes": self.spilled_bytes.get(),
                        "records": self.spilled_records.get(),
                    },
                },
                "operation": {
                    "writeConflicts": self.write_conflicts.get(),
                    "writeConflictRetries": self.write_conflict_retries.get(),
                    "prepareConflictWaits": self.prepare_conflict_waits.get(),
                    "interrupted": self.interrupted_operations.get(),
                },
                "cursor": {
                    "open": open_cursors,
                    "opened": self.cursors_opened.get(),
                    "timedOut": self.cursors_timed_out.get(),
                },
            },
            "transactions": {
                "totalCommitted": self.transactions_committed.get(),
                "totalAborted": self.transactions_aborted.get(),
                "totalPrepared": self.transactions_prepared.get(),
            },
            "indexBuilds": {
                "started": self.index_builds_started.get(),
                "committed": self.index_builds_committed.get(),
                "aborted": self.index_builds_aborted.get(),
            },
            "oplog": {"entries": self.oplog_entries.get()},
            "storageEngine": {
                "gcPasses": self.gc_passes.get(),
                "versionsReclaimed": self.gc_versions_reclaimed.get(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_in_snapshot() {
        let metrics = Metrics::new();
        metrics.plan_cache_hits.incr();
        metrics.record_spill(100, 3);
        metrics.record_command("find", true);
        metrics.record_command("find", false);

        let status = metrics.snapshot(2);
        assert_eq!(status["metrics"]["query"]["planCache"]["hits"], 1);
        assert_eq!(status["metrics"]["query"]["spill"]["bytes"], 100);
        assert_eq!(status["metrics"]["commands"]["find"]["failed"], 1);
        assert_eq!(status["metrics"]["cursor"]["open"], 2);
        assert_eq!(metrics.command_total("find"), 2);
    }
}
