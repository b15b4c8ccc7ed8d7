// quarry-core/src/engine.rs
//! Engine handle and the state every operation shares.
//!
//! ```text
//! Engine
//!   └── Arc<EngineShared>
//!         ├── Catalog                  collections and their indexes
//!         ├── TransactionCoordinator   clock, commits, prepared txns
//!         │     └── Oplog (+ Journal)  change records, durability
//!         ├── PlanCache                shape -> winning access path
//!         ├── CursorManager            parked find/aggregate results
//!         ├── SessionCatalog           multi-document transactions by lsid
//!         ├── OperationRegistry        killOp / interruptAll
//!         ├── ServerParameters         runtime knobs
//!         └── Metrics                  serverStatus counters
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use crate::catalog::Catalog;
use crate::command::{self, SessionCatalog};
use crate::config::{EngineConfig, ServerParameters};
use crate::cursor::CursorManager;
use crate::document::Document;
use crate::error::{ErrorCode, QuarryError, Result};
use crate::interrupt::{OperationContext, OperationRegistry};
use crate::logging;
use crate::metrics::Metrics;
use crate::oplog::Oplog;
use crate::query::PlanCache;
use crate::recovery::{self, CheckpointStats, RecoveryStats};
use crate::storage::{Journal, SorterOptions};
use crate::txn::TransactionCoordinator;
use crate::{log_info, log_warn};

pub const JOURNAL_FILE: &str = "journal.bin";
pub const CHECKPOINT_FILE: &str = "checkpoint.bin";

pub struct EngineShared {
    pub config: EngineConfig,
    pub catalog: Catalog,
    pub coordinator: Arc<TransactionCoordinator>,
    pub params: ServerParameters,
    pub metrics: Arc<Metrics>,
    pub plan_cache: PlanCache,
    pub cursors: CursorManager,
    pub sessions: SessionCatalog,
    pub operations: OperationRegistry,
    /// Catalog changes hold it shared; a checkpoint takes it exclusively
    /// while it fixes its timestamp and catalog image.
    pub(crate) ddl_lock: RwLock<()>,
    next_build_id: AtomicU64,
}

impl EngineShared {
    fn new(config: EngineConfig, params: ServerParameters, oplog: Oplog, metrics: Arc<Metrics>) -> Self {
        let coordinator = Arc::new(TransactionCoordinator::new(Arc::new(oplog), metrics.clone()));
        EngineShared {
            catalog: Catalog::new(),
            coordinator,
            params,
            plan_cache: PlanCache::new(config.plan_cache_capacity, metrics.clone()),
            cursors: CursorManager::new(metrics.clone()),
            sessions: SessionCatalog::new(),
            operations: OperationRegistry::new(),
            metrics,
            config,
            ddl_lock: RwLock::new(()),
            next_build_id: AtomicU64::new(1),
        }
    }

    /// How long a writer waits for a collection gate before reporting a
    /// write conflict.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.params.lock_timeout_millis())
    }

    pub fn prepared_wait_slice(&self) -> Duration {
        Duration::from_millis(self.params.prepared_wait_slice_millis())
    }

    pub fn next_build_id(&self) -> u64 {
        self.next_build_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.config.spill_dir()
    }

    /// Sorter settings for a blocking stage under the current memory limit.
    pub fn sorter_options(&self, allow_disk_use: bool) -> SorterOptions {
        SorterOptions::new(self.params.max_blocking_memory_bytes(), allow_disk_use, self.spill_dir())
            .with_metrics(self.metrics.clone())
    }

    /// A registered operation context, killable through `killOp`.
    pub fn register_operation(&self) -> OperationContext {
        self.operations
            .register(self.params.interrupt_check_interval().min(u32::MAX as u64) as u32)
    }

    /// Reclaim versions below the GC floor in every collection and index.
    pub fn collect_garbage(&self) -> usize {
        let floor = self.coordinator.claim_gc_floor();
        let epoch = self.catalog.snapshot();
        let mut reclaimed = 0;
        for entry in epoch.collections() {
            reclaimed += entry.records.gc(floor);
            for index in &entry.indexes {
                reclaimed += index.tree.gc(floor);
            }
        }
        self.metrics.gc_passes.incr();
        self.metrics.gc_versions_reclaimed.add(reclaimed as u64);
        reclaimed
    }

    pub fn server_status(&self) -> JsonValue {
        let mut status = self.metrics.snapshot(self.cursors.len());
        status["transactions"]["currentOpen"] = self.coordinator.open_transactions().into();
        status["transactions"]["currentPrepared"] = self.coordinator.prepared_ids().len().into();
        status["planCache"] = serde_json::json!({"entries": self.plan_cache.len()});
        status["oplog"]["retained"] = self.coordinator.oplog().len().into();
        status
    }
}

pub struct Engine {
    shared: Arc<EngineShared>,
    recovery: RecoveryStats,
}

impl Engine {
    /// A non-durable engine with default configuration.
    pub fn in_memory() -> Engine {
        let config = EngineConfig::in_memory();
        let metrics = Arc::new(Metrics::new());
        let oplog = Oplog::in_memory(config.oplog_max_entries, metrics.clone());
        Engine {
            shared: Arc::new(EngineShared::new(config, ServerParameters::default(), oplog, metrics)),
            recovery: RecoveryStats::default(),
        }
    }

    /// Open an engine. With a data directory, the latest checkpoint and the
    /// journal are replayed before the engine is returned.
    pub fn open(config: EngineConfig) -> Result<Engine> {
        match &config.log_level {
            Some(spec) => logging::apply_spec(spec),
            None => logging::init_from_env(),
        }
        let params = ServerParameters::from_config(&config)?;
        let metrics = Arc::new(Metrics::new());
        let Some(dir) = config.data_dir.clone() else {
            let oplog = Oplog::in_memory(config.oplog_max_entries, metrics.clone());
            return Ok(Engine {
                shared: Arc::new(EngineShared::new(config, params, oplog, metrics)),
                recovery: RecoveryStats::default(),
            });
        };
        std::fs::create_dir_all(&dir)?;
        let journal = Journal::open(dir.join(JOURNAL_FILE), config.sync_mode)?;
        let oplog = Oplog::with_journal(journal, config.oplog_max_entries, metrics.clone());
        let shared = Arc::new(EngineShared::new(config, params, oplog, metrics));
        let stats = recovery::recover(&shared, &dir.join(CHECKPOINT_FILE))?;
        log_info!(
            "opened {} ({} collections, {} journal records replayed, {} prepared transactions restored)",
            dir.display(),
            stats.collections_loaded,
            stats.records_replayed,
            stats.prepared_restored
        );
        Ok(Engine {
            shared,
            recovery: stats,
        })
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// What the last open recovered.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    /// Run one command document, returning the success reply.
    pub fn run_command(&self, command: &Document) -> Result<Document> {
        command::run_command(&self.shared, command)
    }

    /// Run one JSON command and render the reply, errors included.
    pub fn execute(&self, command: &JsonValue) -> JsonValue {
        command::execute(&self.shared, command)
    }

    /// Write a checkpoint of every collection and compact the journal.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let dir = self.shared.config.data_dir.clone().ok_or_else(|| {
            QuarryError::new(ErrorCode::IllegalOperation, "checkpoint requires a data directory")
        })?;
        recovery::checkpoint(&self.shared, &dir.join(CHECKPOINT_FILE))
    }

    pub fn collect_garbage(&self) -> usize {
        self.shared.collect_garbage()
    }

    /// Interrupt every running operation.
    pub fn interrupt_all(&self, repl_state_change: bool) -> usize {
        let killed = self.shared.operations.kill_all(repl_state_change);
        log_warn!("interrupting {} running operations", killed);
        killed
    }

    pub fn server_status(&self) -> JsonValue {
        self.shared.server_status()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.shared.coordinator.oplog().flush() {
            log_warn!("journal flush on close failed: {}", err);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.shared.config.data_dir)
            .field("collections", &self.shared.catalog.snapshot().collections().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{with_write_retry, CollectionWriter};
    use crate::doc;

    #[test]
    fn test_open_in_memory_config() {
        let engine = Engine::open(EngineConfig::in_memory()).unwrap();
        assert!(engine.shared().catalog.snapshot().collections().next().is_none());
        assert_eq!(engine.checkpoint().unwrap_err().code(), ErrorCode::IllegalOperation);
    }

    #[test]
    fn test_config_parameters_applied() {
        let mut config = EngineConfig::in_memory();
        config.parameters.insert("writeConflictRetryLimit".into(), serde_json::json!(7));
        let engine = Engine::open(config).unwrap();
        assert_eq!(engine.shared().params.write_conflict_retry_limit(), 7);

        let mut config = EngineConfig::in_memory();
        config.parameters.insert("noSuchKnob".into(), serde_json::json!(1));
        assert_eq!(Engine::open(config).unwrap_err().code(), ErrorCode::InvalidOptions);
    }

    #[test]
    fn test_gc_reclaims_old_versions() {
        let engine = Engine::in_memory();
        let shared = engine.shared();
        let op = OperationContext::new();
        crate::ddl::ensure_collection(shared, "test.c", &op).unwrap();
        with_write_retry(shared, &op, |txn| CollectionWriter::open(shared, txn, &op, "test.c")?.insert(doc!({"_id": 1, "v": 0})))
            .unwrap();
        for v in 1..4 {
            with_write_retry(shared, &op, |txn| {
                let writer = CollectionWriter::open(shared, txn, &op, "test.c")?;
                let (rid, old) = writer.find_by_id(&crate::value::Value::Int32(1))?.unwrap();
                writer.update(rid, &old, doc!({"_id": 1, "v": v}))?;
                Ok(())
            })
            .unwrap();
        }
        assert!(engine.collect_garbage() > 0);
        assert_eq!(shared.metrics.gc_passes.get(), 1);
        let entry = shared.catalog.get("test.c").unwrap();
        assert_eq!(entry.records.version_count(), 1);
    }

    #[test]
    fn test_server_status_shape() {
        let engine = Engine::in_memory();
        let status = engine.server_status();
        assert_eq!(status["metrics"]["cursor"]["open"], 0);
        assert_eq!(status["transactions"]["currentPrepared"], 0);
    }
}
