// quarry-core/src/lib.rs
// Embeddable transactional document engine

pub mod catalog;
pub mod collation;
pub mod collection;
pub mod command;
pub mod config;
pub mod cursor;
pub mod ddl;
pub mod document;
pub mod engine;
pub mod error;
pub mod index;
pub mod interrupt;
pub mod logging;
pub mod metrics;
pub mod mvcc;
pub mod oplog;
pub mod pipeline;
pub mod query;
pub mod recovery;
pub mod storage;
pub mod txn;
pub mod value;

// Public exports
pub use catalog::{Catalog, CollectionEntry, IndexEntry, IndexState};
pub use collation::Collation;
pub use collection::{with_write_retry, CollectionWriter};
pub use config::{EngineConfig, ServerParameters, SyncMode};
pub use cursor::{CursorId, CursorManager};
pub use document::Document;
pub use engine::{Engine, EngineShared};
pub use error::{ErrorCategory, ErrorCode, QuarryError, Result};
pub use interrupt::{OperationContext, OperationRegistry};
pub use logging::{get_log_level, set_log_level, LogComponent, LogLevel};
pub use metrics::Metrics;
pub use oplog::{OpKind, Oplog, OplogEntry};
pub use pipeline::{AggregateRequest, PipelineExecutor};
pub use query::{FindQuery, PlanCache, PlanExecutor};
pub use recovery::{CheckpointStats, RecoveryStats};
pub use txn::{ReadView, Timestamp, Transaction, TransactionCoordinator, TxnId, TxnState};
pub use value::{ObjectId, Value};
