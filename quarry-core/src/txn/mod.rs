// quarry-core/src/txn/mod.rs
//! Transactions, timestamps and snapshot bookkeeping.

pub mod coordinator;
pub mod gate;
pub mod transaction;

pub use coordinator::{HistoryPin, TransactionCoordinator};
pub use gate::CollectionGate;
pub use transaction::{PendingWrite, Transaction, TxnShared, TxnState};

/// Logical commit/read timestamp.
pub type Timestamp = u64;

pub type TxnId = u64;

/// What a read operation may see: committed versions at or below `read_ts`
/// plus the intents of `reader`, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    pub read_ts: Timestamp,
    pub reader: Option<TxnId>,
}

impl ReadView {
    /// A view of everything committed, used by internal maintenance.
    pub fn latest() -> Self {
        ReadView {
            read_ts: Timestamp::MAX,
            reader: None,
        }
    }
}

/// Everything a storage-level write needs: the writing transaction, the
/// operation (for interruption while waiting on a prepared transaction) and
/// how long each wait slice lasts.
pub struct WriteContext<'a> {
    pub txn: &'a std::sync::Arc<TxnShared>,
    pub op: &'a crate::interrupt::OperationContext,
    pub wait_slice: std::time::Duration,
    pub metrics: &'a crate::metrics::Metrics,
}

impl<'a> WriteContext<'a> {
    /// Block until a prepared transaction that owns a conflicting intent
    /// commits or aborts.
    pub(crate) fn wait_for_prepared(&self, owner: &TxnShared) -> crate::error::Result<()> {
        self.metrics.prepare_conflict_waits.incr();
        crate::log_debug!("txn {} waiting on prepared txn {}", self.txn.id, owner.id);
        owner.wait_until_resolved(self.op, self.wait_slice)
    }
}
