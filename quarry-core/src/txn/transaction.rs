// quarry-core/src/txn/transaction.rs
// Transaction state shared between the session handle, the coordinator and
// every intent the transaction has installed.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{QuarryError, Result};
use crate::index::{IndexKey, IndexTree};
use crate::interrupt::OperationContext;
use crate::oplog::StagedOp;
use crate::storage::{RecordId, RecordStore};

use super::coordinator::TransactionCoordinator;
use super::gate::CollectionGate;
use super::{ReadView, Timestamp, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    Active = 0,
    Prepared = 1,
    Committed = 2,
    Aborted = 3,
}

impl TxnState {
    fn from_u8(raw: u8) -> TxnState {
        match raw {
            0 => TxnState::Active,
            1 => TxnState::Prepared,
            2 => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Active => "active",
            TxnState::Prepared => "prepared",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        }
    }
}

/// An intent this transaction installed and must resolve on commit or abort.
pub enum PendingWrite {
    Record {
        store: Arc<RecordStore>,
        rid: RecordId,
    },
    IndexKey {
        tree: Arc<IndexTree>,
        key: IndexKey,
        rid: RecordId,
    },
}

impl PendingWrite {
    pub(crate) fn commit(&self, txn: TxnId, ts: Timestamp) {
        match self {
            PendingWrite::Record { store, rid } => store.commit_intent(*rid, txn, ts),
            PendingWrite::IndexKey { tree, key, rid } => tree.commit_intent(key, *rid, txn, ts),
        }
    }

    pub(crate) fn abort(&self, txn: TxnId) {
        match self {
            PendingWrite::Record { store, rid } => store.abort_intent(*rid, txn),
            PendingWrite::IndexKey { tree, key, rid } => tree.abort_intent(key, *rid, txn),
        }
    }
}

#[derive(Default)]
pub(crate) struct TxnInner {
    pub writes: Vec<PendingWrite>,
    pub gates: Vec<Arc<CollectionGate>>,
    pub ops: Vec<StagedOp>,
}

pub struct TxnShared {
    pub id: TxnId,
    pub read_ts: Timestamp,
    state: AtomicU8,
    prepare_ts: AtomicU64,
    commit_ts: AtomicU64,
    pub(crate) inner: Mutex<TxnInner>,
    resolved: Mutex<bool>,
    resolved_cv: Condvar,
}

impl TxnShared {
    pub(crate) fn new(id: TxnId, read_ts: Timestamp) -> Self {
        TxnShared {
            id,
            read_ts,
            state: AtomicU8::new(TxnState::Active as u8),
            prepare_ts: AtomicU64::new(0),
            commit_ts: AtomicU64::new(0),
            inner: Mutex::new(TxnInner::default()),
            resolved: Mutex::new(false),
            resolved_cv: Condvar::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(id: TxnId, read_ts: Timestamp) -> Arc<Self> {
        Arc::new(TxnShared::new(id, read_ts))
    }

    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn prepare_ts(&self) -> Option<Timestamp> {
        match self.prepare_ts.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub(crate) fn set_prepare_ts(&self, ts: Timestamp) {
        self.prepare_ts.store(ts, Ordering::SeqCst);
    }

    pub fn commit_ts(&self) -> Option<Timestamp> {
        match self.commit_ts.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub(crate) fn set_commit_ts(&self, ts: Timestamp) {
        self.commit_ts.store(ts, Ordering::SeqCst);
    }

    pub fn view(&self) -> ReadView {
        ReadView {
            read_ts: self.read_ts,
            reader: Some(self.id),
        }
    }

    pub(crate) fn register_write(&self, write: PendingWrite) {
        self.inner.lock().writes.push(write);
    }

    pub(crate) fn stage_op(&self, op: StagedOp) {
        self.inner.lock().ops.push(op);
    }

    pub fn has_writes(&self) -> bool {
        let inner = self.inner.lock();
        !inner.writes.is_empty() || !inner.ops.is_empty()
    }

    /// Enter a collection's gate once for the life of the transaction.
    pub(crate) fn enter_gate(&self, gate: &Arc<CollectionGate>, timeout: Duration) -> Result<()> {
        if self.inner.lock().gates.iter().any(|g| Arc::ptr_eq(g, gate)) {
            return Ok(());
        }
        if !gate.try_enter_shared(timeout) {
            return Err(QuarryError::WriteConflict);
        }
        self.inner.lock().gates.push(gate.clone());
        Ok(())
    }

    pub(crate) fn release_gates(&self) {
        let gates = std::mem::take(&mut self.inner.lock().gates);
        for gate in gates {
            gate.exit_shared();
        }
    }

    pub(crate) fn mark_resolved(&self) {
        let mut resolved = self.resolved.lock();
        *resolved = true;
        self.resolved_cv.notify_all();
    }

    /// Block until this transaction commits or aborts. Used by writers that
    /// ran into one of its intents while it is prepared.
    pub fn wait_until_resolved(&self, ctx: &OperationContext, slice: Duration) -> Result<()> {
        let mut resolved = self.resolved.lock();
        while !*resolved {
            self.resolved_cv.wait_for(&mut resolved, slice);
            if !*resolved {
                ctx.check_for_interrupt()?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TxnShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnShared")
            .field("id", &self.id)
            .field("read_ts", &self.read_ts)
            .field("state", &self.state())
            .finish()
    }
}

/// Session-side handle. Dropping an active transaction aborts it; a prepared
/// transaction survives its handle and can be picked up again through
/// [`TransactionCoordinator::prepared_transaction`].
pub struct Transaction {
    shared: Arc<TxnShared>,
    coordinator: Arc<TransactionCoordinator>,
    explicit: bool,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<TxnShared>, coordinator: Arc<TransactionCoordinator>, explicit: bool) -> Self {
        Transaction {
            shared,
            coordinator,
            explicit,
        }
    }

    pub fn id(&self) -> TxnId {
        self.shared.id
    }

    pub fn read_ts(&self) -> Timestamp {
        self.shared.read_ts
    }

    pub fn state(&self) -> TxnState {
        self.shared.state()
    }

    /// Multi-statement transaction started by a client, as opposed to the
    /// implicit per-operation transactions the engine opens itself.
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn view(&self) -> ReadView {
        self.shared.view()
    }

    pub fn shared(&self) -> &Arc<TxnShared> {
        &self.shared
    }

    pub fn prepare(&self) -> Result<Timestamp> {
        self.coordinator.prepare(&self.shared)
    }

    /// Commit. Prepared transactions require a commit timestamp at or after
    /// their prepare timestamp; unprepared ones must not pass one.
    pub fn commit(&self, commit_ts: Option<Timestamp>) -> Result<Timestamp> {
        self.coordinator.commit(&self.shared, commit_ts)
    }

    pub fn abort(&self) -> Result<()> {
        self.coordinator.abort(&self.shared)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state() {
            TxnState::Active => Ok(()),
            TxnState::Prepared => Err(QuarryError::new(
                crate::error::ErrorCode::PreparedTransactionInProgress,
                format!("transaction {} has been prepared", self.id()),
            )),
            TxnState::Committed => Err(QuarryError::new(
                crate::error::ErrorCode::TransactionCommitted,
                format!("transaction {} has been committed", self.id()),
            )),
            TxnState::Aborted => Err(QuarryError::new(
                crate::error::ErrorCode::NoSuchTransaction,
                format!("transaction {} has been aborted", self.id()),
            )),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.shared.state() == TxnState::Active {
            let _ = self.coordinator.abort(&self.shared);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.shared.fmt(f)
    }
}
