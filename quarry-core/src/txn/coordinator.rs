// quarry-core/src/txn/coordinator.rs
//! Timestamp allocation, commit/prepare protocol and the GC floor.
//!
//! # Timestamps
//!
//! A single logical clock hands out commit and prepare timestamps. A
//! timestamp is *in flight* from the moment it is reserved until the writes
//! carrying it are published (or, for a prepare timestamp, until the prepared
//! transaction resolves). The all-committed timestamp is one below the
//! oldest in-flight timestamp, so a snapshot taken at it can never observe a
//! half-published commit, and a prepared transaction's eventual commit
//! timestamp (which is at or after its prepare timestamp) is always above
//! every snapshot handed out while it was pending.
//!
//! # Garbage collection floor
//!
//! Version reclamation may not pass the minimum of the all-committed
//! timestamp, the read timestamp of every open transaction and every
//! history pin. Once a pass has reclaimed up to a floor, reads at older
//! timestamps fail with `SnapshotTooOld`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ErrorCode, QuarryError, Result};
use crate::metrics::Metrics;
use crate::oplog::{JournalRecord, Oplog};
use crate::{log_debug, log_trace};

use super::transaction::{Transaction, TxnShared, TxnState};
use super::{Timestamp, TxnId};

#[derive(Default)]
struct CoordinatorState {
    /// Reserved commit/prepare timestamps not yet resolved, with multiplicity.
    in_flight: BTreeMap<Timestamp, usize>,
    /// Read timestamps of open transactions, with multiplicity.
    active_reads: BTreeMap<Timestamp, usize>,
    pins: HashMap<u64, Timestamp>,
    next_pin: u64,
    prepared: HashMap<TxnId, Arc<TxnShared>>,
    /// History below this may already be reclaimed.
    history_horizon: Timestamp,
}

fn multiset_add(set: &mut BTreeMap<Timestamp, usize>, ts: Timestamp) {
    *set.entry(ts).or_insert(0) += 1;
}

fn multiset_remove(set: &mut BTreeMap<Timestamp, usize>, ts: Timestamp) {
    if let Some(count) = set.get_mut(&ts) {
        *count -= 1;
        if *count == 0 {
            set.remove(&ts);
        }
    }
}

/// A retained point in history. Release exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPin {
    pub id: u64,
    pub ts: Timestamp,
}

pub struct TransactionCoordinator {
    clock: AtomicU64,
    next_txn_id: AtomicU64,
    state: Mutex<CoordinatorState>,
    oplog: Arc<Oplog>,
    metrics: Arc<Metrics>,
}

impl TransactionCoordinator {
    pub fn new(oplog: Arc<Oplog>, metrics: Arc<Metrics>) -> Self {
        TransactionCoordinator {
            clock: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
            state: Mutex::new(CoordinatorState::default()),
            oplog,
            metrics,
        }
    }

    pub fn oplog(&self) -> &Arc<Oplog> {
        &self.oplog
    }

    /// Highest timestamp handed out so far.
    pub fn current_ts(&self) -> Timestamp {
        self.clock.load(Ordering::SeqCst)
    }

    /// Move the clock forward to at least `ts` (recovery).
    pub(crate) fn advance_clock(&self, ts: Timestamp) {
        self.clock.fetch_max(ts, Ordering::SeqCst);
    }

    pub(crate) fn advance_txn_ids(&self, id: TxnId) {
        self.next_txn_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    fn all_committed_locked(&self, state: &CoordinatorState) -> Timestamp {
        match state.in_flight.keys().next() {
            Some(oldest) => oldest.saturating_sub(1),
            None => self.clock.load(Ordering::SeqCst),
        }
    }

    pub fn all_committed(&self) -> Timestamp {
        let state = self.state.lock();
        self.all_committed_locked(&state)
    }

    fn floor_locked(&self, state: &CoordinatorState) -> Timestamp {
        let mut floor = self.all_committed_locked(state);
        if let Some(oldest_read) = state.active_reads.keys().next() {
            floor = floor.min(*oldest_read);
        }
        if let Some(oldest_pin) = state.pins.values().min() {
            floor = floor.min(*oldest_pin);
        }
        floor
    }

    /// Oldest timestamp any reader may still need.
    pub fn gc_floor(&self) -> Timestamp {
        let state = self.state.lock();
        self.floor_locked(&state)
    }

    /// The floor a reclamation pass may prune to. Later `begin_at` calls
    /// below it are refused.
    pub(crate) fn claim_gc_floor(&self) -> Timestamp {
        let mut state = self.state.lock();
        let floor = self.floor_locked(&state);
        state.history_horizon = state.history_horizon.max(floor);
        floor
    }

    /// No history older than `ts` exists (a checkpoint keeps only the
    /// versions visible at its timestamp).
    pub(crate) fn raise_history_horizon(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        state.history_horizon = state.history_horizon.max(ts);
    }

    // ========== BEGIN ==========

    /// Start a transaction reading at the all-committed timestamp.
    pub fn begin(self: &Arc<Self>, explicit: bool) -> Transaction {
        let mut state = self.state.lock();
        let read_ts = self.all_committed_locked(&state);
        multiset_add(&mut state.active_reads, read_ts);
        drop(state);
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        log_trace!("begin txn {} at {}", id, read_ts);
        Transaction::new(Arc::new(TxnShared::new(id, read_ts)), self.clone(), explicit)
    }

    /// Start a transaction reading at a caller-chosen timestamp, which must
    /// not be older than history already reclaimed.
    pub fn begin_at(self: &Arc<Self>, read_ts: Timestamp, explicit: bool) -> Result<Transaction> {
        let mut state = self.state.lock();
        let horizon = state.history_horizon;
        let all_committed = self.all_committed_locked(&state);
        if read_ts < horizon {
            return Err(QuarryError::new(
                ErrorCode::SnapshotTooOld,
                format!("read timestamp {} is older than the retained history at {}", read_ts, horizon),
            ));
        }
        if read_ts > all_committed {
            return Err(QuarryError::BadValue(format!(
                "read timestamp {} is newer than the all-committed timestamp {}",
                read_ts, all_committed
            )));
        }
        multiset_add(&mut state.active_reads, read_ts);
        drop(state);
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Ok(Transaction::new(Arc::new(TxnShared::new(id, read_ts)), self.clone(), explicit))
    }

    /// Re-open a journaled transaction under its original id (recovery).
    pub(crate) fn begin_replayed(self: &Arc<Self>, id: TxnId, read_ts: Timestamp) -> Transaction {
        multiset_add(&mut self.state.lock().active_reads, read_ts);
        self.advance_txn_ids(id);
        Transaction::new(Arc::new(TxnShared::new(id, read_ts)), self.clone(), true)
    }

    /// Id the next transaction will receive.
    pub(crate) fn next_txn_id(&self) -> TxnId {
        self.next_txn_id.load(Ordering::SeqCst)
    }

    // ========== PREPARE ==========

    pub fn prepare(&self, txn: &Arc<TxnShared>) -> Result<Timestamp> {
        self.prepare_inner(txn, None)
    }

    /// Prepare at a fixed timestamp (journal replay).
    pub(crate) fn prepare_at(&self, txn: &Arc<TxnShared>, ts: Timestamp) -> Result<Timestamp> {
        self.prepare_inner(txn, Some(ts))
    }

    fn prepare_inner(&self, txn: &Arc<TxnShared>, fixed: Option<Timestamp>) -> Result<Timestamp> {
        match txn.state() {
            TxnState::Active => {}
            TxnState::Prepared => return txn.prepare_ts().ok_or(QuarryError::WriteConflict),
            other => {
                return Err(QuarryError::new(
                    ErrorCode::NoSuchTransaction,
                    format!("cannot prepare a transaction that is {}", other.as_str()),
                ))
            }
        }
        let prepare_ts = {
            let mut state = self.state.lock();
            let ts = match fixed {
                Some(ts) => {
                    self.clock.fetch_max(ts, Ordering::SeqCst);
                    ts
                }
                None => self.clock.fetch_add(1, Ordering::SeqCst) + 1,
            };
            multiset_add(&mut state.in_flight, ts);
            state.prepared.insert(txn.id, txn.clone());
            ts
        };
        if fixed.is_none() {
            let ops = txn.inner.lock().ops.clone();
            let record = JournalRecord::Prepare {
                txn_id: txn.id,
                read_ts: txn.read_ts,
                prepare_ts,
                ops,
            };
            if let Err(err) = self.oplog.journal(&record) {
                let mut state = self.state.lock();
                multiset_remove(&mut state.in_flight, prepare_ts);
                state.prepared.remove(&txn.id);
                return Err(err);
            }
        }
        txn.set_prepare_ts(prepare_ts);
        txn.set_state(TxnState::Prepared);
        self.metrics.transactions_prepared.incr();
        log_debug!("prepared txn {} at {}", txn.id, prepare_ts);
        Ok(prepare_ts)
    }

    /// Look up a prepared transaction whose handle was dropped or that was
    /// restored by recovery.
    pub fn prepared_transaction(self: &Arc<Self>, id: TxnId) -> Option<Transaction> {
        let state = self.state.lock();
        state
            .prepared
            .get(&id)
            .map(|shared| Transaction::new(shared.clone(), self.clone(), true))
    }

    pub fn prepared_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<_> = self.state.lock().prepared.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ========== COMMIT ==========

    pub fn commit(&self, txn: &Arc<TxnShared>, commit_ts: Option<Timestamp>) -> Result<Timestamp> {
        self.commit_inner(txn, commit_ts, true, |_| Ok(()))
    }

    /// Commit, running `hook` while the commit timestamp is reserved but not
    /// yet visible. Catalog changes use this to publish at the commit time.
    pub(crate) fn commit_with<F>(&self, txn: &Arc<TxnShared>, hook: F) -> Result<Timestamp>
    where
        F: FnOnce(Timestamp) -> Result<()>,
    {
        self.commit_inner(txn, None, true, hook)
    }

    /// Commit at a fixed timestamp without journaling (journal replay).
    pub(crate) fn commit_replayed<F>(&self, txn: &Arc<TxnShared>, ts: Timestamp, hook: F) -> Result<Timestamp>
    where
        F: FnOnce(Timestamp) -> Result<()>,
    {
        match txn.state() {
            TxnState::Prepared => self.commit_inner(txn, Some(ts), false, hook),
            _ => {
                self.clock.fetch_max(ts, Ordering::SeqCst);
                self.publish(txn, ts, false, None, hook)
            }
        }
    }

    fn commit_inner<F>(
        &self,
        txn: &Arc<TxnShared>,
        commit_ts: Option<Timestamp>,
        durable: bool,
        hook: F,
    ) -> Result<Timestamp>
    where
        F: FnOnce(Timestamp) -> Result<()>,
    {
        match txn.state() {
            TxnState::Active => {
                if commit_ts.is_some() {
                    return Err(QuarryError::InvalidOptions(
                        "commit timestamp is only allowed for prepared transactions".into(),
                    ));
                }
                if !txn.has_writes() {
                    return self.finish_read_only(txn, hook);
                }
                let ts = {
                    let mut state = self.state.lock();
                    let ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
                    multiset_add(&mut state.in_flight, ts);
                    ts
                };
                let record = durable.then(|| JournalRecord::Commit {
                    ts,
                    txn_id: txn.id,
                    ops: txn.inner.lock().ops.clone(),
                });
                self.publish(txn, ts, true, record, hook)
            }
            TxnState::Prepared => {
                let prepare_ts = txn.prepare_ts().unwrap_or(0);
                let ts = commit_ts.ok_or_else(|| {
                    QuarryError::InvalidOptions("a prepared transaction requires a commit timestamp".into())
                })?;
                if ts < prepare_ts {
                    return Err(QuarryError::InvalidOptions(format!(
                        "commit timestamp {} is before the prepare timestamp {}",
                        ts, prepare_ts
                    )));
                }
                {
                    let mut state = self.state.lock();
                    self.clock.fetch_max(ts, Ordering::SeqCst);
                    multiset_add(&mut state.in_flight, ts);
                }
                let record = durable.then_some(JournalRecord::CommitPrepared {
                    txn_id: txn.id,
                    commit_ts: ts,
                });
                self.publish(txn, ts, true, record, hook)
            }
            TxnState::Committed => Err(QuarryError::new(
                ErrorCode::TransactionCommitted,
                format!("transaction {} has already been committed", txn.id),
            )),
            TxnState::Aborted => Err(QuarryError::new(
                ErrorCode::NoSuchTransaction,
                format!("transaction {} has been aborted", txn.id),
            )),
        }
    }

    fn finish_read_only<F>(&self, txn: &Arc<TxnShared>, hook: F) -> Result<Timestamp>
    where
        F: FnOnce(Timestamp) -> Result<()>,
    {
        let ts = self.all_committed();
        hook(ts)?;
        let mut state = self.state.lock();
        multiset_remove(&mut state.active_reads, txn.read_ts);
        drop(state);
        txn.set_state(TxnState::Committed);
        txn.release_gates();
        txn.mark_resolved();
        Ok(ts)
    }

    /// Publish the transaction's writes at `ts`, which is already in flight
    /// (unless `reserved` is false, in which case it is reserved here).
    fn publish<F>(
        &self,
        txn: &Arc<TxnShared>,
        ts: Timestamp,
        reserved: bool,
        record: Option<JournalRecord>,
        hook: F,
    ) -> Result<Timestamp>
    where
        F: FnOnce(Timestamp) -> Result<()>,
    {
        if !reserved {
            multiset_add(&mut self.state.lock().in_flight, ts);
        }
        let journaled = match &record {
            Some(record) => self.oplog.journal(record),
            None => Ok(()),
        };
        if let Err(err) = journaled.and_then(|_| hook(ts)) {
            multiset_remove(&mut self.state.lock().in_flight, ts);
            if txn.state() == TxnState::Active {
                self.abort(txn)?;
            }
            return Err(err);
        }

        txn.set_commit_ts(ts);
        let (writes, ops) = {
            let mut inner = txn.inner.lock();
            (std::mem::take(&mut inner.writes), std::mem::take(&mut inner.ops))
        };
        for write in &writes {
            write.commit(txn.id, ts);
        }
        self.oplog.publish(ts, Some(txn.id), &ops);

        let was_prepared = txn.state() == TxnState::Prepared;
        {
            let mut state = self.state.lock();
            multiset_remove(&mut state.in_flight, ts);
            if was_prepared {
                if let Some(prepare_ts) = txn.prepare_ts() {
                    multiset_remove(&mut state.in_flight, prepare_ts);
                }
                state.prepared.remove(&txn.id);
            }
            multiset_remove(&mut state.active_reads, txn.read_ts);
        }
        txn.set_state(TxnState::Committed);
        txn.release_gates();
        txn.mark_resolved();
        self.metrics.transactions_committed.incr();
        log_trace!("committed txn {} at {} ({} writes)", txn.id, ts, writes.len());
        Ok(ts)
    }

    // ========== ABORT ==========

    pub fn abort(&self, txn: &Arc<TxnShared>) -> Result<()> {
        let was_prepared = match txn.state() {
            TxnState::Active => false,
            TxnState::Prepared => true,
            TxnState::Committed => {
                return Err(QuarryError::new(
                    ErrorCode::TransactionCommitted,
                    format!("transaction {} has already been committed", txn.id),
                ))
            }
            TxnState::Aborted => return Ok(()),
        };
        if was_prepared {
            self.oplog.journal(&JournalRecord::AbortPrepared { txn_id: txn.id })?;
        }
        let writes = std::mem::take(&mut txn.inner.lock().writes);
        for write in writes.iter().rev() {
            write.abort(txn.id);
        }
        txn.inner.lock().ops.clear();
        {
            let mut state = self.state.lock();
            if was_prepared {
                if let Some(prepare_ts) = txn.prepare_ts() {
                    multiset_remove(&mut state.in_flight, prepare_ts);
                }
                state.prepared.remove(&txn.id);
            }
            multiset_remove(&mut state.active_reads, txn.read_ts);
        }
        txn.set_state(TxnState::Aborted);
        txn.release_gates();
        txn.mark_resolved();
        self.metrics.transactions_aborted.incr();
        log_trace!("aborted txn {}", txn.id);
        Ok(())
    }

    // ========== HISTORY PINS ==========

    /// Retain history at `ts` (default: all-committed) until released.
    pub fn pin_history(&self, ts: Option<Timestamp>) -> Result<HistoryPin> {
        let mut state = self.state.lock();
        let horizon = state.history_horizon;
        let ts = ts.unwrap_or_else(|| self.all_committed_locked(&state));
        if ts < horizon {
            return Err(QuarryError::new(
                ErrorCode::SnapshotTooOld,
                format!("cannot pin timestamp {}: history before {} may be gone", ts, horizon),
            ));
        }
        state.next_pin += 1;
        let id = state.next_pin;
        state.pins.insert(id, ts);
        Ok(HistoryPin { id, ts })
    }

    pub fn release_pin(&self, pin: HistoryPin) -> Result<()> {
        match self.state.lock().pins.remove(&pin.id) {
            Some(_) => Ok(()),
            None => Err(QuarryError::new(
                ErrorCode::NoSuchKey,
                format!("history pin {} is not held", pin.id),
            )),
        }
    }

    pub fn pin_count(&self) -> usize {
        self.state.lock().pins.len()
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().active_reads.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::{OpKind, StagedOp};

    fn coordinator() -> Arc<TransactionCoordinator> {
        let metrics = Arc::new(Metrics::new());
        let oplog = Arc::new(Oplog::in_memory(1000, metrics.clone()));
        Arc::new(TransactionCoordinator::new(oplog, metrics))
    }

    fn noop(txn: &Transaction) {
        txn.shared().stage_op(StagedOp::new(OpKind::Noop, "test.c", Default::default(), None));
    }

    #[test]
    fn test_commit_advances_snapshot() {
        let coord = coordinator();
        let before = coord.all_committed();
        let txn = coord.begin(true);
        noop(&txn);
        let ts = txn.commit(None).unwrap();
        assert!(ts > before);
        assert_eq!(coord.all_committed(), ts);
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(coord.oplog().len(), 1);
    }

    #[test]
    fn test_prepare_holds_back_all_committed() {
        let coord = coordinator();
        let t1 = coord.begin(true);
        noop(&t1);
        let prepare_ts = t1.prepare().unwrap();
        assert_eq!(coord.all_committed(), prepare_ts - 1);

        // Later commits do not become visible past the prepare point.
        let t2 = coord.begin(true);
        noop(&t2);
        let t2_ts = t2.commit(None).unwrap();
        assert!(t2_ts > prepare_ts);
        assert_eq!(coord.all_committed(), prepare_ts - 1);

        t1.commit(Some(prepare_ts + 5)).unwrap();
        assert!(coord.all_committed() >= prepare_ts + 5);
    }

    #[test]
    fn test_commit_timestamp_rules() {
        let coord = coordinator();
        let t1 = coord.begin(true);
        noop(&t1);
        let err = t1.commit(Some(10)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOptions);

        let prepare_ts = t1.prepare().unwrap();
        assert_eq!(t1.commit(None).unwrap_err().code(), ErrorCode::InvalidOptions);
        assert_eq!(t1.commit(Some(prepare_ts - 1)).unwrap_err().code(), ErrorCode::InvalidOptions);
        assert_eq!(t1.state(), TxnState::Prepared);
        t1.commit(Some(prepare_ts)).unwrap();
        assert_eq!(t1.commit(None).unwrap_err().code(), ErrorCode::TransactionCommitted);
    }

    #[test]
    fn test_abort_from_prepared() {
        let coord = coordinator();
        let t1 = coord.begin(true);
        noop(&t1);
        t1.prepare().unwrap();
        t1.abort().unwrap();
        assert_eq!(t1.state(), TxnState::Aborted);
        assert!(coord.prepared_ids().is_empty());
        assert_eq!(coord.all_committed(), coord.current_ts());
    }

    #[test]
    fn test_prepared_survives_handle_drop() {
        let coord = coordinator();
        let id = {
            let t1 = coord.begin(true);
            noop(&t1);
            t1.prepare().unwrap();
            t1.id()
        };
        let again = coord.prepared_transaction(id).expect("still prepared");
        again.abort().unwrap();
    }

    #[test]
    fn test_dropping_active_transaction_aborts() {
        let coord = coordinator();
        {
            let txn = coord.begin(true);
            noop(&txn);
            assert_eq!(coord.open_transactions(), 1);
        }
        assert_eq!(coord.open_transactions(), 0);
    }

    #[test]
    fn test_gc_floor_tracks_reads_and_pins() {
        let coord = coordinator();
        let reader = coord.begin(false);
        let writer = coord.begin(true);
        noop(&writer);
        writer.commit(None).unwrap();
        assert_eq!(coord.gc_floor(), reader.read_ts());
        drop(reader);
        assert_eq!(coord.gc_floor(), coord.all_committed());

        let pin = coord.pin_history(None).unwrap();
        let w2 = coord.begin(true);
        noop(&w2);
        w2.commit(None).unwrap();
        assert_eq!(coord.gc_floor(), pin.ts);
        coord.release_pin(pin).unwrap();
        assert_eq!(coord.release_pin(pin).unwrap_err().code(), ErrorCode::NoSuchKey);
        assert_eq!(coord.gc_floor(), coord.all_committed());
    }

    #[test]
    fn test_pin_below_reclaimed_history_rejected() {
        let coord = coordinator();
        let txn = coord.begin(true);
        noop(&txn);
        txn.commit(None).unwrap();
        let pin = coord.pin_history(Some(0)).unwrap();
        coord.release_pin(pin).unwrap();

        coord.claim_gc_floor();
        let err = coord.pin_history(Some(0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SnapshotTooOld);
    }

    #[test]
    fn test_begin_at_past_timestamp() {
        let coord = coordinator();
        let before = coord.all_committed();
        let txn = coord.begin(true);
        noop(&txn);
        txn.commit(None).unwrap();

        let old = coord.begin_at(before, false).unwrap();
        assert_eq!(old.read_ts(), before);
        // The open reader holds the floor down.
        assert_eq!(coord.claim_gc_floor(), before);
        drop(old);

        let err = coord.begin_at(coord.all_committed() + 5, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
        coord.claim_gc_floor();
        let err = coord.begin_at(before, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SnapshotTooOld);
    }
}
