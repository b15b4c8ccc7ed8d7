// quarry-core/src/interrupt.rs
//! Operation contexts and cooperative interruption.
//!
//! Long-running work (scans, blocking stages, index builds, waits on prepared
//! transactions) calls [`OperationContext::check_periodically`] every unit of
//! work; the context performs a real check every `interval` calls, so a kill
//! is observed within a bounded amount of work rather than only at stage
//! boundaries.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{ErrorCode, QuarryError, Result};

pub type OpId = u64;

const ALIVE: u8 = 0;
const KILLED: u8 = 1;
const KILLED_REPL_STATE: u8 = 2;

const DEFAULT_CHECK_INTERVAL: u32 = 128;

pub struct OperationContext {
    op_id: OpId,
    kill_state: Arc<AtomicU8>,
    deadline: Option<Instant>,
    counter: AtomicU32,
    interval: u32,
    registry: Option<Arc<DashMap<OpId, Arc<AtomicU8>>>>,
}

impl OperationContext {
    /// An unregistered context that can only be killed through itself.
    pub fn new() -> Self {
        OperationContext {
            op_id: 0,
            kill_state: Arc::new(AtomicU8::new(ALIVE)),
            deadline: None,
            counter: AtomicU32::new(0),
            interval: DEFAULT_CHECK_INTERVAL,
            registry: None,
        }
    }

    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.deadline = Some(Instant::now() + max_time);
        self
    }

    pub fn with_check_interval(mut self, interval: u32) -> Self {
        self.interval = interval.max(1);
        self
    }

    pub fn kill(&self) {
        self.kill_state.store(KILLED, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.kill_state.load(Ordering::SeqCst) != ALIVE
    }

    pub fn check_for_interrupt(&self) -> Result<()> {
        match self.kill_state.load(Ordering::SeqCst) {
            ALIVE => {}
            KILLED_REPL_STATE => {
                return Err(QuarryError::new(
                    ErrorCode::InterruptedDueToReplStateChange,
                    "operation was interrupted because of a state change",
                ))
            }
            _ => return Err(QuarryError::Interrupted(format!("operation {} was killed", self.op_id))),
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(QuarryError::new(
                    ErrorCode::MaxTimeMSExpired,
                    "operation exceeded time limit",
                ));
            }
        }
        Ok(())
    }

    /// Count one unit of work and check for interruption every `interval` units.
    #[inline]
    pub fn check_periodically(&self) -> Result<()> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        if n % self.interval == 0 {
            self.check_for_interrupt()
        } else {
            Ok(())
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        OperationContext::new()
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            registry.remove(&self.op_id);
        }
    }
}

/// Process-wide table of running operations, used by `killOp`-style calls.
pub struct OperationRegistry {
    ops: Arc<DashMap<OpId, Arc<AtomicU8>>>,
    next_id: AtomicU64,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        OperationRegistry {
            ops: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        OperationRegistry::default()
    }

    pub fn register(&self, interval: u32) -> OperationContext {
        let op_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kill_state = Arc::new(AtomicU8::new(ALIVE));
        self.ops.insert(op_id, kill_state.clone());
        OperationContext {
            op_id,
            kill_state,
            deadline: None,
            counter: AtomicU32::new(0),
            interval: interval.max(1),
            registry: Some(self.ops.clone()),
        }
    }

    /// Kill one operation. Returns false if it is not running.
    pub fn kill_op(&self, op_id: OpId) -> bool {
        match self.ops.get(&op_id) {
            Some(state) => {
                state.store(KILLED, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Interrupt every running operation; with `repl_state_change` the
    /// operations fail with `InterruptedDueToReplStateChange`.
    pub fn kill_all(&self, repl_state_change: bool) -> usize {
        let code = if repl_state_change { KILLED_REPL_STATE } else { KILLED };
        let mut count = 0;
        for entry in self.ops.iter() {
            entry.value().store(code, Ordering::SeqCst);
            count += 1;
        }
        count
    }

    pub fn running(&self) -> usize {
        self.ops.len()
    }
}
