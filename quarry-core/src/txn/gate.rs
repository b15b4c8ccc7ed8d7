// quarry-core/src/txn/gate.rs
// Per-collection gate: writers hold it shared for the life of their
// transaction, index builds take it exclusively to register and to finish.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::interrupt::OperationContext;

#[derive(Default)]
struct GateState {
    shared: usize,
    exclusive: bool,
    exclusive_waiters: usize,
}

#[derive(Default)]
pub struct CollectionGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl CollectionGate {
    pub fn new() -> Self {
        CollectionGate::default()
    }

    /// Enter in shared mode. Pending exclusive requests take priority, so a
    /// shared entry may time out; returns false in that case.
    pub fn try_enter_shared(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.exclusive || state.exclusive_waiters > 0 {
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                if state.exclusive || state.exclusive_waiters > 0 {
                    return false;
                }
                break;
            }
        }
        state.shared += 1;
        true
    }

    pub fn exit_shared(&self) {
        let mut state = self.state.lock();
        state.shared = state.shared.saturating_sub(1);
        if state.shared == 0 {
            self.cv.notify_all();
        }
    }

    /// Enter exclusively, waiting for every shared holder to leave. The wait
    /// stays interruptible.
    pub fn enter_exclusive(&self, ctx: &OperationContext) -> Result<()> {
        let mut state = self.state.lock();
        state.exclusive_waiters += 1;
        while state.exclusive || state.shared > 0 {
            self.cv.wait_for(&mut state, Duration::from_millis(10));
            if let Err(err) = ctx.check_for_interrupt() {
                state.exclusive_waiters -= 1;
                self.cv.notify_all();
                return Err(err);
            }
        }
        state.exclusive_waiters -= 1;
        state.exclusive = true;
        Ok(())
    }

    pub fn exit_exclusive(&self) {
        let mut state = self.state.lock();
        state.exclusive = false;
        self.cv.notify_all();
    }

    pub fn shared_holders(&self) -> usize {
        self.state.lock().shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shared_entries_coexist() {
        let gate = CollectionGate::new();
        assert!(gate.try_enter_shared(Duration::from_millis(1)));
        assert!(gate.try_enter_shared(Duration::from_millis(1)));
        assert_eq!(gate.shared_holders(), 2);
        gate.exit_shared();
        gate.exit_shared();
        assert_eq!(gate.shared_holders(), 0);
    }

    #[test]
    fn test_exclusive_waits_for_shared_and_blocks_new_entries() {
        let gate = Arc::new(CollectionGate::new());
        assert!(gate.try_enter_shared(Duration::from_millis(1)));

        let g = gate.clone();
        let handle = thread::spawn(move || {
            let ctx = OperationContext::new();
            g.enter_exclusive(&ctx).unwrap();
            g.exit_exclusive();
        });

        // Give the exclusive request time to queue.
        thread::sleep(Duration::from_millis(30));
        assert!(!gate.try_enter_shared(Duration::from_millis(5)));
        gate.exit_shared();
        handle.join().unwrap();
        assert!(gate.try_enter_shared(Duration::from_millis(5)));
    }

    #[test]
    fn test_exclusive_wait_is_interruptible() {
        let gate = CollectionGate::new();
        assert!(gate.try_enter_shared(Duration::from_millis(1)));
        let ctx = OperationContext::new();
        ctx.kill();
        assert!(gate.enter_exclusive(&ctx).is_err());
        // The abandoned exclusive request no longer blocks shared entry.
        assert!(gate.try_enter_shared(Duration::from_millis(1)));
    }
}
