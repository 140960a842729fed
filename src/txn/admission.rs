//! Concurrency admission gate
//!
//! Caps the number of sessions executing inside the engine concurrently when
//! a limit is configured (0 = unlimited). Bounding admission is cheaper than
//! resolving the resulting contention on shared internal structures with
//! fine-grained locking.
//!
//! ## Tickets
//!
//! A session pays for gate entry once per external table-lock scope and is
//! then granted a block of pre-paid tickets. Re-entries on the fast path
//! (the common case of a multi-row statement) just decrement the ticket
//! count without touching the shared counter. The ticket grant is reset when
//! the query layer releases the table lock.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::txn::types::Transaction;

/// Caller priority class for gate admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerClass {
    /// Ordinary client session; blocks until admitted
    Session,
    /// Low-priority background work (purge, stats). Waits a bounded time
    /// when the gate is saturated, then gets `EngineBusy` instead of
    /// competing with client sessions.
    Background,
}

#[derive(Debug, Default)]
struct GateState {
    /// Sessions currently declared inside the engine
    active: usize,
    /// Sessions blocked waiting for admission
    waiting: usize,
}

/// The admission gate: a `Mutex`-guarded counter plus a condvar, with
/// pre-paid tickets handled on the transaction object.
pub struct AdmissionGate {
    /// 0 = disabled; enter/exit become no-ops
    limit: usize,
    /// Tickets granted per paid entry
    tickets_per_entry: u32,
    /// How long a background caller waits before `EngineBusy`
    busy_wait: Duration,
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl AdmissionGate {
    pub fn new(limit: usize, tickets_per_entry: u32, busy_wait: Duration) -> Self {
        Self {
            limit,
            tickets_per_entry,
            busy_wait,
            state: Mutex::new(GateState::default()),
            condvar: Condvar::new(),
        }
    }

    /// Whether admission control is active
    pub fn enabled(&self) -> bool {
        self.limit > 0
    }

    /// Number of sessions currently declared inside
    pub fn active_count(&self) -> usize {
        self.state.lock().expect("admission gate lock poisoned").active
    }

    /// Enter the engine on behalf of `txn`.
    ///
    /// Fast path: a remaining pre-paid ticket admits immediately. Otherwise
    /// the caller blocks until the active count drops below the limit. A
    /// transaction already marked for forced rollback fails fast with
    /// `ForcedAbort`; one chosen as victim while blocked here gets
    /// `Deadlock`, and a killed session gets `Interrupted`.
    pub fn enter(&self, txn: &mut Transaction, class: CallerClass) -> Result<()> {
        if txn.flags.is_forced_rollback() {
            return Err(EngineError::ForcedAbort);
        }
        if self.limit == 0 {
            return Ok(());
        }

        if txn.declared_inside {
            if txn.tickets_remaining > 0 {
                txn.tickets_remaining -= 1;
                return Ok(());
            }
            // Tickets exhausted mid-scope: the caller is still counted as
            // inside, just renew the grant
            txn.tickets_remaining = self.tickets_per_entry.saturating_sub(1);
            return Ok(());
        }

        let deadline = match class {
            CallerClass::Background => Some(Instant::now() + self.busy_wait),
            CallerClass::Session => None,
        };

        let mut state = self.state.lock().expect("admission gate lock poisoned");
        while state.active >= self.limit {
            if txn.flags.is_forced_rollback() {
                return Err(EngineError::ForcedAbort);
            }
            if txn.flags.is_killed() {
                txn.flags.clear_killed();
                return Err(EngineError::Interrupted);
            }

            state.waiting += 1;
            txn.flags.set_lock_wait(true);
            let wait_result = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        state.waiting -= 1;
                        txn.flags.set_lock_wait(false);
                        log::debug!("background caller rejected by saturated admission gate");
                        return Err(EngineError::EngineBusy);
                    }
                    let (guard, _timeout) = self
                        .condvar
                        .wait_timeout(state, remaining)
                        .expect("admission gate lock poisoned");
                    guard
                }
                None => self
                    .condvar
                    .wait(state)
                    .expect("admission gate lock poisoned"),
            };
            state = wait_result;
            state.waiting -= 1;
            txn.flags.set_lock_wait(false);

            // Chosen as victim while blocked: a detected deadlock, not a
            // pre-existing forced abort
            if txn.flags.is_forced_rollback() {
                return Err(EngineError::Deadlock);
            }
        }

        state.active += 1;
        debug_assert!(state.active <= self.limit);
        drop(state);

        txn.declared_inside = true;
        txn.tickets_remaining = self.tickets_per_entry.saturating_sub(1);
        Ok(())
    }

    /// Leave the engine. A transaction that still holds pre-paid tickets
    /// stays declared inside (it paid for the whole table-lock scope).
    pub fn exit(&self, txn: &mut Transaction) {
        if self.limit == 0 || !txn.declared_inside {
            return;
        }
        if txn.tickets_remaining > 0 {
            return;
        }
        self.leave(txn);
    }

    /// Unconditionally leave, regardless of ticket state. Used during
    /// rollback/cleanup so an abandoned transaction never leaks the global
    /// active count.
    pub fn force_exit(&self, txn: &mut Transaction) {
        txn.tickets_remaining = 0;
        if self.limit == 0 || !txn.declared_inside {
            txn.declared_inside = false;
            return;
        }
        self.leave(txn);
    }

    fn leave(&self, txn: &mut Transaction) {
        let mut state = self.state.lock().expect("admission gate lock poisoned");
        debug_assert!(state.active > 0, "admission gate count underflow");
        state.active = state.active.saturating_sub(1);
        let wake = state.waiting > 0;
        drop(state);

        txn.declared_inside = false;
        txn.tickets_remaining = 0;
        if wake {
            self.condvar.notify_all();
        }
    }

    /// Wake every waiter so victims and killed sessions observe their flags.
    /// Called after the deadlock resolver marks a victim or `on_kill` fires.
    pub fn kick_waiters(&self) {
        // Grab the mutex to order the wakeup after the flag store
        let _state = self.state.lock().expect("admission gate lock poisoned");
        self.condvar.notify_all();
    }
}

/// The single global ordering point all committing transactions pass
/// through, bounded by a configurable parallelism knob rather than a single
/// global lock. 0 = unlimited.
pub struct CommitGate {
    limit: usize,
    state: Mutex<usize>,
    condvar: Condvar,
}

impl CommitGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    pub fn enter(&self) {
        if self.limit == 0 {
            return;
        }
        let mut active = self.state.lock().expect("commit gate lock poisoned");
        while *active >= self.limit {
            active = self.condvar.wait(active).expect("commit gate lock poisoned");
        }
        *active += 1;
    }

    pub fn exit(&self) {
        if self.limit == 0 {
            return;
        }
        let mut active = self.state.lock().expect("commit gate lock poisoned");
        debug_assert!(*active > 0, "commit gate count underflow");
        *active = active.saturating_sub(1);
        drop(active);
        self.condvar.notify_one();
    }
}
