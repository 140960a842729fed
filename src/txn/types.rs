//! Core transaction types and state management

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::hooks::UndoPosition;

/// Transaction ID. Assigned monotonically when the transaction first starts;
/// `TXN_ID_NONE` until then.
pub type TxnId = u64;

/// Reserved "no transaction id assigned yet" value
pub const TXN_ID_NONE: TxnId = 0;

/// Persistent XA identifier for recoverable two-phase commit.
///
/// Survives restarts in the XA record log; the external coordinator resolves
/// in-doubt transactions by this identifier, not by the volatile `TxnId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid(pub u64);

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid_{}", self.0)
    }
}

/// Transaction lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    /// Object exists but the transaction has not touched the engine yet
    NotStarted,
    /// Transaction is active and can perform operations
    Active,
    /// First phase of 2PC completed; waiting for the coordinator's verdict
    Prepared,
    /// Transaction has been committed
    Committed,
    /// Transaction has been rolled back
    RolledBack,
    /// Chosen as a deadlock victim; every engine call fails until the
    /// rollback completes
    ForcedRollback,
}

impl TrxState {
    /// Terminal states may be reused from `NotStarted` by the same session
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrxState::Committed | TrxState::RolledBack)
    }
}

impl fmt::Display for TrxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrxState::NotStarted => "NOT STARTED",
            TrxState::Active => "ACTIVE",
            TrxState::Prepared => "PREPARED",
            TrxState::Committed => "COMMITTED",
            TrxState::RolledBack => "ROLLED BACK",
            TrxState::ForcedRollback => "FORCED ROLLBACK",
        };
        write!(f, "{}", s)
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::RepeatableRead
    }
}

impl IsolationLevel {
    /// Parse isolation level from SQL name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().replace('-', " ").as_str() {
            "READ UNCOMMITTED" => Some(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Some(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Statement-level snapshot contract: at or below READ COMMITTED each
    /// non-locking read gets a fresh MVCC view
    pub fn statement_level_snapshot(&self) -> bool {
        *self <= IsolationLevel::ReadCommitted
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named mid-transaction undo position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    pub undo_pos: UndoPosition,
}

/// Flags that may be written asynchronously by threads other than the owning
/// session (the deadlock resolver, `on_kill`). Kept in an `Arc` of atomics so
/// those writers never need the session's exclusive ownership of the
/// transaction object.
#[derive(Debug, Default)]
pub struct TrxFlags {
    /// Set by the deadlock resolver when this transaction is the victim.
    /// Checked at every engine entry point.
    forced_rollback: AtomicBool,
    /// Exempt from ever being chosen as a deadlock victim (recovery,
    /// background maintenance)
    high_priority: AtomicBool,
    /// Set by `on_kill` to cancel a pending wait for this session only
    kill_pending: AtomicBool,
    /// Currently blocked on a row/table lock or the admission gate
    lock_wait: AtomicBool,
}

impl TrxFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_forced_rollback(&self) {
        self.forced_rollback.store(true, Ordering::Release);
    }

    pub fn is_forced_rollback(&self) -> bool {
        self.forced_rollback.load(Ordering::Acquire)
    }

    /// Cleared only once a full rollback has completed
    pub fn clear_forced_rollback(&self) {
        self.forced_rollback.store(false, Ordering::Release);
    }

    pub fn set_high_priority(&self, value: bool) {
        self.high_priority.store(value, Ordering::Release);
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority.load(Ordering::Acquire)
    }

    pub fn mark_killed(&self) {
        self.kill_pending.store(true, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.kill_pending.load(Ordering::Acquire)
    }

    pub fn clear_killed(&self) {
        self.kill_pending.store(false, Ordering::Release);
    }

    pub fn set_lock_wait(&self, waiting: bool) {
        self.lock_wait.store(waiting, Ordering::Release);
    }

    pub fn in_lock_wait(&self) -> bool {
        self.lock_wait.load(Ordering::Acquire)
    }
}

/// The unit of work: owns isolation level, lock-wait state, savepoint list,
/// and commit/rollback bookkeeping.
///
/// Exclusively owned by one session for its whole lifetime; only the fields
/// behind `flags` are ever touched from other threads.
#[derive(Debug)]
pub struct Transaction {
    /// Assigned when the transaction first starts; `TXN_ID_NONE` before that
    pub id: TxnId,
    /// Persistent identifier, present once registered for 2PC
    pub xid: Option<Xid>,
    /// Current lifecycle state
    pub state: TrxState,
    /// Fixed when the transaction starts unless explicitly reset
    pub isolation: IsolationLevel,
    /// Asynchronously written flags (victim, kill, lock wait)
    pub flags: Arc<TrxFlags>,
    /// Ordered savepoints; names unique (re-declare replaces in place)
    pub savepoints: Vec<Savepoint>,
    /// Undo position marked at the last statement boundary; target of a
    /// statement-level rollback
    pub stmt_undo_pos: Option<UndoPosition>,
    /// Count of autoinc values still to be supplied by a pending bulk insert
    pub n_autoinc_rows: u64,
    /// Upper bound of the last reserved autoinc interval
    pub autoinc_last_value: u64,
    /// Pre-paid admission gate entries remaining
    pub tickets_remaining: u32,
    /// Whether this transaction is counted in the gate's global active count
    pub declared_inside: bool,
    /// Whether the external log coordinator knows about this transaction
    pub registered_with_coordinator: bool,
    /// Whether an MVCC read view is currently open
    pub snapshot_open: bool,
    /// Mirrored session option: run foreign key checks
    pub check_foreign_keys: bool,
    /// Mirrored session option: run unique checks
    pub check_unique: bool,
    /// When the transaction started (diagnostics only)
    pub start_time: Option<SystemTime>,
}

impl Transaction {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            id: TXN_ID_NONE,
            xid: None,
            state: TrxState::NotStarted,
            isolation,
            flags: TrxFlags::new(),
            savepoints: Vec::new(),
            stmt_undo_pos: None,
            n_autoinc_rows: 0,
            autoinc_last_value: 0,
            tickets_remaining: 0,
            declared_inside: false,
            registered_with_coordinator: false,
            snapshot_open: false,
            check_foreign_keys: true,
            check_unique: true,
            start_time: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.id != TXN_ID_NONE && !matches!(self.state, TrxState::NotStarted)
    }

    pub fn is_active(&self) -> bool {
        self.state == TrxState::Active
    }

    /// Close the MVCC read view. The next consistent read opens a fresh one.
    pub fn close_snapshot(&mut self) {
        self.snapshot_open = false;
    }

    /// Find a savepoint position by name
    pub fn savepoint_pos(&self, name: &str) -> Option<UndoPosition> {
        self.savepoints
            .iter()
            .find(|sp| sp.name == name)
            .map(|sp| sp.undo_pos)
    }

    /// Add a savepoint, replacing the undo position if the name already
    /// exists. The list keeps a single entry per name.
    pub fn add_savepoint(&mut self, name: &str, undo_pos: UndoPosition) {
        if let Some(existing) = self.savepoints.iter_mut().find(|sp| sp.name == name) {
            existing.undo_pos = undo_pos;
        } else {
            self.savepoints.push(Savepoint {
                name: name.to_string(),
                undo_pos,
            });
        }
    }

    /// Remove a savepoint by name. Returns its undo position if it existed.
    pub fn remove_savepoint(&mut self, name: &str) -> Option<UndoPosition> {
        let idx = self.savepoints.iter().position(|sp| sp.name == name)?;
        Some(self.savepoints.remove(idx).undo_pos)
    }

    /// Discard savepoints set after the given one (rollback-to-savepoint
    /// invalidates everything younger, but keeps the target itself)
    pub fn truncate_savepoints_after(&mut self, name: &str) {
        if let Some(idx) = self.savepoints.iter().position(|sp| sp.name == name) {
            self.savepoints.truncate(idx + 1);
        }
    }

    /// Reset the object so the same session can reuse it for a new
    /// transaction. Valid only from a terminal state.
    pub fn reset_for_reuse(&mut self) {
        debug_assert!(self.state.is_terminal(), "reuse from non-terminal state");
        self.id = TXN_ID_NONE;
        self.xid = None;
        self.state = TrxState::NotStarted;
        self.savepoints.clear();
        self.stmt_undo_pos = None;
        self.n_autoinc_rows = 0;
        self.autoinc_last_value = 0;
        self.registered_with_coordinator = false;
        self.snapshot_open = false;
        self.start_time = None;
        self.flags.clear_forced_rollback();
        self.flags.clear_killed();
    }
}
