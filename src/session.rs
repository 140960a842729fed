//! Per-connection session context
//!
//! One `SessionContext` per client connection, exclusively owned by the
//! session's thread. The transaction object it carries is created lazily on
//! first use and reused across transactions on the same connection; only the
//! `Arc<TrxFlags>` inside it is ever shared with other threads.

use crate::txn::locking::LockMode;
use crate::txn::types::{IsolationLevel, Transaction};

/// Connection identifier assigned by the query layer
pub type SessionId = u64;

#[derive(Debug)]
pub struct SessionContext {
    pub id: SessionId,
    /// The session's transaction object; `None` until first engine contact,
    /// or after a prepared transaction was detached for external resolution
    pub txn: Option<Box<Transaction>>,
    /// Isolation level for the next transaction
    pub isolation: IsolationLevel,
    /// Inside an explicit BEGIN ... COMMIT block
    pub in_explicit_txn: bool,
    /// Lock mode decided for the statement in progress
    pub lock_mode: LockMode,
    /// Saved lock mode, restored at statement end. Independent of
    /// `lock_mode` so nested negotiation inside one statement cannot
    /// clobber the restore value.
    pub stored_lock_mode: LockMode,
    /// First value of the last auto-increment reservation
    pub last_insert_id: u64,
    /// Session options mirrored into the transaction when it starts
    pub check_foreign_keys: bool,
    pub check_unique: bool,
}

impl SessionContext {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            txn: None,
            isolation: IsolationLevel::default(),
            in_explicit_txn: false,
            lock_mode: LockMode::None,
            stored_lock_mode: LockMode::None,
            last_insert_id: 0,
            check_foreign_keys: true,
            check_unique: true,
        }
    }

    /// The session's transaction object, created on first use. Creation
    /// allocates only; the transaction starts when it first touches the
    /// engine.
    pub fn transaction(&mut self) -> &mut Transaction {
        self.txn.get_or_insert_with(|| {
            let mut txn = Box::new(Transaction::new(self.isolation));
            txn.check_foreign_keys = self.check_foreign_keys;
            txn.check_unique = self.check_unique;
            txn
        })
    }

    /// Save the current lock mode so statement end can restore it
    pub fn store_lock_mode(&mut self) {
        self.stored_lock_mode = self.lock_mode;
    }

    pub fn restore_lock_mode(&mut self) {
        self.lock_mode = self.stored_lock_mode;
    }
}
