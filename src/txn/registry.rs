//! Session-to-transaction registry
//!
//! Tracks which transactions exist, hands out transaction IDs, and keeps the
//! shared flag blocks reachable by session and by transaction ID so the
//! deadlock resolver and `KILL` handling can signal a transaction they do not
//! own. Also parks prepared transactions whose session disconnected until an
//! external coordinator resolves them by XID.
//!
//! The transaction object itself is exclusively owned by its session thread
//! and never lives here; the registry holds only `Arc<TrxFlags>` clones plus
//! the detached (ownerless) prepared transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::error::{EngineError, Result};
use crate::session::SessionId;
use crate::txn::types::{Transaction, TrxFlags, TrxState, TxnId, Xid, TXN_ID_NONE};

#[derive(Debug)]
pub struct TrxRegistry {
    /// Next transaction ID; 0 is reserved for "none"
    next_txn_id: AtomicU64,
    /// Flags of each connected session's current transaction object
    sessions: Mutex<HashMap<SessionId, Arc<TrxFlags>>>,
    /// Flags of every started, not yet finished transaction
    active: Mutex<HashMap<TxnId, Arc<TrxFlags>>>,
    /// Prepared transactions that outlived their session, keyed by XID
    detached: Mutex<HashMap<Xid, Box<Transaction>>>,
}

impl TrxRegistry {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            detached: Mutex::new(HashMap::new()),
        }
    }

    /// Make a session's transaction flags reachable for `KILL`
    pub fn register_session(&self, session_id: SessionId, flags: Arc<TrxFlags>) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions.insert(session_id, flags);
    }

    pub fn drop_session(&self, session_id: SessionId) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions.remove(&session_id);
    }

    pub fn flags_for_session(&self, session_id: SessionId) -> Option<Arc<TrxFlags>> {
        let sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions.get(&session_id).cloned()
    }

    pub fn flags_for_txn(&self, txn_id: TxnId) -> Option<Arc<TrxFlags>> {
        let active = self.active.lock().expect("registry lock poisoned");
        active.get(&txn_id).cloned()
    }

    /// Assign an ID and move the transaction to `Active`. Idempotent for an
    /// already started transaction.
    pub fn start(&self, txn: &mut Transaction) {
        if txn.is_started() {
            return;
        }
        debug_assert_eq!(txn.id, TXN_ID_NONE);
        txn.id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        txn.state = TrxState::Active;
        txn.start_time = Some(SystemTime::now());

        let mut active = self.active.lock().expect("registry lock poisoned");
        active.insert(txn.id, Arc::clone(&txn.flags));
        log::debug!("trx {} started ({})", txn.id, txn.isolation);
    }

    /// Forget a finished transaction. Called after commit or rollback moved
    /// it to a terminal state.
    pub fn finish(&self, txn: &Transaction) {
        debug_assert!(txn.state.is_terminal(), "finish from non-terminal state");
        if txn.id == TXN_ID_NONE {
            return;
        }
        let mut active = self.active.lock().expect("registry lock poisoned");
        active.remove(&txn.id);
    }

    /// Choose a transaction as deadlock victim. Returns false when the
    /// transaction is unknown or exempt (high priority); the resolver must
    /// then pick another victim.
    pub fn mark_victim(&self, txn_id: TxnId) -> bool {
        let flags = match self.flags_for_txn(txn_id) {
            Some(flags) => flags,
            None => return false,
        };
        if flags.is_high_priority() {
            return false;
        }
        flags.mark_forced_rollback();
        log::info!("trx {} chosen as deadlock victim", txn_id);
        true
    }

    /// Park a prepared transaction whose session is going away. The session
    /// hands over ownership; the transaction stays resolvable by XID.
    pub fn detach(&self, txn: Box<Transaction>) -> Result<()> {
        if txn.state != TrxState::Prepared {
            return Err(EngineError::invalid_state("detach", txn.state));
        }
        let xid = txn
            .xid
            .ok_or_else(|| EngineError::Transaction("prepared transaction has no XID".into()))?;

        let mut detached = self.detached.lock().expect("registry lock poisoned");
        detached.insert(xid, txn);
        log::info!("prepared trx parked for external resolution, xid={}", xid);
        Ok(())
    }

    /// Reclaim a parked prepared transaction for commit or rollback
    pub fn resume(&self, xid: Xid) -> Option<Box<Transaction>> {
        let mut detached = self.detached.lock().expect("registry lock poisoned");
        detached.remove(&xid)
    }

    /// XIDs of every parked prepared transaction
    pub fn detached_xids(&self) -> Vec<Xid> {
        let detached = self.detached.lock().expect("registry lock poisoned");
        detached.keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::types::IsolationLevel;

    #[test]
    fn test_start_assigns_monotonic_ids() {
        let registry = TrxRegistry::new();
        let mut a = Transaction::new(IsolationLevel::RepeatableRead);
        let mut b = Transaction::new(IsolationLevel::RepeatableRead);

        registry.start(&mut a);
        registry.start(&mut b);
        assert!(a.id >= 1);
        assert!(b.id > a.id);
        assert_eq!(a.state, TrxState::Active);
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_start_is_idempotent() {
        let registry = TrxRegistry::new();
        let mut txn = Transaction::new(IsolationLevel::RepeatableRead);
        registry.start(&mut txn);
        let id = txn.id;
        registry.start(&mut txn);
        assert_eq!(txn.id, id);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_finish_removes_from_active() {
        let registry = TrxRegistry::new();
        let mut txn = Transaction::new(IsolationLevel::RepeatableRead);
        registry.start(&mut txn);
        let id = txn.id;

        txn.state = TrxState::Committed;
        registry.finish(&txn);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.flags_for_txn(id).is_none());
    }

    #[test]
    fn test_mark_victim_sets_flag() {
        let registry = TrxRegistry::new();
        let mut txn = Transaction::new(IsolationLevel::RepeatableRead);
        registry.start(&mut txn);

        assert!(registry.mark_victim(txn.id));
        assert!(txn.flags.is_forced_rollback());
    }

    #[test]
    fn test_mark_victim_skips_high_priority() {
        let registry = TrxRegistry::new();
        let mut txn = Transaction::new(IsolationLevel::RepeatableRead);
        registry.start(&mut txn);
        txn.flags.set_high_priority(true);

        assert!(!registry.mark_victim(txn.id));
        assert!(!txn.flags.is_forced_rollback());
    }

    #[test]
    fn test_mark_victim_unknown_txn() {
        let registry = TrxRegistry::new();
        assert!(!registry.mark_victim(999));
    }

    #[test]
    fn test_session_flags_lookup() {
        let registry = TrxRegistry::new();
        let txn = Transaction::new(IsolationLevel::RepeatableRead);
        registry.register_session(7, Arc::clone(&txn.flags));

        let flags = registry.flags_for_session(7).unwrap();
        flags.mark_killed();
        assert!(txn.flags.is_killed());

        registry.drop_session(7);
        assert!(registry.flags_for_session(7).is_none());
    }

    #[test]
    fn test_detach_requires_prepared() {
        let registry = TrxRegistry::new();
        let mut txn = Box::new(Transaction::new(IsolationLevel::RepeatableRead));
        registry.start(&mut txn);
        // Active, not prepared
        assert!(registry.detach(txn).is_err());
    }

    #[test]
    fn test_detach_and_resume_by_xid() {
        let registry = TrxRegistry::new();
        let mut txn = Box::new(Transaction::new(IsolationLevel::RepeatableRead));
        registry.start(&mut txn);
        txn.xid = Some(Xid(42));
        txn.state = TrxState::Prepared;
        let id = txn.id;

        registry.detach(txn).unwrap();
        assert_eq!(registry.detached_xids(), vec![Xid(42)]);

        let resumed = registry.resume(Xid(42)).unwrap();
        assert_eq!(resumed.id, id);
        assert_eq!(resumed.state, TrxState::Prepared);
        assert!(registry.resume(Xid(42)).is_none());
    }
}
