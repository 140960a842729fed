//! Boundary interfaces to external collaborators.
//!
//! The transactional core does not own row storage, the undo log, or the
//! replication log; it drives them through these traits, similar to how the
//! query layer drives storage engines through a uniform handler API. Simple
//! in-memory implementations are provided for embedding and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::txn::TxnId;

/// Opaque position in the undo log. Mutations after a position can be
/// discarded by rolling back to it.
pub type UndoPosition = u64;

/// The undo (rollback) log owned by the storage layer.
///
/// Must be callable from any session thread; implementations serialize
/// internally.
pub trait UndoLog: Send + Sync {
    /// Record the current undo position for a transaction. Savepoints and
    /// statement boundaries are both marked this way.
    fn mark(&self, txn_id: TxnId) -> Result<UndoPosition>;

    /// Discard all mutations made by the transaction after `pos`
    fn rollback_to(&self, txn_id: TxnId, pos: UndoPosition) -> Result<()>;

    /// Discard every mutation made by the transaction
    fn rollback_all(&self, txn_id: TxnId) -> Result<()>;

    /// Release undo records up to `pos`; called when a transaction
    /// finalizes and its undo mutations are no longer needed
    fn release(&self, txn_id: TxnId) -> Result<()>;
}

/// The external transaction coordinator (replication/binary log).
///
/// The engine guarantees that the coordinator's record of an outcome is
/// written no later than the engine's own durable commit record.
pub trait LogCoordinator: Send + Sync {
    /// Announce a transaction that may later prepare/commit
    fn register(&self, txn_id: TxnId) -> Result<()>;

    /// Record the prepare decision (first phase of 2PC)
    fn mark_prepared(&self, txn_id: TxnId) -> Result<()>;

    /// Record the final outcome
    fn mark_committed(&self, txn_id: TxnId) -> Result<()>;
}

/// In-memory undo log. Tracks a global position counter and, per transaction,
/// the list of positions still live; good enough for tests and for embedders
/// whose storage layer keeps its own undo information.
#[derive(Debug, Default)]
pub struct MemoryUndoLog {
    inner: Mutex<MemoryUndoState>,
}

#[derive(Debug, Default)]
struct MemoryUndoState {
    next_pos: UndoPosition,
    /// Per transaction: current logical undo position
    cursors: HashMap<TxnId, UndoPosition>,
    /// Rollback targets observed, for test assertions
    rollbacks: Vec<(TxnId, UndoPosition)>,
}

impl MemoryUndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the transaction's undo cursor, as a mutation would
    pub fn record_mutation(&self, txn_id: TxnId) {
        let mut state = self.inner.lock().expect("undo log lock poisoned");
        state.next_pos += 1;
        let pos = state.next_pos;
        state.cursors.insert(txn_id, pos);
    }

    /// Positions this transaction was rolled back to, oldest first
    pub fn rollbacks_for(&self, txn_id: TxnId) -> Vec<UndoPosition> {
        let state = self.inner.lock().expect("undo log lock poisoned");
        state
            .rollbacks
            .iter()
            .filter(|(id, _)| *id == txn_id)
            .map(|(_, pos)| *pos)
            .collect()
    }

    /// Current undo cursor for a transaction (0 if it never mutated)
    pub fn cursor(&self, txn_id: TxnId) -> UndoPosition {
        let state = self.inner.lock().expect("undo log lock poisoned");
        state.cursors.get(&txn_id).copied().unwrap_or(0)
    }
}

impl UndoLog for MemoryUndoLog {
    fn mark(&self, txn_id: TxnId) -> Result<UndoPosition> {
        let state = self.inner.lock().expect("undo log lock poisoned");
        Ok(state.cursors.get(&txn_id).copied().unwrap_or(0))
    }

    fn rollback_to(&self, txn_id: TxnId, pos: UndoPosition) -> Result<()> {
        let mut state = self.inner.lock().expect("undo log lock poisoned");
        state.rollbacks.push((txn_id, pos));
        state.cursors.insert(txn_id, pos);
        Ok(())
    }

    fn rollback_all(&self, txn_id: TxnId) -> Result<()> {
        let mut state = self.inner.lock().expect("undo log lock poisoned");
        state.rollbacks.push((txn_id, 0));
        state.cursors.insert(txn_id, 0);
        Ok(())
    }

    fn release(&self, txn_id: TxnId) -> Result<()> {
        let mut state = self.inner.lock().expect("undo log lock poisoned");
        state.cursors.remove(&txn_id);
        Ok(())
    }
}

/// Coordinator stub that records the order of callbacks it receives.
/// Commit ordering tests assert against `committed_order`.
#[derive(Debug, Default)]
pub struct RecordingCoordinator {
    inner: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    registered: Vec<TxnId>,
    prepared: Vec<TxnId>,
    committed: Vec<TxnId>,
}

impl RecordingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<TxnId> {
        self.inner.lock().expect("coordinator lock poisoned").registered.clone()
    }

    pub fn prepared(&self) -> Vec<TxnId> {
        self.inner.lock().expect("coordinator lock poisoned").prepared.clone()
    }

    pub fn committed_order(&self) -> Vec<TxnId> {
        self.inner.lock().expect("coordinator lock poisoned").committed.clone()
    }
}

impl LogCoordinator for RecordingCoordinator {
    fn register(&self, txn_id: TxnId) -> Result<()> {
        self.inner
            .lock()
            .expect("coordinator lock poisoned")
            .registered
            .push(txn_id);
        Ok(())
    }

    fn mark_prepared(&self, txn_id: TxnId) -> Result<()> {
        self.inner
            .lock()
            .expect("coordinator lock poisoned")
            .prepared
            .push(txn_id);
        Ok(())
    }

    fn mark_committed(&self, txn_id: TxnId) -> Result<()> {
        self.inner
            .lock()
            .expect("coordinator lock poisoned")
            .committed
            .push(txn_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_undo_log_mark_and_rollback() {
        let undo = MemoryUndoLog::new();
        assert_eq!(undo.mark(1).unwrap(), 0);

        undo.record_mutation(1);
        undo.record_mutation(1);
        let pos = undo.mark(1).unwrap();
        assert_eq!(pos, 2);

        undo.record_mutation(1);
        undo.rollback_to(1, pos).unwrap();
        assert_eq!(undo.mark(1).unwrap(), pos);
        assert_eq!(undo.rollbacks_for(1), vec![pos]);
    }

    #[test]
    fn test_memory_undo_log_release_forgets_cursor() {
        let undo = MemoryUndoLog::new();
        undo.record_mutation(5);
        assert!(undo.cursor(5) > 0);
        undo.release(5).unwrap();
        assert_eq!(undo.cursor(5), 0);
    }

    #[test]
    fn test_recording_coordinator_orders() {
        let coord = RecordingCoordinator::new();
        coord.register(1).unwrap();
        coord.register(2).unwrap();
        coord.mark_prepared(2).unwrap();
        coord.mark_committed(2).unwrap();
        coord.mark_committed(1).unwrap();

        assert_eq!(coord.registered(), vec![1, 2]);
        assert_eq!(coord.prepared(), vec![2]);
        assert_eq!(coord.committed_order(), vec![2, 1]);
    }
}
