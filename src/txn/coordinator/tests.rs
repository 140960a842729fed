use super::*;
use crate::hooks::{MemoryUndoLog, RecordingCoordinator};
use crate::txn::registry::TrxRegistry;
use crate::txn::types::IsolationLevel;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::tempdir;

struct Fixture {
    coordinator: TxnCoordinator,
    undo: Arc<MemoryUndoLog>,
    log_coord: Arc<RecordingCoordinator>,
    registry: TrxRegistry,
}

fn setup(dir: &Path) -> Fixture {
    let undo = Arc::new(MemoryUndoLog::new());
    let log_coord = Arc::new(RecordingCoordinator::new());
    let coordinator = TxnCoordinator::new(
        dir,
        Arc::clone(&undo) as Arc<dyn UndoLog>,
        Arc::clone(&log_coord) as Arc<dyn LogCoordinator>,
        0,
    )
    .unwrap();
    Fixture {
        coordinator,
        undo,
        log_coord,
        registry: TrxRegistry::new(),
    }
}

fn started_txn(fx: &Fixture) -> Transaction {
    let mut txn = Transaction::new(IsolationLevel::RepeatableRead);
    fx.registry.start(&mut txn);
    txn
}

#[test]
fn test_prepare_then_commit() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.coordinator.prepare(&mut txn).unwrap();
    assert_eq!(txn.state, TrxState::Prepared);
    assert!(txn.xid.is_some());
    assert_eq!(fx.coordinator.recover().unwrap().len(), 1);

    fx.coordinator.commit(&mut txn, false).unwrap();
    assert_eq!(txn.state, TrxState::Committed);
    assert_eq!(fx.log_coord.committed_order(), vec![txn.id]);
    // Outcome recorded: nothing in doubt anymore
    assert!(fx.coordinator.recover().unwrap().is_empty());
}

#[test]
fn test_prepare_registers_with_coordinator() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.coordinator.prepare(&mut txn).unwrap();
    assert!(txn.registered_with_coordinator);
    assert_eq!(fx.log_coord.registered(), vec![txn.id]);
    assert_eq!(fx.log_coord.prepared(), vec![txn.id]);
}

#[test]
fn test_double_prepare_rejected() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.coordinator.prepare(&mut txn).unwrap();
    let err = fx.coordinator.prepare(&mut txn);
    assert!(err.is_err());
    assert_eq!(txn.state, TrxState::Prepared);
}

#[test]
fn test_commit_without_prepare() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);
    fx.coordinator.register(&mut txn).unwrap();

    fx.coordinator.commit(&mut txn, false).unwrap();
    assert_eq!(txn.state, TrxState::Committed);
    assert_eq!(fx.log_coord.committed_order(), vec![txn.id]);
    // No prepare: XA log never involved
    assert!(fx.coordinator.recover().unwrap().is_empty());
}

#[test]
fn test_statement_boundary_keeps_transaction_open() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.undo.record_mutation(txn.id);
    fx.undo.record_mutation(txn.id);
    fx.coordinator.commit(&mut txn, true).unwrap();

    assert_eq!(txn.state, TrxState::Active);
    assert_eq!(txn.stmt_undo_pos, Some(2));
    assert_eq!(txn.n_autoinc_rows, 0);
}

#[test]
fn test_statement_rollback_targets_boundary() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.undo.record_mutation(txn.id);
    fx.coordinator.commit(&mut txn, true).unwrap();
    let boundary = txn.stmt_undo_pos.unwrap();

    fx.undo.record_mutation(txn.id);
    fx.undo.record_mutation(txn.id);
    fx.coordinator.rollback_statement(&mut txn).unwrap();

    assert_eq!(fx.undo.rollbacks_for(txn.id), vec![boundary]);
    assert_eq!(txn.state, TrxState::Active);
}

#[test]
fn test_rollback_whole_transaction() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.undo.record_mutation(txn.id);
    fx.coordinator.rollback(&mut txn).unwrap();

    assert_eq!(txn.state, TrxState::RolledBack);
    assert_eq!(fx.undo.rollbacks_for(txn.id), vec![0]);
    assert!(txn.savepoints.is_empty());
}

#[test]
fn test_rollback_completes_victim() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);
    txn.flags.mark_forced_rollback();
    txn.state = TrxState::ForcedRollback;

    // Every forward operation fails while the victim flag is set
    assert!(matches!(
        fx.coordinator.commit(&mut txn, false),
        Err(EngineError::ForcedAbort)
    ));
    assert!(matches!(
        fx.coordinator.savepoint(&mut txn, "sp"),
        Err(EngineError::ForcedAbort)
    ));

    // Rollback is the only way out, and it clears the flag
    fx.coordinator.rollback(&mut txn).unwrap();
    assert_eq!(txn.state, TrxState::RolledBack);
    assert!(!txn.flags.is_forced_rollback());
}

#[test]
fn test_commit_in_terminal_state_rejected() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.coordinator.commit(&mut txn, false).unwrap();
    let err = fx.coordinator.commit(&mut txn, false).unwrap_err();
    assert!(matches!(err, EngineError::Transaction(_)));

    let err = fx.coordinator.rollback(&mut txn).unwrap_err();
    assert!(matches!(err, EngineError::Transaction(_)));
}

#[test]
fn test_savepoint_rollback_and_release() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.undo.record_mutation(txn.id);
    fx.coordinator.savepoint(&mut txn, "a").unwrap();
    let pos_a = txn.savepoint_pos("a").unwrap();

    fx.undo.record_mutation(txn.id);
    fx.coordinator.savepoint(&mut txn, "b").unwrap();
    fx.undo.record_mutation(txn.id);

    fx.coordinator.rollback_to_savepoint(&mut txn, "a").unwrap();
    assert_eq!(fx.undo.rollbacks_for(txn.id), vec![pos_a]);
    // Target survives, younger savepoints are gone
    assert!(txn.savepoint_pos("a").is_some());
    assert!(txn.savepoint_pos("b").is_none());

    fx.coordinator.release_savepoint(&mut txn, "a").unwrap();
    assert!(txn.savepoint_pos("a").is_none());
}

#[test]
fn test_rollback_to_savepoint_is_idempotent() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.undo.record_mutation(txn.id);
    fx.coordinator.savepoint(&mut txn, "a").unwrap();
    let pos = txn.savepoint_pos("a").unwrap();

    fx.undo.record_mutation(txn.id);
    fx.coordinator.rollback_to_savepoint(&mut txn, "a").unwrap();
    fx.coordinator.rollback_to_savepoint(&mut txn, "a").unwrap();

    assert_eq!(fx.undo.rollbacks_for(txn.id), vec![pos, pos]);
}

#[test]
fn test_unknown_savepoint_leaves_state_untouched() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);
    fx.coordinator.savepoint(&mut txn, "a").unwrap();

    let err = fx.coordinator.rollback_to_savepoint(&mut txn, "nope").unwrap_err();
    assert!(matches!(err, EngineError::NoSuchSavepoint(_)));
    assert_eq!(err.mysql_error_code(), 1305);

    let err = fx.coordinator.release_savepoint(&mut txn, "nope").unwrap_err();
    assert!(matches!(err, EngineError::NoSuchSavepoint(_)));

    assert_eq!(txn.state, TrxState::Active);
    assert!(txn.savepoint_pos("a").is_some());
    assert!(fx.undo.rollbacks_for(txn.id).is_empty());
}

#[test]
fn test_redeclared_savepoint_moves() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.coordinator.savepoint(&mut txn, "a").unwrap();
    fx.undo.record_mutation(txn.id);
    fx.coordinator.savepoint(&mut txn, "a").unwrap();

    assert_eq!(txn.savepoints.len(), 1);
    assert_eq!(txn.savepoint_pos("a"), Some(1));
}

#[test]
fn test_recover_survives_restart() {
    let dir = tempdir().unwrap();
    let txn_id;
    let xid;
    {
        let fx = setup(dir.path());
        let mut txn = started_txn(&fx);
        fx.coordinator.prepare(&mut txn).unwrap();
        txn_id = txn.id;
        xid = txn.xid.unwrap();
        // Crash: transaction never reaches an outcome
    }

    let fx = setup(dir.path());
    let pending = fx.coordinator.recover().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].xid, xid);
    assert_eq!(pending[0].txn_id, txn_id);

    fx.coordinator.resolve_recovered(xid, txn_id, false).unwrap();
    assert!(fx.coordinator.recover().unwrap().is_empty());
    assert_eq!(fx.undo.rollbacks_for(txn_id), vec![0]);
}

#[test]
fn test_xid_allocation_resumes_past_logged_xids() {
    let dir = tempdir().unwrap();
    let old_xid;
    {
        let fx = setup(dir.path());
        let mut txn = started_txn(&fx);
        fx.coordinator.prepare(&mut txn).unwrap();
        old_xid = txn.xid.unwrap();
        // Crash: the transaction stays in doubt
    }

    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);
    fx.coordinator.prepare(&mut txn).unwrap();
    let new_xid = txn.xid.unwrap();
    assert_ne!(new_xid, old_xid);
    assert!(new_xid.0 > old_xid.0);

    // Resolving the new transaction must leave the old one in doubt
    fx.coordinator.commit(&mut txn, false).unwrap();
    let pending = fx.coordinator.recover().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].xid, old_xid);
}

/// Coordinator that records, at `mark_committed` time, whether the engine
/// had already made its own commit record durable.
struct CommitRecordWatch {
    data_dir: PathBuf,
    engine_record_seen: Mutex<Option<bool>>,
}

impl LogCoordinator for CommitRecordWatch {
    fn register(&self, _txn_id: TxnId) -> Result<()> {
        Ok(())
    }

    fn mark_prepared(&self, _txn_id: TxnId) -> Result<()> {
        Ok(())
    }

    fn mark_committed(&self, txn_id: TxnId) -> Result<()> {
        let log = XaLog::open(&self.data_dir)?;
        let durable = log
            .scan()?
            .iter()
            .any(|r| r.txn_id == txn_id && r.op == XaOp::Committed);
        *self.engine_record_seen.lock().unwrap() = Some(durable);
        Ok(())
    }
}

#[test]
fn test_outcome_reaches_coordinator_before_engine_commit_record() {
    let dir = tempdir().unwrap();
    let watch = Arc::new(CommitRecordWatch {
        data_dir: dir.path().to_path_buf(),
        engine_record_seen: Mutex::new(None),
    });
    let undo = Arc::new(MemoryUndoLog::new());
    let coordinator = TxnCoordinator::new(
        dir.path(),
        undo as Arc<dyn UndoLog>,
        Arc::clone(&watch) as Arc<dyn LogCoordinator>,
        0,
    )
    .unwrap();
    let registry = TrxRegistry::new();
    let mut txn = Transaction::new(IsolationLevel::RepeatableRead);
    registry.start(&mut txn);

    coordinator.prepare(&mut txn).unwrap();
    coordinator.commit(&mut txn, false).unwrap();

    // The callback fired and found no durable engine commit record yet
    assert_eq!(*watch.engine_record_seen.lock().unwrap(), Some(false));
}

#[test]
fn test_checkpoint_after_resolution() {
    let dir = tempdir().unwrap();
    let fx = setup(dir.path());
    let mut txn = started_txn(&fx);

    fx.coordinator.prepare(&mut txn).unwrap();
    fx.coordinator.commit(&mut txn, false).unwrap();
    fx.coordinator.checkpoint().unwrap();

    // Reopen: truncated log, nothing pending
    let fx2 = setup(dir.path());
    assert!(fx2.coordinator.recover().unwrap().is_empty());
}
