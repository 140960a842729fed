//! Two-phase-commit and savepoint coordinator
//!
//! Drives the state machine transitions that involve the undo log, the
//! external log coordinator, and the durable XA record log: prepare, commit,
//! rollback (whole transaction, statement, or to a savepoint), and startup
//! recovery of in-doubt prepared transactions.
//!
//! Every finalizing commit passes through the commit gate while its outcome
//! records are written, so the coordinator's commit order always matches the
//! engine's durable commit order.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::hooks::{LogCoordinator, UndoLog};
use crate::txn::admission::CommitGate;
use crate::txn::types::{Transaction, TrxState, TxnId, Xid};
use crate::txn::xa::{XaLog, XaOp, XaRecord};

/// An in-doubt transaction surfaced by `recover`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedTransaction {
    pub xid: Xid,
    pub txn_id: TxnId,
}

pub struct TxnCoordinator {
    undo: Arc<dyn UndoLog>,
    log_coord: Arc<dyn LogCoordinator>,
    xa_log: XaLog,
    commit_gate: CommitGate,
    next_xid: AtomicU64,
}

impl TxnCoordinator {
    pub fn new(
        data_dir: &Path,
        undo: Arc<dyn UndoLog>,
        log_coord: Arc<dyn LogCoordinator>,
        commit_concurrency: usize,
    ) -> Result<Self> {
        let xa_log = XaLog::open(data_dir)?;

        // Never hand out an XID already present in the log. A recycled XID
        // would let a new transaction's outcome record resolve a still
        // in-doubt transaction from before the restart.
        let mut next_xid = 1;
        for record in xa_log.scan()? {
            next_xid = next_xid.max(record.xid.0.saturating_add(1));
        }

        Ok(Self {
            undo,
            log_coord,
            xa_log,
            commit_gate: CommitGate::new(commit_concurrency),
            next_xid: AtomicU64::new(next_xid),
        })
    }

    pub fn undo_log(&self) -> &Arc<dyn UndoLog> {
        &self.undo
    }

    /// Announce the transaction to the external coordinator the first time
    /// it does work that can reach a commit
    pub fn register(&self, txn: &mut Transaction) -> Result<()> {
        if txn.registered_with_coordinator {
            return Ok(());
        }
        self.log_coord.register(txn.id)?;
        txn.registered_with_coordinator = true;
        Ok(())
    }

    /// First phase of 2PC. The prepare decision is durable in the XA log
    /// before this returns; after a crash the transaction surfaces from
    /// `recover` until an outcome is recorded.
    pub fn prepare(&self, txn: &mut Transaction) -> Result<()> {
        if txn.flags.is_forced_rollback() {
            return Err(EngineError::ForcedAbort);
        }
        if txn.state != TrxState::Active {
            return Err(EngineError::invalid_state("prepare", txn.state));
        }

        let xid = match txn.xid {
            Some(xid) => xid,
            None => {
                let xid = Xid(self.next_xid.fetch_add(1, Ordering::SeqCst));
                txn.xid = Some(xid);
                xid
            }
        };

        self.register(txn)?;
        self.log_coord.mark_prepared(txn.id)?;
        self.xa_log
            .append(&XaRecord::new(xid, txn.id, XaOp::Prepared))?;

        txn.state = TrxState::Prepared;
        log::info!("trx {} prepared, xid={}", txn.id, xid);
        Ok(())
    }

    /// Commit. With `statement_ended_only` the transaction stays open and
    /// only the statement boundary is recorded: the statement-rollback
    /// target advances and the pending autoinc bookkeeping is settled.
    /// Otherwise the transaction finalizes through the commit gate.
    pub fn commit(&self, txn: &mut Transaction, statement_ended_only: bool) -> Result<()> {
        if txn.flags.is_forced_rollback() {
            return Err(EngineError::ForcedAbort);
        }

        if statement_ended_only {
            if !matches!(txn.state, TrxState::Active | TrxState::NotStarted) {
                return Err(EngineError::invalid_state("end statement of", txn.state));
            }
            if txn.is_started() {
                txn.stmt_undo_pos = Some(self.undo.mark(txn.id)?);
            }
            txn.n_autoinc_rows = 0;
            if txn.isolation.statement_level_snapshot() {
                txn.close_snapshot();
            }
            return Ok(());
        }

        if !matches!(txn.state, TrxState::Active | TrxState::Prepared) {
            return Err(EngineError::invalid_state("commit", txn.state));
        }

        // Outcome records are written inside the gate: coordinator order
        // equals durable commit order
        self.commit_gate.enter();
        let result = self.commit_inside_gate(txn);
        self.commit_gate.exit();
        result?;

        txn.state = TrxState::Committed;
        txn.savepoints.clear();
        txn.stmt_undo_pos = None;
        txn.close_snapshot();
        log::debug!("trx {} committed", txn.id);
        Ok(())
    }

    fn commit_inside_gate(&self, txn: &mut Transaction) -> Result<()> {
        // The external coordinator's outcome record must never trail the
        // engine's own durable commit record: a crash between the two would
        // leave the engine committed while the coordinator could still
        // decide rollback
        if txn.registered_with_coordinator {
            self.log_coord.mark_committed(txn.id)?;
        }
        if txn.state == TrxState::Prepared {
            let xid = txn
                .xid
                .ok_or_else(|| EngineError::Transaction("prepared trx lost its XID".into()))?;
            self.xa_log
                .append(&XaRecord::new(xid, txn.id, XaOp::Committed))?;
        }
        self.undo.release(txn.id)?;
        Ok(())
    }

    /// Roll back the whole transaction. Also the completion path for a
    /// deadlock victim: the forced-rollback flag is cleared only here, once
    /// every mutation has been undone.
    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        match txn.state {
            TrxState::Active | TrxState::Prepared | TrxState::ForcedRollback => {}
            TrxState::NotStarted => {
                // Nothing to undo
                txn.state = TrxState::RolledBack;
                return Ok(());
            }
            state => return Err(EngineError::invalid_state("rollback", state)),
        }

        self.undo.rollback_all(txn.id)?;
        self.undo.release(txn.id)?;

        if let Some(xid) = txn.xid {
            if txn.state == TrxState::Prepared {
                self.xa_log
                    .append(&XaRecord::new(xid, txn.id, XaOp::RolledBack))?;
            }
        }

        txn.state = TrxState::RolledBack;
        txn.savepoints.clear();
        txn.stmt_undo_pos = None;
        txn.close_snapshot();
        txn.flags.clear_forced_rollback();
        log::debug!("trx {} rolled back", txn.id);
        Ok(())
    }

    /// Roll back only the current statement, to the boundary recorded at the
    /// last `commit(statement_ended_only)`. The lock-wait-timeout path when
    /// whole-transaction rollback is not configured.
    pub fn rollback_statement(&self, txn: &mut Transaction) -> Result<()> {
        if txn.state != TrxState::Active {
            return Err(EngineError::invalid_state("roll back statement of", txn.state));
        }
        match txn.stmt_undo_pos {
            Some(pos) => self.undo.rollback_to(txn.id, pos)?,
            None => self.undo.rollback_all(txn.id)?,
        }
        txn.n_autoinc_rows = 0;
        Ok(())
    }

    /// Declare a savepoint at the current undo position. Re-declaring an
    /// existing name moves it.
    pub fn savepoint(&self, txn: &mut Transaction, name: &str) -> Result<()> {
        if txn.flags.is_forced_rollback() {
            return Err(EngineError::ForcedAbort);
        }
        if txn.state != TrxState::Active {
            return Err(EngineError::invalid_state("set a savepoint in", txn.state));
        }
        let pos = self.undo.mark(txn.id)?;
        txn.add_savepoint(name, pos);
        Ok(())
    }

    /// Drop a savepoint without rolling back
    pub fn release_savepoint(&self, txn: &mut Transaction, name: &str) -> Result<()> {
        if txn.state != TrxState::Active {
            return Err(EngineError::invalid_state("release a savepoint in", txn.state));
        }
        txn.remove_savepoint(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::no_such_savepoint(name))
    }

    /// Roll back to a savepoint. Idempotent: repeating the call rolls back
    /// to the same position again. Savepoints set after the target are
    /// discarded, the target itself survives.
    pub fn rollback_to_savepoint(&self, txn: &mut Transaction, name: &str) -> Result<()> {
        if txn.flags.is_forced_rollback() {
            return Err(EngineError::ForcedAbort);
        }
        if txn.state != TrxState::Active {
            return Err(EngineError::invalid_state("roll back to a savepoint in", txn.state));
        }
        let pos = txn
            .savepoint_pos(name)
            .ok_or_else(|| EngineError::no_such_savepoint(name))?;

        self.undo.rollback_to(txn.id, pos)?;
        txn.truncate_savepoints_after(name);
        Ok(())
    }

    /// In-doubt transactions from the durable XA log, for the external
    /// coordinator to resolve after a restart
    pub fn recover(&self) -> Result<Vec<PreparedTransaction>> {
        let pending = self.xa_log.pending_prepared()?;
        if !pending.is_empty() {
            log::info!("{} in-doubt prepared transaction(s) found", pending.len());
        }
        Ok(pending
            .into_iter()
            .map(|r| PreparedTransaction {
                xid: r.xid,
                txn_id: r.txn_id,
            })
            .collect())
    }

    /// Record the outcome for an in-doubt transaction known only from the
    /// XA log (its session and undo state did not survive the restart)
    pub fn resolve_recovered(&self, xid: Xid, txn_id: TxnId, commit: bool) -> Result<()> {
        let op = if commit { XaOp::Committed } else { XaOp::RolledBack };
        self.xa_log.append(&XaRecord::new(xid, txn_id, op))?;
        if !commit {
            self.undo.rollback_all(txn_id)?;
        }
        self.undo.release(txn_id)?;
        log::info!(
            "in-doubt trx {} (xid={}) resolved: {}",
            txn_id,
            xid,
            if commit { "commit" } else { "rollback" }
        );
        Ok(())
    }

    /// Write the XA checkpoint marker; truncates the log when nothing is in
    /// doubt
    pub fn checkpoint(&self) -> Result<()> {
        self.xa_log.checkpoint()
    }
}

#[cfg(test)]
mod tests;
