//! Engine facade
//!
//! The handler surface the query layer drives: connection lifecycle,
//! statement begin/end, lock mode negotiation, auto-increment reservation,
//! transaction control, 2PC, savepoints, and crash recovery. One `Engine` per
//! process; sessions call in concurrently, each from its own thread, holding
//! exclusive ownership of its `SessionContext`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::hooks::{LogCoordinator, UndoLog};
use crate::session::{SessionContext, SessionId};
use crate::txn::admission::{AdmissionGate, CallerClass};
use crate::txn::autoinc::{AutoincRegistry, AutoincReservation};
use crate::txn::coordinator::{PreparedTransaction, TxnCoordinator};
use crate::txn::locking::{select_lock_mode, LockMode, LockPolicy, LockRequest};
use crate::txn::registry::TrxRegistry;
use crate::txn::types::{IsolationLevel, Transaction, TrxState, TxnId, Xid};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the XA record log and checkpoint marker
    pub data_dir: PathBuf,
    /// Admission gate limit; 0 disables admission control
    pub concurrency_limit: usize,
    /// Pre-paid gate tickets granted per admitted entry
    pub concurrency_tickets: u32,
    /// How long a background caller waits at a saturated gate (milliseconds)
    pub busy_wait_ms: u64,
    /// Commit gate parallelism; 0 = unlimited
    pub commit_concurrency: usize,
    /// Roll back the whole transaction on lock wait timeout instead of just
    /// the current statement
    pub rollback_on_timeout: bool,
    pub lock_policy: LockPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./basalt_data"),
            concurrency_limit: 0,
            concurrency_tickets: 500,
            busy_wait_ms: 100,
            commit_concurrency: 0,
            rollback_on_timeout: false,
            lock_policy: LockPolicy::default(),
        }
    }
}

impl Config {
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Admission-controlled preset for hosts where unbounded concurrency
    /// degrades throughput
    pub fn gated(limit: usize) -> Self {
        Self {
            concurrency_limit: limit,
            ..Default::default()
        }
    }

    /// Preset matching deployments that want a lock wait timeout to abort
    /// the whole transaction
    pub fn strict_timeouts() -> Self {
        Self {
            rollback_on_timeout: true,
            ..Default::default()
        }
    }
}

pub struct Engine {
    config: Config,
    registry: TrxRegistry,
    gate: AdmissionGate,
    coordinator: TxnCoordinator,
    autoinc: AutoincRegistry,
}

impl Engine {
    pub fn new(
        config: Config,
        undo: Arc<dyn UndoLog>,
        log_coord: Arc<dyn LogCoordinator>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let coordinator = TxnCoordinator::new(
            &config.data_dir,
            undo,
            log_coord,
            config.commit_concurrency,
        )?;
        let gate = AdmissionGate::new(
            config.concurrency_limit,
            config.concurrency_tickets,
            Duration::from_millis(config.busy_wait_ms),
        );
        log::info!(
            "engine initialized, data_dir={:?}, concurrency_limit={}",
            config.data_dir,
            config.concurrency_limit
        );
        Ok(Self {
            config,
            registry: TrxRegistry::new(),
            gate,
            coordinator,
            autoinc: AutoincRegistry::new(),
        })
    }

    // ---- connection lifecycle ----

    pub fn on_connect(&self, session_id: SessionId) -> SessionContext {
        log::debug!("session {} connected", session_id);
        SessionContext::new(session_id)
    }

    /// Tear a session down. An active transaction rolls back; a prepared one
    /// survives the disconnect, parked in the registry for the external
    /// coordinator to resolve by XID.
    pub fn on_disconnect(&self, session: &mut SessionContext) -> Result<()> {
        if let Some(mut txn) = session.txn.take() {
            self.gate.force_exit(&mut txn);
            match txn.state {
                TrxState::Prepared => {
                    self.registry.detach(txn)?;
                }
                TrxState::Active | TrxState::ForcedRollback => {
                    log::info!(
                        "session {} disconnected with trx {} open, rolling back",
                        session.id,
                        txn.id
                    );
                    self.coordinator.rollback(&mut txn)?;
                    self.registry.finish(&txn);
                }
                _ => {}
            }
        }
        self.registry.drop_session(session.id);
        session.in_explicit_txn = false;
        Ok(())
    }

    /// `KILL` a session: its next engine entry (or current gate wait) fails
    /// with `Interrupted`. Safe to call from any thread.
    pub fn on_kill(&self, session_id: SessionId) {
        if let Some(flags) = self.registry.flags_for_session(session_id) {
            flags.mark_killed();
            self.gate.kick_waiters();
            log::info!("kill requested for session {}", session_id);
        }
    }

    /// Apply the deadlock resolver's verdict to a transaction. Returns false
    /// when the transaction is unknown or exempt; the resolver must pick
    /// another victim.
    pub fn force_rollback(&self, txn_id: TxnId) -> bool {
        let marked = self.registry.mark_victim(txn_id);
        if marked {
            self.gate.kick_waiters();
        }
        marked
    }

    // ---- statement lifecycle ----

    /// Enter the engine for one statement: start the transaction if needed,
    /// announce it to the external coordinator, and pass the admission gate.
    pub fn begin_statement(&self, session: &mut SessionContext, class: CallerClass) -> Result<()> {
        session.store_lock_mode();
        let txn = self.ensure_started(session)?;
        self.gate.enter(txn, class)
    }

    /// Statement completed: record the statement boundary (the target of a
    /// statement-level rollback), settle pending autoinc bookkeeping, leave
    /// the gate, and restore the saved lock mode.
    pub fn end_statement(&self, session: &mut SessionContext) -> Result<()> {
        let result = match session.txn.as_deref_mut() {
            Some(txn) if txn.is_started() => {
                let result = self.coordinator.commit(txn, true);
                self.gate.exit(txn);
                result
            }
            _ => Ok(()),
        };
        session.restore_lock_mode();
        result
    }

    /// Negotiate the lock mode for one table reference and record it on the
    /// session. A consistent read at statement-level-snapshot isolation
    /// closes the current MVCC view so the next read opens a fresh one.
    pub fn acquire_table_lock(
        &self,
        session: &mut SessionContext,
        req: &LockRequest,
    ) -> Result<LockMode> {
        let in_explicit_txn = session.in_explicit_txn;
        let txn = self.ensure_started(session)?;

        let mode = select_lock_mode(req, txn.isolation, in_explicit_txn, &self.config.lock_policy);
        if mode == LockMode::None {
            if txn.isolation.statement_level_snapshot() {
                txn.close_snapshot();
            }
            txn.snapshot_open = true;
        }
        session.lock_mode = mode;
        Ok(mode)
    }

    /// Reserve auto-increment values for a table under its serialization
    /// point
    pub fn get_autoinc(
        &self,
        session: &mut SessionContext,
        table: &str,
        need: u64,
        step: u64,
        offset: u64,
        max_value: u64,
    ) -> Result<AutoincReservation> {
        let txn = self.ensure_started(session)?;
        let counter = self.autoinc.counter(table);
        let reservation = counter.reserve(table, need, step, offset, max_value)?;

        txn.n_autoinc_rows = reservation.reserved_count;
        txn.autoinc_last_value = reservation.last_value;
        session.last_insert_id = reservation.first_value;
        Ok(reservation)
    }

    /// Forget a table's auto-increment counter (DROP/TRUNCATE)
    pub fn reset_autoinc(&self, table: &str) {
        self.autoinc.forget(table);
    }

    // ---- transaction control ----

    /// Explicit BEGIN. Any transaction already open on the session is
    /// committed first, as the SQL layer mandates.
    pub fn begin(
        &self,
        session: &mut SessionContext,
        isolation: Option<IsolationLevel>,
    ) -> Result<()> {
        if session.txn.as_ref().map_or(false, |t| t.is_started()) {
            self.commit(session)?;
        }
        if let Some(level) = isolation {
            session.isolation = level;
        }
        session.in_explicit_txn = true;
        self.ensure_started(session)?;
        Ok(())
    }

    /// Finalize the session's transaction. No-op when nothing started.
    pub fn commit(&self, session: &mut SessionContext) -> Result<()> {
        match session.txn.as_deref_mut() {
            Some(txn) if txn.is_started() => {
                self.coordinator.commit(txn, false)?;
                self.gate.force_exit(txn);
                self.registry.finish(txn);
                txn.reset_for_reuse();
            }
            _ => {}
        }
        session.in_explicit_txn = false;
        Ok(())
    }

    /// Roll back the session's transaction. Also the path a session takes
    /// after any call returned `ForcedAbort`.
    pub fn rollback(&self, session: &mut SessionContext) -> Result<()> {
        match session.txn.as_deref_mut() {
            Some(txn) if txn.is_started() => {
                self.coordinator.rollback(txn)?;
                self.gate.force_exit(txn);
                self.registry.finish(txn);
                txn.reset_for_reuse();
            }
            _ => {}
        }
        session.in_explicit_txn = false;
        Ok(())
    }

    /// First phase of 2PC for the session's transaction
    pub fn prepare(&self, session: &mut SessionContext) -> Result<()> {
        let txn = self.ensure_started(session)?;
        self.coordinator.prepare(txn)
    }

    /// A lock wait exceeded the configured bound. Applies the configured
    /// rollback scope and returns the error the caller should surface.
    pub fn on_lock_wait_timeout(&self, session: &mut SessionContext) -> EngineError {
        let result = if self.config.rollback_on_timeout {
            self.rollback(session)
        } else {
            match session.txn.as_deref_mut() {
                Some(txn) if txn.is_active() => self.coordinator.rollback_statement(txn),
                _ => Ok(()),
            }
        };
        if let Err(e) = result {
            log::warn!("rollback after lock wait timeout failed: {}", e);
        }
        EngineError::LockWaitTimeout
    }

    // ---- savepoints ----

    pub fn savepoint(&self, session: &mut SessionContext, name: &str) -> Result<()> {
        let txn = self.ensure_started(session)?;
        self.coordinator.savepoint(txn, name)
    }

    pub fn release_savepoint(&self, session: &mut SessionContext, name: &str) -> Result<()> {
        match session.txn.as_deref_mut() {
            Some(txn) if txn.is_started() => self.coordinator.release_savepoint(txn, name),
            _ => Err(EngineError::no_such_savepoint(name)),
        }
    }

    pub fn rollback_to_savepoint(&self, session: &mut SessionContext, name: &str) -> Result<()> {
        match session.txn.as_deref_mut() {
            Some(txn) if txn.is_started() => self.coordinator.rollback_to_savepoint(txn, name),
            _ => Err(EngineError::no_such_savepoint(name)),
        }
    }

    // ---- recovery and external resolution ----

    /// Surface in-doubt prepared transactions after a restart and park them
    /// in the registry so `commit_by_xid`/`rollback_by_xid` can resolve them
    pub fn recover(&self) -> Result<Vec<PreparedTransaction>> {
        let pending = self.coordinator.recover()?;
        let parked: HashSet<Xid> = self.registry.detached_xids().into_iter().collect();

        for p in &pending {
            if parked.contains(&p.xid) {
                continue;
            }
            let mut txn = Box::new(Transaction::new(IsolationLevel::default()));
            txn.id = p.txn_id;
            txn.xid = Some(p.xid);
            txn.state = TrxState::Prepared;
            self.registry.detach(txn)?;
        }
        Ok(pending)
    }

    /// External coordinator's commit verdict for an in-doubt transaction
    pub fn commit_by_xid(&self, xid: Xid) -> Result<()> {
        let mut txn = self
            .registry
            .resume(xid)
            .ok_or_else(|| EngineError::Transaction(format!("unknown XA transaction {}", xid)))?;
        if let Err(e) = self.coordinator.commit(&mut txn, false) {
            // Still in doubt: put it back
            let _ = self.registry.detach(txn);
            return Err(e);
        }
        self.registry.finish(&txn);
        Ok(())
    }

    /// External coordinator's rollback verdict for an in-doubt transaction
    pub fn rollback_by_xid(&self, xid: Xid) -> Result<()> {
        let mut txn = self
            .registry
            .resume(xid)
            .ok_or_else(|| EngineError::Transaction(format!("unknown XA transaction {}", xid)))?;
        if let Err(e) = self.coordinator.rollback(&mut txn) {
            let _ = self.registry.detach(txn);
            return Err(e);
        }
        self.registry.finish(&txn);
        Ok(())
    }

    /// Swap a parked prepared transaction into a session, as when XA COMMIT
    /// or XA ROLLBACK arrives on a different connection than the one that
    /// prepared. The session's own transaction is exchanged: a prepared one
    /// is parked in its place, a never-started or finished one is discarded.
    /// An active transaction is never displaced.
    pub fn adopt_prepared(&self, session: &mut SessionContext, xid: Xid) -> Result<()> {
        if let Some(txn) = session.txn.as_ref() {
            if txn.is_active() {
                return Err(EngineError::invalid_state(
                    "adopt a prepared transaction over",
                    txn.state,
                ));
            }
        }
        let adopted = self
            .registry
            .resume(xid)
            .ok_or_else(|| EngineError::Transaction(format!("unknown XA transaction {}", xid)))?;
        self.registry
            .register_session(session.id, Arc::clone(&adopted.flags));

        if let Some(previous) = session.txn.replace(adopted) {
            if previous.state == TrxState::Prepared {
                self.registry.detach(previous)?;
            }
        }
        log::info!("session {} adopted prepared trx, xid={}", session.id, xid);
        Ok(())
    }

    /// Write the XA checkpoint marker, truncating the record log when no
    /// transaction is in doubt
    pub fn checkpoint(&self) -> Result<()> {
        self.coordinator.checkpoint()
    }

    // ---- observability ----

    pub fn active_transactions(&self) -> usize {
        self.registry.active_count()
    }

    pub fn admission_active(&self) -> usize {
        self.gate.active_count()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---- internals ----

    /// The session's transaction, started. Fails fast when the transaction
    /// was chosen as a deadlock victim or the session was killed.
    fn ensure_started<'a>(&self, session: &'a mut SessionContext) -> Result<&'a mut Transaction> {
        let session_id = session.id;
        let newly_created = session.txn.is_none();
        let isolation = session.isolation;

        let txn = session.transaction();
        if txn.flags.is_forced_rollback() {
            txn.state = TrxState::ForcedRollback;
            return Err(EngineError::ForcedAbort);
        }
        if txn.flags.is_killed() {
            txn.flags.clear_killed();
            return Err(EngineError::Interrupted);
        }

        if newly_created {
            self.registry
                .register_session(session_id, Arc::clone(&txn.flags));
        }
        if !txn.is_started() {
            txn.isolation = isolation;
            self.registry.start(txn);
            self.coordinator.register(txn)?;
        }
        Ok(txn)
    }
}
