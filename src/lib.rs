//! # Basalt
//!
//! The transactional core of an on-disk storage engine serving a
//! MySQL-compatible query layer. Basalt turns statement and connection
//! events into ACID transactions: lifecycle state machine, session registry,
//! concurrency admission gate, lock mode negotiation, auto-increment
//! reservation, and a two-phase-commit / savepoint coordinator with a
//! durable XA record log for crash recovery.
//!
//! Row storage, the undo log, and the replication log stay outside the
//! crate; Basalt drives them through the traits in [`hooks`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use basalt::{Config, Engine};
//! use basalt::hooks::{MemoryUndoLog, RecordingCoordinator};
//! use basalt::txn::CallerClass;
//!
//! let engine = Engine::new(
//!     Config::at("./data"),
//!     Arc::new(MemoryUndoLog::new()),
//!     Arc::new(RecordingCoordinator::new()),
//! )?;
//!
//! let mut session = engine.on_connect(1);
//! engine.begin(&mut session, None)?;
//! engine.begin_statement(&mut session, CallerClass::Session)?;
//! engine.end_statement(&mut session)?;
//! engine.commit(&mut session)?;
//! # Ok::<(), basalt::EngineError>(())
//! ```

pub mod engine;
pub mod error;
pub mod hooks;
pub mod session;
pub mod txn;

pub use engine::{Config, Engine};
pub use error::{EngineError, Result};
pub use session::{SessionContext, SessionId};
