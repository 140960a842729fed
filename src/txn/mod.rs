//! Transaction subsystem: lifecycle state machine, registry, admission gate,
//! lock mode negotiation, auto-increment reservation, and the 2PC/savepoint
//! coordinator with its durable XA record log.

pub mod admission;
pub mod autoinc;
pub mod coordinator;
pub mod locking;
pub mod registry;
pub mod types;
pub mod xa;

pub use admission::{AdmissionGate, CallerClass, CommitGate};
pub use autoinc::{next_autoinc, AutoincCounter, AutoincRegistry, AutoincReservation};
pub use coordinator::{PreparedTransaction, TxnCoordinator};
pub use locking::{
    select_lock_mode, LockIntention, LockMode, LockPolicy, LockRequest, StatementKind,
    TableCategory,
};
pub use registry::TrxRegistry;
pub use types::{IsolationLevel, Savepoint, Transaction, TrxFlags, TrxState, TxnId, Xid, TXN_ID_NONE};
pub use xa::{XaLog, XaOp, XaRecord};
