//! Lock mode negotiation
//!
//! Translates the query layer's lock intention, the transaction's isolation
//! level, and the statement context into the engine's internal lock
//! discipline: no lock (consistent snapshot read), shared, or exclusive.
//!
//! The decision table is a single exhaustive match evaluated in precedence
//! order, replacing the conditional cascade such logic usually grows into.

use serde::{Deserialize, Serialize};

/// Lock intention as expressed by the query layer for one table reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockIntention {
    /// Plain read (SELECT with no locking clause)
    Read,
    /// SELECT ... LOCK IN SHARE MODE / FOR SHARE
    ReadShared,
    /// SELECT ... FOR UPDATE
    ReadForUpdate,
    /// Any write intention (INSERT/UPDATE/DELETE target)
    Write,
}

/// Engine-internal lock mode for the statement in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Consistent snapshot read; no row locks taken
    None,
    /// Locking read with shared row locks
    Shared,
    /// Locking read/write with exclusive row locks
    Exclusive,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::None
    }
}

/// Coarse statement categories the negotiator distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Plain SELECT
    Select,
    /// INSERT ... SELECT and friends; the read side must serialize with
    /// concurrent writers under statement-based replication
    InsertSelect,
    /// Other DML reading rows it will modify (UPDATE/DELETE subqueries,
    /// REPLACE ... SELECT, CREATE TABLE ... SELECT)
    DmlRead,
}

/// Category of the referenced table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableCategory {
    /// Ordinary user table
    User,
    /// Data dictionary / access-control table read on the side of ordinary
    /// statements
    Dictionary,
}

/// Policy knobs for the downgrade decisions that are site-specific rather
/// than law. The exact set of statements allowed to downgrade a locking read
/// to a consistent read depends on the deployment's replication and
/// consistency requirements.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// At READ COMMITTED and below, treat serialization-sensitive reads as
    /// plain consistent reads instead of shared-locking them
    pub skip_locking_reads: bool,
    /// Read dictionary/ACL tables without shared locks even where a plain
    /// read would otherwise lock
    pub dictionary_unlocked_reads: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            skip_locking_reads: true,
            dictionary_unlocked_reads: true,
        }
    }
}

/// One table-lock request from the query layer
#[derive(Debug, Clone, Copy)]
pub struct LockRequest {
    pub intention: LockIntention,
    pub statement: StatementKind,
    /// Whether a consistent (snapshot) read is known to be safe for this
    /// statement, e.g. row-based replication is in effect
    pub consistent_read_safe: bool,
    pub category: TableCategory,
}

impl LockRequest {
    /// A plain SELECT against a user table; the common case
    pub fn plain_read() -> Self {
        Self {
            intention: LockIntention::Read,
            statement: StatementKind::Select,
            consistent_read_safe: true,
            category: TableCategory::User,
        }
    }
}

use crate::txn::types::IsolationLevel;

/// Decide the engine lock mode for one table reference.
///
/// Pure function over the request, the transaction's isolation level,
/// whether the session is inside an explicit multi-statement transaction,
/// and the configured policy. Evaluated in precedence order:
///
/// 1. Statements whose reads must serialize with concurrent writers take a
///    shared lock, unless low isolation plus `skip_locking_reads` downgrades
///    them to a consistent read.
/// 2. Explicit share-locked read takes a shared lock.
/// 3. Exclusive-locked read or any write intention takes an exclusive lock.
/// 4. Plain reads below SERIALIZABLE (and unlocked dictionary reads) take no
///    lock.
/// 5. Plain reads at SERIALIZABLE inside an explicit transaction take a
///    shared lock.
pub fn select_lock_mode(
    req: &LockRequest,
    isolation: IsolationLevel,
    in_explicit_txn: bool,
    policy: &LockPolicy,
) -> LockMode {
    // 1. Reads that must serialize with concurrent writers for replication
    // correctness
    let serializing_read = matches!(
        req.statement,
        StatementKind::InsertSelect | StatementKind::DmlRead
    ) && req.intention == LockIntention::Read
        && !req.consistent_read_safe;
    if serializing_read {
        if isolation.statement_level_snapshot() && policy.skip_locking_reads {
            return LockMode::None;
        }
        return LockMode::Shared;
    }

    match req.intention {
        // 2. Explicit share-locked read
        LockIntention::ReadShared => LockMode::Shared,
        // 3. Exclusive read or write
        LockIntention::ReadForUpdate | LockIntention::Write => LockMode::Exclusive,
        // 4./5. Plain read
        LockIntention::Read => {
            if req.category == TableCategory::Dictionary && policy.dictionary_unlocked_reads {
                return LockMode::None;
            }
            if isolation == IsolationLevel::Serializable && in_explicit_txn {
                // SERIALIZABLE turns plain reads into locking reads, but only
                // inside an explicit transaction; an autocommit SELECT is
                // still a consistent read
                LockMode::Shared
            } else {
                LockMode::None
            }
        }
    }
}
