//! Durable XA record log
//!
//! Two-phase commit outcomes must survive a crash: a transaction that was
//! prepared but neither committed nor rolled back is in doubt, and only the
//! external coordinator may decide its fate after restart. This module keeps
//! an append-only log of prepare/commit/rollback records (length-prefixed
//! bincode, fsynced per append) plus a JSON checkpoint marker that lets
//! startup skip a log known to contain no in-doubt transactions.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::txn::types::{TxnId, Xid};

const XA_LOG_FILE: &str = "xa.log";
const XA_CHECKPOINT_FILE: &str = "xa.checkpoint";

/// 2PC decision recorded durably before the caller proceeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XaOp {
    /// First phase complete; transaction is in doubt until resolved
    Prepared,
    /// Coordinator decided commit
    Committed,
    /// Coordinator decided rollback
    RolledBack,
}

/// One durable XA log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XaRecord {
    pub xid: Xid,
    pub txn_id: TxnId,
    pub op: XaOp,
    pub timestamp: u64,
}

impl XaRecord {
    pub fn new(xid: Xid, txn_id: TxnId, op: XaOp) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            xid,
            txn_id,
            op,
            timestamp,
        }
    }
}

/// Checkpoint marker written when the log is known to hold no in-doubt
/// transactions. JSON so it stays inspectable in the data directory.
#[derive(Debug, Serialize, Deserialize)]
struct XaCheckpoint {
    pending: Vec<Xid>,
    timestamp: u64,
}

/// Append-only XA record log. One per data directory; appends serialize on
/// the internal mutex and each append is fsynced before returning.
pub struct XaLog {
    data_dir: PathBuf,
    file: Mutex<File>,
}

impl XaLog {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_dir.join(XA_LOG_FILE))?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn log_path(&self) -> PathBuf {
        self.data_dir.join(XA_LOG_FILE)
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(XA_CHECKPOINT_FILE)
    }

    /// Append one record and fsync. The record is durable when this returns.
    pub fn append(&self, record: &XaRecord) -> Result<()> {
        let encoded = bincode::serialize(record).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, format!("xa encode: {}", e))
        })?;
        let len = encoded.len() as u32;

        let mut file = self.file.lock().expect("xa log lock poisoned");
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&encoded)?;
        file.flush()?;
        file.sync_data()?;

        log::debug!(
            "xa record durable: xid={} trx={} op={:?}",
            record.xid,
            record.txn_id,
            record.op
        );
        Ok(())
    }

    /// Scan the whole log, oldest record first. A torn tail (partial record
    /// from a crash mid-append) is tolerated: everything before it was
    /// fsynced and is returned, the tail is dropped.
    pub fn scan(&self) -> Result<Vec<XaRecord>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&path)?;
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut record_buf = vec![0u8; len];
            match file.read_exact(&mut record_buf) {
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("xa log ends in a torn record, dropping tail");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            match bincode::deserialize::<XaRecord>(&record_buf) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!("skipping malformed xa record: {}", e);
                }
            }
        }

        Ok(records)
    }

    /// Transactions that prepared but never reached an outcome. These are the
    /// in-doubt transactions the external coordinator must resolve.
    pub fn pending_prepared(&self) -> Result<Vec<XaRecord>> {
        let mut pending: HashMap<Xid, XaRecord> = HashMap::new();
        for record in self.scan()? {
            match record.op {
                XaOp::Prepared => {
                    pending.insert(record.xid, record);
                }
                XaOp::Committed | XaOp::RolledBack => {
                    pending.remove(&record.xid);
                }
            }
        }
        let mut records: Vec<XaRecord> = pending.into_values().collect();
        records.sort_by_key(|r| r.txn_id);
        Ok(records)
    }

    /// Write the checkpoint marker atomically and, when nothing is in doubt,
    /// reset the log so it does not grow without bound.
    pub fn checkpoint(&self) -> Result<()> {
        let pending = self.pending_prepared()?;
        let marker = XaCheckpoint {
            pending: pending.iter().map(|r| r.xid).collect(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        // Write-then-rename so a crash never leaves a half-written marker
        let mut tmp = tempfile::NamedTempFile::new_in(&self.data_dir)?;
        tmp.write_all(serde_json::to_string_pretty(&marker)?.as_bytes())?;
        tmp.as_file().sync_data()?;
        tmp.persist(self.checkpoint_path())
            .map_err(|e| e.error)?;

        if pending.is_empty() {
            let mut file = self.file.lock().expect("xa log lock poisoned");
            let new_file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.log_path())?;
            *file = new_file;
            log::info!("xa log truncated at checkpoint, no in-doubt transactions");
        }

        Ok(())
    }

    /// Read the last checkpoint's pending set, if a valid marker exists.
    /// Malformed or missing markers are treated as "no checkpoint".
    pub fn read_checkpoint(&self) -> Option<Vec<Xid>> {
        let path = self.checkpoint_path();
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<XaCheckpoint>(&text) {
            Ok(marker) => Some(marker.pending),
            Err(e) => {
                log::warn!("failed to parse xa checkpoint '{}': {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_empty_log() {
        let dir = tempdir().unwrap();
        let xa = XaLog::open(dir.path()).unwrap();
        assert!(xa.scan().unwrap().is_empty());
        assert!(xa.pending_prepared().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_scan_round() {
        let dir = tempdir().unwrap();
        let xa = XaLog::open(dir.path()).unwrap();

        xa.append(&XaRecord::new(Xid(1), 10, XaOp::Prepared)).unwrap();
        xa.append(&XaRecord::new(Xid(1), 10, XaOp::Committed)).unwrap();
        xa.append(&XaRecord::new(Xid(2), 11, XaOp::Prepared)).unwrap();

        let records = xa.scan().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op, XaOp::Prepared);
        assert_eq!(records[1].op, XaOp::Committed);
        assert_eq!(records[2].xid, Xid(2));
    }

    #[test]
    fn test_pending_prepared_excludes_resolved() {
        let dir = tempdir().unwrap();
        let xa = XaLog::open(dir.path()).unwrap();

        xa.append(&XaRecord::new(Xid(1), 10, XaOp::Prepared)).unwrap();
        xa.append(&XaRecord::new(Xid(2), 11, XaOp::Prepared)).unwrap();
        xa.append(&XaRecord::new(Xid(3), 12, XaOp::Prepared)).unwrap();
        xa.append(&XaRecord::new(Xid(1), 10, XaOp::Committed)).unwrap();
        xa.append(&XaRecord::new(Xid(3), 12, XaOp::RolledBack)).unwrap();

        let pending = xa.pending_prepared().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].xid, Xid(2));
        assert_eq!(pending[0].txn_id, 11);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let xa = XaLog::open(dir.path()).unwrap();
            xa.append(&XaRecord::new(Xid(7), 70, XaOp::Prepared)).unwrap();
        }
        let xa = XaLog::open(dir.path()).unwrap();
        let pending = xa.pending_prepared().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].xid, Xid(7));
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let xa = XaLog::open(dir.path()).unwrap();
        xa.append(&XaRecord::new(Xid(1), 10, XaOp::Prepared)).unwrap();

        // Simulate a crash mid-append: a length prefix with no body
        {
            let mut f = OpenOptions::new()
                .append(true)
                .open(dir.path().join(XA_LOG_FILE))
                .unwrap();
            f.write_all(&100u32.to_le_bytes()).unwrap();
            f.write_all(&[0xAB, 0xCD]).unwrap();
        }

        let records = xa.scan().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].xid, Xid(1));
    }

    #[test]
    fn test_checkpoint_truncates_when_nothing_pending() {
        let dir = tempdir().unwrap();
        let xa = XaLog::open(dir.path()).unwrap();

        xa.append(&XaRecord::new(Xid(1), 10, XaOp::Prepared)).unwrap();
        xa.append(&XaRecord::new(Xid(1), 10, XaOp::Committed)).unwrap();
        xa.checkpoint().unwrap();

        assert!(xa.scan().unwrap().is_empty());
        assert_eq!(xa.read_checkpoint().unwrap(), Vec::<Xid>::new());

        // The log is still usable after truncation
        xa.append(&XaRecord::new(Xid(2), 11, XaOp::Prepared)).unwrap();
        assert_eq!(xa.pending_prepared().unwrap().len(), 1);
    }

    #[test]
    fn test_checkpoint_keeps_pending_log() {
        let dir = tempdir().unwrap();
        let xa = XaLog::open(dir.path()).unwrap();

        xa.append(&XaRecord::new(Xid(5), 50, XaOp::Prepared)).unwrap();
        xa.checkpoint().unwrap();

        // In-doubt transaction: log must not be truncated
        assert_eq!(xa.scan().unwrap().len(), 1);
        assert_eq!(xa.read_checkpoint().unwrap(), vec![Xid(5)]);
    }

    #[test]
    fn test_read_checkpoint_missing_or_malformed() {
        let dir = tempdir().unwrap();
        let xa = XaLog::open(dir.path()).unwrap();
        assert!(xa.read_checkpoint().is_none());

        std::fs::write(dir.path().join(XA_CHECKPOINT_FILE), "not json").unwrap();
        assert!(xa.read_checkpoint().is_none());
    }
}
