//! On-disk record of committed ID ranges.
//!
//! The ledger is a JSON-lines file, one [`AllocationRecord`] per line. It is
//! only read or rewritten while holding an exclusive `flock` on a sibling lock
//! file, and every rewrite goes through a temporary file renamed into place,
//! so readers never observe a half-written ledger.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bock_common::{BockError, BockResult, ContainerId, LeaseId};
use chrono::{DateTime, Utc};
use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;
use serde::{Deserialize, Serialize};

use crate::idmap::IdKind;
use crate::subid::IdRange;

/// Longest pause between two lock attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Whoever a committed range belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum LeaseOwner {
    /// A container known to the registry.
    Container(ContainerId),
    /// A bare process, identified by PID.
    Process(u32),
}

impl std::fmt::Display for LeaseOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container(id) => write!(f, "container {id}"),
            Self::Process(pid) => write!(f, "process {pid}"),
        }
    }
}

/// One committed range of one principal's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Pool owner the range was carved from.
    pub principal: String,
    /// UID or GID pool.
    pub kind: IdKind,
    /// First host ID of the range.
    pub start: u32,
    /// Number of IDs.
    pub length: u32,
    /// Lease handed to the requester.
    pub lease: LeaseId,
    /// Owner checked for liveness during reclamation.
    pub owner: LeaseOwner,
    /// Commit time.
    pub created: DateTime<Utc>,
}

impl AllocationRecord {
    /// The host range this record covers.
    #[must_use]
    pub const fn range(&self) -> IdRange {
        IdRange::new(self.start, self.length)
    }
}

/// Location and locking policy of the ledger.
#[derive(Debug, Clone)]
pub(crate) struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
    timeout: Duration,
}

impl Ledger {
    pub(crate) fn new(path: PathBuf, lock_path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            lock_path,
            timeout,
        }
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take the exclusive host-wide lock, waiting at most the configured timeout.
    pub(crate) fn lock(&self) -> BockResult<LedgerGuard<'_>> {
        for path in [&self.path, &self.lock_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;

        let started = Instant::now();
        let mut backoff = Duration::from_millis(5);
        loop {
            match flock(&file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => break,
                Err(Errno::INTR) => continue,
                Err(Errno::WOULDBLOCK) => {}
                Err(errno) => return Err(std::io::Error::from(errno).into()),
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(BockError::LockTimeout {
                    path: self.lock_path.display().to_string(),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }
            std::thread::sleep(backoff.min(self.timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        tracing::trace!(
            lock = %self.lock_path.display(),
            waited_ms = started.elapsed().as_millis(),
            "Acquired allocation lock"
        );

        Ok(LedgerGuard {
            ledger: self,
            _lock: file,
        })
    }
}

/// Proof that the ledger lock is held; released on drop.
pub(crate) struct LedgerGuard<'a> {
    ledger: &'a Ledger,
    _lock: File,
}

impl LedgerGuard<'_> {
    /// Read every record; a missing ledger is empty.
    pub(crate) fn read(&self) -> BockResult<Vec<AllocationRecord>> {
        let content = match fs::read_to_string(&self.ledger.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(BockError::from))
            .collect()
    }

    /// Replace the ledger with `records` in one rename.
    pub(crate) fn write(&self, records: &[AllocationRecord]) -> BockResult<()> {
        let dir = self
            .ledger
            .path
            .parent()
            .ok_or_else(|| BockError::Internal {
                message: format!("ledger path {} has no parent", self.ledger.path.display()),
            })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for record in records {
            serde_json::to_writer(&mut tmp, record)?;
            tmp.write_all(b"\n")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.ledger.path).map_err(|e| e.error)?;

        tracing::debug!(
            path = %self.ledger.path.display(),
            records = records.len(),
            "Wrote allocation ledger"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn ledger_in(dir: &Path, timeout: Duration) -> Ledger {
        Ledger::new(dir.join("allocations"), dir.join("allocations.lock"), timeout)
    }

    fn record(start: u32) -> AllocationRecord {
        AllocationRecord {
            principal: "alice".into(),
            kind: IdKind::Uid,
            start,
            length: 1024,
            lease: LeaseId::generate(),
            owner: LeaseOwner::Process(1),
            created: Utc::now(),
        }
    }

    #[test]
    fn missing_ledger_reads_empty() {
        let temp = tempdir().unwrap();
        let ledger = ledger_in(temp.path(), Duration::from_secs(1));
        assert!(ledger.lock().unwrap().read().unwrap().is_empty());
    }

    #[test]
    fn write_then_read() {
        let temp = tempdir().unwrap();
        let ledger = ledger_in(temp.path(), Duration::from_secs(1));
        let records = vec![record(100_000), record(101_024)];

        {
            let guard = ledger.lock().unwrap();
            guard.write(&records).unwrap();
        }

        let guard = ledger.lock().unwrap();
        assert_eq!(guard.read().unwrap(), records);

        let text = fs::read_to_string(&ledger.path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn owner_serializes_tagged() {
        let json = serde_json::to_string(&LeaseOwner::Process(42)).unwrap();
        assert_eq!(json, r#"{"type":"process","id":42}"#);
    }

    #[test]
    fn contended_lock_times_out() {
        let temp = tempdir().unwrap();
        let holder = ledger_in(temp.path(), Duration::from_secs(1));
        let waiter = ledger_in(temp.path(), Duration::from_millis(50));

        let _held = holder.lock().unwrap();
        let err = waiter.lock().err().unwrap();
        assert!(matches!(err, BockError::LockTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let temp = tempdir().unwrap();
        let ledger = ledger_in(temp.path(), Duration::from_millis(50));

        drop(ledger.lock().unwrap());
        assert!(ledger.lock().is_ok());
    }

    #[test]
    fn corrupt_ledger_is_an_error() {
        let temp = tempdir().unwrap();
        let ledger = ledger_in(temp.path(), Duration::from_secs(1));
        fs::write(&ledger.path, "{not json}\n").unwrap();

        let err = ledger.lock().unwrap().read().unwrap_err();
        assert!(matches!(err, BockError::Serialization(_)));
    }
}
