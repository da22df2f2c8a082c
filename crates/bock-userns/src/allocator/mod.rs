//! Carving per-container ranges out of subordinate ID pools.
//!
//! Ranges handed out to containers of the same principal never overlap. The
//! scan for a free range and the commit of the chosen range happen under one
//! exclusive host-wide lock, so concurrent container starts serialize on the
//! ledger and each observes the commits of the ones before it.

mod ledger;

pub use ledger::{AllocationRecord, LeaseOwner};

use std::path::PathBuf;
use std::time::Duration;

use bock_common::{BockError, BockResult, LeaseId};
use chrono::Utc;
use serde::Serialize;

use crate::idmap::IdKind;
use crate::subid::{IdRange, IdRangePool};
use ledger::Ledger;

/// Range length used when `auto` is given no `size=`.
pub const DEFAULT_AUTO_SIZE: u32 = 1024;

/// Default bound on waiting for the ledger lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Decides whether the owner of a committed range still exists.
///
/// Records of dead owners are treated as free on the next allocation.
pub trait LeaseLiveness {
    /// Whether `owner` is still alive.
    fn is_live(&self, owner: &LeaseOwner) -> bool;
}

impl<F> LeaseLiveness for F
where
    F: Fn(&LeaseOwner) -> bool,
{
    fn is_live(&self, owner: &LeaseOwner) -> bool {
        self(owner)
    }
}

/// Whether a process with this PID exists (EPERM still means it does).
pub(crate) fn process_alive(pid: u32) -> bool {
    let Some(pid) = i32::try_from(pid).ok().and_then(rustix::process::Pid::from_raw) else {
        return false;
    };
    !matches!(
        rustix::process::test_kill_process(pid),
        Err(rustix::io::Errno::SRCH)
    )
}

/// Ranges committed together under one lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    /// Lease through which the ranges are released.
    pub lease: LeaseId,
    /// Length of every range in this allocation.
    pub length: u32,
    ranges: Vec<(IdKind, IdRange)>,
}

impl Allocation {
    /// The range allocated from the pool of `kind`.
    #[must_use]
    pub fn range(&self, kind: IdKind) -> Option<IdRange> {
        self.ranges
            .iter()
            .find_map(|(k, range)| (*k == kind).then_some(*range))
    }
}

/// Commits and releases ranges in the shared allocation ledger.
#[derive(Debug)]
pub struct Allocator<L> {
    ledger: Ledger,
    liveness: L,
    default_size: u32,
}

impl<L: LeaseLiveness> Allocator<L> {
    /// Create an allocator over the ledger at `path`, locked through `lock_path`.
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>, liveness: L) -> Self {
        Self {
            ledger: Ledger::new(path.into(), lock_path.into(), DEFAULT_LOCK_TIMEOUT),
            liveness,
            default_size: DEFAULT_AUTO_SIZE,
        }
    }

    /// Set how long to wait for the ledger lock.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.ledger = self.ledger.with_timeout(timeout);
        self
    }

    /// Set the length used when no size is requested.
    #[must_use]
    pub const fn with_default_size(mut self, size: u32) -> Self {
        self.default_size = size;
        self
    }

    /// Reserve one range of equal length from each of `pools`.
    ///
    /// The length is `max(requested or default, minimum)`. Each range is the
    /// lowest-addressed free stretch of its pool. Either every range is
    /// committed under a single new lease or none is.
    ///
    /// # Errors
    ///
    /// [`BockError::PoolExhausted`] when a pool has no room,
    /// [`BockError::LockTimeout`] when the ledger lock stays contended.
    pub fn allocate(
        &self,
        pools: &[&IdRangePool],
        owner: &LeaseOwner,
        requested: Option<u32>,
        minimum: u32,
    ) -> BockResult<Allocation> {
        let length = requested.unwrap_or(self.default_size).max(minimum).max(1);

        let guard = self.ledger.lock()?;
        let mut records = self.live_records(guard.read()?);

        let lease = LeaseId::generate();
        let created = Utc::now();
        let mut ranges = Vec::with_capacity(pools.len());

        for pool in pools {
            let mut taken: Vec<IdRange> = records
                .iter()
                .filter(|r| r.principal == pool.principal() && r.kind == pool.kind())
                .map(AllocationRecord::range)
                .collect();
            taken.sort_by_key(|r| r.start);

            let start = find_free(pool, &taken, length).ok_or_else(|| BockError::PoolExhausted {
                principal: pool.principal().to_string(),
                kind: pool.kind().to_string(),
                length,
            })?;

            ranges.push((pool.kind(), IdRange::new(start, length)));
            records.push(AllocationRecord {
                principal: pool.principal().to_string(),
                kind: pool.kind(),
                start,
                length,
                lease: lease.clone(),
                owner: owner.clone(),
                created,
            });
        }

        guard.write(&records)?;

        for (kind, range) in &ranges {
            tracing::info!(
                lease = %lease,
                owner = %owner,
                kind = %kind,
                start = range.start,
                length = range.length,
                "Committed ID range"
            );
        }

        Ok(Allocation {
            lease,
            length,
            ranges,
        })
    }

    /// Drop every record held by `lease`; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Only I/O and lock failures; an unknown lease is not an error.
    pub fn release(&self, lease: &LeaseId) -> BockResult<usize> {
        self.remove_where(|r| &r.lease == lease)
    }

    /// Drop the record covering exactly `range` of `principal`'s `kind` pool.
    ///
    /// # Errors
    ///
    /// Only I/O and lock failures; an unknown range is not an error.
    pub fn release_range(&self, principal: &str, kind: IdKind, range: IdRange) -> BockResult<bool> {
        self.remove_where(|r| r.principal == principal && r.kind == kind && r.range() == range)
            .map(|removed| removed > 0)
    }

    /// Drop every record owned by `owner`, e.g. when its container is removed.
    ///
    /// # Errors
    ///
    /// Only I/O and lock failures.
    pub fn release_owner(&self, owner: &LeaseOwner) -> BockResult<usize> {
        self.remove_where(|r| &r.owner == owner)
    }

    /// Snapshot of the committed records, including stale ones.
    ///
    /// # Errors
    ///
    /// I/O, lock or ledger format failures.
    pub fn list(&self) -> BockResult<Vec<AllocationRecord>> {
        self.ledger.lock()?.read()
    }

    fn remove_where(&self, matches: impl Fn(&AllocationRecord) -> bool) -> BockResult<usize> {
        let guard = self.ledger.lock()?;
        let mut records = guard.read()?;
        let before = records.len();
        records.retain(|r| !matches(r));

        let removed = before - records.len();
        if removed > 0 {
            guard.write(&records)?;
            tracing::info!(removed, "Released ID ranges");
        } else {
            tracing::debug!("Nothing to release");
        }
        Ok(removed)
    }

    fn live_records(&self, mut records: Vec<AllocationRecord>) -> Vec<AllocationRecord> {
        records.retain(|record| {
            let live = self.liveness.is_live(&record.owner);
            if !live {
                tracing::info!(
                    lease = %record.lease,
                    owner = %record.owner,
                    principal = %record.principal,
                    kind = %record.kind,
                    start = record.start,
                    length = record.length,
                    "Reclaiming range of vanished owner"
                );
            }
            live
        });
        records
    }
}

/// Lowest start of `length` free IDs in `pool`, given the sorted `taken` ranges.
fn find_free(pool: &IdRangePool, taken: &[IdRange], length: u32) -> Option<u32> {
    let length = u64::from(length);

    for range in pool.ranges() {
        let mut cursor = u64::from(range.start);
        for t in taken {
            if t.end() <= cursor {
                continue;
            }
            if u64::from(t.start) >= range.end() {
                break;
            }
            if u64::from(t.start) >= cursor + length {
                break;
            }
            cursor = t.end();
        }
        if cursor + length <= range.end() {
            return u32::try_from(cursor).ok();
        }
    }

    None
}
