//! Subordinate ID pools from /etc/subuid and /etc/subgid.
//!
//! Each line of those files has the form `name:start:count` (the name may also
//! be a numeric UID). All lines for a principal together form its pool.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bock_common::paths::{SUBGID_FILE, SUBUID_FILE};
use bock_common::{BockError, BockResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::idmap::IdKind;

/// Principal whose pool backs containers started by the host superuser.
pub const ROOT_PRINCIPAL: &str = "containers";

/// A contiguous range of host IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    /// First host ID.
    pub start: u32,
    /// Number of IDs.
    pub length: u32,
}

impl IdRange {
    /// Create a range.
    #[must_use]
    pub const fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }

    /// One past the last ID.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start as u64 + self.length as u64
    }

    /// Whether the two ranges share at least one ID.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        (self.start as u64) < other.end() && (other.start as u64) < self.end()
    }
}

/// The subordinate IDs configured for one principal and one ID kind.
///
/// Ranges are sorted by start and never overlap or touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdRangePool {
    kind: IdKind,
    principal: String,
    ranges: Vec<IdRange>,
}

impl IdRangePool {
    /// Build a pool, sorting and merging the given ranges.
    #[must_use]
    pub fn new(kind: IdKind, principal: impl Into<String>, mut ranges: Vec<IdRange>) -> Self {
        ranges.retain(|r| r.length > 0);
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<IdRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if u64::from(range.start) <= last.end() => {
                    let end = last.end().max(range.end());
                    last.length = u32::try_from(end - u64::from(last.start)).unwrap_or(u32::MAX);
                }
                _ => merged.push(range),
            }
        }

        Self {
            kind,
            principal: principal.into(),
            ranges: merged,
        }
    }

    /// The ID kind of this pool.
    #[must_use]
    pub const fn kind(&self) -> IdKind {
        self.kind
    }

    /// The principal that owns this pool.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The ranges, lowest first.
    #[must_use]
    pub fn ranges(&self) -> &[IdRange] {
        &self.ranges
    }

    /// Total number of IDs in the pool.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|r| u64::from(r.length)).sum()
    }
}

/// The user on whose behalf the mapping is computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoker {
    /// Real UID.
    pub uid: u32,
    /// Real GID.
    pub gid: u32,
    /// Login name (or the UID as a string when unknown).
    pub name: String,
}

impl Invoker {
    /// Create an invoker from explicit values.
    pub fn new(uid: u32, gid: u32, name: impl Into<String>) -> Self {
        Self {
            uid,
            gid,
            name: name.into(),
        }
    }

    /// The invoking process's identity.
    #[must_use]
    pub fn current() -> Self {
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        let name = username_for(Path::new("/etc/passwd"), uid);
        Self { uid, gid, name }
    }

    /// Whether this is the host superuser.
    #[must_use]
    pub const fn is_superuser(&self) -> bool {
        self.uid == 0
    }

    /// Name under which this invoker's pool is looked up.
    #[must_use]
    pub fn principal(&self) -> &str {
        if self.is_superuser() {
            ROOT_PRINCIPAL
        } else {
            &self.name
        }
    }
}

/// Get username for a UID from a passwd-format file.
fn username_for(passwd: &Path, uid: u32) -> String {
    let content = fs::read_to_string(passwd).unwrap_or_default();

    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split(':');
            let name = parts.next()?;
            let line_uid: u32 = parts.nth(1)?.parse().ok()?;
            (line_uid == uid).then(|| name.to_string())
        })
        .next()
        .unwrap_or_else(|| uid.to_string())
}

type CacheKey = (IdKind, String, Option<u32>);

/// Reads subordinate ID pools, caching each answer for the process lifetime.
#[derive(Debug)]
pub struct PoolReader {
    subuid: PathBuf,
    subgid: PathBuf,
    cache: Mutex<HashMap<CacheKey, Arc<IdRangePool>>>,
}

impl Default for PoolReader {
    fn default() -> Self {
        Self::new(SUBUID_FILE, SUBGID_FILE)
    }
}

impl PoolReader {
    /// Create a reader over the given subuid and subgid files.
    pub fn new(subuid: impl Into<PathBuf>, subgid: impl Into<PathBuf>) -> Self {
        Self {
            subuid: subuid.into(),
            subgid: subgid.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The file consulted for `kind`.
    #[must_use]
    pub fn file(&self, kind: IdKind) -> &Path {
        match kind {
            IdKind::Uid => &self.subuid,
            IdKind::Gid => &self.subgid,
        }
    }

    /// Pool configured for a principal name.
    ///
    /// # Errors
    ///
    /// [`BockError::PoolNotFound`] if the file is missing or has no entry.
    pub fn pool(&self, kind: IdKind, principal: &str) -> BockResult<Arc<IdRangePool>> {
        self.lookup(kind, principal, None)
    }

    /// Pool of the invoking user, matched by name or numeric UID.
    ///
    /// # Errors
    ///
    /// [`BockError::PoolNotFound`] if the file is missing or has no entry.
    pub fn pool_for(&self, kind: IdKind, invoker: &Invoker) -> BockResult<Arc<IdRangePool>> {
        let uid = (!invoker.is_superuser()).then_some(invoker.uid);
        self.lookup(kind, invoker.principal(), uid)
    }

    fn lookup(
        &self,
        kind: IdKind,
        principal: &str,
        uid: Option<u32>,
    ) -> BockResult<Arc<IdRangePool>> {
        let key = (kind, principal.to_string(), uid);
        if let Some(pool) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(pool));
        }

        let path = self.file(kind);
        let not_found = || BockError::PoolNotFound {
            principal: principal.to_string(),
            kind: kind.to_string(),
            file: path.display().to_string(),
        };

        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let uid_str = uid.map(|u| u.to_string());
        let ranges = parse_subid(&content, |name| {
            name == principal || uid_str.as_deref() == Some(name)
        });
        if ranges.is_empty() {
            return Err(not_found());
        }

        let pool = Arc::new(IdRangePool::new(kind, principal, ranges));
        tracing::debug!(
            principal = %principal,
            kind = %kind,
            ranges = pool.ranges().len(),
            total = pool.total(),
            "Loaded subordinate ID pool"
        );

        Ok(Arc::clone(self.cache.lock().entry(key).or_insert(pool)))
    }
}

/// One past the highest ID a subordinate range may cover.
const ID_SPACE_END: u64 = 1 << 32;

/// Collect the ranges of every line whose name matches.
fn parse_subid(content: &str, matches: impl Fn(&str) -> bool) -> Vec<IdRange> {
    let mut ranges = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split(':').collect();
        let [name, start, count] = parts.as_slice() else {
            tracing::warn!(line, "Skipping malformed subordinate ID entry");
            continue;
        };
        if !matches(*name) {
            continue;
        }

        match (start.parse::<u32>(), count.parse::<u32>()) {
            (Ok(start), Ok(count)) if count > 0 => {
                let range = IdRange::new(start, count);
                if range.end() > ID_SPACE_END {
                    tracing::warn!(line, "Skipping subordinate ID entry past the last ID");
                } else {
                    ranges.push(range);
                }
            }
            _ => tracing::warn!(line, "Skipping malformed subordinate ID entry"),
        }
    }

    ranges
}
