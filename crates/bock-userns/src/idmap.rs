//! UID/GID mapping tables.
//!
//! An [`IdMap`] is the ordered list of `container host size` triples that
//! ends up in `/proc/<pid>/uid_map` or `/proc/<pid>/gid_map`.

use std::fmt;
use std::str::FromStr;

use bock_common::{BockError, BockResult};
use serde::{Deserialize, Serialize};

/// Which of the two ID spaces a map or range belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    /// User IDs.
    Uid,
    /// Group IDs.
    Gid,
}

impl IdKind {
    /// Both kinds, UID first.
    pub const ALL: [Self; 2] = [Self::Uid, Self::Gid];

    /// Lowercase name ("uid" / "gid").
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uid => "uid",
            Self::Gid => "gid",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UID/GID mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdMapEntry {
    /// Container ID (start).
    pub container_id: u32,
    /// Host ID (start).
    pub host_id: u32,
    /// Range size.
    pub size: u32,
}

impl IdMapEntry {
    /// Create a new ID mapping entry.
    #[must_use]
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// One past the last container ID covered by this entry.
    #[must_use]
    pub const fn container_end(&self) -> u64 {
        self.container_id as u64 + self.size as u64
    }

    /// One past the last host ID covered by this entry.
    #[must_use]
    pub const fn host_end(&self) -> u64 {
        self.host_id as u64 + self.size as u64
    }

    /// Format for /proc/<pid>/uid_map or gid_map.
    #[must_use]
    pub fn to_proc_format(&self) -> String {
        format!("{} {} {}", self.container_id, self.host_id, self.size)
    }
}

impl fmt::Display for IdMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

impl FromStr for IdMapEntry {
    type Err = BockError;

    /// Parse a `container:host:size` triple.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [container, host, size] = fields.as_slice() else {
            return Err(BockError::syntax(s, "expected container:host:size"));
        };

        let container_id = parse_id(s, container)?;
        let host_id = parse_id(s, host)?;
        let size = parse_id(s, size)?;

        if size == 0 {
            return Err(BockError::syntax(s, "mapping size must be at least 1"));
        }
        let entry = Self::new(container_id, host_id, size);
        if entry.container_end() > u64::from(u32::MAX) + 1
            || u64::from(host_id) + u64::from(size) > u64::from(u32::MAX) + 1
        {
            return Err(BockError::syntax(s, "mapping exceeds the 32-bit ID space"));
        }

        Ok(entry)
    }
}

/// Parse one non-negative 32-bit ID field of `token`.
pub(crate) fn parse_id(token: &str, field: &str) -> BockResult<u32> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BockError::syntax(
            token,
            format!("{field:?} is not a non-negative integer"),
        ));
    }
    field
        .parse()
        .map_err(|_| BockError::syntax(token, format!("{field} is out of range")))
}

/// Ordered list of mapping entries for one ID kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdMap(Vec<IdMapEntry>);

impl IdMap {
    /// An empty map, meaning "no remapping".
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an entry; zero-sized entries are dropped.
    pub fn push(&mut self, entry: IdMapEntry) {
        if entry.size > 0 {
            self.0.push(entry);
        }
    }

    /// The entries in order.
    #[must_use]
    pub fn entries(&self) -> &[IdMapEntry] {
        &self.0
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the entries.
    pub fn iter(&self) -> std::slice::Iter<'_, IdMapEntry> {
        self.0.iter()
    }

    /// Highest container ID covered plus one (0 for an empty map).
    #[must_use]
    pub fn container_span(&self) -> u64 {
        self.0.iter().map(IdMapEntry::container_end).max().unwrap_or(0)
    }

    /// Host ID that `container_id` maps to, if any.
    #[must_use]
    pub fn host_id_of(&self, container_id: u32) -> Option<u32> {
        self.0.iter().find_map(|e| {
            let offset = container_id.checked_sub(e.container_id)?;
            (offset < e.size).then(|| e.host_id + offset)
        })
    }

    /// Fail with [`BockError::Overlap`] if any container ID is covered twice.
    ///
    /// # Errors
    ///
    /// Returns the first doubly-mapped container ID.
    pub fn check_disjoint(&self, kind: IdKind) -> BockResult<()> {
        let mut sorted = self.0.clone();
        sorted.sort_by_key(|e| e.container_id);

        for pair in sorted.windows(2) {
            if u64::from(pair[1].container_id) < pair[0].container_end() {
                return Err(BockError::Overlap {
                    kind: kind.to_string(),
                    container_id: pair[1].container_id,
                });
            }
        }
        Ok(())
    }

    /// Check that no host ID is the target of two entries.
    ///
    /// # Errors
    ///
    /// Returns the first host ID mapped twice.
    pub fn check_host_disjoint(&self, kind: IdKind) -> BockResult<()> {
        let mut sorted = self.0.clone();
        sorted.sort_by_key(|e| e.host_id);

        for pair in sorted.windows(2) {
            if u64::from(pair[1].host_id) < pair[0].host_end() {
                return Err(BockError::HostOverlap {
                    kind: kind.to_string(),
                    host_id: pair[1].host_id,
                });
            }
        }
        Ok(())
    }

    /// Format the whole map for /proc/<pid>/uid_map or gid_map.
    #[must_use]
    pub fn to_proc_format(&self) -> String {
        self.0
            .iter()
            .map(IdMapEntry::to_proc_format)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<Vec<IdMapEntry>> for IdMap {
    fn from(entries: Vec<IdMapEntry>) -> Self {
        let mut map = Self::new();
        for entry in entries {
            map.push(entry);
        }
        map
    }
}

impl<'a> IntoIterator for &'a IdMap {
    type Item = &'a IdMapEntry;
    type IntoIter = std::slice::Iter<'a, IdMapEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A finished mapping: one UID map and one GID map.
///
/// Both maps empty means the container stays in the host user namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernsMaps {
    /// UID mappings.
    pub uid_map: IdMap,
    /// GID mappings.
    pub gid_map: IdMap,
}

impl UsernsMaps {
    /// Pair a UID and a GID map.
    #[must_use]
    pub const fn new(uid_map: IdMap, gid_map: IdMap) -> Self {
        Self { uid_map, gid_map }
    }

    /// The map of `kind`.
    #[must_use]
    pub const fn get(&self, kind: IdKind) -> &IdMap {
        match kind {
            IdKind::Uid => &self.uid_map,
            IdKind::Gid => &self.gid_map,
        }
    }

    /// Whether no remapping takes place.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.uid_map.is_empty() && self.gid_map.is_empty()
    }
}
