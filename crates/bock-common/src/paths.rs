//! Standard filesystem paths for Bock.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Bock data.
pub static BOCK_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("BOCK_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/bock"))
});

/// Host file listing subordinate UID ranges.
pub const SUBUID_FILE: &str = "/etc/subuid";

/// Host file listing subordinate GID ranges.
pub const SUBGID_FILE: &str = "/etc/subgid";

/// Standard paths used by the Bock runtime.
#[derive(Debug, Clone)]
pub struct BockPaths {
    /// Root data directory (default: /var/lib/bock).
    pub root: PathBuf,
}

impl BockPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths for an unprivileged user (`~/.local/share/bock`).
    #[must_use]
    pub fn rootless() -> Self {
        let data = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::with_root(data.join("bock"))
    }

    /// Directory for container data.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory holding the ID allocation ledger.
    #[must_use]
    pub fn userns(&self) -> PathBuf {
        self.root.join("userns")
    }

    /// The ID allocation ledger.
    #[must_use]
    pub fn userns_ledger(&self) -> PathBuf {
        self.userns().join("allocations")
    }

    /// Lock file guarding the ledger.
    #[must_use]
    pub fn userns_lock(&self) -> PathBuf {
        self.userns().join("allocations.lock")
    }
}

impl Default for BockPaths {
    fn default() -> Self {
        Self {
            root: BOCK_ROOT.clone(),
        }
    }
}
