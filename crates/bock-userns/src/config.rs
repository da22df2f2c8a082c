//! User namespace configuration.
//!
//! Settings come from defaults, then an optional TOML file, then whatever the
//! caller sets through the builder methods:
//!
//! ```toml
//! root = "/var/lib/bock"
//! userns = "auto:size=2048"
//! auto_size = 2048
//! lock_timeout = 10
//! subuid_file = "/etc/subuid"
//! subgid_file = "/etc/subgid"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use bock_common::paths::{SUBGID_FILE, SUBUID_FILE};
use bock_common::{BockError, BockPaths, BockResult};
use serde::Deserialize;

use crate::allocator::{Allocator, DEFAULT_AUTO_SIZE, DEFAULT_LOCK_TIMEOUT, LeaseLiveness};
use crate::registry::ContainerRegistry;
use crate::subid::PoolReader;

/// System-wide configuration file.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/bock/userns.toml";

/// Runtime configuration for user namespace setup.
#[derive(Debug, Clone)]
pub struct UsernsConfig {
    /// Paths for runtime data.
    pub paths: BockPaths,
    /// Subordinate UID file.
    pub subuid_file: PathBuf,
    /// Subordinate GID file.
    pub subgid_file: PathBuf,
    /// Range length for `auto` without `size=`.
    pub auto_size: u32,
    /// Bound on waiting for the allocation lock.
    pub lock_timeout: Duration,
    /// `--userns` value used when none is given.
    pub default_userns: Option<String>,
}

impl Default for UsernsConfig {
    fn default() -> Self {
        Self {
            paths: BockPaths::new(),
            subuid_file: PathBuf::from(SUBUID_FILE),
            subgid_file: PathBuf::from(SUBGID_FILE),
            auto_size: DEFAULT_AUTO_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            default_userns: None,
        }
    }
}

/// On-disk form; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    root: Option<PathBuf>,
    userns: Option<String>,
    auto_size: Option<u32>,
    lock_timeout: Option<u64>,
    subuid_file: Option<PathBuf>,
    subgid_file: Option<PathBuf>,
}

impl UsernsConfig {
    /// Create a rootless configuration.
    #[must_use]
    pub fn rootless() -> Self {
        Self {
            paths: BockPaths::rootless(),
            ..Self::default()
        }
    }

    /// Configuration file consulted by default for this kind of user.
    #[must_use]
    pub fn default_file(rootless: bool) -> Option<PathBuf> {
        if rootless {
            dirs::config_dir().map(|dir| dir.join("bock").join("userns.toml"))
        } else {
            Some(PathBuf::from(SYSTEM_CONFIG_FILE))
        }
    }

    /// Overlay settings from a TOML file; a missing file changes nothing.
    ///
    /// # Errors
    ///
    /// [`BockError::Config`] if the file is unreadable or malformed.
    pub fn load_file(mut self, path: &Path) -> BockResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(self),
            Err(e) => {
                return Err(BockError::config(format!("cannot read {}: {e}", path.display())));
            }
        };
        let file: ConfigFile = toml::from_str(&text)
            .map_err(|e| BockError::config(format!("{}: {e}", path.display())))?;

        if let Some(root) = file.root {
            self.paths = BockPaths::with_root(root);
        }
        if file.userns.is_some() {
            self.default_userns = file.userns;
        }
        if let Some(size) = file.auto_size {
            self = self.with_auto_size(size)?;
        }
        if let Some(secs) = file.lock_timeout {
            self.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(subuid) = file.subuid_file {
            self.subuid_file = subuid;
        }
        if let Some(subgid) = file.subgid_file {
            self.subgid_file = subgid;
        }

        tracing::debug!(path = %path.display(), "Loaded user namespace configuration");
        Ok(self)
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = BockPaths::with_root(root);
        self
    }

    /// Set the subordinate ID files.
    #[must_use]
    pub fn with_subid_files(mut self, subuid: impl Into<PathBuf>, subgid: impl Into<PathBuf>) -> Self {
        self.subuid_file = subuid.into();
        self.subgid_file = subgid.into();
        self
    }

    /// Set the default `auto` range length.
    ///
    /// # Errors
    ///
    /// [`BockError::Config`] for a zero size.
    pub fn with_auto_size(mut self, size: u32) -> BockResult<Self> {
        if size == 0 {
            return Err(BockError::config("auto_size must be at least 1"));
        }
        self.auto_size = size;
        Ok(self)
    }

    /// Set the lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the `--userns` default.
    #[must_use]
    pub fn with_default_userns(mut self, userns: impl Into<String>) -> Self {
        self.default_userns = Some(userns.into());
        self
    }

    /// Pool reader over the configured subid files.
    #[must_use]
    pub fn pool_reader(&self) -> PoolReader {
        PoolReader::new(&self.subuid_file, &self.subgid_file)
    }

    /// Registry of container records under the data root.
    #[must_use]
    pub fn registry(&self) -> ContainerRegistry {
        ContainerRegistry::new(self.paths.containers())
    }

    /// Allocator over the ledger under the data root.
    #[must_use]
    pub fn allocator<L: LeaseLiveness>(&self, liveness: L) -> Allocator<L> {
        Allocator::new(
            self.paths.userns_ledger(),
            self.paths.userns_lock(),
            liveness,
        )
        .with_lock_timeout(self.lock_timeout)
        .with_default_size(self.auto_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config() {
        let config = UsernsConfig::default();
        assert_eq!(config.auto_size, 1024);
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.subuid_file, PathBuf::from("/etc/subuid"));
        assert!(config.default_userns.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = UsernsConfig::default()
            .with_root("/custom/root")
            .with_lock_timeout(Duration::from_secs(1))
            .with_default_userns("auto")
            .with_auto_size(2048)
            .unwrap();

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.auto_size, 2048);
        assert_eq!(config.default_userns.as_deref(), Some("auto"));
        assert!(UsernsConfig::default().with_auto_size(0).is_err());
    }

    #[test]
    fn file_overlays_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("userns.toml");
        std::fs::write(
            &path,
            "root = \"/srv/bock\"\nuserns = \"keep-id\"\nauto_size = 4096\nlock_timeout = 3\n",
        )
        .unwrap();

        let config = UsernsConfig::default().load_file(&path).unwrap();
        assert_eq!(config.paths.root, PathBuf::from("/srv/bock"));
        assert_eq!(config.default_userns.as_deref(), Some("keep-id"));
        assert_eq!(config.auto_size, 4096);
        assert_eq!(config.lock_timeout, Duration::from_secs(3));
    }

    #[test]
    fn missing_file_is_ignored() {
        let temp = tempdir().unwrap();
        let config = UsernsConfig::default()
            .load_file(&temp.path().join("absent.toml"))
            .unwrap();
        assert_eq!(config.auto_size, DEFAULT_AUTO_SIZE);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("userns.toml");
        std::fs::write(&path, "auto_size = \"big\"\n").unwrap();
        assert!(matches!(
            UsernsConfig::default().load_file(&path),
            Err(BockError::Config { .. })
        ));

        std::fs::write(&path, "colour = \"blue\"\n").unwrap();
        assert!(UsernsConfig::default().load_file(&path).is_err());
    }
}
