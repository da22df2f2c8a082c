//! Committed user namespace state of containers.
//!
//! Every container that went through setup gets a `userns.json` under its
//! container directory. The registry answers join lookups and tells the
//! allocator whether a lease owner still exists.

use std::path::PathBuf;

use bock_common::{BockError, BockResult, ContainerId, LeaseId};
use serde::{Deserialize, Serialize};

use crate::allocator::{LeaseLiveness, LeaseOwner, process_alive};
use crate::idmap::UsernsMaps;
use crate::join::ContainerLookup;

/// Lifecycle status as far as namespace joining is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Setup has started; the namespace does not exist yet.
    Creating,
    /// The namespace exists; the workload has not started.
    Created,
    /// The workload is running.
    Running,
    /// The workload has exited.
    Stopped,
}

/// User namespace facts recorded for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUserns {
    /// Container ID.
    pub id: ContainerId,
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Current status.
    pub status: ContainerStatus,
    /// Whether the container has a user namespace other than the host's.
    pub userns: bool,
    /// The maps in effect.
    pub maps: UsernsMaps,
    /// Lease of the ranges backing the maps, if they were allocated.
    pub lease: Option<LeaseId>,
    /// PID of the container's init process, once started.
    pub pid: Option<u32>,
    /// PID of the process running setup, while the status is `Creating`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<u32>,
}

impl ContainerUserns {
    /// Whether this record still stands for a container.
    ///
    /// A `Creating` record whose setup process has died is an orphan.
    #[must_use]
    pub fn is_live(&self) -> bool {
        match (self.status, self.creator) {
            (ContainerStatus::Creating, Some(creator)) => process_alive(creator),
            _ => true,
        }
    }
}

/// Manages container user namespace records on disk.
#[derive(Debug, Clone)]
pub struct ContainerRegistry {
    /// Base directory holding one subdirectory per container.
    state_dir: PathBuf,
}

impl ContainerRegistry {
    /// Create a registry rooted at `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Path of a container's record.
    #[must_use]
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(id).join("userns.json")
    }

    /// Save a record, replacing any previous one.
    ///
    /// # Errors
    ///
    /// I/O or serialization failures.
    pub fn save(&self, record: &ContainerUserns) -> BockResult<()> {
        let path = self.record_path(record.id.as_str());
        let dir = path.parent().ok_or_else(|| BockError::Internal {
            message: format!("record path {} has no parent", path.display()),
        })?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        tracing::debug!(
            container_id = %record.id,
            path = %path.display(),
            "Saved user namespace record"
        );
        Ok(())
    }

    /// Load the record of container `id`.
    ///
    /// # Errors
    ///
    /// [`BockError::ContainerNotFound`] if there is none.
    pub fn load(&self, id: &str) -> BockResult<ContainerUserns> {
        let path = self.record_path(id);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BockError::ContainerNotFound { id: id.to_string() });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// Delete the record of container `id`; a missing record is fine.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn delete(&self, id: &str) -> BockResult<()> {
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => {
                tracing::debug!(container_id = %id, "Deleted user namespace record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List all recorded containers.
    ///
    /// # Errors
    ///
    /// I/O failures while scanning the state directory.
    pub fn list(&self) -> BockResult<Vec<ContainerUserns>> {
        let mut records = Vec::new();
        if !self.state_dir.exists() {
            return Ok(records);
        }

        for entry in std::fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.record_path(&name).exists() {
                continue;
            }
            match self.load(&name) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(container_id = %name, %err, "Skipping unreadable record"),
            }
        }

        Ok(records)
    }

    /// Whether container `id` has a record.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).exists()
    }
}

impl ContainerLookup for ContainerRegistry {
    fn lookup(&self, reference: &str) -> BockResult<Option<ContainerUserns>> {
        if ContainerId::new(reference).is_ok() && self.exists(reference) {
            return self.load(reference).map(Some);
        }
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.name.as_deref() == Some(reference)))
    }
}

impl LeaseLiveness for ContainerRegistry {
    fn is_live(&self, owner: &LeaseOwner) -> bool {
        match owner {
            LeaseOwner::Container(id) => match self.load(id.as_str()) {
                Ok(record) => record.is_live(),
                Err(BockError::ContainerNotFound { .. }) => false,
                Err(err) => {
                    tracing::warn!(container_id = %id, %err, "Unreadable record; keeping its lease");
                    true
                }
            },
            LeaseOwner::Process(pid) => process_alive(*pid),
        }
    }
}
