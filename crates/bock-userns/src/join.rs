//! Resolving `--userns=container:<name>` to an existing namespace.

use std::path::PathBuf;

use bock_common::{BockError, BockResult, ContainerId};
use serde::{Deserialize, Serialize};

use crate::idmap::UsernsMaps;
use crate::registry::{ContainerStatus, ContainerUserns};

/// Lookup of containers by name or ID.
pub trait ContainerLookup {
    /// The container called or identified by `reference`, if any.
    ///
    /// # Errors
    ///
    /// Failures of the underlying store; absence is `Ok(None)`.
    fn lookup(&self, reference: &str) -> BockResult<Option<ContainerUserns>>;
}

/// The user namespace a new container will join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTarget {
    /// Container that owns the namespace.
    pub container: ContainerId,
    /// `/proc/<pid>/ns/user` of the owner, when its init process is known.
    pub ns_path: Option<PathBuf>,
    /// The owner's finalized maps.
    pub maps: UsernsMaps,
}

/// Find the namespace of `reference`.
///
/// # Errors
///
/// [`BockError::ContainerNotFound`] if no such container exists,
/// [`BockError::NamespaceNotFound`] if it is still being created or runs in
/// the host user namespace.
pub fn resolve(lookup: &impl ContainerLookup, reference: &str) -> BockResult<JoinTarget> {
    let target = lookup
        .lookup(reference)?
        .ok_or_else(|| BockError::ContainerNotFound {
            id: reference.to_string(),
        })?;

    let unavailable = |reason: &str| BockError::NamespaceNotFound {
        id: target.id.to_string(),
        reason: reason.to_string(),
    };
    match target.status {
        ContainerStatus::Creating => {
            return Err(unavailable("the container is still being created"));
        }
        ContainerStatus::Stopped => return Err(unavailable("the container has stopped")),
        ContainerStatus::Created | ContainerStatus::Running => {}
    }
    if !target.userns {
        return Err(unavailable("the container runs in the host user namespace"));
    }

    tracing::debug!(
        container = %target.id,
        uid_entries = target.maps.uid_map.len(),
        gid_entries = target.maps.gid_map.len(),
        "Joining user namespace"
    );

    Ok(JoinTarget {
        ns_path: target
            .pid
            .map(|pid| PathBuf::from(format!("/proc/{pid}/ns/user"))),
        container: target.id,
        maps: target.maps,
    })
}
