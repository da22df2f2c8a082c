//! Cross-checks between `--userns` and the legacy mapping options.

use bock_common::{BockError, BockResult};

use crate::parser::{ExplicitMaps, MappingRequest};
use crate::subid::Invoker;

/// Message of the [`BockError::Conflict`] raised for mixed sources.
pub const CONFLICT_MESSAGE: &str =
    "--userns and --uidmap/--gidmap/--subuidname/--subgidname are mutually exclusive";

/// Which legacy options were supplied on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictSet {
    /// `--uidmap` was given.
    pub uid_map: bool,
    /// `--gidmap` was given.
    pub gid_map: bool,
    /// `--subuidname` was given.
    pub sub_uid_name: bool,
    /// `--subgidname` was given.
    pub sub_gid_name: bool,
}

impl ConflictSet {
    /// Record which fields of `maps` are populated.
    #[must_use]
    pub fn of(maps: &ExplicitMaps) -> Self {
        Self {
            uid_map: !maps.uid_map.is_empty(),
            gid_map: !maps.gid_map.is_empty(),
            sub_uid_name: maps.sub_uid_name.is_some(),
            sub_gid_name: maps.sub_gid_name.is_some(),
        }
    }

    /// Whether no legacy option was given.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !(self.uid_map || self.gid_map || self.sub_uid_name || self.sub_gid_name)
    }

    /// Whether a named subordinate pool was requested.
    #[must_use]
    pub const fn names_pool(&self) -> bool {
        self.sub_uid_name || self.sub_gid_name
    }
}

/// Reject contradictory configuration before anything is allocated.
///
/// `userns` is `None` when neither the flag nor its environment default was
/// set. An unset mode accepts every legacy option; `private` accepts
/// `--uidmap`/`--gidmap` only; any other mode accepts none of them.
///
/// # Errors
///
/// [`BockError::Conflict`] for mixed sources, [`BockError::Config`] for
/// `keep-id` requested by the host superuser.
pub fn validate(
    userns: Option<&MappingRequest>,
    conflicts: ConflictSet,
    invoker: &Invoker,
) -> BockResult<()> {
    let conflicting = match userns {
        None | Some(MappingRequest::Explicit(_)) => false,
        Some(MappingRequest::Private) => conflicts.names_pool(),
        Some(_) => !conflicts.is_empty(),
    };
    if conflicting {
        return Err(BockError::Conflict {
            message: CONFLICT_MESSAGE.to_string(),
        });
    }

    if matches!(userns, Some(MappingRequest::KeepId(_))) && invoker.is_superuser() {
        return Err(BockError::config(
            "keep-id is only supported in rootless mode: the superuser already owns every ID",
        ));
    }

    Ok(())
}

/// Fold the legacy options into the request the builder works from.
#[must_use]
pub fn reconcile(userns: Option<MappingRequest>, legacy: ExplicitMaps) -> MappingRequest {
    match userns {
        None | Some(MappingRequest::Private) if !legacy.is_empty() => {
            MappingRequest::Explicit(legacy)
        }
        None => MappingRequest::Private,
        Some(request) => request,
    }
}
