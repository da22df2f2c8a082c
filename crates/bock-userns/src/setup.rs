//! User namespace setup for one container.
//!
//! [`UsernsManager::setup`] runs the whole pipeline: parse, validate,
//! allocate or resolve, build, record. Either the container ends up with a
//! committed record and the ranges behind it, or nothing is left behind.

use std::path::PathBuf;

use bock_common::{BockError, BockResult, ContainerId, LeaseId};
use serde::{Deserialize, Serialize};

use crate::allocator::{AllocationRecord, Allocator, LeaseOwner};
use crate::builder::{
    auto_minimum, build_auto, build_explicit, build_keep_id, build_private, keep_id_length,
};
use crate::config::UsernsConfig;
use crate::idmap::{IdKind, IdMap, UsernsMaps};
use crate::join::{self, ContainerLookup, JoinTarget};
use crate::parser::{ExplicitMaps, MappingRequest, UserSpec, parse_id_maps, parse_userns};
use crate::registry::{ContainerRegistry, ContainerStatus, ContainerUserns};
use crate::subid::{IdRange, Invoker, PoolReader};
use crate::validate::{ConflictSet, reconcile, validate};

/// Raw user namespace options of a container, as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct UsernsOptions {
    /// `--userns`; `None` when neither the flag nor its default is set.
    pub userns: Option<String>,
    /// `--uidmap` values.
    pub uid_map: Vec<String>,
    /// `--gidmap` values.
    pub gid_map: Vec<String>,
    /// `--subuidname`.
    pub sub_uid_name: Option<String>,
    /// `--subgidname`.
    pub sub_gid_name: Option<String>,
    /// `--user`.
    pub user: Option<String>,
    /// Container name.
    pub name: Option<String>,
    /// Container ID; generated when absent.
    pub id: Option<ContainerId>,
}

/// How the container's user namespace comes into being.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NamespaceMode {
    /// Create a new user namespace with the given maps.
    New,
    /// Join the namespace of another container.
    Join {
        /// Owner of the namespace.
        container: ContainerId,
        /// Namespace file to open, when the owner is running.
        path: Option<PathBuf>,
    },
    /// Stay in the host user namespace.
    Host,
}

/// Finished user namespace setup, handed to whatever creates the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernsSetup {
    /// Container the setup belongs to.
    pub container: ContainerId,
    /// New, joined or host namespace.
    pub mode: NamespaceMode,
    /// UID mappings.
    pub uid_map: IdMap,
    /// GID mappings.
    pub gid_map: IdMap,
    /// Lease of the allocated ranges, if any were allocated.
    pub lease: Option<LeaseId>,
}

impl UsernsSetup {
    /// Contents for `/proc/<pid>/uid_map` or `/proc/<pid>/gid_map`.
    #[must_use]
    pub fn proc_map(&self, kind: IdKind) -> String {
        match kind {
            IdKind::Uid => self.uid_map.to_proc_format(),
            IdKind::Gid => self.gid_map.to_proc_format(),
        }
    }
}

/// A validated request, ready to be turned into maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// The mapping mode after folding in the legacy options.
    pub request: MappingRequest,
    /// Parsed `--user`, if given.
    pub user: Option<UserSpec>,
}

/// Sets up, joins and tears down container user namespaces.
#[derive(Debug)]
pub struct UsernsManager {
    config: UsernsConfig,
    invoker: Invoker,
    pools: PoolReader,
    registry: ContainerRegistry,
    allocator: Allocator<ContainerRegistry>,
}

impl UsernsManager {
    /// Create a manager acting on behalf of `invoker`.
    #[must_use]
    pub fn new(config: UsernsConfig, invoker: Invoker) -> Self {
        let registry = config.registry();
        Self {
            pools: config.pool_reader(),
            allocator: config.allocator(registry.clone()),
            registry,
            invoker,
            config,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &UsernsConfig {
        &self.config
    }

    /// The container records.
    #[must_use]
    pub const fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    /// Parse and cross-check the options without touching any state.
    ///
    /// # Errors
    ///
    /// [`BockError::InvalidSyntax`], [`BockError::Conflict`] or
    /// [`BockError::Config`].
    pub fn prepare(&self, opts: &UsernsOptions) -> BockResult<PreparedRequest> {
        let raw = opts.userns.as_ref().or(self.config.default_userns.as_ref());
        let userns = raw.map(|raw| parse_userns(raw)).transpose()?;

        let legacy = ExplicitMaps {
            uid_map: parse_id_maps(&opts.uid_map)?,
            gid_map: parse_id_maps(&opts.gid_map)?,
            sub_uid_name: opts.sub_uid_name.clone(),
            sub_gid_name: opts.sub_gid_name.clone(),
        };
        let user = opts.user.as_deref().map(str::parse).transpose()?;

        validate(userns.as_ref(), ConflictSet::of(&legacy), &self.invoker)?;

        Ok(PreparedRequest {
            request: reconcile(userns, legacy),
            user,
        })
    }

    /// Set up the user namespace of a new container.
    ///
    /// # Errors
    ///
    /// Any [`BockError`] of the pipeline; on error no record or lease is left.
    pub fn setup(&self, opts: &UsernsOptions) -> BockResult<UsernsSetup> {
        let prepared = self.prepare(opts)?;
        let id = opts.id.clone().unwrap_or_else(ContainerId::generate);
        if self.registry.exists(id.as_str()) {
            return Err(BockError::Conflict {
                message: format!("container {id} already exists"),
            });
        }
        if let Some(name) = &opts.name {
            self.claim_name(name)?;
        }

        // The record exists before any range is committed so the lease
        // counts as live for concurrent allocators.
        let mut record = ContainerUserns {
            id: id.clone(),
            name: opts.name.clone(),
            status: ContainerStatus::Creating,
            userns: false,
            maps: UsernsMaps::default(),
            lease: None,
            pid: None,
            creator: Some(std::process::id()),
        };
        self.registry.save(&record)?;

        match self.resolve(&id, &prepared) {
            Ok(setup) => {
                record.status = ContainerStatus::Created;
                record.creator = None;
                record.userns = setup.mode != NamespaceMode::Host;
                record.maps = UsernsMaps::new(setup.uid_map.clone(), setup.gid_map.clone());
                record.lease.clone_from(&setup.lease);
                if let Err(err) = self.registry.save(&record) {
                    self.rollback(&id, setup.lease.as_ref());
                    return Err(err);
                }

                tracing::info!(
                    container_id = %id,
                    mode = prepared.request.name(),
                    uid_entries = setup.uid_map.len(),
                    gid_entries = setup.gid_map.len(),
                    "User namespace set up"
                );
                Ok(setup)
            }
            Err(err) => {
                self.rollback(&id, None);
                Err(err)
            }
        }
    }

    /// Fail if `name` already refers to a container; orphans of crashed
    /// setups are cleared instead.
    fn claim_name(&self, name: &str) -> BockResult<()> {
        let Some(existing) = self.registry.lookup(name)? else {
            return Ok(());
        };
        if existing.is_live() {
            return Err(BockError::Conflict {
                message: format!("name {name:?} is already in use by container {}", existing.id),
            });
        }

        tracing::warn!(container_id = %existing.id, name, "Removing record of an abandoned setup");
        self.registry.delete(existing.id.as_str())
    }

    fn resolve(&self, id: &ContainerId, prepared: &PreparedRequest) -> BockResult<UsernsSetup> {
        let owner = LeaseOwner::Container(id.clone());
        let user = prepared.user.as_ref();
        let setup = |mode, maps: UsernsMaps, lease| UsernsSetup {
            container: id.clone(),
            mode,
            uid_map: maps.uid_map,
            gid_map: maps.gid_map,
            lease,
        };

        match &prepared.request {
            MappingRequest::Auto(opts) => {
                let (lease, uid, gid) =
                    self.allocate(&owner, opts.size, auto_minimum(opts, user))?;
                match build_auto(opts, uid, gid) {
                    Ok(maps) => Ok(setup(NamespaceMode::New, maps, Some(lease))),
                    Err(err) => {
                        self.release_after_failure(id, &lease);
                        Err(err)
                    }
                }
            }
            MappingRequest::KeepId(opts) => {
                let length = keep_id_length(opts, &self.invoker, user);
                let (lease, uid, gid) = self.allocate(&owner, Some(length), length)?;
                match build_keep_id(opts, &self.invoker, uid, gid) {
                    Ok(maps) => Ok(setup(NamespaceMode::New, maps, Some(lease))),
                    Err(err) => {
                        self.release_after_failure(id, &lease);
                        Err(err)
                    }
                }
            }
            MappingRequest::Container { target } => {
                let JoinTarget {
                    container,
                    ns_path,
                    maps,
                } = join::resolve(&self.registry, target)?;
                Ok(setup(
                    NamespaceMode::Join {
                        container,
                        path: ns_path,
                    },
                    maps,
                    None,
                ))
            }
            MappingRequest::Host => Ok(setup(NamespaceMode::Host, UsernsMaps::default(), None)),
            MappingRequest::Private => Ok(setup(
                NamespaceMode::New,
                build_private(&self.invoker, &self.pools),
                None,
            )),
            MappingRequest::Explicit(maps) => Ok(setup(
                NamespaceMode::New,
                build_explicit(maps, &self.pools)?,
                None,
            )),
        }
    }

    /// Allocate one UID and one GID range under a single lease.
    fn allocate(
        &self,
        owner: &LeaseOwner,
        requested: Option<u32>,
        minimum: u32,
    ) -> BockResult<(LeaseId, IdRange, IdRange)> {
        let uid_pool = self.pools.pool_for(IdKind::Uid, &self.invoker)?;
        let gid_pool = self.pools.pool_for(IdKind::Gid, &self.invoker)?;
        let allocation = self
            .allocator
            .allocate(&[uid_pool.as_ref(), gid_pool.as_ref()], owner, requested, minimum)?;

        match (allocation.range(IdKind::Uid), allocation.range(IdKind::Gid)) {
            (Some(uid), Some(gid)) => Ok((allocation.lease, uid, gid)),
            _ => {
                self.release_after_failure(owner, &allocation.lease);
                Err(BockError::Internal {
                    message: "allocation is missing a UID or GID range".to_string(),
                })
            }
        }
    }

    /// Release `lease` on an error path, keeping the original error.
    fn release_after_failure(&self, owner: &impl std::fmt::Display, lease: &LeaseId) {
        if let Err(err) = self.allocator.release(lease) {
            tracing::warn!(%owner, %lease, %err, "Failed to release lease");
        }
    }

    fn rollback(&self, id: &ContainerId, lease: Option<&LeaseId>) {
        if let Some(lease) = lease {
            self.release_after_failure(id, lease);
        }
        if let Err(err) = self.registry.delete(id.as_str()) {
            tracing::warn!(container_id = %id, %err, "Failed to delete record");
        }
    }

    /// Record that the container's init process `pid` is running.
    ///
    /// # Errors
    ///
    /// [`BockError::ContainerNotFound`] for an unknown container.
    pub fn started(&self, id: &str, pid: u32) -> BockResult<()> {
        let mut record = self.registry.load(id)?;
        record.status = ContainerStatus::Running;
        record.pid = Some(pid);
        self.registry.save(&record)
    }

    /// Record that the container's workload has exited.
    ///
    /// Its ranges stay committed until [`Self::remove`].
    ///
    /// # Errors
    ///
    /// [`BockError::ContainerNotFound`] for an unknown container.
    pub fn stopped(&self, id: &str) -> BockResult<()> {
        let mut record = self.registry.load(id)?;
        record.status = ContainerStatus::Stopped;
        record.pid = None;
        self.registry.save(&record)
    }

    /// Resolve the namespace of container `reference` for joining.
    ///
    /// # Errors
    ///
    /// [`BockError::ContainerNotFound`] or [`BockError::NamespaceNotFound`].
    pub fn join(&self, reference: &str) -> BockResult<JoinTarget> {
        join::resolve(&self.registry, reference)
    }

    /// Release the ranges of `lease`; unknown leases release nothing.
    ///
    /// # Errors
    ///
    /// [`BockError::LockTimeout`] or ledger I/O failures.
    pub fn release(&self, lease: &LeaseId) -> BockResult<usize> {
        self.allocator.release(lease)
    }

    /// Tear down container `id`: release its ranges and drop its record.
    ///
    /// # Errors
    ///
    /// [`BockError::LockTimeout`] or I/O failures.
    pub fn remove(&self, id: &ContainerId) -> BockResult<usize> {
        let released = self
            .allocator
            .release_owner(&LeaseOwner::Container(id.clone()))?;
        self.registry.delete(id.as_str())?;
        tracing::info!(container_id = %id, released, "Removed container user namespace");
        Ok(released)
    }

    /// Live records of the allocation ledger.
    ///
    /// # Errors
    ///
    /// [`BockError::LockTimeout`] or ledger I/O failures.
    pub fn leases(&self) -> BockResult<Vec<AllocationRecord>> {
        self.allocator.list()
    }
}
