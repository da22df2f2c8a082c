//! CLI command definitions and handlers.

use std::path::PathBuf;

use bock_common::{BockResult, ContainerId, LeaseId};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::UsernsConfig;
use crate::setup::{UsernsManager, UsernsOptions};
use crate::subid::Invoker;

/// Exit code for any failure to set up a user namespace.
pub const EXIT_SETUP_FAILURE: i32 = 125;

/// Bock user namespace helper
#[derive(Parser)]
#[command(name = "bock-userns")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for bock data
    #[arg(long, global = true, env = "BOCK_ROOT")]
    pub root: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true, env = "BOCK_USERNS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subordinate UID file
    #[arg(long, global = true, hide = true)]
    pub subuid_file: Option<PathBuf>,

    /// Subordinate GID file
    #[arg(long, global = true, hide = true)]
    pub subgid_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// User namespace commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Compute and commit the user namespace of a new container
    Setup {
        /// User namespace mode (auto, keep-id, container:<name>, host, private)
        #[arg(long, env = "BOCK_USERNS")]
        userns: Option<String>,

        /// UID mapping container:host:size (repeatable)
        #[arg(long = "uidmap")]
        uid_map: Vec<String>,

        /// GID mapping container:host:size (repeatable)
        #[arg(long = "gidmap")]
        gid_map: Vec<String>,

        /// Map UIDs from this user's subordinate range
        #[arg(long = "subuidname")]
        sub_uid_name: Option<String>,

        /// Map GIDs from this user's subordinate range
        #[arg(long = "subgidname")]
        sub_gid_name: Option<String>,

        /// User the container runs as (uid[:gid])
        #[arg(short, long)]
        user: Option<String>,

        /// Container name
        #[arg(long)]
        name: Option<String>,
    },

    /// Release the ranges held by a lease
    Release {
        /// Lease ID
        lease: LeaseId,
    },

    /// Release a container's ranges and forget its namespace
    Remove {
        /// Container ID
        container_id: ContainerId,
    },

    /// List committed ranges
    Leases,

    /// Show the namespace a container would join
    Join {
        /// Container name or ID
        container: String,
    },
}

#[derive(Serialize)]
struct Released {
    released: usize,
}

impl Cli {
    /// Build the configuration from defaults, the config file and flags.
    ///
    /// # Errors
    ///
    /// [`bock_common::BockError::Config`] for a malformed config file.
    pub fn load_config(&self, invoker: &Invoker) -> BockResult<UsernsConfig> {
        let rootless = !invoker.is_superuser();
        let mut config = if rootless {
            UsernsConfig::rootless()
        } else {
            UsernsConfig::default()
        };

        if let Some(path) = self.config.clone().or_else(|| UsernsConfig::default_file(rootless)) {
            config = config.load_file(&path)?;
        }
        if let Some(root) = &self.root {
            config = config.with_root(root);
        }
        if let Some(subuid) = &self.subuid_file {
            config.subuid_file.clone_from(subuid);
        }
        if let Some(subgid) = &self.subgid_file {
            config.subgid_file.clone_from(subgid);
        }
        Ok(config)
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Any failure of the command; the caller exits with
    /// [`EXIT_SETUP_FAILURE`].
    pub fn execute(self) -> BockResult<()> {
        let invoker = Invoker::current();
        let config = self.load_config(&invoker)?;
        tracing::debug!(
            uid = invoker.uid,
            principal = invoker.principal(),
            root = %config.paths.root.display(),
            "Loaded configuration"
        );
        let manager = UsernsManager::new(config, invoker);

        match self.command {
            Commands::Setup {
                userns,
                uid_map,
                gid_map,
                sub_uid_name,
                sub_gid_name,
                user,
                name,
            } => {
                let setup = manager.setup(&UsernsOptions {
                    userns,
                    uid_map,
                    gid_map,
                    sub_uid_name,
                    sub_gid_name,
                    user,
                    name,
                    id: None,
                })?;
                print_json(&setup)
            }

            Commands::Release { lease } => {
                let released = manager.release(&lease)?;
                print_json(&Released { released })
            }

            Commands::Remove { container_id } => {
                let released = manager.remove(&container_id)?;
                print_json(&Released { released })
            }

            Commands::Leases => print_json(&manager.leases()?),

            Commands::Join { container } => print_json(&manager.join(&container)?),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> BockResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}
