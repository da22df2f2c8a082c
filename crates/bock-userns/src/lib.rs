//! # Bock user namespaces
//!
//! Identity mapping for rootless Bock containers: which host IDs back a
//! container's user namespace, how they translate to in-container IDs, and
//! whether the namespace is new, shared with another container, or the host's.
//!
//! ## Usage
//!
//! ```no_run
//! use bock_userns::{Invoker, UsernsConfig, UsernsManager, UsernsOptions};
//!
//! # fn example() -> bock_common::BockResult<()> {
//! let manager = UsernsManager::new(UsernsConfig::rootless(), Invoker::current());
//!
//! let setup = manager.setup(&UsernsOptions {
//!     userns: Some("auto:size=65536".to_string()),
//!     user: Some("1000:1000".to_string()),
//!     ..Default::default()
//! })?;
//! println!("{}", setup.uid_map.to_proc_format());
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod builder;
pub mod cli;
pub mod config;
pub mod idmap;
pub mod join;
pub mod parser;
pub mod registry;
pub mod setup;
pub mod subid;
pub mod validate;

pub use allocator::{Allocation, AllocationRecord, Allocator, LeaseLiveness, LeaseOwner};
pub use config::UsernsConfig;
pub use idmap::{IdKind, IdMap, IdMapEntry, UsernsMaps};
pub use join::{ContainerLookup, JoinTarget};
pub use parser::{MappingRequest, UserSpec, parse_userns};
pub use registry::{ContainerRegistry, ContainerStatus, ContainerUserns};
pub use setup::{NamespaceMode, UsernsManager, UsernsOptions, UsernsSetup};
pub use subid::{IdRange, IdRangePool, Invoker, PoolReader};
