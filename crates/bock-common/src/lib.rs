//! # bock-common
//!
//! Shared utilities and types for the Bock container ecosystem.
//!
//! This crate provides common functionality used across all Bock crates:
//! - Container ID and lease ID generation
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{BockError, BockResult};
pub use id::{ContainerId, LeaseId};
pub use paths::BockPaths;
