//! Common error types for the Bock ecosystem.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`BockError`].
pub type BockResult<T> = Result<T, BockError>;

/// Common errors across the Bock ecosystem.
#[derive(Error, Diagnostic, Debug)]
pub enum BockError {
    /// A configuration token could not be parsed.
    #[error("Invalid syntax in {token:?}: {reason}")]
    #[diagnostic(
        code(bock::userns::invalid_syntax),
        help(
            "Valid forms are auto[:size=N,uidmapping=C:H:S,gidmapping=C:H:S], keep-id[:uid=U,gid=G], container:<name>, host, private and C:H:S"
        )
    )]
    InvalidSyntax {
        /// The offending token.
        token: String,
        /// Why the token was rejected.
        reason: String,
    },

    /// Mutually exclusive configuration sources were supplied together.
    #[error("{message}")]
    #[diagnostic(code(bock::userns::conflict))]
    Conflict {
        /// The error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(bock::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// No subordinate ID range is configured for a principal.
    #[error("No subordinate {kind} range configured for {principal:?} in {file}")]
    #[diagnostic(
        code(bock::userns::pool_not_found),
        help("Add an entry for the user to /etc/subuid and /etc/subgid (see usermod --add-subuids)")
    )]
    PoolNotFound {
        /// The principal that was looked up.
        principal: String,
        /// "uid" or "gid".
        kind: String,
        /// The file that was searched.
        file: String,
    },

    /// The subordinate ID pool has no free range of the requested size.
    #[error("No free {kind} range of {length} IDs left for {principal:?}")]
    #[diagnostic(
        code(bock::userns::pool_exhausted),
        help("Remove unused containers or enlarge the subordinate ID range")
    )]
    PoolExhausted {
        /// The principal whose pool is exhausted.
        principal: String,
        /// "uid" or "gid".
        kind: String,
        /// The requested range length.
        length: u32,
    },

    /// Two mapping entries cover the same container ID.
    #[error("Overlapping {kind} mapping: container ID {container_id} is mapped more than once")]
    #[diagnostic(code(bock::userns::overlap))]
    Overlap {
        /// "uid" or "gid".
        kind: String,
        /// The first container ID covered twice.
        container_id: u32,
    },

    /// Two mapping entries map onto the same host ID.
    #[error("Overlapping {kind} mapping: host ID {host_id} is mapped more than once")]
    #[diagnostic(
        code(bock::userns::host_overlap),
        help("Custom auto mappings must not use host IDs of the allocated range")
    )]
    HostOverlap {
        /// "uid" or "gid".
        kind: String,
        /// The first host ID covered twice.
        host_id: u32,
    },

    /// The allocation ledger lock could not be acquired in time.
    #[error("Timed out after {waited_ms}ms waiting for the ID allocation lock {path}")]
    #[diagnostic(
        code(bock::userns::lock_timeout),
        help("Another container is being set up; retry the command")
    )]
    LockTimeout {
        /// The lock file.
        path: String,
        /// How long acquisition was attempted.
        waited_ms: u64,
    },

    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(bock::container::not_found))]
    ContainerNotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// The container exists but has no user namespace that can be joined.
    #[error("Container {id} has no user namespace to join: {reason}")]
    #[diagnostic(code(bock::userns::namespace_not_found))]
    NamespaceNotFound {
        /// The container that was resolved.
        id: String,
        /// Why the namespace is unavailable.
        reason: String,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(bock::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(bock::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(bock::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(bock::internal),
        help("This is a bug, please report it at https://github.com/bock-containers/bock/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl BockError {
    /// Shorthand for [`BockError::InvalidSyntax`].
    pub fn syntax(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSyntax {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`BockError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed without operator action.
    ///
    /// Only lock contention is transient; every other kind needs corrected
    /// input or host reconfiguration.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

impl From<serde_json::Error> for BockError {
    fn from(err: serde_json::Error) -> Self {
        BockError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BockError::ContainerNotFound {
            id: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "Container not found: abc123");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BockError = io_err.into();
        assert!(matches!(err, BockError::Io(_)));
    }

    #[test]
    fn only_lock_timeout_is_retryable() {
        let timeout = BockError::LockTimeout {
            path: "/run/bock/userns.lock".to_string(),
            waited_ms: 10_000,
        };
        assert!(timeout.is_retryable());
        assert!(!BockError::syntax("size=x", "not a number").is_retryable());
        assert!(!BockError::config("keep-id as root").is_retryable());
    }

    #[test]
    fn syntax_error_names_token() {
        let err = BockError::syntax("bogus=1", "unknown option");
        assert!(err.to_string().contains("bogus=1"));
    }
}
