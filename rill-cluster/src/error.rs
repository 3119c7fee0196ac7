//! Errors raised while describing, starting, or stopping a cluster.

use std::time::Duration;

use thiserror::Error;

/// The result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur while orchestrating a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The topology violates a start-order or addressing rule.
    #[error("invalid topology: {reason}")]
    InvalidTopology {
        /// What is wrong with it.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read cluster config from {path}: {source}")]
    ConfigIo {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("failed to parse cluster config: {message}")]
    ConfigParse {
        /// Parser message.
        message: String,
    },

    /// A launch command references a placeholder that does not exist.
    #[error("unknown placeholder {{{name}}} in launch command")]
    UnknownPlaceholder {
        /// The placeholder name without braces.
        name: String,
    },

    /// The scratch directory could not be created.
    #[error("failed to create scratch directory: {0}")]
    Scratch(std::io::Error),

    /// A node process could not be spawned.
    #[error("failed to spawn {node}: {source}")]
    SpawnFailed {
        /// Node name, e.g. `broker-0`.
        node: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A node process exited while the cluster was starting.
    #[error("{node} exited before becoming ready ({status})")]
    NodeExited {
        /// Node name.
        node: String,
        /// Exit status as reported by the OS.
        status: String,
    },

    /// A node did not accept connections within the readiness timeout.
    #[error("{node} not ready at {address} after {waited:?}")]
    NotReady {
        /// Node name.
        node: String,
        /// Address that was probed.
        address: String,
        /// How long readiness was polled.
        waited: Duration,
    },

    /// Any other I/O failure while managing node processes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Returns true if the error happened before any node was launched.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidTopology { .. }
                | Self::ConfigIo { .. }
                | Self::ConfigParse { .. }
                | Self::UnknownPlaceholder { .. }
        )
    }
}
