//! Error types for workload production and consumption.

use std::time::Duration;

use rill_client::ClientError;
use thiserror::Error;

/// Result type for workload operations.
pub type Result<T> = std::result::Result<T, WorkloadError>;

/// Errors raised while producing, consuming, or checking a workload.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// A broker operation failed where the workload needed it to succeed.
    #[error("{operation} failed: {source}")]
    Client {
        /// The operation and its arguments.
        operation: String,
        /// The broker's error.
        #[source]
        source: ClientError,
    },

    /// A bounded wait expired.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// How long the wait lasted.
        waited: Duration,
    },

    /// The workload or consumer description is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Why it was rejected.
        reason: String,
    },

    /// A producer or consumer task panicked or was cancelled.
    #[error("task failed: {message}")]
    TaskFailed {
        /// Description of the failure.
        message: String,
    },

    /// Expected and observed models diverged.
    #[error("verification failed: {summary}")]
    Verification {
        /// Diagnostic with counts and a sample of the difference.
        summary: String,
    },

    /// One or more contract checks did not hold.
    #[error("{} contract check(s) failed:\n  {}", failures.len(), failures.join("\n  "))]
    Contract {
        /// One line per failed check, with the attempted operation.
        failures: Vec<String>,
    },
}

impl WorkloadError {
    /// Wraps a client error with the operation that produced it.
    pub fn client(operation: impl Into<String>, source: ClientError) -> Self {
        Self::Client {
            operation: operation.into(),
            source,
        }
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
