//! Failure classes of a test case.

use std::time::Duration;

use rill_client::ClientError;
use rill_cluster::ClusterError;
use rill_workload::WorkloadError;
use thiserror::Error;

/// The result type returned by test-case bodies.
pub type Result<T> = std::result::Result<T, CaseError>;

/// Why a test case failed.
///
/// Infrastructure and timeout failures abort a case at the point they
/// happen. Contract and verification failures are collected first, so a
/// single error can carry several of them.
#[derive(Debug, Error)]
pub enum CaseError {
    /// The cluster could not be brought up, reached, or torn down.
    #[error("infrastructure failure: {message}")]
    Infrastructure {
        /// What failed.
        message: String,
    },

    /// An operation succeeded where failure was expected, or the reverse.
    #[error("contract violated:\n  {}", failures.join("\n  "))]
    Contract {
        /// One entry per failed expectation, naming the operation.
        failures: Vec<String>,
    },

    /// The observed model diverged from the expected model.
    #[error("verification failed:\n{summary}")]
    Verification {
        /// Verdict summaries.
        summary: String,
    },

    /// A bounded wait expired.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// How long the wait lasted.
        waited: Duration,
    },
}

impl CaseError {
    /// A broker operation failed that was expected to succeed.
    #[must_use]
    pub fn contract(operation: impl Into<String>, source: &ClientError) -> Self {
        Self::Contract {
            failures: vec![format!("{}: {source}", operation.into())],
        }
    }

    /// Returns true for the timeout class.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true for the infrastructure class.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure { .. })
    }
}

impl From<ClusterError> for CaseError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotReady {
                node,
                address,
                waited,
            } => Self::Timeout {
                what: format!("{node} to accept connections at {address}"),
                waited,
            },
            other => Self::Infrastructure {
                message: other.to_string(),
            },
        }
    }
}

impl From<WorkloadError> for CaseError {
    fn from(err: WorkloadError) -> Self {
        match err {
            WorkloadError::Client { operation, source } => Self::contract(operation, &source),
            WorkloadError::Timeout { what, waited } => Self::Timeout { what, waited },
            WorkloadError::Verification { summary } => Self::Verification { summary },
            WorkloadError::Contract { failures } => Self::Contract { failures },
            other @ (WorkloadError::InvalidConfig { .. } | WorkloadError::TaskFailed { .. }) => {
                Self::Infrastructure {
                    message: other.to_string(),
                }
            }
        }
    }
}
