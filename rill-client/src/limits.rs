//! Broker limits the harness relies on.
//!
//! Every limit is explicit. Tests that probe a limit (oversized records,
//! outstanding delivery windows) read it from here instead of hard-coding it.

use std::time::Duration;

use crate::error::{ClientError, Result};

/// Limits of a broker deployment as assumed by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of a single record payload in bytes.
    pub max_record_bytes: usize,
    /// Maximum number of records accepted by one append call.
    pub max_records_per_append: usize,
    /// Ack timeout applied when a subscription does not set one.
    pub default_ack_timeout: Duration,
    /// Maximum number of unacknowledged deliveries held by one consumer.
    pub max_outstanding_per_consumer: usize,
}

impl Limits {
    /// Creates limits with the broker's documented defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // 1 MiB records, 10k records per append.
            max_record_bytes: 1024 * 1024,
            max_records_per_append: 10_000,

            // Subscriptions redeliver after a minute without an ack.
            default_ack_timeout: Duration::from_secs(60),
            max_outstanding_per_consumer: 512,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_record_bytes == 0 {
            return Err(ClientError::InvalidArgument {
                name: "max_record_bytes",
                reason: "must be positive".to_string(),
            });
        }

        if self.max_records_per_append == 0 {
            return Err(ClientError::InvalidArgument {
                name: "max_records_per_append",
                reason: "must be positive".to_string(),
            });
        }

        if self.default_ack_timeout.is_zero() {
            return Err(ClientError::InvalidArgument {
                name: "default_ack_timeout",
                reason: "must be positive".to_string(),
            });
        }

        if self.max_outstanding_per_consumer == 0 {
            return Err(ClientError::InvalidArgument {
                name: "max_outstanding_per_consumer",
                reason: "must be positive".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = Limits::new();
        assert!(limits.validate().is_ok());
        assert_eq!(limits.max_record_bytes, 1024 * 1024);
    }

    #[test]
    fn test_zero_record_size_rejected() {
        let mut limits = Limits::new();
        limits.max_record_bytes = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_zero_ack_timeout_rejected() {
        let mut limits = Limits::new();
        limits.default_ack_timeout = Duration::ZERO;
        assert!(limits.validate().is_err());
    }
}
