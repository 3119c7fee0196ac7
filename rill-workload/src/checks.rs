//! Contract checks.
//!
//! A test case often asserts that a sequence of broker operations succeed or
//! fail in specific ways. [`Checks`] collects every outcome instead of
//! stopping at the first surprise, then reports all failures together, each
//! with the operation that was attempted.

use std::fmt;

use rill_client::ClientError;
use tracing::warn;

use crate::error::{Result, WorkloadError};
use crate::verification::Verdict;

/// Collected contract and verification outcomes.
#[derive(Debug, Default)]
pub struct Checks {
    contract: Vec<String>,
    verification: Vec<String>,
    passed: usize,
}

impl Checks {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expects `result` to be an error accepted by `accept`.
    ///
    /// Returns true if it was.
    pub fn expect_err<T: fmt::Debug>(
        &mut self,
        operation: &str,
        result: std::result::Result<T, ClientError>,
        accept: impl FnOnce(&ClientError) -> bool,
    ) -> bool {
        match result {
            Err(e) if accept(&e) => {
                self.passed += 1;
                true
            }
            Err(e) => {
                self.contract(format!("{operation}: failed with unexpected error: {e}"));
                false
            }
            Ok(value) => {
                self.contract(format!("{operation}: expected failure, got {value:?}"));
                false
            }
        }
    }

    /// Expects `result` to succeed and returns its value.
    pub fn expect_ok<T>(
        &mut self,
        operation: &str,
        result: std::result::Result<T, ClientError>,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                self.passed += 1;
                Some(value)
            }
            Err(e) => {
                self.contract(format!("{operation}: expected success, failed with: {e}"));
                None
            }
        }
    }

    /// Expects `condition` to hold.
    pub fn expect(&mut self, what: &str, condition: bool) -> bool {
        if condition {
            self.passed += 1;
        } else {
            self.contract(format!("{what}: did not hold"));
        }
        condition
    }

    /// Records a verification verdict.
    pub fn verdict(&mut self, verdict: &Verdict) -> bool {
        if verdict.is_pass() {
            self.passed += 1;
            return true;
        }
        warn!(%verdict, "verification failed");
        self.verification.push(verdict.to_string());
        false
    }

    /// Returns how many checks passed.
    #[must_use]
    pub const fn passed(&self) -> usize {
        self.passed
    }

    /// Returns how many checks failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.contract.len() + self.verification.len()
    }

    /// Reports the collected failures.
    ///
    /// # Errors
    /// Returns `Contract` if any contract check failed (verification
    /// failures are listed with it), otherwise `Verification` if any
    /// verdict failed.
    pub fn finish(self) -> Result<()> {
        if !self.contract.is_empty() {
            let mut failures = self.contract;
            failures.extend(self.verification);
            return Err(WorkloadError::Contract { failures });
        }
        if !self.verification.is_empty() {
            return Err(WorkloadError::Verification {
                summary: self.verification.join("\n"),
            });
        }
        Ok(())
    }

    fn contract(&mut self, failure: String) {
        warn!(%failure, "contract check failed");
        self.contract.push(failure);
    }
}
