//! Rill Tests - scoped test cases and the scenario suite.
//!
//! Every case runs through [`run_case`], which acquires an [`Environment`]
//! (the in-process simulated broker by default, or an orchestrated cluster
//! when `RILL_CLUSTER_CONFIG` names a config file), passes the body a
//! [`Case`], and always tears down afterwards.
//!
//! ## Test Organization
//!
//! **Scenario Tests** (`*_tests.rs`): broker contract as seen through the
//! harness
//! - `stream_tests`: stream create/list/delete and failure paths
//! - `subscription_tests`: subscription lifecycle and consumer attachment
//! - `producer_tests`: direct and batched writes, batch triggers, backpressure
//! - `consumer_tests`: delivery, acknowledgment, and redelivery
//! - `group_tests`: consumer groups and ordering-key exclusivity
//! - `cross_node_tests`: operations split across node addresses
//!
//! **Support Modules**:
//! - `harness`: [`run_case`], [`Case`], logging setup
//! - `environment`: simulated and orchestrated backends
//! - `error`: [`CaseError`], the failure classes of a case
//!
//! ## Naming Conventions
//!
//! - Scenario tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod environment;
pub mod error;
pub mod harness;

pub use environment::Environment;
pub use error::{CaseError, Result};
pub use harness::{init_logging, run_case, Case, LOG_ENV};

#[cfg(test)]
mod producer_tests;
