//! Rill Cluster - topology and lifecycle of a broker cluster under test.
//!
//! A cluster is three kinds of node started in a fixed order:
//!
//! 1. a coordination service,
//! 2. a storage layer that registers with it,
//! 3. one or more brokers that need both.
//!
//! The orchestrator knows nothing about what the processes are. Each role
//! has a launch command with `{placeholder}` arguments (see [`config`]), a
//! node is ready once its client port accepts connections, and everything
//! it prints is captured and written under the log directory when the
//! cluster stops:
//!
//! ```text
//! <log_dir>/<run_id>/<case>/broker-0.log
//! <log_dir>/<run_id>/<case>/storage-0.log
//! <log_dir>/<run_id>/<case>/coordination-0.log
//! ```
//!
//! # Example
//!
//! ```ignore
//! let config = ClusterConfig::from_file("cluster.toml")?;
//! let cluster = Cluster::start(&config, "write_and_read").await?;
//! let brokers = cluster.broker_addresses();
//! // ... drive a workload against `brokers` ...
//! let report = cluster.stop().await;
//! assert!(report.is_clean());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
mod error;
mod logs;
mod orchestrator;
mod readiness;
mod topology;

pub use config::{ClusterConfig, ClusterConfigBuilder, NodeCommand, ReadinessPolicy, CONFIG_ENV};
pub use error::{ClusterError, Result};
pub use logs::{LogBuffer, DEFAULT_LOG_CAPACITY};
pub use orchestrator::{Cluster, NodeHandle, TeardownReport};
pub use readiness::{probe, wait_until_ready};
pub use topology::{ClusterTopology, ClusterTopologyBuilder, NodeRole, NodeSpec};
