//! Where a test case runs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rill_client::ClientFactory;
use rill_cluster::ClusterConfig;
use rill_sim::SimConfig;

use crate::error::Result;

/// Dispatch tick used by the default simulated environment.
pub const SIM_DISPATCH_TICK: Duration = Duration::from_millis(10);

/// Simulated nodes in the default environment, matching a three-broker
/// orchestrated topology.
pub const SIM_NODES: usize = 3;

/// Backend a test case acquires.
#[derive(Clone)]
pub enum Environment {
    /// An in-process broker with several node addresses.
    Simulated(SimConfig),
    /// External node processes started by the orchestrator.
    Orchestrated {
        /// Topology, launch commands, and readiness bounds.
        config: ClusterConfig,
        /// Turns a broker address into a client.
        factory: Arc<dyn ClientFactory>,
    },
}

impl Environment {
    /// The default simulated environment.
    #[must_use]
    pub const fn simulated() -> Self {
        Self::Simulated(
            SimConfig::new()
                .nodes(SIM_NODES)
                .dispatch_tick(SIM_DISPATCH_TICK),
        )
    }

    /// An orchestrated environment.
    #[must_use]
    pub fn orchestrated(config: ClusterConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self::Orchestrated { config, factory }
    }

    /// Picks the orchestrated environment when `RILL_CLUSTER_CONFIG` names a
    /// config file, and the default simulated one otherwise.
    ///
    /// # Errors
    /// Returns an error if the named file cannot be read or parsed.
    pub fn from_env(factory: Arc<dyn ClientFactory>) -> Result<Self> {
        Ok(match ClusterConfig::from_env()? {
            Some(config) => Self::orchestrated(config, factory),
            None => Self::simulated(),
        })
    }

    /// Returns true for the simulated backend.
    #[must_use]
    pub const fn is_simulated(&self) -> bool {
        matches!(self, Self::Simulated(_))
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::simulated()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simulated(config) => f.debug_tuple("Simulated").field(config).finish(),
            Self::Orchestrated { config, .. } => f
                .debug_struct("Orchestrated")
                .field("config", config)
                .finish_non_exhaustive(),
        }
    }
}
