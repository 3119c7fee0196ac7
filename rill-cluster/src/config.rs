//! Cluster configuration.
//!
//! A [`ClusterConfig`] describes how to launch every role and how long to
//! wait for it. It is usually loaded from TOML:
//!
//! ```toml
//! host = "127.0.0.1"
//! brokers = 1
//! log_dir = "target/rill-logs"
//!
//! [readiness]
//! timeout_ms = 30000
//!
//! [broker]
//! program = "hstream-server"
//! args = ["--host", "{host}", "--port", "{port}", "--internal-port", "{internal_port}",
//!         "--store-config", "{storage}", "--zkuri", "{coordination}"]
//! ```
//!
//! Launch arguments may reference these placeholders: `{host}`, `{port}`,
//! `{internal_port}`, `{address}`, `{data_dir}`, `{index}`, `{name}`,
//! `{coordination}` and `{storage}` (the addresses of the dependency nodes).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::topology::{ClusterTopology, NodeRole};

/// Environment variable naming a cluster config file.
pub const CONFIG_ENV: &str = "RILL_CLUSTER_CONFIG";

/// How a node process is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments, with placeholders.
    pub args: Vec<String>,
    /// Extra environment variables, with placeholders.
    pub env: BTreeMap<String, String>,
}

impl NodeCommand {
    /// Creates a command without arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Bounds for readiness polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Total time to wait for one node.
    pub timeout_ms: u64,
    /// First delay between probes.
    pub initial_backoff_ms: u64,
    /// Upper bound for the delay between probes.
    pub max_backoff_ms: u64,
}

impl ReadinessPolicy {
    /// Returns the readiness timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the first probe delay.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Returns the maximum probe delay.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

/// Everything needed to start a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Host every node binds to.
    pub host: String,
    /// Number of broker nodes.
    pub brokers: u32,
    /// Coordination node port.
    pub coordination_port: u16,
    /// Storage node port.
    pub storage_port: u16,
    /// First broker client port.
    pub broker_port: u16,
    /// First broker internal port.
    pub internal_port: u16,
    /// Directory node logs are written to at teardown.
    pub log_dir: PathBuf,
    /// Time allowed for a node to exit after being killed.
    pub stop_timeout_ms: u64,
    /// Readiness bounds, applied to every node.
    pub readiness: ReadinessPolicy,
    /// Coordination node launch command.
    pub coordination: NodeCommand,
    /// Storage node launch command.
    pub storage: NodeCommand,
    /// Broker launch command.
    pub broker: NodeCommand,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            brokers: 1,
            coordination_port: 2181,
            storage_port: 4440,
            broker_port: 6570,
            internal_port: 65000,
            log_dir: PathBuf::from("target/rill-logs"),
            stop_timeout_ms: 10_000,
            readiness: ReadinessPolicy::default(),
            coordination: NodeCommand::default(),
            storage: NodeCommand::default(),
            broker: NodeCommand::default(),
        }
    }
}

impl ClusterConfig {
    /// Creates a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder {
            config: Self::default(),
        }
    }

    /// Loads a config from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ClusterError::ConfigIo {
                path: path.as_ref().display().to_string(),
                source: e,
            })?;
        Self::from_toml(&contents)
    }

    /// Parses a config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML cannot be parsed.
    pub fn from_toml(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(|e| ClusterError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Loads the config named by `RILL_CLUSTER_CONFIG`, if set.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but the file is unusable.
    pub fn from_env() -> Result<Option<Self>> {
        std::env::var_os(CONFIG_ENV)
            .map(|path| Self::from_file(PathBuf::from(path)))
            .transpose()
    }

    /// Serializes the config to TOML.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Returns the launch command for a role.
    #[must_use]
    pub const fn command(&self, role: NodeRole) -> &NodeCommand {
        match role {
            NodeRole::Coordination => &self.coordination,
            NodeRole::Storage => &self.storage,
            NodeRole::Broker => &self.broker,
        }
    }

    /// Returns the stop timeout.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Derives the topology described by this config.
    ///
    /// # Errors
    ///
    /// Returns an error if the topology is invalid or a role has no program.
    pub fn topology(&self) -> Result<ClusterTopology> {
        for role in [NodeRole::Coordination, NodeRole::Storage, NodeRole::Broker] {
            if self.command(role).program.is_empty() {
                return Err(ClusterError::InvalidTopology {
                    reason: format!("no launch program configured for {role}"),
                });
            }
        }
        ClusterTopology::builder()
            .host(&self.host)
            .coordination_port(self.coordination_port)
            .storage_port(self.storage_port)
            .brokers(self.brokers)
            .broker_port(self.broker_port)
            .internal_port(self.internal_port)
            .build()
    }
}

/// Builder for [`ClusterConfig`].
#[derive(Debug, Clone)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Sets the bind host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the number of brokers.
    #[must_use]
    pub const fn brokers(mut self, count: u32) -> Self {
        self.config.brokers = count;
        self
    }

    /// Sets the coordination and storage ports.
    #[must_use]
    pub const fn dependency_ports(mut self, coordination: u16, storage: u16) -> Self {
        self.config.coordination_port = coordination;
        self.config.storage_port = storage;
        self
    }

    /// Sets the first broker client and internal ports.
    #[must_use]
    pub const fn broker_ports(mut self, client: u16, internal: u16) -> Self {
        self.config.broker_port = client;
        self.config.internal_port = internal;
        self
    }

    /// Sets the log directory.
    #[must_use]
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    /// Sets the readiness policy.
    #[must_use]
    pub const fn readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.config.readiness = policy;
        self
    }

    /// Sets the launch command for a role.
    #[must_use]
    pub fn command(mut self, role: NodeRole, command: NodeCommand) -> Self {
        match role {
            NodeRole::Coordination => self.config.coordination = command,
            NodeRole::Storage => self.config.storage = command,
            NodeRole::Broker => self.config.broker = command,
        }
        self
    }

    /// Finishes the config.
    #[must_use]
    pub fn build(self) -> ClusterConfig {
        self.config
    }
}

/// Substitutes `{name}` placeholders in `template`.
///
/// `{{` and `}}` produce literal braces.
///
/// # Errors
/// Returns `UnknownPlaceholder` for a name missing from `values`.
pub fn render(template: &str, values: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(['{', '}']) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        let end = match (tail.starts_with('{'), tail.find('}')) {
            (true, Some(end)) => end,
            _ => {
                return Err(ClusterError::UnknownPlaceholder {
                    name: tail.to_string(),
                })
            }
        };
        let name = &tail[1..end];
        let value = values
            .get(name)
            .ok_or_else(|| ClusterError::UnknownPlaceholder {
                name: name.to_string(),
            })?;
        out.push_str(value);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
