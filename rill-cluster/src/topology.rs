//! Static description of a cluster.
//!
//! A topology is an ordered list of nodes. The order is the start order:
//! the coordination node first, then the storage node, then every broker.
//! Teardown walks the same list backwards.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// The role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Coordination service (metadata, membership).
    Coordination,
    /// Storage layer.
    Storage,
    /// Client-facing broker.
    Broker,
}

impl NodeRole {
    /// Returns the lowercase role name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Coordination => "coordination",
            Self::Storage => "storage",
            Self::Broker => "broker",
        }
    }

    /// Rank in the start order. Lower ranks start first.
    const fn rank(self) -> u8 {
        match self {
            Self::Coordination => 0,
            Self::Storage => 1,
            Self::Broker => 2,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Role of the node.
    pub role: NodeRole,
    /// Index among nodes of the same role.
    pub index: u32,
    /// Bind host.
    pub host: String,
    /// Client port.
    pub port: u16,
    /// Internal (cluster) port, for roles that have one.
    pub internal_port: Option<u16>,
    /// Scratch subdirectory, relative to the run's scratch directory.
    pub data_dir: PathBuf,
}

impl NodeSpec {
    /// Creates a node spec with a data directory named after the node.
    #[must_use]
    pub fn new(role: NodeRole, index: u32, host: impl Into<String>, port: u16) -> Self {
        Self {
            role,
            index,
            host: host.into(),
            port,
            internal_port: None,
            data_dir: PathBuf::from(format!("{role}-{index}")),
        }
    }

    /// Sets the internal port.
    #[must_use]
    pub const fn with_internal_port(mut self, port: u16) -> Self {
        self.internal_port = Some(port);
        self
    }

    /// Returns the node name, e.g. `broker-0`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-{}", self.role, self.index)
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A validated cluster description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    nodes: Vec<NodeSpec>,
}

impl ClusterTopology {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> ClusterTopologyBuilder {
        ClusterTopologyBuilder::new()
    }

    /// Creates a topology from an explicit node list.
    ///
    /// # Errors
    /// Returns an error if the list fails [`ClusterTopology::validate`].
    pub fn from_nodes(nodes: Vec<NodeSpec>) -> Result<Self> {
        let topology = Self { nodes };
        topology.validate()?;
        Ok(topology)
    }

    /// Checks start order and addressing.
    ///
    /// Exactly one coordination node and one storage node, at least one
    /// broker, dependencies listed before dependents, and no two nodes
    /// sharing a port on the same host.
    ///
    /// # Errors
    /// Returns `InvalidTopology` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(ClusterError::InvalidTopology { reason });

        let count = |role| self.nodes.iter().filter(|n| n.role == role).count();
        if count(NodeRole::Coordination) != 1 {
            return invalid("exactly one coordination node is required".to_string());
        }
        if count(NodeRole::Storage) != 1 {
            return invalid("exactly one storage node is required".to_string());
        }
        if count(NodeRole::Broker) == 0 {
            return invalid("at least one broker node is required".to_string());
        }

        for pair in self.nodes.windows(2) {
            if pair[0].role.rank() > pair[1].role.rank() {
                return invalid(format!("{} must start before {}", pair[1].name(), pair[0].name()));
            }
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name()) {
                return invalid(format!("duplicate node {}", node.name()));
            }
            for port in std::iter::once(node.port).chain(node.internal_port) {
                if !ports.insert((node.host.as_str(), port)) {
                    return invalid(format!("port {port} on {} is used twice", node.host));
                }
            }
        }
        Ok(())
    }

    /// Returns the nodes in start order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Returns the node with the given role and index.
    #[must_use]
    pub fn node(&self, role: NodeRole, index: u32) -> Option<&NodeSpec> {
        self.nodes
            .iter()
            .find(|n| n.role == role && n.index == index)
    }

    /// Returns the broker nodes in start order.
    pub fn brokers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Broker)
    }
}

/// Builder for the usual single-host topology.
#[derive(Debug, Clone)]
pub struct ClusterTopologyBuilder {
    host: String,
    coordination_port: u16,
    storage_port: u16,
    brokers: u32,
    broker_port: u16,
    internal_port: u16,
}

impl ClusterTopologyBuilder {
    /// Creates a builder with one broker on the loopback interface.
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            coordination_port: 2181,
            storage_port: 4440,
            brokers: 1,
            broker_port: 6570,
            internal_port: 65000,
        }
    }

    /// Sets the host every node binds to.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the coordination node's port.
    #[must_use]
    pub const fn coordination_port(mut self, port: u16) -> Self {
        self.coordination_port = port;
        self
    }

    /// Sets the storage node's port.
    #[must_use]
    pub const fn storage_port(mut self, port: u16) -> Self {
        self.storage_port = port;
        self
    }

    /// Sets the number of brokers.
    #[must_use]
    pub const fn brokers(mut self, count: u32) -> Self {
        self.brokers = count;
        self
    }

    /// Sets the first broker's client port. Broker N uses `port + N`.
    #[must_use]
    pub const fn broker_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    /// Sets the first broker's internal port. Broker N uses `port + N`.
    #[must_use]
    pub const fn internal_port(mut self, port: u16) -> Self {
        self.internal_port = port;
        self
    }

    /// Builds and validates the topology.
    ///
    /// # Errors
    /// Returns an error if the ports overflow or the topology is invalid.
    pub fn build(self) -> Result<ClusterTopology> {
        let offset = |base: u16, index: u32| {
            u16::try_from(index)
                .ok()
                .and_then(|index| base.checked_add(index))
                .ok_or_else(|| ClusterError::InvalidTopology {
                    reason: format!("port {base} + {index} overflows"),
                })
        };

        let mut nodes = vec![
            NodeSpec::new(NodeRole::Coordination, 0, &self.host, self.coordination_port),
            NodeSpec::new(NodeRole::Storage, 0, &self.host, self.storage_port),
        ];
        for index in 0..self.brokers {
            nodes.push(
                NodeSpec::new(NodeRole::Broker, index, &self.host, offset(self.broker_port, index)?)
                    .with_internal_port(offset(self.internal_port, index)?),
            );
        }
        ClusterTopology::from_nodes(nodes)
    }
}

impl Default for ClusterTopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_orders_dependencies_first() {
        let topology = ClusterTopology::builder().brokers(3).build().unwrap();
        let roles: Vec<_> = topology.nodes().iter().map(|n| n.role).collect();
        assert_eq!(
            roles,
            vec![
                NodeRole::Coordination,
                NodeRole::Storage,
                NodeRole::Broker,
                NodeRole::Broker,
                NodeRole::Broker
            ]
        );
        assert_eq!(topology.node(NodeRole::Broker, 2).unwrap().port, 6572);
        assert_eq!(topology.brokers().count(), 3);
    }

    #[test]
    fn test_broker_before_storage_rejected() {
        let nodes = vec![
            NodeSpec::new(NodeRole::Coordination, 0, "h", 1),
            NodeSpec::new(NodeRole::Broker, 0, "h", 3),
            NodeSpec::new(NodeRole::Storage, 0, "h", 2),
        ];
        let err = ClusterTopology::from_nodes(nodes).unwrap_err();
        assert!(err.to_string().contains("storage-0 must start before broker-0"));
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let result = ClusterTopology::builder()
            .brokers(2)
            .broker_port(7000)
            .internal_port(7001)
            .build();
        assert!(matches!(result, Err(ClusterError::InvalidTopology { .. })));
    }

    #[test]
    fn test_zero_brokers_rejected() {
        assert!(ClusterTopology::builder().brokers(0).build().is_err());
    }

    #[test]
    fn test_missing_coordination_rejected() {
        let nodes = vec![
            NodeSpec::new(NodeRole::Storage, 0, "h", 2),
            NodeSpec::new(NodeRole::Broker, 0, "h", 3),
        ];
        assert!(ClusterTopology::from_nodes(nodes).is_err());
    }
}
