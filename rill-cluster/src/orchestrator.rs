//! Cluster lifecycle.
//!
//! [`Cluster::start`] launches every node of the topology in order and
//! waits for each one to accept connections before launching the next.
//! If any node fails, the nodes already running are torn down before the
//! error is returned, so a failed start never leaks processes.
//!
//! [`Cluster::stop`] runs in reverse start order. For each node it first
//! writes the captured output to the log directory, then kills the process,
//! then appends whatever the process printed while exiting. The scratch
//! directory is removed only once every node has been reaped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{render, ClusterConfig};
use crate::error::{ClusterError, Result};
use crate::logs::LogBuffer;
use crate::readiness::wait_until_ready;
use crate::topology::{ClusterTopology, NodeRole, NodeSpec};

/// How long to wait for output readers after a node exits.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running node process.
pub struct NodeHandle {
    spec: NodeSpec,
    data_dir: PathBuf,
    child: Child,
    logs: LogBuffer,
    readers: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Returns the node's spec.
    #[must_use]
    pub const fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    /// Returns the node name, e.g. `storage-0`.
    #[must_use]
    pub fn name(&self) -> String {
        self.spec.name()
    }

    /// Returns the node's client address.
    #[must_use]
    pub fn address(&self) -> String {
        self.spec.address()
    }

    /// Returns the node's scratch directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the OS process id, if the process is still running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Returns the output captured so far.
    #[must_use]
    pub fn logs(&self) -> String {
        self.logs.snapshot()
    }

    async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        self.child.start_kill()?;
        let status = timeout(grace, self.child.wait()).await.map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} did not exit within {grace:?}", self.spec.name()),
            )
        })??;
        Ok(status)
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.spec.name())
            .field("address", &self.spec.address())
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`Cluster::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Identifier shared by every log file of the run.
    pub run_id: Uuid,
    /// Node names in the order they were stopped.
    pub stopped: Vec<String>,
    /// Log files written, in stop order.
    pub log_files: Vec<PathBuf>,
    /// Problems encountered; teardown continues past each of them.
    pub errors: Vec<String>,
    /// Whether the scratch directory was removed.
    pub scratch_released: bool,
}

impl TeardownReport {
    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.scratch_released
    }
}

/// A started cluster.
pub struct Cluster {
    run_id: Uuid,
    case: String,
    topology: ClusterTopology,
    nodes: Vec<NodeHandle>,
    scratch: Option<TempDir>,
    log_dir: PathBuf,
    stop_timeout: Duration,
}

impl Cluster {
    /// Starts every node of `config` in dependency order.
    ///
    /// `case` names the test case; it becomes part of the log path.
    ///
    /// # Errors
    ///
    /// Returns the first launch or readiness failure. Nodes started before
    /// the failure have been stopped and their logs persisted.
    pub async fn start(config: &ClusterConfig, case: &str) -> Result<Self> {
        let topology = config.topology()?;
        let scratch = tempfile::Builder::new()
            .prefix("rill-")
            .tempdir()
            .map_err(ClusterError::Scratch)?;

        let mut cluster = Self {
            run_id: Uuid::new_v4(),
            case: case.to_string(),
            topology: topology.clone(),
            nodes: Vec::with_capacity(topology.nodes().len()),
            scratch: Some(scratch),
            log_dir: config.log_dir.clone(),
            stop_timeout: config.stop_timeout(),
        };
        info!(
            run_id = %cluster.run_id,
            case,
            nodes = topology.nodes().len(),
            "starting cluster"
        );

        let started = Instant::now();
        for spec in topology.nodes() {
            if let Err(e) = cluster.launch(config, spec).await {
                warn!(run_id = %cluster.run_id, node = %spec.name(), error = %e, "start failed, tearing down");
                let report = cluster.stop().await;
                if !report.is_clean() {
                    warn!(errors = ?report.errors, "teardown after failed start was not clean");
                }
                return Err(e);
            }
        }

        info!(
            run_id = %cluster.run_id,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "cluster ready"
        );
        Ok(cluster)
    }

    async fn launch(&mut self, config: &ClusterConfig, spec: &NodeSpec) -> Result<()> {
        let name = spec.name();
        let data_dir = self
            .scratch
            .as_ref()
            .map_or_else(|| spec.data_dir.clone(), |dir| dir.path().join(&spec.data_dir));
        std::fs::create_dir_all(&data_dir)?;

        let values = self.placeholders(spec, &data_dir);
        let command = config.command(spec.role);
        let program = render(&command.program, &values)?;
        let args = command
            .args
            .iter()
            .map(|arg| render(arg, &values))
            .collect::<Result<Vec<_>>>()?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &command.env {
            cmd.env(key, render(value, &values)?);
        }

        let mut child = cmd.spawn().map_err(|source| ClusterError::SpawnFailed {
            node: name.clone(),
            source,
        })?;
        let logs = LogBuffer::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(logs.capture(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(logs.capture(stderr));
        }
        debug!(node = %name, program = %program, args = ?args, pid = ?child.id(), "node spawned");

        self.nodes.push(NodeHandle {
            spec: spec.clone(),
            data_dir,
            child,
            logs,
            readers,
        });
        if let Some(node) = self.nodes.last_mut() {
            wait_until_ready(&name, &spec.address(), &config.readiness, &mut node.child).await?;
        }
        Ok(())
    }

    fn placeholders(&self, spec: &NodeSpec, data_dir: &Path) -> BTreeMap<&'static str, String> {
        let dependency = |role| {
            self.topology
                .node(role, 0)
                .map(NodeSpec::address)
                .unwrap_or_default()
        };
        BTreeMap::from([
            ("host", spec.host.clone()),
            ("port", spec.port.to_string()),
            (
                "internal_port",
                spec.internal_port.map(|p| p.to_string()).unwrap_or_default(),
            ),
            ("address", spec.address()),
            ("data_dir", data_dir.display().to_string()),
            ("index", spec.index.to_string()),
            ("name", spec.name()),
            ("coordination", dependency(NodeRole::Coordination)),
            ("storage", dependency(NodeRole::Storage)),
        ])
    }

    /// Returns the run identifier.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the topology.
    #[must_use]
    pub const fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// Returns the running nodes in start order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Returns the scratch directory, until the cluster is stopped.
    #[must_use]
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Returns the client address of a node.
    #[must_use]
    pub fn address(&self, role: NodeRole, index: u32) -> Option<String> {
        self.topology.node(role, index).map(NodeSpec::address)
    }

    /// Returns the client addresses of every broker.
    #[must_use]
    pub fn broker_addresses(&self) -> Vec<String> {
        self.topology.brokers().map(NodeSpec::address).collect()
    }

    /// Checks that every node process is still running.
    ///
    /// # Errors
    ///
    /// Returns `NodeExited` for the first node that has terminated.
    pub fn check_health(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            if let Some(status) = node.child.try_wait()? {
                return Err(ClusterError::NodeExited {
                    node: node.spec.name(),
                    status: status.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stops every node and releases the scratch directory.
    ///
    /// Never fails: problems are collected in the report and teardown
    /// carries on with the next node.
    pub async fn stop(mut self) -> TeardownReport {
        let mut report = TeardownReport {
            run_id: self.run_id,
            stopped: Vec::with_capacity(self.nodes.len()),
            log_files: Vec::with_capacity(self.nodes.len()),
            errors: Vec::new(),
            scratch_released: false,
        };
        let dir = self
            .log_dir
            .join(self.run_id.to_string())
            .join(sanitize(&self.case));
        let mut all_terminated = true;

        while let Some(mut node) = self.nodes.pop() {
            let name = node.spec.name();
            let path = dir.join(format!("{name}.log"));

            if let Err(e) = node.logs.persist(&path) {
                report.errors.push(format!("{name}: failed to write log: {e}"));
            }

            match node.terminate(self.stop_timeout).await {
                Ok(status) => debug!(node = %name, %status, "node stopped"),
                Err(e) => {
                    all_terminated = false;
                    report.errors.push(format!("{name}: {e}"));
                }
            }

            for reader in node.readers.drain(..) {
                let _ = timeout(LOG_DRAIN_TIMEOUT, reader).await;
            }
            match node.logs.persist(&path) {
                Ok(path) => report.log_files.push(path),
                Err(e) => report.errors.push(format!("{name}: failed to write log: {e}")),
            }
            report.stopped.push(name);
        }

        if let Some(scratch) = self.scratch.take() {
            if all_terminated {
                match scratch.close() {
                    Ok(()) => report.scratch_released = true,
                    Err(e) => report.errors.push(format!("failed to remove scratch directory: {e}")),
                }
            } else {
                let kept = scratch.into_path();
                report
                    .errors
                    .push(format!("scratch directory kept at {}", kept.display()));
            }
        }

        info!(
            run_id = %report.run_id,
            case = %self.case,
            stopped = report.stopped.len(),
            errors = report.errors.len(),
            "cluster stopped"
        );
        report
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if !self.nodes.is_empty() {
            warn!(
                run_id = %self.run_id,
                nodes = self.nodes.len(),
                "cluster dropped without stop, logs were not persisted"
            );
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("run_id", &self.run_id)
            .field("case", &self.case)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

/// Makes a case name safe to use as a directory name.
fn sanitize(case: &str) -> String {
    case.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
