//! Scoped cluster acquisition.
//!
//! [`run_case`] brings up the environment, hands the body a [`Case`], and
//! tears the environment down afterwards whether the body returned `Ok`,
//! returned an error, or panicked. Node logs are therefore persisted even
//! for cases that fail half-way through setup.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rill_client::{Limits, SharedClient, Subscription};
use rill_cluster::{Cluster, TeardownReport};
use rill_sim::{SimBroker, SubscriptionStats};
use rill_workload::Oracle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::environment::Environment;
use crate::error::{CaseError, Result};

/// Environment variable holding the log filter for test runs.
pub const LOG_ENV: &str = "RILL_LOG";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Installs the process-wide `tracing` subscriber.
///
/// Safe to call from every test; only the first call has an effect.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// What a test-case body gets to work with.
///
/// Cheap to clone; every clone talks to the same nodes.
#[derive(Clone)]
pub struct Case {
    name: String,
    run_id: Uuid,
    clients: Vec<SharedClient>,
    limits: Limits,
    sim: Option<SimBroker>,
}

impl Case {
    /// Returns the case name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the run identifier that tags this case's logs.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the client of the first node.
    #[must_use]
    pub fn client(&self) -> SharedClient {
        self.clients[0].clone()
    }

    /// Returns the client of node `index`, wrapping around the node count.
    #[must_use]
    pub fn node(&self, index: usize) -> SharedClient {
        self.clients[index % self.clients.len()].clone()
    }

    /// Returns one client per node.
    #[must_use]
    pub fn nodes(&self) -> &[SharedClient] {
        &self.clients
    }

    /// Returns the broker limits in effect.
    #[must_use]
    pub const fn limits(&self) -> Limits {
        self.limits
    }

    /// Returns a fresh name with the given prefix, unique across runs.
    #[must_use]
    pub fn unique(&self, prefix: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{prefix}-{}", &suffix[..12])
    }

    /// Creates a stream with a fresh name through the first node.
    ///
    /// # Errors
    /// Returns a contract failure if the broker rejects it.
    pub async fn create_stream(&self) -> Result<String> {
        let name = self.unique("stream");
        self.client()
            .create_stream(&name)
            .await
            .map_err(|e| CaseError::contract(format!("create stream {name}"), &e))?;
        Ok(name)
    }

    /// Creates a subscription with a fresh id on `stream`.
    ///
    /// # Errors
    /// Returns a contract failure if the broker rejects it.
    pub async fn create_subscription(&self, stream: &str, ack_timeout: Duration) -> Result<String> {
        let id = self.unique("sub");
        self.client()
            .create_subscription(&Subscription::new(&id, stream, ack_timeout))
            .await
            .map_err(|e| CaseError::contract(format!("create subscription {id} on {stream}"), &e))?;
        Ok(id)
    }

    /// Returns an oracle consuming through the first node.
    #[must_use]
    pub fn oracle(&self) -> Oracle {
        Oracle::new(self.client())
    }

    /// Returns dispatch counters of a subscription, when the broker is
    /// simulated.
    #[must_use]
    pub fn subscription_stats(&self, id: &str) -> Option<SubscriptionStats> {
        self.sim.as_ref()?.subscription_stats(id)
    }

    /// Polls `ready` until it holds.
    ///
    /// # Errors
    /// Returns `Timeout` naming `what` if it does not hold within `bound`.
    pub async fn wait_until(
        &self,
        what: &str,
        bound: Duration,
        mut ready: impl FnMut(&Self) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + bound;
        while !ready(self) {
            if Instant::now() >= deadline {
                return Err(CaseError::Timeout {
                    what: what.to_string(),
                    waited: bound,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }
}

/// Resources released at teardown.
enum Backend {
    Simulated(SimBroker),
    Orchestrated(Cluster),
}

impl Backend {
    async fn teardown(self) -> Option<TeardownReport> {
        match self {
            Self::Simulated(broker) => {
                drop(broker);
                None
            }
            Self::Orchestrated(cluster) => Some(cluster.stop().await),
        }
    }
}

async fn acquire(name: &str, env: Environment) -> Result<(Case, Backend)> {
    match env {
        Environment::Simulated(config) => {
            let broker = SimBroker::start(config).map_err(|e| CaseError::Infrastructure {
                message: format!("failed to start simulated broker: {e}"),
            })?;
            let case = Case {
                name: name.to_string(),
                run_id: Uuid::new_v4(),
                clients: broker.clients(),
                limits: broker.limits(),
                sim: Some(broker.clone()),
            };
            Ok((case, Backend::Simulated(broker)))
        }
        Environment::Orchestrated { config, factory } => {
            let cluster = Cluster::start(&config, name).await?;
            let mut clients = Vec::new();
            for address in cluster.broker_addresses() {
                match factory.connect(&address).await {
                    Ok(client) => clients.push(client),
                    Err(e) => {
                        let report = cluster.stop().await;
                        log_teardown(name, &report);
                        return Err(CaseError::Infrastructure {
                            message: format!("failed to connect to {address}: {e}"),
                        });
                    }
                }
            }
            let case = Case {
                name: name.to_string(),
                run_id: cluster.run_id(),
                clients,
                limits: Limits::new(),
                sim: None,
            };
            Ok((case, Backend::Orchestrated(cluster)))
        }
    }
}

fn log_teardown(name: &str, report: &TeardownReport) {
    if report.is_clean() {
        info!(
            case = name,
            run_id = %report.run_id,
            logs = report.log_files.len(),
            "teardown complete"
        );
    } else {
        warn!(
            case = name,
            run_id = %report.run_id,
            errors = ?report.errors,
            "teardown was not clean"
        );
    }
}

/// Runs one test case in `env`.
///
/// The environment is acquired before `body` runs and released after it
/// finishes, including when it panics; the panic is then resumed so the
/// test still fails with the panic message. Begin and end markers with
/// the elapsed time are logged around the case.
///
/// # Errors
/// Returns `Infrastructure` or `Timeout` if the environment cannot be
/// acquired, otherwise whatever `body` returned.
pub async fn run_case<F, Fut>(name: &str, env: Environment, body: F) -> Result<()>
where
    F: FnOnce(Case) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    init_logging();
    let started = Instant::now();
    info!(case = name, ?env, "BEGIN");

    let (case, backend) = match acquire(name, env).await {
        Ok(acquired) => acquired,
        Err(e) => {
            warn!(case = name, error = %e, "environment unavailable");
            return Err(e);
        }
    };
    let run_id = case.run_id();

    let outcome = AssertUnwindSafe(body(case)).catch_unwind().await;

    if let Some(report) = backend.teardown().await {
        log_teardown(name, &report);
    }
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(Ok(())) => {
            info!(case = name, %run_id, elapsed_ms, "END passed");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(case = name, %run_id, elapsed_ms, error = %e, "END failed");
            Err(e)
        }
        Err(panic) => {
            warn!(case = name, %run_id, elapsed_ms, "END panicked");
            std::panic::resume_unwind(panic)
        }
    }
}
