//! Readiness detection.
//!
//! Nodes do not announce readiness. A node counts as ready once its client
//! port accepts a TCP connection. Probing backs off exponentially and stops
//! early if the process has already exited.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::config::ReadinessPolicy;
use crate::error::{ClusterError, Result};

/// Upper bound for a single connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Returns true if something accepts connections at `address`.
pub async fn probe(address: &str) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// Polls `address` until it accepts connections.
///
/// Returns how long the node took to become ready.
///
/// # Errors
///
/// Returns `NodeExited` if `child` terminates first and `NotReady` if the
/// policy's timeout elapses.
pub async fn wait_until_ready(
    node: &str,
    address: &str,
    policy: &ReadinessPolicy,
    child: &mut Child,
) -> Result<Duration> {
    let start = Instant::now();
    let deadline = start + policy.timeout();
    let mut backoff = policy.initial_backoff();
    let mut attempts = 0u32;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(ClusterError::NodeExited {
                node: node.to_string(),
                status: status.to_string(),
            });
        }

        attempts += 1;
        if probe(address).await {
            let waited = start.elapsed();
            info!(
                node,
                address,
                attempts,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "node ready"
            );
            return Ok(waited);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ClusterError::NotReady {
                node: node.to_string(),
                address: address.to_string(),
                waited: now - start,
            });
        }

        debug!(node, address, attempts, backoff = ?backoff, "not ready yet");
        sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(policy.max_backoff());
    }
}
