//! Simulated nodes and their client.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rill_client::{
    AckSink, BrokerClient, ClientError, ClientFactory, Limits, Record, RecordId, Result,
    SharedClient, StreamInfo, Subscriber, Subscription,
};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::state::State;

/// Configuration of a simulated broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Number of nodes, each with its own address.
    pub nodes: usize,
    /// Broker limits.
    pub limits: Limits,
    /// Interval at which ack timeouts are checked.
    pub dispatch_tick: Duration,
}

impl SimConfig {
    /// Creates the default configuration: three nodes, default limits.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: 3,
            limits: Limits::new(),
            dispatch_tick: Duration::from_millis(20),
        }
    }

    /// Sets the number of nodes.
    #[must_use]
    pub const fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the broker limits.
    #[must_use]
    pub const fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the ack-timeout check interval.
    #[must_use]
    pub const fn dispatch_tick(mut self, tick: Duration) -> Self {
        self.dispatch_tick = tick;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch counters of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Distinct records acknowledged.
    pub acked: usize,
    /// Deliveries handed out and not yet acknowledged.
    pub outstanding: usize,
    /// Deliveries waiting to be offered again.
    pub redelivery_queued: usize,
    /// New records held back because their key's owner was at capacity.
    pub held_back: usize,
    /// Attached consumers.
    pub members: usize,
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    config: SimConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self) {
        self.lock().dispatch_all(&self.config.limits, Instant::now());
    }
}

async fn run_dispatcher(shared: Weak<Shared>, tick: Duration) {
    while let Some(shared) = shared.upgrade() {
        shared.dispatch();
        tokio::select! {
            () = shared.wake.notified() => {}
            () = tokio::time::sleep(tick) => {}
        }
    }
    debug!("dispatcher stopped");
}

/// Acknowledgments for one subscription generation.
struct SubscriptionSink {
    shared: Weak<Shared>,
    subscription: String,
    generation: u64,
}

impl SubscriptionSink {
    fn apply(&self, op: impl FnOnce(&mut crate::state::SubState)) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut state = shared.lock();
            if let Some(sub) = state.subscription_mut(&self.subscription, self.generation) {
                op(sub);
            }
        }
        shared.wake.notify_one();
    }
}

impl AckSink for SubscriptionSink {
    fn ack(&self, id: RecordId) {
        self.apply(|sub| {
            sub.ack(id);
        });
    }

    fn nack(&self, id: RecordId) {
        self.apply(|sub| sub.nack(id));
    }
}

/// A simulated multi-node broker.
///
/// Cloning yields another handle to the same broker. The background
/// dispatcher stops once every handle and client has been dropped.
#[derive(Clone)]
pub struct SimBroker {
    shared: Arc<Shared>,
    addresses: Arc<[String]>,
}

impl SimBroker {
    /// Starts a broker. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the limits are invalid or `nodes` is zero.
    pub fn start(config: SimConfig) -> Result<Self> {
        config.limits.validate()?;
        if config.nodes == 0 {
            return Err(ClientError::InvalidArgument {
                name: "nodes",
                reason: "must be positive".to_string(),
            });
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Notify::new(),
            config,
        });
        tokio::spawn(run_dispatcher(Arc::downgrade(&shared), config.dispatch_tick));

        let addresses: Arc<[String]> = (0..config.nodes)
            .map(|index| format!("sim-{index}.rill.local:{}", 6570 + index))
            .collect();
        info!(nodes = config.nodes, "simulated broker started");
        Ok(Self { shared, addresses })
    }

    /// Returns the address of every node.
    #[must_use]
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Returns the broker limits.
    #[must_use]
    pub fn limits(&self) -> Limits {
        self.shared.config.limits
    }

    /// Returns a client of node `index`.
    #[must_use]
    pub fn client(&self, index: usize) -> Option<SharedClient> {
        self.addresses.get(index).map(|address| {
            Arc::new(SimClient {
                shared: self.shared.clone(),
                address: address.clone(),
            }) as SharedClient
        })
    }

    /// Returns one client per node.
    #[must_use]
    pub fn clients(&self) -> Vec<SharedClient> {
        (0..self.addresses.len())
            .filter_map(|index| self.client(index))
            .collect()
    }

    /// Returns dispatch counters of a subscription.
    #[must_use]
    pub fn subscription_stats(&self, id: &str) -> Option<SubscriptionStats> {
        let state = self.shared.lock();
        state.subscriptions.get(id).map(|sub| SubscriptionStats {
            acked: sub.acked.len(),
            outstanding: sub.ledger.len(),
            redelivery_queued: sub.redelivery.len(),
            held_back: sub.waiting.len(),
            members: sub.members.len(),
        })
    }
}

impl std::fmt::Debug for SimBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBroker")
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ClientFactory for SimBroker {
    async fn connect(&self, address: &str) -> Result<SharedClient> {
        self.addresses
            .iter()
            .position(|candidate| candidate == address)
            .and_then(|index| self.client(index))
            .ok_or_else(|| ClientError::Unavailable {
                address: address.to_string(),
            })
    }
}

/// Client of one simulated node.
pub struct SimClient {
    shared: Arc<Shared>,
    address: String,
}

impl SimClient {
    fn wake(&self) {
        self.shared.wake.notify_one();
    }
}

impl std::fmt::Debug for SimClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimClient")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerClient for SimClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn create_stream(&self, name: &str) -> Result<()> {
        self.shared.lock().create_stream(name)?;
        debug!(node = %self.address, stream = name, "stream created");
        Ok(())
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        Ok(self.shared.lock().list_streams())
    }

    async fn delete_stream(&self, name: &str) -> Result<()> {
        self.shared.lock().delete_stream(name)?;
        debug!(node = %self.address, stream = name, "stream deleted");
        Ok(())
    }

    async fn create_subscription(&self, subscription: &Subscription) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        self.shared
            .lock()
            .create_subscription(subscription, |generation| {
                Arc::new(SubscriptionSink {
                    shared: weak,
                    subscription: subscription.id.clone(),
                    generation,
                }) as Arc<dyn AckSink>
            })?;
        debug!(
            node = %self.address,
            subscription = %subscription.id,
            stream = %subscription.stream,
            "subscription created"
        );
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.shared.lock().list_subscriptions())
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        self.shared.lock().delete_subscription(id)?;
        debug!(node = %self.address, subscription = id, "subscription deleted");
        Ok(())
    }

    async fn append(&self, stream: &str, records: Vec<Record>) -> Result<Vec<RecordId>> {
        let ids = self
            .shared
            .lock()
            .append(&self.shared.config.limits, stream, records)?;
        self.wake();
        Ok(ids)
    }

    async fn subscribe(&self, subscription: &str, consumer: &str) -> Result<Subscriber> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (generation, member_id) = self.shared.lock().attach(subscription, consumer, tx)?;
        debug!(node = %self.address, subscription, consumer, "consumer attached");
        self.wake();

        let weak = Arc::downgrade(&self.shared);
        let sub_id = subscription.to_string();
        Ok(Subscriber::new(subscription, consumer, rx, move || {
            if let Some(shared) = weak.upgrade() {
                if let Some(sub) = shared.lock().subscription_mut(&sub_id, generation) {
                    sub.remove_member(member_id);
                }
                shared.wake.notify_one();
            }
        }))
    }
}
