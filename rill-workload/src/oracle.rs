//! Consumption oracle.
//!
//! The oracle attaches one or more named members to a subscription, applies
//! an [`AckPolicy`] to every delivery, and reports what was permanently
//! acknowledged as an [`ObservedModel`].
//!
//! Each member runs on its own task and owns the sending half of its own
//! observation channel. A collector merges the channels, evaluates the
//! [`StopCondition`] against the merged model, and signals every member to
//! stop through a shared watch channel. Results are only read after every
//! member task has finished, so a delivery in flight at stop time is either
//! in the report or was never acknowledged.
//!
//! Withheld deliveries live in a [`PendingPool`] shared by all members of the
//! oracle. Any member may release a pooled delivery; members whose policy
//! uses the pool release one at every tick of the release interval, and the
//! pool is drained once the group stops, so a withheld delivery is always
//! acknowledged eventually.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::{self, select_all, StreamExt};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rill_client::{ClientError, Delivery, ReceivedRecord, Responder, SharedClient};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Result, WorkloadError};
use crate::model::{Observation, ObservedModel};

/// Default bound on a consumer run.
pub const DEFAULT_CONSUME_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval at which pool-using members release a pending delivery.
pub const DEFAULT_RELEASE_INTERVAL: Duration = Duration::from_millis(20);

/// What a member does with each delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AckPolicy {
    /// Acknowledge immediately.
    Always,
    /// Negatively acknowledge a random fraction of deliveries.
    ///
    /// A delivery whose attempt number exceeds `max_redeliveries` is always
    /// acknowledged.
    Nack {
        /// Chance of a nack per delivery.
        probability: f64,
        /// Attempts that may be nacked.
        max_redeliveries: u32,
    },
    /// Withhold a random fraction of deliveries in the pending pool.
    Withhold {
        /// Chance of withholding per delivery.
        probability: f64,
        /// Upper bound on deliveries withheld in the pool at a time.
        max_pending: usize,
    },
    /// Acknowledge own deliveries and, with the given chance per delivery,
    /// release a random pooled delivery held for any member.
    DrainShuffled {
        /// Chance of releasing a pooled delivery per delivery.
        probability: f64,
    },
}

impl AckPolicy {
    const fn uses_pool(&self) -> bool {
        matches!(self, Self::Withhold { .. } | Self::DrainShuffled { .. })
    }
}

/// Predicate over a model.
pub type ModelPredicate = Arc<dyn Fn(&ObservedModel) -> bool + Send + Sync>;

/// When a consumer run ends.
#[derive(Clone)]
pub enum StopCondition {
    /// Once this many distinct records were acknowledged.
    Count(usize),
    /// Once the predicate holds for the merged model.
    Until(ModelPredicate),
    /// Only on an explicit stop or the timeout.
    Never,
}

impl StopCondition {
    /// Creates an [`StopCondition::Until`] condition.
    pub fn until(predicate: impl Fn(&ObservedModel) -> bool + Send + Sync + 'static) -> Self {
        Self::Until(Arc::new(predicate))
    }

    fn is_met(&self, observed: &ObservedModel) -> bool {
        match self {
            Self::Count(n) => observed.len() >= *n,
            Self::Until(predicate) => predicate(observed),
            Self::Never => false,
        }
    }
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "Count({n})"),
            Self::Until(_) => f.write_str("Until(..)"),
            Self::Never => f.write_str("Never"),
        }
    }
}

/// A delivery withheld by a member.
#[derive(Debug)]
pub struct PendingDelivery {
    /// The delivered record.
    pub record: ReceivedRecord,
    /// Delivery attempt.
    pub attempt: u32,
    /// Member the delivery was made to.
    pub member: String,
    responder: Responder,
}

impl PendingDelivery {
    /// Wraps a delivery made to `member`.
    #[must_use]
    pub fn new(delivery: Delivery, member: impl Into<String>) -> Self {
        Self {
            record: delivery.record,
            attempt: delivery.attempt,
            member: member.into(),
            responder: delivery.responder,
        }
    }

    /// Acknowledges the delivery on behalf of `acked_by`.
    pub fn ack_by(self, acked_by: &str) -> Observation {
        self.responder.ack();
        Observation {
            record: self.record,
            attempt: self.attempt,
            delivered_to: self.member,
            acked_by: acked_by.to_string(),
        }
    }
}

/// Withheld deliveries shared by every member of an oracle.
///
/// Pops are random, not FIFO.
#[derive(Debug, Clone, Default)]
pub struct PendingPool {
    inner: Arc<Mutex<Vec<PendingDelivery>>>,
}

impl PendingPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingDelivery>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a delivery.
    pub fn push(&self, pending: PendingDelivery) {
        self.lock().push(pending);
    }

    /// Adds a delivery unless the pool already holds `limit` entries.
    ///
    /// # Errors
    /// Returns the delivery back if the pool is full.
    pub fn try_push(
        &self,
        pending: PendingDelivery,
        limit: usize,
    ) -> std::result::Result<(), PendingDelivery> {
        let mut pool = self.lock();
        if pool.len() >= limit {
            return Err(pending);
        }
        pool.push(pending);
        Ok(())
    }

    /// Removes a random delivery.
    pub fn pop_random<R: Rng>(&self, rng: &mut R) -> Option<PendingDelivery> {
        let mut pool = self.lock();
        if pool.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..pool.len());
        Some(pool.swap_remove(index))
    }

    /// Removes every delivery.
    #[must_use]
    pub fn drain_all(&self) -> Vec<PendingDelivery> {
        std::mem::take(&mut *self.lock())
    }

    /// Returns the number of withheld deliveries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is withheld.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// One member of a consumer run.
#[derive(Clone)]
pub struct ConsumerSpec {
    /// Subscription to attach to.
    pub subscription: String,
    /// Member name.
    pub member: String,
    /// Ack policy.
    pub policy: AckPolicy,
    client: Option<SharedClient>,
}

impl ConsumerSpec {
    /// Creates an always-ack member.
    #[must_use]
    pub fn new(subscription: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            member: member.into(),
            policy: AckPolicy::Always,
            client: None,
        }
    }

    /// Sets the ack policy.
    #[must_use]
    pub const fn policy(mut self, policy: AckPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attaches through `client` instead of the oracle's client.
    #[must_use]
    pub fn via(mut self, client: SharedClient) -> Self {
        self.client = Some(client);
        self
    }
}

impl fmt::Debug for ConsumerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSpec")
            .field("subscription", &self.subscription)
            .field("member", &self.member)
            .field("policy", &self.policy)
            .field("via", &self.client.as_ref().map(|c| c.address().to_string()))
            .finish()
    }
}

/// Per-member counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberStats {
    /// Deliveries received.
    pub deliveries: u64,
    /// Own deliveries acknowledged.
    pub acks: u64,
    /// Deliveries negatively acknowledged.
    pub nacks: u64,
    /// Deliveries withheld in the pool.
    pub withheld: u64,
    /// Pooled deliveries this member acknowledged.
    pub released: u64,
}

/// Result of a consumer run.
#[derive(Debug, Clone)]
pub struct ConsumerReport {
    /// Records permanently acknowledged by the group.
    pub observed: ObservedModel,
    /// Counters per member.
    pub members: BTreeMap<String, MemberStats>,
    /// True if the run ended because its timeout expired.
    pub timed_out: bool,
    /// How long the run lasted.
    pub elapsed: Duration,
}

impl ConsumerReport {
    /// Returns the observed model if the stop condition was reached.
    ///
    /// # Errors
    /// Returns `Timeout` if the run timed out.
    pub fn require_complete(self) -> Result<ObservedModel> {
        if self.timed_out {
            return Err(WorkloadError::Timeout {
                what: format!("consumers ({} records observed)", self.observed.len()),
                waited: self.elapsed,
            });
        }
        Ok(self.observed)
    }
}

/// Handle to a running consumer group.
///
/// Dropping the handle detaches from the run without stopping it; the run
/// still ends at its stop condition or timeout.
#[derive(Debug)]
pub struct ConsumerHandle {
    signal: Arc<watch::Sender<bool>>,
    task: JoinHandle<Result<ConsumerReport>>,
}

impl ConsumerHandle {
    /// Returns true once every member has stopped and the report is ready.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks every member to stop without waiting.
    pub fn request_stop(&self) {
        self.signal.send_replace(true);
    }

    /// Stops the run and waits until every member has terminated.
    ///
    /// # Errors
    /// Returns the first member failure (for example a subscribe error).
    pub async fn stop(self) -> Result<ConsumerReport> {
        self.request_stop();
        self.wait().await
    }

    /// Waits for the run to end on its own.
    ///
    /// # Errors
    /// Returns the first member failure (for example a subscribe error).
    pub async fn wait(self) -> Result<ConsumerReport> {
        self.task.await.map_err(|e| WorkloadError::TaskFailed {
            message: format!("consumer collector: {e}"),
        })?
    }
}

/// Runs consumers against a broker.
#[derive(Clone)]
pub struct Oracle {
    client: SharedClient,
    pool: PendingPool,
    timeout: Duration,
    release_interval: Duration,
    seed: u64,
}

impl Oracle {
    /// Creates an oracle with default timeout and release interval.
    #[must_use]
    pub fn new(client: SharedClient) -> Self {
        Self {
            client,
            pool: PendingPool::new(),
            timeout: DEFAULT_CONSUME_TIMEOUT,
            release_interval: DEFAULT_RELEASE_INTERVAL,
            seed: 0,
        }
    }

    /// Sets the bound on each run.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how often pool-using members release a pending delivery.
    #[must_use]
    pub const fn release_interval(mut self, interval: Duration) -> Self {
        self.release_interval = interval;
        self
    }

    /// Sets the seed of the members' policy decisions.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Shares `pool` instead of a fresh one.
    #[must_use]
    pub fn with_pool(mut self, pool: PendingPool) -> Self {
        self.pool = pool;
        self
    }

    /// Returns the pending pool.
    #[must_use]
    pub const fn pool(&self) -> &PendingPool {
        &self.pool
    }

    /// Consumes with one member until `stop` holds or the timeout expires.
    ///
    /// # Errors
    /// Returns an error if the member could not attach.
    pub async fn consume(&self, spec: ConsumerSpec, stop: StopCondition) -> Result<ConsumerReport> {
        self.spawn(spec, stop).wait().await
    }

    /// Starts one member in the background.
    #[must_use]
    pub fn spawn(&self, spec: ConsumerSpec, stop: StopCondition) -> ConsumerHandle {
        self.spawn_group(vec![spec], stop)
    }

    /// Consumes with several members until `stop` holds for their merged
    /// model or the timeout expires.
    ///
    /// # Errors
    /// Returns an error if any member could not attach.
    pub async fn consume_group(
        &self,
        specs: Vec<ConsumerSpec>,
        stop: StopCondition,
    ) -> Result<ConsumerReport> {
        self.spawn_group(specs, stop).wait().await
    }

    /// Starts several members in the background.
    #[must_use]
    pub fn spawn_group(&self, specs: Vec<ConsumerSpec>, stop: StopCondition) -> ConsumerHandle {
        let (signal, _) = watch::channel(false);
        let signal = Arc::new(signal);
        let mut receivers = Vec::with_capacity(specs.len());
        let mut members = Vec::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push(rx);
            let label = format!("{} on {}", spec.member, spec.subscription);
            let member = Member {
                client: spec.client.unwrap_or_else(|| Arc::clone(&self.client)),
                subscription: spec.subscription,
                name: spec.member.clone(),
                policy: spec.policy,
                pool: self.pool.clone(),
                tx,
                stop: signal.subscribe(),
                rng: ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(index as u64)),
                release_interval: self.release_interval,
                stats: MemberStats::default(),
            };
            // A member that cannot attach stops the whole group.
            let abort = Arc::clone(&signal);
            let task = tokio::spawn(async move {
                let result = member.run().await;
                if result.is_err() {
                    abort.send_replace(true);
                }
                result
            });
            members.push((spec.member, label, task));
        }

        let task = tokio::spawn(collect(
            members,
            receivers,
            stop,
            Arc::clone(&signal),
            self.pool.clone(),
            self.timeout,
        ));
        ConsumerHandle { signal, task }
    }
}

impl fmt::Debug for Oracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Oracle")
            .field("address", &self.client.address())
            .field("pending", &self.pool.len())
            .field("timeout", &self.timeout)
            .field("release_interval", &self.release_interval)
            .finish_non_exhaustive()
    }
}

type MemberTask = (String, String, JoinHandle<std::result::Result<MemberStats, ClientError>>);

async fn collect(
    members: Vec<MemberTask>,
    receivers: Vec<mpsc::UnboundedReceiver<Observation>>,
    stop: StopCondition,
    signal: Arc<watch::Sender<bool>>,
    pool: PendingPool,
    limit: Duration,
) -> Result<ConsumerReport> {
    let started = Instant::now();
    let deadline = started + limit;
    let mut merged = select_all(
        receivers
            .into_iter()
            .map(|mut rx| stream::poll_fn(move |cx| rx.poll_recv(cx))),
    );

    let mut observed = ObservedModel::new();
    let mut timed_out = false;
    if stop.is_met(&observed) {
        signal.send_replace(true);
    }

    loop {
        tokio::select! {
            next = merged.next() => {
                let Some(observation) = next else { break };
                observed.record(observation);
                if !*signal.borrow() && stop.is_met(&observed) {
                    debug!(observed = observed.len(), "stop condition met");
                    signal.send_replace(true);
                }
            }
            () = sleep_until(deadline), if !*signal.borrow() => {
                timed_out = true;
                warn!(observed = observed.len(), limit = ?limit, "consumers timed out");
                signal.send_replace(true);
            }
        }
    }

    let mut stats = BTreeMap::new();
    let mut failure = None;
    for (name, label, task) in members {
        match task.await {
            Ok(Ok(member)) => {
                stats.insert(name, member);
            }
            Ok(Err(source)) => {
                failure
                    .get_or_insert_with(|| WorkloadError::client(format!("attach {label}"), source));
            }
            Err(e) => {
                failure.get_or_insert_with(|| WorkloadError::TaskFailed {
                    message: format!("consumer {label}: {e}"),
                });
            }
        }
    }

    let leftover = pool.drain_all();
    if !leftover.is_empty() {
        debug!(count = leftover.len(), "acknowledging pending deliveries");
    }
    for pending in leftover {
        let holder = pending.member.clone();
        observed.record(pending.ack_by(&holder));
    }

    if let Some(error) = failure {
        return Err(error);
    }
    let elapsed = started.elapsed();
    info!(
        observed = observed.len(),
        duplicates = observed.duplicate_acks(),
        timed_out,
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "consumers stopped"
    );
    Ok(ConsumerReport {
        observed,
        members: stats,
        timed_out,
        elapsed,
    })
}

/// Resolves once a stop is requested or the collector is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

struct Member {
    client: SharedClient,
    subscription: String,
    name: String,
    policy: AckPolicy,
    pool: PendingPool,
    tx: mpsc::UnboundedSender<Observation>,
    stop: watch::Receiver<bool>,
    rng: ChaCha8Rng,
    release_interval: Duration,
    stats: MemberStats,
}

impl Member {
    async fn run(mut self) -> std::result::Result<MemberStats, ClientError> {
        let attached = tokio::select! {
            subscriber = self.client.subscribe(&self.subscription, &self.name) => Some(subscriber?),
            () = stop_requested(&mut self.stop) => None,
        };
        let Some(mut subscriber) = attached else {
            warn!(
                subscription = %self.subscription,
                member = %self.name,
                "stopped before the consumer attached"
            );
            return Ok(self.stats);
        };
        info!(subscription = %self.subscription, member = %self.name, "consumer attached");

        let releases = self.policy.uses_pool();
        let mut ticker = tokio::time::interval(self.release_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                delivery = subscriber.recv() => {
                    let Some(delivery) = delivery else {
                        debug!(member = %self.name, "delivery channel closed");
                        break;
                    };
                    self.handle(delivery);
                }
                _ = ticker.tick(), if releases => self.release_one(),
            }
        }

        debug!(member = %self.name, stats = ?self.stats, "consumer detaching");
        Ok(self.stats)
    }

    fn handle(&mut self, delivery: Delivery) {
        self.stats.deliveries += 1;
        match self.policy {
            AckPolicy::Always => self.ack(delivery),
            AckPolicy::Nack {
                probability,
                max_redeliveries,
            } => {
                if delivery.attempt <= max_redeliveries && self.chance(probability) {
                    self.stats.nacks += 1;
                    delivery.responder.nack();
                } else {
                    self.ack(delivery);
                }
            }
            AckPolicy::Withhold {
                probability,
                max_pending,
            } => {
                if self.chance(probability) {
                    let pending = PendingDelivery::new(delivery, self.name.clone());
                    match self.pool.try_push(pending, max_pending) {
                        Ok(()) => self.stats.withheld += 1,
                        Err(pending) => self.emit(pending.ack_by(&self.name), false),
                    }
                } else {
                    self.ack(delivery);
                }
            }
            AckPolicy::DrainShuffled { probability } => {
                self.ack(delivery);
                if self.chance(probability) {
                    self.release_one();
                }
            }
        }
    }

    fn ack(&mut self, delivery: Delivery) {
        let observation = PendingDelivery::new(delivery, self.name.clone()).ack_by(&self.name);
        self.emit(observation, false);
    }

    fn release_one(&mut self) {
        if let Some(pending) = self.pool.pop_random(&mut self.rng) {
            let observation = pending.ack_by(&self.name);
            self.emit(observation, true);
        }
    }

    fn emit(&mut self, observation: Observation, released: bool) {
        if released {
            self.stats.released += 1;
        } else {
            self.stats.acks += 1;
        }
        // The collector outlives every member, so a send only fails if it panicked.
        let _ = self.tx.send(observation);
    }

    fn chance(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }
}
