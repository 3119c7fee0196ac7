//! Workload generation.
//!
//! A [`Workload`] is a deterministic plan of records (payloads from a
//! [`PayloadShape`], ordering keys from a [`KeyAssignment`]) and a
//! [`Discipline`] describing how the records are written:
//!
//! - **Direct**: one append per record, awaited before the next is issued
//! - **Batched**: one [`BufferedProducer`], closed once every write is issued
//! - **Concurrent**: several tasks issuing writes into one shared
//!   [`BufferedProducer`]; no ordering across tasks is assumed
//! - **Mixed**: each turn either writes one record directly or writes a
//!   burst through a fresh buffered producer whose count limit equals the
//!   burst size, awaiting the burst before the next turn
//!
//! Running a workload yields the [`ExpectedModel`]: every acknowledged write
//! with the identifier the broker assigned.

use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use hdrhistogram::Histogram;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rill_client::{
    BatchSetting, BufferedProducer, ClientError, Producer, Record, RecordId, SharedClient,
    WriteHandle,
};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, WorkloadError};
use crate::model::ExpectedModel;
use crate::payload::{PayloadGenerator, PayloadShape};

/// Default bound on a single write's resolution.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// How records are written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Discipline {
    /// One append per record.
    #[default]
    Direct,
    /// One buffered producer with the given flush triggers.
    Batched(BatchSetting),
    /// Several tasks writing through one shared buffered producer.
    Concurrent {
        /// Number of writer tasks.
        tasks: usize,
        /// Flush triggers of the shared producer.
        setting: BatchSetting,
    },
    /// Random interleaving of direct writes and batched bursts.
    Mixed {
        /// Records per burst.
        burst: u32,
    },
}

/// How ordering keys are assigned to records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyAssignment {
    /// No explicit key; every record belongs to the default key.
    #[default]
    Unkeyed,
    /// The same key for every record.
    Single(String),
    /// A key chosen uniformly at random per record.
    Uniform(Vec<String>),
}

impl KeyAssignment {
    /// Creates a uniform assignment over `key-0` .. `key-{n-1}`.
    #[must_use]
    pub fn uniform(n: usize) -> Self {
        Self::Uniform((0..n).map(|i| format!("key-{i}")).collect())
    }
}

/// Configuration for a workload run.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of records to write.
    pub count: usize,
    /// Payload shape.
    pub shape: PayloadShape,
    /// Write discipline.
    pub discipline: Discipline,
    /// Ordering key assignment.
    pub keys: KeyAssignment,
    /// Random seed for payloads, keys, and mixed interleaving.
    pub seed: u64,
    /// Bound on each write's resolution.
    pub write_timeout: Duration,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            count: 100,
            shape: PayloadShape::default(),
            discipline: Discipline::default(),
            keys: KeyAssignment::default(),
            seed: 42,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Builder for [`Workload`].
#[derive(Debug, Clone, Default)]
pub struct WorkloadBuilder {
    config: WorkloadConfig,
}

impl WorkloadBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of records.
    #[must_use]
    pub const fn count(mut self, count: usize) -> Self {
        self.config.count = count;
        self
    }

    /// Sets the payload shape.
    #[must_use]
    pub fn shape(mut self, shape: PayloadShape) -> Self {
        self.config.shape = shape;
        self
    }

    /// Sets the write discipline.
    #[must_use]
    pub const fn discipline(mut self, discipline: Discipline) -> Self {
        self.config.discipline = discipline;
        self
    }

    /// Sets the ordering key assignment.
    #[must_use]
    pub fn keys(mut self, keys: KeyAssignment) -> Self {
        self.config.keys = keys;
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Sets the bound on each write's resolution.
    #[must_use]
    pub const fn write_timeout(mut self, write_timeout: Duration) -> Self {
        self.config.write_timeout = write_timeout;
        self
    }

    /// Builds the workload.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for zero writer tasks, an empty burst, an
    /// empty key set, or a zero write timeout.
    pub fn build(self) -> Result<Workload> {
        let invalid = |reason: &str| {
            Err(WorkloadError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        match &self.config.discipline {
            Discipline::Concurrent { tasks: 0, .. } => return invalid("tasks must be positive"),
            Discipline::Mixed { burst: 0 } => return invalid("burst must be positive"),
            _ => {}
        }
        if matches!(&self.config.keys, KeyAssignment::Uniform(keys) if keys.is_empty()) {
            return invalid("key set must not be empty");
        }
        if self.config.write_timeout.is_zero() {
            return invalid("write timeout must be positive");
        }
        Ok(Workload {
            config: self.config,
        })
    }
}

/// A failed write.
#[derive(Debug)]
pub struct WriteFailure {
    /// Position of the record in the plan.
    pub index: usize,
    /// What went wrong.
    pub error: WorkloadError,
}

/// Outcome of a workload run.
#[derive(Debug)]
pub struct Production {
    /// Acknowledged writes.
    pub expected: ExpectedModel,
    /// Write statistics.
    pub stats: ProduceStats,
    /// Writes that did not resolve to an identifier.
    pub failures: Vec<WriteFailure>,
}

/// Statistics from a workload run.
#[derive(Debug, Clone, Default)]
pub struct ProduceStats {
    /// Writes that resolved to an identifier.
    pub writes_ok: u64,
    /// Writes that failed or timed out.
    pub writes_failed: u64,
    /// Payload bytes of acknowledged writes.
    pub bytes_written: u64,
    /// Write latency p50 in milliseconds.
    pub latency_p50_ms: f64,
    /// Write latency p95 in milliseconds.
    pub latency_p95_ms: f64,
    /// Write latency p99 in milliseconds.
    pub latency_p99_ms: f64,
    /// Write latency max in milliseconds.
    pub latency_max_ms: f64,
    /// Writes per second.
    pub throughput: f64,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl fmt::Display for ProduceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "writes: {} ok, {} failed, {} bytes; latency p50={:.2}ms p95={:.2}ms \
             p99={:.2}ms max={:.2}ms; {:.0} writes/sec over {}ms",
            self.writes_ok,
            self.writes_failed,
            self.bytes_written,
            self.latency_p50_ms,
            self.latency_p95_ms,
            self.latency_p99_ms,
            self.latency_max_ms,
            self.throughput,
            self.duration_ms
        )
    }
}

/// A deterministic write plan.
#[derive(Debug, Clone)]
pub struct Workload {
    config: WorkloadConfig,
}

impl Workload {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> WorkloadBuilder {
        WorkloadBuilder::new()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// Returns the records this workload writes, in issue order.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        let mut payloads = PayloadGenerator::new(self.config.shape.clone(), self.config.seed);
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.rotate_left(17));
        (0..self.config.count)
            .map(|_| {
                let record = payloads.next_record();
                match &self.config.keys {
                    KeyAssignment::Unkeyed => record,
                    KeyAssignment::Single(key) => record.with_key(key.clone()),
                    KeyAssignment::Uniform(keys) => match keys.choose(&mut rng) {
                        Some(key) => record.with_key(key.clone()),
                        None => record,
                    },
                }
            })
            .collect()
    }

    /// Writes the workload and returns the expected model.
    ///
    /// # Errors
    /// Returns the first write failure, if any write failed.
    pub async fn produce(&self, client: SharedClient, stream: &str) -> Result<ExpectedModel> {
        let mut production = self.run(client, stream).await?;
        if production.failures.is_empty() {
            Ok(production.expected)
        } else {
            Err(production.failures.swap_remove(0).error)
        }
    }

    /// Writes the workload, keeping failures and statistics.
    ///
    /// # Errors
    /// Returns an error only if the run could not start (for example an
    /// invalid batch setting); individual write failures are reported in
    /// [`Production::failures`].
    pub async fn run(&self, client: SharedClient, stream: &str) -> Result<Production> {
        let records = self.records();
        let mut recorder = LatencyRecorder::new()?;
        let started = Instant::now();
        info!(
            stream,
            count = records.len(),
            discipline = ?self.config.discipline,
            "producing workload"
        );

        let outcomes = match &self.config.discipline {
            Discipline::Direct => self.write_direct(&client, stream, records).await,
            Discipline::Batched(setting) => {
                let producer = buffered(&client, stream, *setting)?;
                let issued = records
                    .into_iter()
                    .enumerate()
                    .map(|(index, record)| Issued::new(index, &producer, record))
                    .collect();
                self.resolve(issued, &producer).await
            }
            Discipline::Concurrent { tasks, setting } => {
                self.write_concurrent(&client, stream, records, *tasks, *setting)
                    .await?
            }
            Discipline::Mixed { burst } => {
                self.write_mixed(&client, stream, records, *burst).await?
            }
        };

        let mut production = Production {
            expected: ExpectedModel::new(),
            stats: ProduceStats::default(),
            failures: Vec::new(),
        };
        for outcome in outcomes {
            match outcome.result {
                Ok(id) => {
                    recorder.record(outcome.latency);
                    production.stats.bytes_written += outcome.record.size() as u64;
                    production.expected.push_from(outcome.lane, id, &outcome.record);
                }
                Err(error) => {
                    warn!(stream, index = outcome.index, %error, "write failed");
                    production.failures.push(WriteFailure {
                        index: outcome.index,
                        error,
                    });
                }
            }
        }

        production.stats = recorder.finish(
            production.stats.bytes_written,
            production.failures.len() as u64,
            started.elapsed(),
        );
        info!(stream, stats = %production.stats, "workload produced");
        Ok(production)
    }

    async fn write_direct(
        &self,
        client: &SharedClient,
        stream: &str,
        records: Vec<Record>,
    ) -> Vec<Outcome> {
        let producer = Producer::new(client.clone(), stream);
        let mut outcomes = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let started = Instant::now();
            let write = producer.write(record.clone());
            let result = bounded(self.config.write_timeout, index, write).await;
            outcomes.push(Outcome {
                index,
                lane: 0,
                record,
                result,
                latency: started.elapsed(),
            });
        }
        outcomes
    }

    async fn write_concurrent(
        &self,
        client: &SharedClient,
        stream: &str,
        records: Vec<Record>,
        tasks: usize,
        setting: BatchSetting,
    ) -> Result<Vec<Outcome>> {
        let producer = buffered(client, stream, setting)?;
        let mut lanes: Vec<Vec<(usize, Record)>> = vec![Vec::new(); tasks];
        for (index, record) in records.into_iter().enumerate() {
            lanes[index % tasks].push((index, record));
        }

        let writers: Vec<_> = lanes
            .into_iter()
            .enumerate()
            .map(|(lane, records)| {
                let producer = producer.clone();
                tokio::spawn(async move {
                    let mut issued = Vec::with_capacity(records.len());
                    for (index, record) in records {
                        issued.push(Issued::new(index, &producer, record).in_lane(lane));
                        tokio::task::yield_now().await;
                    }
                    issued
                })
            })
            .collect();

        // Lane by lane, each in the order its task issued the writes.
        let mut issued = Vec::new();
        for writer in join_all(writers).await {
            issued.extend(writer.map_err(|e| WorkloadError::TaskFailed {
                message: format!("writer task: {e}"),
            })?);
        }

        Ok(self.resolve(issued, &producer).await)
    }

    async fn write_mixed(
        &self,
        client: &SharedClient,
        stream: &str,
        records: Vec<Record>,
        burst: u32,
    ) -> Result<Vec<Outcome>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(1));
        let direct = Producer::new(client.clone(), stream);
        let mut pending = records.into_iter().enumerate().peekable();
        let mut outcomes = Vec::new();

        while pending.peek().is_some() {
            if rng.gen_bool(0.5) {
                let setting = BatchSetting::builder()
                    .record_count_limit(burst)
                    .build()
                    .map_err(|e| WorkloadError::client("configure burst", e))?;
                let producer = buffered(client, stream, setting)?;
                let issued: Vec<Issued> = pending
                    .by_ref()
                    .take(burst as usize)
                    .map(|(index, record)| Issued::new(index, &producer, record))
                    .collect();
                debug!(stream, size = issued.len(), "mixed burst");
                outcomes.extend(self.resolve(issued, &producer).await);
            } else if let Some((index, record)) = pending.next() {
                let started = Instant::now();
                let write = direct.write(record.clone());
                let result = bounded(self.config.write_timeout, index, write).await;
                outcomes.push(Outcome {
                    index,
                    lane: 0,
                    record,
                    result,
                    latency: started.elapsed(),
                });
            }
        }
        Ok(outcomes)
    }

    /// Awaits every issued write while closing the producer, which flushes
    /// whatever no trigger has flushed yet.
    ///
    /// The close is bounded by the write timeout like each write. A close
    /// that expires leaves the writes it was holding to fail on their own
    /// bounds.
    async fn resolve(&self, issued: Vec<Issued>, producer: &BufferedProducer) -> Vec<Outcome> {
        let write_timeout = self.config.write_timeout;
        let waits = issued.into_iter().map(|issued| async move {
            let result = bounded(write_timeout, issued.index, issued.handle).await;
            Outcome {
                index: issued.index,
                lane: issued.lane,
                record: issued.record,
                result,
                latency: issued.started.elapsed(),
            }
        });
        let close = timeout(write_timeout, producer.close());
        let (outcomes, closed) = tokio::join!(join_all(waits), close);
        if closed.is_err() {
            warn!(
                stream = producer.stream(),
                waited_ms = u64::try_from(write_timeout.as_millis()).unwrap_or(u64::MAX),
                "producer close did not finish"
            );
        }
        outcomes
    }
}

/// A write handed to a buffered producer.
struct Issued {
    index: usize,
    lane: usize,
    record: Record,
    handle: WriteHandle,
    started: Instant,
}

impl Issued {
    fn new(index: usize, producer: &BufferedProducer, record: Record) -> Self {
        let started = Instant::now();
        let handle = producer.write(record.clone());
        Self {
            index,
            lane: 0,
            record,
            handle,
            started,
        }
    }

    const fn in_lane(mut self, lane: usize) -> Self {
        self.lane = lane;
        self
    }
}

struct Outcome {
    index: usize,
    /// Writer task that issued the record.
    lane: usize,
    record: Record,
    result: Result<RecordId>,
    latency: Duration,
}

fn buffered(client: &SharedClient, stream: &str, setting: BatchSetting) -> Result<BufferedProducer> {
    BufferedProducer::new(client.clone(), stream, setting)
        .map_err(|e| WorkloadError::client(format!("open buffered producer on {stream}"), e))
}

async fn bounded(
    limit: Duration,
    index: usize,
    write: impl std::future::Future<Output = std::result::Result<RecordId, ClientError>>,
) -> Result<RecordId> {
    match timeout(limit, write).await {
        Ok(Ok(id)) => Ok(id),
        Ok(Err(e)) => Err(WorkloadError::client(format!("write record {index}"), e)),
        Err(_) => Err(WorkloadError::Timeout {
            what: format!("write of record {index}"),
            waited: limit,
        }),
    }
}

struct LatencyRecorder {
    histogram: Histogram<u64>,
    ok: u64,
}

impl LatencyRecorder {
    fn new() -> Result<Self> {
        let histogram = Histogram::<u64>::new(3).map_err(|e| WorkloadError::InvalidConfig {
            reason: format!("latency histogram: {e}"),
        })?;
        Ok(Self { histogram, ok: 0 })
    }

    fn record(&mut self, latency: Duration) {
        self.ok += 1;
        self.histogram
            .saturating_record(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX));
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(&self, bytes_written: u64, failed: u64, elapsed: Duration) -> ProduceStats {
        let ms = |micros: u64| micros as f64 / 1000.0;
        let secs = elapsed.as_secs_f64();
        ProduceStats {
            writes_ok: self.ok,
            writes_failed: failed,
            bytes_written,
            latency_p50_ms: ms(self.histogram.value_at_quantile(0.50)),
            latency_p95_ms: ms(self.histogram.value_at_quantile(0.95)),
            latency_p99_ms: ms(self.histogram.value_at_quantile(0.99)),
            latency_max_ms: ms(self.histogram.max()),
            throughput: if secs > 0.0 { self.ok as f64 / secs } else { 0.0 },
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
