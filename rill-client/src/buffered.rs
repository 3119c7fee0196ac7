//! Batching producer.
//!
//! A [`BufferedProducer`] hands every write to a background batcher task and
//! returns a [`WriteHandle`] immediately. The batcher accumulates records and
//! flushes them as a single append when any enabled limit trips:
//!
//! - the number of buffered records reaches `record_count_limit`,
//! - the age of the oldest buffered record reaches `age_limit`,
//! - the buffered payload bytes reach `bytes_limit`.
//!
//! Records buffered after a flush wait for the next trigger. A handle for
//! such a record stays pending until a later flush, an explicit
//! [`BufferedProducer::flush`], or [`BufferedProducer::close`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::client::SharedClient;
use crate::error::{ClientError, Result};
use crate::record::{Record, RecordId};

/// Flush triggers of a [`BufferedProducer`].
///
/// `None` disables a trigger. With every trigger disabled, records are
/// only written by an explicit flush or close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSetting {
    /// Flush once this many records are buffered.
    pub record_count_limit: Option<u32>,
    /// Flush once the oldest buffered record is this old.
    pub age_limit: Option<Duration>,
    /// Flush once buffered payloads reach this many bytes.
    pub bytes_limit: Option<usize>,
}

impl BatchSetting {
    /// Creates the default setting: 100 records, 100ms, 4096 bytes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            record_count_limit: Some(100),
            age_limit: Some(Duration::from_millis(100)),
            bytes_limit: Some(4096),
        }
    }

    /// Creates a setting with every trigger disabled.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            record_count_limit: None,
            age_limit: None,
            bytes_limit: None,
        }
    }

    /// Returns a builder starting from every trigger disabled.
    #[must_use]
    pub const fn builder() -> BatchSettingBuilder {
        BatchSettingBuilder {
            setting: Self::disabled(),
        }
    }

    /// Validates the setting.
    ///
    /// # Errors
    /// Returns an error if an enabled limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.record_count_limit == Some(0) {
            return Err(ClientError::InvalidArgument {
                name: "record_count_limit",
                reason: "must be positive when enabled".to_string(),
            });
        }
        if self.age_limit.is_some_and(|age| age.is_zero()) {
            return Err(ClientError::InvalidArgument {
                name: "age_limit",
                reason: "must be positive when enabled".to_string(),
            });
        }
        if self.bytes_limit == Some(0) {
            return Err(ClientError::InvalidArgument {
                name: "bytes_limit",
                reason: "must be positive when enabled".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for BatchSetting {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`BatchSetting`].
#[derive(Debug, Clone, Copy)]
pub struct BatchSettingBuilder {
    setting: BatchSetting,
}

impl BatchSettingBuilder {
    /// Enables the record-count trigger.
    #[must_use]
    pub const fn record_count_limit(mut self, limit: u32) -> Self {
        self.setting.record_count_limit = Some(limit);
        self
    }

    /// Enables the age trigger.
    #[must_use]
    pub const fn age_limit(mut self, limit: Duration) -> Self {
        self.setting.age_limit = Some(limit);
        self
    }

    /// Enables the byte-size trigger.
    #[must_use]
    pub const fn bytes_limit(mut self, limit: usize) -> Self {
        self.setting.bytes_limit = Some(limit);
        self
    }

    /// Builds and validates the setting.
    ///
    /// # Errors
    /// Returns an error if an enabled limit is zero.
    pub fn build(self) -> Result<BatchSetting> {
        self.setting.validate()?;
        Ok(self.setting)
    }
}

/// Snapshot of a producer's flush counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Number of appends issued by the batcher.
    pub flushes: u64,
    /// Records written successfully.
    pub records_written: u64,
    /// Records whose batch was rejected.
    pub records_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    records_written: AtomicU64,
    records_failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ProducerStats {
        ProducerStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
        }
    }
}

type Reply = oneshot::Sender<Result<RecordId>>;

enum Command {
    Write { record: Record, reply: Reply },
    Flush { done: oneshot::Sender<()> },
    Close { done: oneshot::Sender<()> },
}

/// Pending result of a buffered write.
///
/// Resolves to the record's identifier once its batch has been appended.
#[derive(Debug)]
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<RecordId>>,
}

impl WriteHandle {
    /// Returns the result if the write has already resolved.
    pub fn try_result(&mut self) -> Option<Result<RecordId>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::ProducerClosed)),
        }
    }
}

impl Future for WriteHandle {
    type Output = Result<RecordId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ClientError::ProducerClosed)))
    }
}

/// A producer that batches writes according to a [`BatchSetting`].
///
/// Cloning yields another handle to the same batcher, so several tasks can
/// write through one batching instance.
#[derive(Clone)]
pub struct BufferedProducer {
    stream: String,
    commands: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
}

impl BufferedProducer {
    /// Creates a producer for `stream` and starts its batcher task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns an error if `setting` is invalid.
    pub fn new(client: SharedClient, stream: impl Into<String>, setting: BatchSetting) -> Result<Self> {
        setting.validate()?;
        let stream = stream.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let batcher = Batcher {
            client,
            stream: stream.clone(),
            setting,
            commands: rx,
            buffer: Vec::new(),
            buffered_bytes: 0,
            deadline: None,
            counters: counters.clone(),
        };
        tokio::spawn(batcher.run());

        Ok(Self {
            stream,
            commands: tx,
            counters,
        })
    }

    /// Returns the target stream.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Queues a record and returns a handle to its eventual identifier.
    ///
    /// The handle of a write issued after `close` resolves to
    /// `ProducerClosed`.
    pub fn write(&self, record: Record) -> WriteHandle {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Write { record, reply }) {
            if let Command::Write { reply, .. } = command {
                let _ = reply.send(Err(ClientError::ProducerClosed));
            }
        }
        WriteHandle { rx }
    }

    /// Flushes everything buffered so far and waits for the append.
    ///
    /// # Errors
    /// Returns `ProducerClosed` if the producer has been closed.
    pub async fn flush(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush { done })
            .map_err(|_| ClientError::ProducerClosed)?;
        rx.await.map_err(|_| ClientError::ProducerClosed)
    }

    /// Flushes outstanding records and stops the batcher.
    ///
    /// Every handle returned by `write` before this call has resolved when
    /// `close` returns. Closing twice is a no-op.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Returns the flush counters.
    #[must_use]
    pub fn stats(&self) -> ProducerStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for BufferedProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedProducer")
            .field("stream", &self.stream)
            .field("stats", &self.stats())
            .finish()
    }
}

struct Batcher {
    client: SharedClient,
    stream: String,
    setting: BatchSetting,
    commands: mpsc::UnboundedReceiver<Command>,
    buffer: Vec<(Record, Reply)>,
    buffered_bytes: usize,
    deadline: Option<Instant>,
    counters: Arc<Counters>,
}

impl Batcher {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;

                () = wait_for(deadline) => {
                    debug!(stream = %self.stream, "age limit reached");
                    self.flush().await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Write { record, reply }) => {
                        self.push(record, reply);
                        if self.limit_reached() {
                            self.flush().await;
                        }
                    }
                    Some(Command::Flush { done }) => {
                        self.flush().await;
                        let _ = done.send(());
                    }
                    Some(Command::Close { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.flush().await;
                        return;
                    }
                },
            }
        }
    }

    fn push(&mut self, record: Record, reply: Reply) {
        if self.buffer.is_empty() {
            self.deadline = self.setting.age_limit.map(|age| Instant::now() + age);
        }
        self.buffered_bytes += record.size();
        self.buffer.push((record, reply));
    }

    fn limit_reached(&self) -> bool {
        let count_reached = self
            .setting
            .record_count_limit
            .is_some_and(|limit| self.buffer.len() >= limit as usize);
        let bytes_reached = self
            .setting
            .bytes_limit
            .is_some_and(|limit| self.buffered_bytes >= limit);
        count_reached || bytes_reached
    }

    async fn flush(&mut self) {
        self.deadline = None;
        if self.buffer.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut self.buffered_bytes);
        let (records, replies): (Vec<_>, Vec<_>) = std::mem::take(&mut self.buffer).into_iter().unzip();
        let count = records.len();

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        let result = match self.client.append(&self.stream, records).await {
            Ok(ids) if ids.len() == count => Ok(ids),
            Ok(ids) => Err(ClientError::Protocol {
                message: format!("append of {count} records returned {} identifiers", ids.len()),
            }),
            Err(e) => Err(e),
        };

        match result {
            Ok(ids) => {
                debug!(stream = %self.stream, records = count, bytes, "batch flushed");
                self.counters
                    .records_written
                    .fetch_add(count as u64, Ordering::Relaxed);
                for (reply, id) in replies.into_iter().zip(ids) {
                    let _ = reply.send(Ok(id));
                }
            }
            Err(e) => {
                warn!(stream = %self.stream, records = count, error = %e, "batch rejected");
                self.counters
                    .records_failed
                    .fetch_add(count as u64, Ordering::Relaxed);
                for reply in replies {
                    let _ = reply.send(Err(e.clone()));
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.flush().await;
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Write { reply, .. } => {
                    let _ = reply.send(Err(ClientError::ProducerClosed));
                }
                Command::Flush { done } | Command::Close { done } => {
                    let _ = done.send(());
                }
            }
        }
        debug!(stream = %self.stream, "producer closed");
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::time::timeout;

    use super::*;
    use crate::client::{BrokerClient, Subscriber};
    use crate::record::{StreamInfo, Subscription};

    /// Records every append and assigns sequential batch ids.
    #[derive(Default)]
    struct MockClient {
        batches: Mutex<Vec<usize>>,
        reject: bool,
    }

    impl MockClient {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerClient for MockClient {
        fn address(&self) -> &str {
            "mock:0"
        }

        async fn create_stream(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn list_streams(&self) -> Result<Vec<StreamInfo>> {
            Ok(Vec::new())
        }

        async fn delete_stream(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn create_subscription(&self, _subscription: &Subscription) -> Result<()> {
            Ok(())
        }

        async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
            Ok(Vec::new())
        }

        async fn delete_subscription(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn append(&self, stream: &str, records: Vec<Record>) -> Result<Vec<RecordId>> {
            if self.reject {
                return Err(ClientError::stream_not_found(stream));
            }
            let mut batches = self.batches.lock().unwrap();
            batches.push(records.len());
            let batch_id = batches.len() as u64;
            Ok((0..records.len())
                .map(|i| RecordId::new(batch_id, u32::try_from(i).unwrap()))
                .collect())
        }

        async fn subscribe(&self, subscription: &str, _consumer: &str) -> Result<Subscriber> {
            Err(ClientError::subscription_not_found(subscription))
        }
    }

    fn record(len: usize) -> Record {
        Record::raw(Bytes::from(vec![b'x'; len]))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_count_limit_flushes_exactly_once() {
        let client = Arc::new(MockClient::default());
        let setting = BatchSetting::builder().record_count_limit(10).build().unwrap();
        let producer = BufferedProducer::new(client.clone(), "s", setting).unwrap();

        let handles: Vec<_> = (0..10).map(|_| producer.write(record(8))).collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let id = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
            assert_eq!(id, RecordId::new(1, u32::try_from(i).unwrap()));
        }
        assert_eq!(client.batch_sizes(), vec![10]);

        // The eleventh record waits for the next trigger.
        let mut extra = producer.write(record(8));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(extra.try_result().is_none());
        assert_eq!(client.batch_sizes(), vec![10]);

        producer.close().await;
        assert_eq!(extra.try_result().unwrap().unwrap(), RecordId::new(2, 0));
        assert_eq!(client.batch_sizes(), vec![10, 1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bytes_limit_holds_back_excess_write() {
        let client = Arc::new(MockClient::default());
        let setting = BatchSetting::builder().bytes_limit(4096).build().unwrap();
        let producer = BufferedProducer::new(client.clone(), "s", setting).unwrap();

        let mut handles: Vec<_> = (0..42).map(|_| producer.write(record(100))).collect();
        let last = handles.pop().unwrap();

        for handle in handles {
            timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        }
        assert_eq!(client.batch_sizes(), vec![41]);

        let mut last = last;
        assert!(timeout(Duration::from_secs(3), &mut last).await.is_err());

        producer.close().await;
        let id = timeout(Duration::from_secs(1), last).await.unwrap().unwrap();
        assert_eq!(id, RecordId::new(2, 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_age_limit_flushes_without_close() {
        let client = Arc::new(MockClient::default());
        let setting = BatchSetting::builder()
            .age_limit(Duration::from_millis(50))
            .build()
            .unwrap();
        let producer = BufferedProducer::new(client.clone(), "s", setting).unwrap();

        let first = producer.write(record(1));
        let second = producer.write(record(1));
        timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
        timeout(Duration::from_secs(5), second).await.unwrap().unwrap();
        assert_eq!(client.batch_sizes(), vec![2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_resolves_all_handles() {
        let client = Arc::new(MockClient::default());
        let producer = BufferedProducer::new(client.clone(), "s", BatchSetting::disabled()).unwrap();

        let handles: Vec<_> = (0..25).map(|_| producer.write(record(4))).collect();
        producer.close().await;

        for mut handle in handles {
            assert!(handle.try_result().unwrap().is_ok());
        }
        assert_eq!(producer.stats().records_written, 25);

        let late = producer.write(record(4));
        assert_eq!(late.await, Err(ClientError::ProducerClosed));
        assert_eq!(producer.flush().await, Err(ClientError::ProducerClosed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_batch_fails_every_handle() {
        let client = Arc::new(MockClient {
            reject: true,
            ..MockClient::default()
        });
        let producer = BufferedProducer::new(client, "missing", BatchSetting::disabled()).unwrap();

        let handles: Vec<_> = (0..3).map(|_| producer.write(record(4))).collect();
        producer.flush().await.unwrap();
        for handle in handles {
            assert!(handle.await.unwrap_err().is_not_found());
        }
        assert_eq!(producer.stats().records_failed, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_writers_all_resolve() {
        let client = Arc::new(MockClient::default());
        let setting = BatchSetting::builder()
            .record_count_limit(7)
            .age_limit(Duration::from_millis(20))
            .build()
            .unwrap();
        let producer = BufferedProducer::new(client.clone(), "s", setting).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let producer = producer.clone();
            tasks.push(tokio::spawn(async move {
                let handles: Vec<_> = (0..50).map(|_| producer.write(record(2))).collect();
                let mut ids = Vec::new();
                for handle in handles {
                    ids.push(handle.await.unwrap());
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(timeout(Duration::from_secs(10), task).await.unwrap().unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert_eq!(client.batch_sizes().iter().sum::<usize>(), 200);
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(BatchSetting::builder().record_count_limit(0).build().is_err());
        assert!(BatchSetting::builder().bytes_limit(0).build().is_err());
        assert!(BatchSetting::builder().age_limit(Duration::ZERO).build().is_err());
        assert!(BatchSetting::default().validate().is_ok());
    }
}
