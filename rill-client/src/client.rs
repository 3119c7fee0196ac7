//! The broker client trait and the delivery types it hands out.
//!
//! Deliveries are pushed to a [`Subscriber`] through an unbounded channel.
//! Each [`Delivery`] carries a [`Responder`] that can be used exactly once:
//! `ack` and `nack` consume it, so a delivery moves from pending to acked at
//! most once on the consumer side. Responders are `Send`, which lets one
//! consumer park a delivery in a shared pool and another consumer of the
//! same subscription acknowledge it later.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::record::{ReceivedRecord, Record, RecordId, StreamInfo, Subscription};

/// Client-facing operations of a broker node.
///
/// Implementations must be `Send + Sync` for use across producer and
/// consumer tasks.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Returns the address of the node this client talks to.
    fn address(&self) -> &str;

    /// Creates a stream.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyExists` if a stream with this name exists.
    async fn create_stream(&self, name: &str) -> Result<()>;

    /// Lists all streams.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be reached.
    async fn list_streams(&self) -> Result<Vec<StreamInfo>>;

    /// Deletes a stream.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the stream does not exist.
    async fn delete_stream(&self, name: &str) -> Result<()>;

    /// Creates a subscription bound to an existing stream.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the stream does not exist and with
    /// `AlreadyExists` if the subscription id is taken.
    async fn create_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Lists all subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be reached.
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Deletes a subscription.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the subscription does not exist.
    async fn delete_subscription(&self, id: &str) -> Result<()>;

    /// Appends records to a stream as one batch.
    ///
    /// On success the returned identifiers are in the same order as
    /// `records`. On failure no record of the batch is written.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the stream does not exist and with
    /// `RecordTooLarge` if any record exceeds the maximum record size.
    async fn append(&self, stream: &str, records: Vec<Record>) -> Result<Vec<RecordId>>;

    /// Attaches a named consumer to a subscription.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the subscription does not exist.
    async fn subscribe(&self, subscription: &str, consumer: &str) -> Result<Subscriber>;
}

/// A shareable, type-erased broker client.
pub type SharedClient = Arc<dyn BrokerClient>;

/// Connects clients to node addresses.
///
/// The orchestrator only knows addresses; a factory turns an address into a
/// client of whatever transport the broker under test speaks.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// Connects to the node at `address`.
    ///
    /// # Errors
    ///
    /// Fails with `Unavailable` if nothing answers at `address`.
    async fn connect(&self, address: &str) -> Result<SharedClient>;
}

/// Receiving side of acknowledgments for one subscription.
pub trait AckSink: Send + Sync + 'static {
    /// Finalizes the delivery of `id`.
    fn ack(&self, id: RecordId);

    /// Refuses the delivery of `id`, asking for redelivery.
    fn nack(&self, id: RecordId);
}

/// Single-use acknowledgment handle for one delivery.
pub struct Responder {
    id: RecordId,
    sink: Arc<dyn AckSink>,
}

impl Responder {
    /// Creates a responder for `id` that reports to `sink`.
    #[must_use]
    pub fn new(id: RecordId, sink: Arc<dyn AckSink>) -> Self {
        Self { id, sink }
    }

    /// Returns the identifier of the delivered record.
    #[must_use]
    pub const fn id(&self) -> RecordId {
        self.id
    }

    /// Acknowledges the delivery.
    pub fn ack(self) {
        self.sink.ack(self.id);
    }

    /// Negatively acknowledges the delivery.
    pub fn nack(self) {
        self.sink.nack(self.id);
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish()
    }
}

/// One delivery of a record to a consumer.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered record.
    pub record: ReceivedRecord,
    /// How many times this record has been handed out, starting at 1.
    pub attempt: u32,
    /// Acknowledgment handle.
    pub responder: Responder,
}

/// A named consumer attached to a subscription.
///
/// Dropping the subscriber detaches the consumer from its group.
pub struct Subscriber {
    subscription: String,
    consumer: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    on_detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscriber {
    /// Creates a subscriber over a delivery channel.
    ///
    /// `on_detach` runs exactly once, when the subscriber is dropped.
    #[must_use]
    pub fn new(
        subscription: impl Into<String>,
        consumer: impl Into<String>,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        on_detach: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            consumer: consumer.into(),
            deliveries,
            on_detach: Some(Box::new(on_detach)),
        }
    }

    /// Returns the subscription id.
    #[must_use]
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Returns the consumer name.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Waits for the next delivery.
    ///
    /// Returns `None` once the broker has dropped this consumer.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Returns the next delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscription", &self.subscription)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(detach) = self.on_detach.take() {
            detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::record::Record;

    #[derive(Default)]
    struct RecordingSink {
        acks: Mutex<Vec<RecordId>>,
        nacks: Mutex<Vec<RecordId>>,
    }

    impl AckSink for RecordingSink {
        fn ack(&self, id: RecordId) {
            self.acks.lock().unwrap().push(id);
        }

        fn nack(&self, id: RecordId) {
            self.nacks.lock().unwrap().push(id);
        }
    }

    #[test]
    fn test_responder_reports_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        Responder::new(RecordId::new(1, 0), sink.clone()).ack();
        Responder::new(RecordId::new(1, 1), sink.clone()).nack();

        assert_eq!(*sink.acks.lock().unwrap(), vec![RecordId::new(1, 0)]);
        assert_eq!(*sink.nacks.lock().unwrap(), vec![RecordId::new(1, 1)]);
    }

    #[tokio::test]
    async fn test_subscriber_detaches_on_drop() {
        let detached = Arc::new(Mutex::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let flag = detached.clone();
        let mut subscriber = Subscriber::new("sub", "c1", rx, move || {
            *flag.lock().unwrap() = true;
        });

        let sink = Arc::new(RecordingSink::default());
        tx.send(Delivery {
            record: ReceivedRecord {
                id: RecordId::new(3, 0),
                record: Record::raw(vec![1u8]),
            },
            attempt: 1,
            responder: Responder::new(RecordId::new(3, 0), sink),
        })
        .unwrap();

        let delivery = subscriber.recv().await.unwrap();
        assert_eq!(delivery.record.id, RecordId::new(3, 0));
        assert!(!*detached.lock().unwrap());

        drop(subscriber);
        assert!(*detached.lock().unwrap());
    }
}
