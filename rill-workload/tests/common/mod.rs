//! Broker clients that misbehave in controlled ways.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rill_client::{
    BrokerClient, ClientError, Record, RecordId, Result, StreamInfo, Subscriber, Subscription,
};

/// Which calls never complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    /// Appends hang.
    Append,
    /// Attaching a consumer hangs.
    Subscribe,
}

/// A client whose appends or attaches never complete.
#[derive(Debug)]
pub struct StalledClient {
    stall: Stall,
}

impl StalledClient {
    pub const fn new(stall: Stall) -> Self {
        Self { stall }
    }
}

#[async_trait]
impl BrokerClient for StalledClient {
    fn address(&self) -> &str {
        "stalled:0"
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

    async fn append(&self, stream: &str, _records: Vec<Record>) -> Result<Vec<RecordId>> {
        if self.stall == Stall::Append {
            std::future::pending::<()>().await;
        }
        Err(ClientError::stream_not_found(stream))
    }

    async fn subscribe(&self, subscription: &str, _consumer: &str) -> Result<Subscriber> {
        if self.stall == Stall::Subscribe {
            std::future::pending::<()>().await;
        }
        Err(ClientError::subscription_not_found(subscription))
    }
}

/// A client that assigns each append a lower batch id than the one before.
#[derive(Debug)]
pub struct CountdownClient {
    next_batch: AtomicU64,
}

impl CountdownClient {
    pub const fn new(first_batch: u64) -> Self {
        Self {
            next_batch: AtomicU64::new(first_batch),
        }
    }
}

#[async_trait]
impl BrokerClient for CountdownClient {
    fn address(&self) -> &str {
        "countdown:0"
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

    async fn append(&self, _stream: &str, records: Vec<Record>) -> Result<Vec<RecordId>> {
        let batch = self.next_batch.fetch_sub(1, Ordering::SeqCst);
        Ok((0..records.len())
            .map(|i| RecordId::new(batch, u32::try_from(i).unwrap()))
            .collect())
    }

    async fn subscribe(&self, subscription: &str, _consumer: &str) -> Result<Subscriber> {
        Err(ClientError::subscription_not_found(subscription))
    }
}
