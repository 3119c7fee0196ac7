//! Broker state shared by every simulated node.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rill_client::{
    AckSink, ClientError, Delivery, Limits, ReceivedRecord, Record, RecordId, Resource, Result,
    StreamInfo, Subscription,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Records of one stream in append order.
#[derive(Debug, Default)]
pub struct StreamLog {
    pub records: Vec<ReceivedRecord>,
}

/// A delivery that has been handed out and not yet acked.
#[derive(Debug, Clone, Copy)]
pub struct Outstanding {
    pub member: u64,
    pub position: usize,
    pub deadline: Instant,
}

/// Outstanding deliveries of one subscription.
#[derive(Debug, Default)]
pub struct AckLedger {
    entries: BTreeMap<RecordId, Outstanding>,
}

impl AckLedger {
    pub fn insert(&mut self, id: RecordId, entry: Outstanding) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<Outstanding> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes and returns every entry whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(RecordId, Outstanding)> {
        self.take_where(|entry| entry.deadline <= now)
    }

    /// Removes and returns every entry held by `member`.
    pub fn take_member(&mut self, member: u64) -> Vec<(RecordId, Outstanding)> {
        self.take_where(|entry| entry.member == member)
    }

    fn take_where(&mut self, pred: impl Fn(&Outstanding) -> bool) -> Vec<(RecordId, Outstanding)> {
        let ids: Vec<RecordId> = self
            .entries
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }
}

/// A consumer attached to a subscription.
#[derive(Debug)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub outstanding: usize,
    pub tx: mpsc::UnboundedSender<Delivery>,
}

/// Dispatch state of one subscription.
pub struct SubState {
    pub info: Subscription,
    /// Distinguishes a subscription from a later one with the same id.
    pub generation: u64,
    pub sink: Arc<dyn AckSink>,
    /// Next stream position never dispatched.
    pub cursor: usize,
    pub ledger: AckLedger,
    pub acked: HashSet<RecordId>,
    pub redelivery: VecDeque<(RecordId, usize)>,
    /// Never-delivered records held back while their key's owner was full.
    pub waiting: VecDeque<(RecordId, usize)>,
    /// Ordering key to owning member id.
    pub owners: HashMap<String, u64>,
    /// Attached members in attach order.
    pub members: Vec<Member>,
    pub next_owner: usize,
    pub attempts: HashMap<RecordId, u32>,
}

impl SubState {
    fn new(info: Subscription, generation: u64, sink: Arc<dyn AckSink>) -> Self {
        Self {
            info,
            generation,
            sink,
            cursor: 0,
            ledger: AckLedger::default(),
            acked: HashSet::new(),
            redelivery: VecDeque::new(),
            waiting: VecDeque::new(),
            owners: HashMap::new(),
            members: Vec::new(),
            next_owner: 0,
            attempts: HashMap::new(),
        }
    }
}

/// The whole broker.
#[derive(Default)]
pub struct State {
    pub streams: BTreeMap<String, StreamLog>,
    pub subscriptions: BTreeMap<String, SubState>,
    next_batch_id: u64,
    next_generation: u64,
    next_member_id: u64,
}

impl State {
    pub fn create_stream(&mut self, name: &str) -> Result<()> {
        if self.streams.contains_key(name) {
            return Err(ClientError::AlreadyExists {
                resource: Resource::Stream,
                name: name.to_string(),
            });
        }
        self.streams.insert(name.to_string(), StreamLog::default());
        Ok(())
    }

    pub fn list_streams(&self) -> Vec<StreamInfo> {
        self.streams
            .keys()
            .map(|name| StreamInfo { name: name.clone() })
            .collect()
    }

    pub fn delete_stream(&mut self, name: &str) -> Result<()> {
        self.streams
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::stream_not_found(name))
    }

    /// Appends a batch. Either every record is written or none is.
    pub fn append(&mut self, limits: &Limits, stream: &str, records: Vec<Record>) -> Result<Vec<RecordId>> {
        let log = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| ClientError::stream_not_found(stream))?;

        if records.len() > limits.max_records_per_append {
            return Err(ClientError::InvalidArgument {
                name: "records",
                reason: format!(
                    "{} records exceeds the per-append limit of {}",
                    records.len(),
                    limits.max_records_per_append
                ),
            });
        }
        if let Some(size) = records
            .iter()
            .map(Record::size)
            .find(|size| *size > limits.max_record_bytes)
        {
            return Err(ClientError::RecordTooLarge {
                size,
                max: limits.max_record_bytes,
            });
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }

        self.next_batch_id += 1;
        let batch_id = self.next_batch_id;
        let mut ids = Vec::with_capacity(records.len());
        for (index, record) in (0u32..).zip(records) {
            let id = RecordId::new(batch_id, index);
            log.records.push(ReceivedRecord { id, record });
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn create_subscription(
        &mut self,
        subscription: &Subscription,
        sink: impl FnOnce(u64) -> Arc<dyn AckSink>,
    ) -> Result<()> {
        if !self.streams.contains_key(&subscription.stream) {
            return Err(ClientError::stream_not_found(&subscription.stream));
        }
        if self.subscriptions.contains_key(&subscription.id) {
            return Err(ClientError::AlreadyExists {
                resource: Resource::Subscription,
                name: subscription.id.clone(),
            });
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.subscriptions.insert(
            subscription.id.clone(),
            SubState::new(subscription.clone(), generation, sink(generation)),
        );
        Ok(())
    }

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .values()
            .map(|sub| sub.info.clone())
            .collect()
    }

    pub fn delete_subscription(&mut self, id: &str) -> Result<()> {
        self.subscriptions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ClientError::subscription_not_found(id))
    }

    /// Attaches a member. Returns the subscription generation and member id.
    pub fn attach(
        &mut self,
        subscription: &str,
        name: &str,
        tx: mpsc::UnboundedSender<Delivery>,
    ) -> Result<(u64, u64)> {
        let sub = self
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| ClientError::subscription_not_found(subscription))?;
        if sub.members.iter().any(|member| member.name == name) {
            return Err(ClientError::AlreadyExists {
                resource: Resource::Consumer,
                name: name.to_string(),
            });
        }
        self.next_member_id += 1;
        let id = self.next_member_id;
        sub.members.push(Member {
            id,
            name: name.to_string(),
            outstanding: 0,
            tx,
        });
        Ok((sub.generation, id))
    }

    pub fn subscription_mut(&mut self, id: &str, generation: u64) -> Option<&mut SubState> {
        self.subscriptions
            .get_mut(id)
            .filter(|sub| sub.generation == generation)
    }

    /// Expires timed-out deliveries and dispatches every subscription.
    pub fn dispatch_all(&mut self, limits: &Limits, now: Instant) {
        for sub in self.subscriptions.values_mut() {
            sub.expire(now);
            if let Some(log) = self.streams.get(&sub.info.stream) {
                let ack_timeout = effective_ack_timeout(&sub.info, limits);
                sub.dispatch(log, limits.max_outstanding_per_consumer, now + ack_timeout);
            }
        }
    }
}

fn effective_ack_timeout(info: &Subscription, limits: &Limits) -> Duration {
    if info.ack_timeout.is_zero() {
        limits.default_ack_timeout
    } else {
        info.ack_timeout
    }
}
