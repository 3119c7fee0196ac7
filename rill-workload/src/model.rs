//! Expected and observed models.
//!
//! The [`ExpectedModel`] is what the producer side knows: every record whose
//! write was acknowledged, with the identifier the broker assigned. The
//! [`ObservedModel`] is what the consumer side saw: every record that was
//! permanently acknowledged, keyed by identifier so a record that was
//! redelivered before its final ack appears once.

use std::collections::{BTreeMap, BTreeSet};

use rill_client::{ReceivedRecord, Record, RecordId};

/// A produced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedEntry {
    /// Identifier assigned by the broker.
    pub id: RecordId,
    /// Payload fingerprint.
    pub fingerprint: String,
    /// Effective ordering key.
    pub key: String,
    /// Payload size in bytes.
    pub size: usize,
    /// Writer that issued the record; zero unless several writers ran.
    pub writer: usize,
}

/// Records whose writes were acknowledged, in the order they were issued.
///
/// With several writers, entries are ordered writer by writer, each in the
/// order that writer issued them. No order across writers is implied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedModel {
    entries: Vec<ExpectedEntry>,
}

impl ExpectedModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an acknowledged write.
    pub fn push(&mut self, id: RecordId, record: &Record) {
        self.push_from(0, id, record);
    }

    /// Records an acknowledged write issued by one of several writers.
    pub fn push_from(&mut self, writer: usize, id: RecordId, record: &Record) {
        self.entries.push(ExpectedEntry {
            id,
            fingerprint: record.payload.fingerprint(),
            key: record.key().to_string(),
            size: record.size(),
            writer,
        });
    }

    /// Appends all entries of `other`.
    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entries in issue order.
    #[must_use]
    pub fn entries(&self) -> &[ExpectedEntry] {
        &self.entries
    }

    /// Returns the set of assigned identifiers.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<RecordId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Returns payload fingerprints in issue order.
    #[must_use]
    pub fn fingerprints(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.fingerprint.clone()).collect()
    }

    /// Returns identifiers grouped by writer and ordering key, each in the
    /// order that writer issued them.
    #[must_use]
    pub fn by_writer_and_key(&self) -> BTreeMap<(usize, String), Vec<RecordId>> {
        let mut keys: BTreeMap<(usize, String), Vec<RecordId>> = BTreeMap::new();
        for entry in &self.entries {
            keys.entry((entry.writer, entry.key.clone()))
                .or_default()
                .push(entry.id);
        }
        keys
    }

    /// Returns the total payload bytes produced.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// A permanently acknowledged delivery as reported by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// The delivered record.
    pub record: ReceivedRecord,
    /// Delivery attempt that was acknowledged.
    pub attempt: u32,
    /// Member the delivery was made to.
    pub delivered_to: String,
    /// Member that acknowledged it.
    pub acked_by: String,
}

/// A consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEntry {
    /// Identifier of the record.
    pub id: RecordId,
    /// Payload fingerprint.
    pub fingerprint: String,
    /// Effective ordering key.
    pub key: String,
    /// Member the acknowledged delivery was made to.
    pub delivered_to: String,
    /// Member that acknowledged it.
    pub acked_by: String,
    /// Delivery attempt that was acknowledged.
    pub attempt: u32,
}

/// Records permanently acknowledged by one or more consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedModel {
    entries: BTreeMap<RecordId, ObservedEntry>,
    order: Vec<RecordId>,
    duplicate_acks: usize,
}

impl ObservedModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a final acknowledgment.
    ///
    /// Returns false if the record was already present; the first
    /// acknowledgment is kept and the repeat is only counted.
    pub fn record(&mut self, observation: Observation) -> bool {
        let id = observation.record.id;
        if self.entries.contains_key(&id) {
            self.duplicate_acks += 1;
            return false;
        }
        let record = observation.record.record;
        self.entries.insert(
            id,
            ObservedEntry {
                id,
                fingerprint: record.payload.fingerprint(),
                key: record.key().to_string(),
                delivered_to: observation.delivered_to,
                acked_by: observation.acked_by,
                attempt: observation.attempt,
            },
        );
        self.order.push(id);
        true
    }

    /// Merges another model into this one.
    pub fn merge(&mut self, mut other: Self) {
        self.duplicate_acks += other.duplicate_acks;
        for id in other.order {
            if let Some(entry) = other.entries.remove(&id) {
                if self.entries.contains_key(&id) {
                    self.duplicate_acks += 1;
                } else {
                    self.entries.insert(id, entry);
                    self.order.push(id);
                }
            }
        }
    }

    /// Returns the number of distinct records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `id` was consumed.
    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns the entry for `id`.
    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&ObservedEntry> {
        self.entries.get(&id)
    }

    /// Returns the entries in acknowledgment order.
    pub fn entries(&self) -> impl Iterator<Item = &ObservedEntry> + '_ {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Returns the consumed identifiers.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<RecordId> {
        self.entries.keys().copied().collect()
    }

    /// Returns payload fingerprints in acknowledgment order.
    #[must_use]
    pub fn fingerprints(&self) -> Vec<String> {
        self.entries().map(|e| e.fingerprint.clone()).collect()
    }

    /// Returns consumed identifiers grouped by the member they were delivered to.
    #[must_use]
    pub fn by_member(&self) -> BTreeMap<String, BTreeSet<RecordId>> {
        let mut members: BTreeMap<String, BTreeSet<RecordId>> = BTreeMap::new();
        for entry in self.entries.values() {
            members
                .entry(entry.delivered_to.clone())
                .or_default()
                .insert(entry.id);
        }
        members
    }

    /// Returns, per member, how many records it consumed.
    #[must_use]
    pub fn member_counts(&self) -> BTreeMap<String, usize> {
        self.by_member()
            .into_iter()
            .map(|(member, ids)| (member, ids.len()))
            .collect()
    }

    /// Returns, per ordering key, the members its records were delivered to.
    #[must_use]
    pub fn key_owners(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut owners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for entry in self.entries.values() {
            owners
                .entry(entry.key.clone())
                .or_default()
                .insert(entry.delivered_to.clone());
        }
        owners
    }

    /// Returns identifiers of first-attempt deliveries grouped by ordering
    /// key, each in acknowledgment order.
    ///
    /// Redelivered records are left out: a redelivery legitimately arrives
    /// after records written later.
    #[must_use]
    pub fn first_attempts_by_key(&self) -> BTreeMap<String, Vec<RecordId>> {
        let mut keys: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
        for entry in self.entries().filter(|e| e.attempt <= 1) {
            keys.entry(entry.key.clone()).or_default().push(entry.id);
        }
        keys
    }

    /// Returns how many acknowledgments arrived for records already present.
    #[must_use]
    pub const fn duplicate_acks(&self) -> usize {
        self.duplicate_acks
    }

    /// Returns the highest acknowledged delivery attempt.
    #[must_use]
    pub fn max_attempt(&self) -> u32 {
        self.entries.values().map(|e| e.attempt).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(batch: u64, key: &str, member: &str, attempt: u32) -> Observation {
        Observation {
            record: ReceivedRecord {
                id: RecordId::new(batch, 0),
                record: Record::raw(vec![u8::try_from(batch % 256).unwrap()]).with_key(key),
            },
            attempt,
            delivered_to: member.to_string(),
            acked_by: member.to_string(),
        }
    }

    #[test]
    fn test_observed_model_counts_presence_not_deliveries() {
        let mut model = ObservedModel::new();
        assert!(model.record(observation(1, "k", "c1", 1)));
        assert!(!model.record(observation(1, "k", "c2", 2)));
        assert!(model.record(observation(2, "k", "c1", 1)));

        assert_eq!(model.len(), 2);
        assert_eq!(model.duplicate_acks(), 1);
        assert_eq!(model.get(RecordId::new(1, 0)).unwrap().delivered_to, "c1");
    }

    #[test]
    fn test_observed_model_views() {
        let mut model = ObservedModel::new();
        model.record(observation(1, "a", "c1", 1));
        model.record(observation(3, "b", "c2", 1));
        model.record(observation(2, "a", "c1", 2));

        assert_eq!(model.member_counts().get("c1"), Some(&2));
        assert_eq!(model.key_owners()["a"].len(), 1);
        assert_eq!(
            model.first_attempts_by_key()["a"],
            vec![RecordId::new(1, 0)]
        );
        assert_eq!(model.max_attempt(), 2);
    }

    #[test]
    fn test_merge_deduplicates() {
        let mut left = ObservedModel::new();
        left.record(observation(1, "a", "c1", 1));
        let mut right = ObservedModel::new();
        right.record(observation(1, "a", "c2", 1));
        right.record(observation(2, "a", "c2", 1));

        left.merge(right);
        assert_eq!(left.len(), 2);
        assert_eq!(left.duplicate_acks(), 1);
    }

    #[test]
    fn test_expected_model_by_writer_and_key() {
        let mut model = ExpectedModel::new();
        model.push(RecordId::new(1, 0), &Record::raw(vec![1]).with_key("a"));
        model.push(RecordId::new(1, 1), &Record::raw(vec![2]));
        model.push(RecordId::new(2, 0), &Record::raw(vec![3]).with_key("a"));
        model.push_from(1, RecordId::new(0, 5), &Record::raw(vec![4]).with_key("a"));

        let keys = model.by_writer_and_key();
        assert_eq!(
            keys[&(0, "a".to_string())],
            vec![RecordId::new(1, 0), RecordId::new(2, 0)]
        );
        assert_eq!(keys[&(1, "a".to_string())], vec![RecordId::new(0, 5)]);
        let default_key = (0, rill_client::DEFAULT_ORDERING_KEY.to_string());
        assert_eq!(keys[&default_key].len(), 1);
        assert_eq!(model.total_bytes(), 4);
    }
}
