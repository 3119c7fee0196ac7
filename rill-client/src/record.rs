//! Record, identifier, and resource descriptions.
//!
//! # Record identifiers
//!
//! A [`RecordId`] is assigned by the broker when an append is acknowledged.
//! It is a `(batch_id, index)` pair: `batch_id` identifies the append call,
//! `index` the record's position inside it. Identifiers compare
//! lexicographically, and for a fixed ordering key they must strictly
//! increase in write order. The harness verifies that property rather than
//! assuming it.
//!
//! # Payloads
//!
//! Payloads are either raw bytes or structured key-value objects. Each
//! payload has a canonical [`Payload::fingerprint`] so multisets of produced
//! and consumed payloads can be compared without caring about the shape.

use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClientError;

/// Ordering key assigned to records that do not carry one.
pub const DEFAULT_ORDERING_KEY: &str = "__default__";

/// The body of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Opaque bytes.
    Raw(Bytes),
    /// A structured key-value object.
    Structured(Map<String, Value>),
}

impl Payload {
    /// Creates a raw payload.
    #[must_use]
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self::Raw(bytes.into())
    }

    /// Creates a structured payload.
    #[must_use]
    pub const fn structured(fields: Map<String, Value>) -> Self {
        Self::Structured(fields)
    }

    /// Returns the payload size in bytes as the broker accounts for it.
    ///
    /// Structured payloads are measured by their JSON encoding.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Raw(bytes) => bytes.len(),
            Self::Structured(fields) => serde_json::to_vec(fields).map_or(0, |v| v.len()),
        }
    }

    /// Returns a canonical textual representation of the payload.
    ///
    /// Two payloads have the same fingerprint exactly when they are equal.
    /// Structured fields are ordered by key, so insertion order is ignored.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Raw(bytes) => {
                let mut out = String::with_capacity(4 + bytes.len() * 2);
                out.push_str("raw:");
                for byte in bytes {
                    let _ = write!(out, "{byte:02x}");
                }
                out
            }
            Self::Structured(fields) => {
                format!("json:{}", Value::Object(fields.clone()))
            }
        }
    }

    /// Returns the raw bytes, if this is a raw payload.
    #[must_use]
    pub const fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Self::Raw(bytes) => Some(bytes),
            Self::Structured(_) => None,
        }
    }

    /// Returns the structured fields, if this is a structured payload.
    #[must_use]
    pub const fn as_structured(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Raw(_) => None,
            Self::Structured(fields) => Some(fields),
        }
    }
}

/// A record to be written to a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The record body.
    pub payload: Payload,
    /// Optional ordering key.
    pub ordering_key: Option<String>,
}

impl Record {
    /// Creates an un-keyed record with a raw payload.
    #[must_use]
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self {
            payload: Payload::raw(bytes),
            ordering_key: None,
        }
    }

    /// Creates an un-keyed record with a structured payload.
    #[must_use]
    pub const fn structured(fields: Map<String, Value>) -> Self {
        Self {
            payload: Payload::Structured(fields),
            ordering_key: None,
        }
    }

    /// Sets the ordering key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// Returns the effective ordering key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.ordering_key.as_deref().unwrap_or(DEFAULT_ORDERING_KEY)
    }

    /// Returns the payload size used for size limits and byte-based batching.
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.encoded_len()
    }
}

/// Broker-assigned record identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RecordId {
    /// Identifier of the append call that wrote the record.
    pub batch_id: u64,
    /// Position of the record inside its append call.
    pub index: u32,
}

impl RecordId {
    /// Creates a record identifier.
    #[must_use]
    pub const fn new(batch_id: u64, index: u32) -> Self {
        Self { batch_id, index }
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rid({}-{})", self.batch_id, self.index)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.batch_id, self.index)
    }
}

impl FromStr for RecordId {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidArgument {
            name: "record_id",
            reason: format!("expected '<batch>-<index>', got '{s}'"),
        };
        let (batch, index) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            batch_id: batch.parse().map_err(|_| invalid())?,
            index: index.parse().map_err(|_| invalid())?,
        })
    }
}

/// A record as delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedRecord {
    /// Identifier assigned when the record was written.
    pub id: RecordId,
    /// The record itself.
    pub record: Record,
}

/// Description of a stream as returned by listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
}

/// A subscription: a durable cursor over one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: String,
    /// Stream the subscription reads.
    pub stream: String,
    /// How long a delivery may stay unacknowledged before redelivery.
    pub ack_timeout: Duration,
}

impl Subscription {
    /// Creates a subscription description.
    #[must_use]
    pub fn new(id: impl Into<String>, stream: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            id: id.into(),
            stream: stream.into(),
            ack_timeout,
        }
    }
}
