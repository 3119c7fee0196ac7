//! Rill Client - the broker contract as seen by the verification harness.
//!
//! The harness never speaks a wire protocol itself. Everything it needs from a
//! broker is expressed here as plain Rust types and one object-safe trait:
//!
//! - [`BrokerClient`]: stream and subscription administration, appends, and
//!   subscriptions that push [`Delivery`] values to a named consumer
//! - [`Producer`]: one append per record, resolved before the call returns
//! - [`BufferedProducer`]: batching writer that flushes on a record-count,
//!   age, or byte-size trigger, whichever trips first
//! - [`Responder`]: the single-use acknowledgment handle of a delivery
//!
//! A broker transport (or the in-process reference broker in `rill-sim`)
//! implements [`BrokerClient`]; the workload and oracle crates only ever see
//! [`SharedClient`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod buffered;
mod client;
mod error;
mod limits;
mod producer;
mod record;

pub use buffered::{
    BatchSetting, BatchSettingBuilder, BufferedProducer, ProducerStats, WriteHandle,
};
pub use client::{
    AckSink, BrokerClient, ClientFactory, Delivery, Responder, SharedClient, Subscriber,
};
pub use error::{ClientError, Resource, Result};
pub use limits::Limits;
pub use producer::Producer;
pub use record::{
    Payload, ReceivedRecord, Record, RecordId, StreamInfo, Subscription, DEFAULT_ORDERING_KEY,
};
