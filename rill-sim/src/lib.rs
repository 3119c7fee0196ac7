//! Rill Sim - an in-process reference broker.
//!
//! `rill-sim` implements [`rill_client::BrokerClient`] without any external
//! process, so the harness can be exercised end to end inside `cargo test`.
//! Several simulated nodes share one state: a stream created through node A
//! is visible through node B, and two nodes racing to create the same
//! stream see exactly one success.
//!
//! ## Delivery model
//!
//! - Every append gets the next broker-wide batch id; records inside it are
//!   numbered from zero.
//! - A subscription dispatches records in stream order. Each ordering key is
//!   owned by one attached member at a time, assigned round-robin on first
//!   sight and kept while that member stays attached.
//! - A delivery stays outstanding until acked. Nack, ack-timeout expiry and
//!   member detach all put it back on the redelivery queue, which is served
//!   before new records.
//! - Each member holds at most `Limits::max_outstanding_per_consumer`
//!   unacknowledged deliveries. While a member is full, records of the keys
//!   it owns are held back in order and other keys keep flowing.
//!
//! This is a model for testing the harness, not a broker implementation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod dispatch;
mod state;

pub use broker::{SimBroker, SimClient, SimConfig, SubscriptionStats};
