//! Rill Workload: produce, consume, verify.
//!
//! The three halves of every test case against a broker:
//!
//! 1. **Workload generation** - write a deterministic set of records with a
//!    chosen [`Discipline`] and get back the [`ExpectedModel`]
//! 2. **Consumption** - attach members to a subscription through the
//!    [`Oracle`], apply an [`AckPolicy`] to every delivery, and collect the
//!    [`ObservedModel`] of permanently acknowledged records
//! 3. **Verification** - compare the two under a [`Guarantee`] and get a
//!    [`Verdict`] with counts and a sample of the difference
//!
//! # Example
//!
//! ```ignore
//! use rill_workload::{Guarantee, Oracle, ConsumerSpec, StopCondition, Workload, verify};
//!
//! let workload = Workload::builder().count(1000).seed(7).build()?;
//! let expected = workload.produce(client.clone(), "orders").await?;
//!
//! let report = Oracle::new(client)
//!     .consume(ConsumerSpec::new("orders-sub", "c1"), StopCondition::Count(expected.len()))
//!     .await?;
//!
//! verify(&expected, &report.require_complete()?, Guarantee::InOrder).into_result()?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod checks;
mod error;
mod generator;
mod model;
mod oracle;
mod payload;
mod verification;

pub use checks::Checks;
pub use error::{Result, WorkloadError};
pub use generator::{
    Discipline, KeyAssignment, ProduceStats, Production, Workload, WorkloadBuilder,
    WorkloadConfig, WriteFailure, DEFAULT_WRITE_TIMEOUT,
};
pub use model::{ExpectedEntry, ExpectedModel, Observation, ObservedEntry, ObservedModel};
pub use oracle::{
    AckPolicy, ConsumerHandle, ConsumerReport, ConsumerSpec, MemberStats, ModelPredicate, Oracle,
    PendingDelivery, PendingPool, StopCondition, DEFAULT_CONSUME_TIMEOUT,
    DEFAULT_RELEASE_INTERVAL,
};
pub use payload::{PayloadGenerator, PayloadShape, DEFAULT_RAW_SIZE};
pub use verification::{verify, verify_disjoint, Guarantee, Verdict, Violation, SAMPLE_SIZE};
