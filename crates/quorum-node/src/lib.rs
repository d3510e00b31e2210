//! # quorum-node
//!
//! the three long-running roles of the quorum task network and the adapters
//! they run on:
//!
//! - [`monitor`]: heartbeat rounds that keep the [`registry`] of live
//!   participants fresh
//! - [`publisher`]: samples a quorum, hides it in a bloom filter and
//!   broadcasts the signed task
//! - [`aggregator`]: verifies who answered, enforces the quorum and picks the
//!   response the quorum agrees with most
//!
//! roles never talk to each other directly. they share the work [`queue`],
//! the [`store`] and the gossip [`transport`], each behind a trait with a
//! production and an in-memory implementation.

pub mod aggregator;
pub mod config;
pub mod consensus;
pub mod embedding;
pub mod error;
pub mod message;
pub mod monitor;
pub mod participant;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod store;
pub mod task;
pub mod topic;
pub mod transport;
pub mod worker;

pub use aggregator::{AggregateOutcome, Aggregator};
pub use config::{Config, MembershipGate};
pub use error::{NodeError, Result};
pub use monitor::{Monitor, RoundOutcome};
pub use participant::{Compute, Participant};
pub use publisher::{PublishOutcome, Publisher};
pub use task::{TaskRecord, TaskStatus};
pub use worker::{shutdown_channel, Shutdown, ShutdownHandle};
