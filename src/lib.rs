//! # brokercore
//!
//! `brokercore` is the in-memory routing and delivery core of a JMS-style
//! message broker: destinations (queues and topics), consumers and
//! subscriptions, sessions with their acknowledgment and transaction
//! handling, and delayed delivery. Wire protocols, connections and
//! clustering transports sit outside; the core talks to them through the
//! `Store` and `ClusterBroadcast` traits.
//!
//! ## Core Modules
//!
//! - `broker`: the `Broker` entry point and the `BrokerContext` registry it owns.
//! - `destination`: queue and topic routing, limits, expiration and dead letters.
//! - `consumer`: per-consumer delivery buffers and durable/shared subscriptions.
//! - `session`: round-robin delivery across a session's consumers and the
//!   pending-acknowledgment table.
//! - `transaction`: transaction states, transacted produce and consume.
//! - `delay`: the delivery-delay timer.
//! - `message`: packets, stored-message references and pending lists.
//! - `selector`: message selector parsing and evaluation.
//! - `ids`: identifiers, including wildcard destination names.
//! - `persistence`: the storage interface, with in-memory and sled stores.
//! - `cluster`: the cluster broadcast interface and its standalone version.
//! - `monitor`: metric snapshots published on `mq.metrics.*` topics.
//! - `config`: settings loading and change notification.
//! - `utils`: shared error type, logging setup and clock.

pub mod broker;
pub mod cluster;
pub mod config;
pub mod consumer;
pub mod delay;
pub mod destination;
pub mod ids;
pub mod message;
pub mod monitor;
pub mod persistence;
pub mod selector;
pub mod session;
pub mod transaction;
pub mod utils;

pub use broker::{Broker, BrokerContext, PublishReceipt};
pub use utils::{BrokerError, Result};

#[cfg(test)]
mod tests;
