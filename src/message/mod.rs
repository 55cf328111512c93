//! The `message` module holds the message representation and the structures
//! that track a stored message while it moves through the broker.
//!
//! - `Packet`: headers, properties and body of one message.
//! - `PacketReference`: the shared handle to a stored message with its
//!   per-consumer delivery and acknowledgment state.
//! - `RefTable`: generation-counted arena of live references. Pending-ack
//!   entries hold a `RefHandle` into it and detect removed messages
//!   deterministically.
//! - `PendingList`: the priority-major, FIFO-minor ordered set used by
//!   destinations, subscriptions and consumers.
//! - `ExpirationInfo`: `(time, id)` records for expiration reaping.

mod packet;
mod pending;
mod reference;
mod table;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ids::SysMessageId;

pub use packet::{DEFAULT_PRIORITY, MAX_PRIORITY, Packet, PropertyValue};
pub use pending::{PendingList, SharedPending};
pub use reference::{AckState, DeliveredOutcome, PacketReference};
pub use table::{RefHandle, RefTable};

/// Source of the arrival-order keys used to keep FIFO order inside a priority.
#[derive(Debug)]
pub struct OrderSequence(AtomicU64);

impl OrderSequence {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve `count` consecutive keys and return the first.
    pub fn reserve(&self, count: u64) -> u64 {
        self.0.fetch_add(count, Ordering::Relaxed)
    }
}

impl Default for OrderSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Expiration record, ordered by expiration time and then by message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpirationInfo {
    pub expiration: i64,
    pub id: SysMessageId,
}

impl ExpirationInfo {
    pub fn new(expiration: i64, id: SysMessageId) -> Self {
        Self { expiration, id }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration <= now
    }
}

#[cfg(test)]
mod tests;
