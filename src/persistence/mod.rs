//! The `persistence` module is the storage hand-off for the routing core.
//!
//! The core only needs a narrow interface: store a message with its
//! interest list, look it up, record per-consumer acknowledgments and remove
//! it. Two implementations are provided:
//!
//! - `MemoryStore`, used when no store path is configured and in tests,
//! - `SledStore`, which keeps persistent messages in an embedded `sled`
//!   database so they can be recovered after a restart.
//!
//! Implementations must be safe to call from many threads and must remove a
//! message physically at most once, even when acknowledgment and expiration
//! race on the same id.

mod memory;
mod sled_store;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ConsumerUid, SysMessageId};
use crate::message::Packet;
use crate::utils::Result;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// Why a message left its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveReason {
    Acknowledged,
    Expired,
    Purged,
    RemovedOldest,
    RemovedLowPriority,
    Undeliverable,
    RolledBack,
    NoInterest,
    Overridden,
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RemoveReason::Acknowledged => "acknowledged",
            RemoveReason::Expired => "expired",
            RemoveReason::Purged => "purged",
            RemoveReason::RemovedOldest => "removed oldest",
            RemoveReason::RemovedLowPriority => "removed low priority",
            RemoveReason::Undeliverable => "undeliverable",
            RemoveReason::RolledBack => "rolled back",
            RemoveReason::NoInterest => "no interest",
            RemoveReason::Overridden => "overridden",
        };
        f.write_str(text)
    }
}

/// A persisted message and the acknowledgment state of each stored consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub packet: Packet,
    pub interests: BTreeMap<ConsumerUid, bool>,
}

impl StoredMessage {
    pub fn new(packet: &Packet, consumers: &[ConsumerUid]) -> Self {
        Self {
            packet: packet.clone(),
            interests: consumers.iter().map(|c| (*c, false)).collect(),
        }
    }

    pub fn unacked(&self) -> Vec<ConsumerUid> {
        self.interests
            .iter()
            .filter(|(_, acked)| !**acked)
            .map(|(uid, _)| *uid)
            .collect()
    }

    fn acknowledge(&mut self, stored: ConsumerUid) -> bool {
        if let Some(acked) = self.interests.get_mut(&stored) {
            *acked = true;
        }
        self.interests.values().all(|acked| *acked)
    }
}

pub trait Store: Send + Sync + fmt::Debug {
    /// Persist `packet` with the stored consumers interested in it.
    fn store_message(&self, packet: &Packet, consumers: &[ConsumerUid]) -> Result<()>;

    fn get_message(&self, id: SysMessageId) -> Result<Option<StoredMessage>>;

    /// Record that `consumer` acknowledged the message on behalf of `stored`.
    ///
    /// Returns `true` once every interest has been acknowledged.
    fn acknowledged(
        &self,
        id: SysMessageId,
        consumer: ConsumerUid,
        stored: ConsumerUid,
        sync: bool,
        local: bool,
    ) -> Result<bool>;

    /// Remove the message. Returns `true` only for the call that removed it.
    fn remove_message(&self, id: SysMessageId, reason: RemoveReason) -> Result<bool>;

    /// Every stored message in id order, for recovery.
    fn messages(&self) -> Result<Vec<StoredMessage>>;

    fn len(&self) -> Result<usize>;
}
