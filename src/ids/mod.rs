//! Opaque identifiers used for every lookup in the routing core.
//!
//! Consumer, session, connection and transaction ids are `u64` newtypes handed
//! out by a process-wide counter. Message ids (`SysMessageId`) are ordered by
//! creation timestamp and then by a per-broker sequence, which gives a global
//! order for messages produced on one broker.

mod destination_uid;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use destination_uid::{DestinationType, DestinationUid, UidInterner, wildcard_regex};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

macro_rules! uid_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Allocate a fresh id.
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(next_uid())
            }

            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }
    };
}

uid_type!(
    /// Identifies a consumer, or the stored identity a consumer acknowledges
    /// under (a subscription, or the shared queue identity).
    ConsumerUid
);
uid_type!(SessionUid);
uid_type!(ConnectionUid);
uid_type!(TransactionUid);

impl ConsumerUid {
    /// Stored consumer identity shared by every consumer of a queue.
    ///
    /// Queue messages carry a single interest entry under this id, which is
    /// what makes in-delivery marking exclusive across queue consumers.
    pub const QUEUE: ConsumerUid = ConsumerUid(0);

    pub fn is_queue(&self) -> bool {
        *self == Self::QUEUE
    }
}

/// System message id: creation time in epoch milliseconds plus a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SysMessageId {
    timestamp: i64,
    sequence: u64,
}

impl SysMessageId {
    pub const fn new(timestamp: i64, sequence: u64) -> Self {
        Self {
            timestamp,
            sequence,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Big-endian key that sorts the same way the id does.
    pub fn to_key(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&(self.timestamp as u64 ^ (1 << 63)).to_be_bytes());
        key[8..].copy_from_slice(&self.sequence.to_be_bytes());
        key
    }
}

impl fmt::Display for SysMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID:{}-{}", self.timestamp, self.sequence)
    }
}

/// Hands out `SysMessageId`s; owned by the broker context.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    sequence: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SysMessageId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        SysMessageId::new(Utc::now().timestamp_millis(), sequence)
    }
}
