use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::ids::{DestinationUid, SysMessageId};
use crate::message::Packet;
use crate::persistence::RemoveReason;

/// Entries kept before the oldest dead letter is dropped.
pub const DEAD_LETTER_CAPACITY: usize = 10_000;

/// A message removed as dead, with why and when.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: SysMessageId,
    pub destination: DestinationUid,
    pub reason: RemoveReason,
    pub at: i64,
    #[serde(skip)]
    pub packet: Arc<Packet>,
}

/// Bounded sink for dead messages.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::with_capacity(DEAD_LETTER_CAPACITY)
    }
}

impl DeadLetterQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, letter: DeadLetter) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: SysMessageId) -> bool {
        self.entries.lock().iter().any(|l| l.id == id)
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn drain(&self) -> Vec<DeadLetter> {
        self.entries.lock().drain(..).collect()
    }
}
