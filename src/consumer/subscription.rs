use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::consumer::Consumer;
use crate::ids::ConsumerUid;
use crate::utils::{BrokerError, Result};

/// Name of a topic subscription, scoped by client id when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionKey {
    pub client_id: Option<String>,
    pub name: String,
}

impl SubscriptionKey {
    pub fn new(client_id: Option<&str>, name: &str) -> Self {
        Self {
            client_id: client_id.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Stored consumer id for this subscription.
    ///
    /// Derived from the key (FNV-1a, top bit set) so that persisted interest
    /// entries still match after a restart and never collide with counter ids.
    pub fn stored_uid(&self) -> ConsumerUid {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        let client = self.client_id.as_deref().unwrap_or("");
        for byte in client.bytes().chain([0u8]).chain(self.name.bytes()) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
        ConsumerUid::from_raw(hash | (1 << 63))
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.client_id {
            Some(client) => write!(f, "{client}:{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Subscription side of a consumer record: the record's private list is the
/// parent list of every child consumer attached to it.
pub struct Subscription {
    key: SubscriptionKey,
    durable: bool,
    shared: bool,
    children: Mutex<Vec<Arc<Consumer>>>,
}

impl Subscription {
    pub fn new(key: SubscriptionKey, durable: bool, shared: bool) -> Self {
        Self {
            key,
            durable,
            shared,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Attach a consumer. A non-shared subscription takes one child at a time.
    pub fn attach(&self, child: Arc<Consumer>) -> Result<()> {
        let mut children = self.children.lock();
        if !self.shared && !children.is_empty() {
            return Err(BrokerError::SubscriptionInUse(self.key.to_string()));
        }
        children.push(child);
        Ok(())
    }

    /// Detach a child; returns how many remain.
    pub fn detach(&self, child: ConsumerUid) -> usize {
        let mut children = self.children.lock();
        children.retain(|c| c.uid() != child);
        children.len()
    }

    pub fn children(&self) -> Vec<Arc<Consumer>> {
        self.children.lock().clone()
    }

    pub fn has_children(&self) -> bool {
        !self.children.lock().is_empty()
    }

    pub(crate) fn signal_children(&self) {
        for child in self.children.lock().iter() {
            child.signal();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("durable", &self.durable)
            .field("shared", &self.shared)
            .field("children", &self.children.lock().len())
            .finish()
    }
}
