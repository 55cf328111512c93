use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::ids::{ConsumerUid, SysMessageId};
use crate::message::Packet;
use crate::persistence::{RemoveReason, Store, StoredMessage};
use crate::utils::Result;

/// Store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<BTreeMap<SysMessageId, StoredMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn store_message(&self, packet: &Packet, consumers: &[ConsumerUid]) -> Result<()> {
        self.messages
            .lock()
            .insert(packet.id, StoredMessage::new(packet, consumers));
        Ok(())
    }

    fn get_message(&self, id: SysMessageId) -> Result<Option<StoredMessage>> {
        Ok(self.messages.lock().get(&id).cloned())
    }

    fn acknowledged(
        &self,
        id: SysMessageId,
        consumer: ConsumerUid,
        stored: ConsumerUid,
        _sync: bool,
        _local: bool,
    ) -> Result<bool> {
        let mut messages = self.messages.lock();
        let Some(message) = messages.get_mut(&id) else {
            return Ok(false);
        };
        trace!(%id, %consumer, %stored, "ack recorded");
        Ok(message.acknowledge(stored))
    }

    fn remove_message(&self, id: SysMessageId, reason: RemoveReason) -> Result<bool> {
        let removed = self.messages.lock().remove(&id).is_some();
        if removed {
            trace!(%id, %reason, "message removed from memory store");
        }
        Ok(removed)
    }

    fn messages(&self) -> Result<Vec<StoredMessage>> {
        Ok(self.messages.lock().values().cloned().collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.messages.lock().len())
    }
}
