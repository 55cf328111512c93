use std::path::Path;

use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::ids::{ConsumerUid, SysMessageId};
use crate::message::Packet;
use crate::persistence::{RemoveReason, Store, StoredMessage};
use crate::utils::Result;

const MESSAGES_TREE: &str = "messages";

/// Persistent store backed by an embedded `sled` database.
///
/// Messages live in one tree keyed by `SysMessageId::to_key`, so iteration
/// yields them in id order. Values are JSON-encoded `StoredMessage`s.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    messages: Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let messages = db.open_tree(MESSAGES_TREE)?;
        Ok(Self { db, messages })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn update(
        &self,
        id: SysMessageId,
        mut change: impl FnMut(&mut StoredMessage),
    ) -> Result<Option<StoredMessage>> {
        let mut result = None;
        self.messages.update_and_fetch(id.to_key(), |old| {
            let bytes = old?;
            let mut stored: StoredMessage = match serde_json::from_slice(bytes) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(%id, error = %e, "unreadable stored message left untouched");
                    return Some(bytes.to_vec());
                }
            };
            change(&mut stored);
            let encoded = serde_json::to_vec(&stored).ok();
            result = Some(stored);
            encoded.or_else(|| Some(bytes.to_vec()))
        })?;
        Ok(result)
    }
}

impl Store for SledStore {
    fn store_message(&self, packet: &Packet, consumers: &[ConsumerUid]) -> Result<()> {
        let stored = StoredMessage::new(packet, consumers);
        let serialized = serde_json::to_vec(&stored)?;
        self.messages.insert(packet.id.to_key(), serialized)?;
        Ok(())
    }

    fn get_message(&self, id: SysMessageId) -> Result<Option<StoredMessage>> {
        match self.messages.get(id.to_key())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn acknowledged(
        &self,
        id: SysMessageId,
        consumer: ConsumerUid,
        stored: ConsumerUid,
        sync: bool,
        _local: bool,
    ) -> Result<bool> {
        let mut complete = false;
        self.update(id, |message| complete = message.acknowledge(stored))?;
        if sync {
            self.messages.flush()?;
        }
        debug!(%id, %consumer, %stored, complete, "ack persisted");
        Ok(complete)
    }

    fn remove_message(&self, id: SysMessageId, reason: RemoveReason) -> Result<bool> {
        let removed = self.messages.remove(id.to_key())?.is_some();
        if removed {
            debug!(%id, %reason, "message removed from sled store");
        }
        Ok(removed)
    }

    fn messages(&self) -> Result<Vec<StoredMessage>> {
        let mut all = Vec::new();
        for entry in self.messages.iter() {
            let (_, bytes) = entry?;
            match serde_json::from_slice::<StoredMessage>(&bytes) {
                Ok(stored) => all.push(stored),
                Err(e) => warn!(error = %e, "skipping unreadable stored message"),
            }
        }
        Ok(all)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.messages.len())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("messages", &self.messages.len())
            .finish()
    }
}
