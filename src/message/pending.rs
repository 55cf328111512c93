use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::ids::SysMessageId;
use crate::message::{MAX_PRIORITY, OrderSequence, PacketReference};

/// `(band, sequence)`. Band 0 holds messages explicitly put at the front; a
/// message of priority `p` lives in band `1 + (9 - p)`.
type Key = (u8, u64);

fn band(priority: u8) -> u8 {
    1 + (MAX_PRIORITY - priority.min(MAX_PRIORITY))
}

/// Ordered set of message references: highest priority first, FIFO inside a
/// priority, with a front band for redelivered batches.
#[derive(Debug)]
pub struct PendingList {
    entries: BTreeMap<Key, Arc<PacketReference>>,
    index: HashMap<SysMessageId, Key>,
    sequence: Arc<OrderSequence>,
    front: u64,
}

impl Default for PendingList {
    fn default() -> Self {
        Self::new(Arc::new(OrderSequence::new()))
    }
}

impl PendingList {
    pub fn new(sequence: Arc<OrderSequence>) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            sequence,
            front: u64::MAX,
        }
    }

    fn insert(&mut self, key: Key, reference: Arc<PacketReference>) {
        if let Some(old) = self.index.insert(reference.id(), key) {
            self.entries.remove(&old);
        }
        self.entries.insert(key, reference);
    }

    /// Append behind everything of the same priority.
    pub fn add(&mut self, reference: Arc<PacketReference>) {
        let key = (band(reference.priority()), self.sequence.next());
        self.insert(key, reference);
    }

    /// Insert at the message's original arrival position in its priority.
    pub fn add_ordered(&mut self, reference: Arc<PacketReference>) {
        let key = (band(reference.priority()), reference.order());
        self.insert(key, reference);
    }

    pub fn add_all_ordered(&mut self, references: impl IntoIterator<Item = Arc<PacketReference>>) {
        for reference in references {
            self.add_ordered(reference);
        }
    }

    /// Put `references` ahead of everything, keeping their given order.
    pub fn add_all_to_front(&mut self, references: Vec<Arc<PacketReference>>) {
        let start = self.front.saturating_sub(references.len() as u64);
        for (offset, reference) in references.into_iter().enumerate() {
            self.insert((0, start + offset as u64), reference);
        }
        self.front = start;
    }

    pub fn pop_front(&mut self) -> Option<Arc<PacketReference>> {
        let (_, reference) = self.entries.pop_first()?;
        self.index.remove(&reference.id());
        Some(reference)
    }

    /// Pop up to `count` references from the front.
    pub fn take(&mut self, count: usize) -> Vec<Arc<PacketReference>> {
        let mut taken = Vec::with_capacity(count.min(self.entries.len()));
        while taken.len() < count {
            match self.pop_front() {
                Some(reference) => taken.push(reference),
                None => break,
            }
        }
        taken
    }

    pub fn remove(&mut self, id: SysMessageId) -> Option<Arc<PacketReference>> {
        let key = self.index.remove(&id)?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, id: SysMessageId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PacketReference>> {
        self.entries.values()
    }

    pub fn drain(&mut self) -> Vec<Arc<PacketReference>> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Arc<PacketReference>) -> bool) {
        let index = &mut self.index;
        self.entries.retain(|_, reference| {
            let kept = keep(reference);
            if !kept {
                index.remove(&reference.id());
            }
            kept
        });
    }
}

/// A `PendingList` shared between a destination (or subscription) and the
/// consumers pulling from it.
#[derive(Debug)]
pub struct SharedPending {
    list: Mutex<PendingList>,
}

impl SharedPending {
    pub fn new(sequence: Arc<OrderSequence>) -> Self {
        Self {
            list: Mutex::new(PendingList::new(sequence)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PendingList> {
        self.list.lock()
    }

    pub fn add(&self, reference: Arc<PacketReference>) {
        self.list.lock().add(reference);
    }

    pub fn add_ordered(&self, reference: Arc<PacketReference>) {
        self.list.lock().add_ordered(reference);
    }

    pub fn add_all_ordered(&self, references: impl IntoIterator<Item = Arc<PacketReference>>) {
        self.list.lock().add_all_ordered(references);
    }

    pub fn add_all_to_front(&self, references: Vec<Arc<PacketReference>>) {
        self.list.lock().add_all_to_front(references);
    }

    pub fn take(&self, count: usize) -> Vec<Arc<PacketReference>> {
        self.list.lock().take(count)
    }

    pub fn remove(&self, id: SysMessageId) -> Option<Arc<PacketReference>> {
        self.list.lock().remove(id)
    }

    pub fn contains(&self, id: SysMessageId) -> bool {
        self.list.lock().contains(id)
    }

    pub fn drain(&self) -> Vec<Arc<PacketReference>> {
        self.list.lock().drain()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Message ids in delivery order.
    pub fn ids(&self) -> Vec<SysMessageId> {
        self.list.lock().iter().map(|r| r.id()).collect()
    }
}
