use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use slab::Slab;

use crate::ids::SysMessageId;
use crate::message::PacketReference;

/// Index plus generation of a slot in the `RefTable`.
///
/// A handle outlives the reference it names: once the slot is released (and
/// possibly reused) lookups through the old handle return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RefHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slots {
    live: Slab<Arc<PacketReference>>,
    generations: Vec<u32>,
    by_id: HashMap<SysMessageId, RefHandle>,
}

/// Arena of every live `PacketReference` on the broker.
#[derive(Debug, Default)]
pub struct RefTable {
    slots: RwLock<Slots>,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `reference` and stamp its handle on it.
    ///
    /// A live reference with the same message id is released first and
    /// returned.
    pub fn insert(&self, reference: &Arc<PacketReference>) -> (RefHandle, Option<Arc<PacketReference>>) {
        let mut slots = self.slots.write();
        let replaced = match slots.by_id.get(&reference.id()).copied() {
            Some(old) => Self::release(&mut slots, old),
            None => None,
        };

        let index = slots.live.vacant_key();
        if index >= slots.generations.len() {
            slots.generations.resize(index + 1, 0);
        }
        let handle = RefHandle {
            index: index as u32,
            generation: slots.generations[index],
        };
        slots.live.insert(Arc::clone(reference));
        slots.by_id.insert(reference.id(), handle);
        reference.set_handle(handle);
        (handle, replaced)
    }

    pub fn get(&self, handle: RefHandle) -> Option<Arc<PacketReference>> {
        let slots = self.slots.read();
        let index = handle.index as usize;
        if slots.generations.get(index) != Some(&handle.generation) {
            return None;
        }
        slots.live.get(index).cloned()
    }

    pub fn get_by_id(&self, id: SysMessageId) -> Option<Arc<PacketReference>> {
        let slots = self.slots.read();
        let handle = slots.by_id.get(&id)?;
        slots.live.get(handle.index as usize).cloned()
    }

    /// Release the slot behind `handle`; stale handles are ignored.
    pub fn remove(&self, handle: RefHandle) -> Option<Arc<PacketReference>> {
        Self::release(&mut self.slots.write(), handle)
    }

    fn release(slots: &mut Slots, handle: RefHandle) -> Option<Arc<PacketReference>> {
        let index = handle.index as usize;
        if slots.generations.get(index) != Some(&handle.generation) {
            return None;
        }
        let reference = slots.live.try_remove(index)?;
        slots.generations[index] = slots.generations[index].wrapping_add(1);
        if slots.by_id.get(&reference.id()) == Some(&handle) {
            slots.by_id.remove(&reference.id());
        }
        Some(reference)
    }

    pub fn len(&self) -> usize {
        self.slots.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut slots = self.slots.write();
        let indices: Vec<usize> = slots.live.iter().map(|(i, _)| i).collect();
        for index in indices {
            slots.live.remove(index);
            slots.generations[index] = slots.generations[index].wrapping_add(1);
        }
        slots.by_id.clear();
    }
}
