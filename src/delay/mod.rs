//! The `delay` module holds messages whose delivery time is in the future.
//!
//! Each destination owns one `DeliveryDelayTimer`: an ordered set of
//! `(delivery time, message id)` entries and a tokio task that sleeps until
//! the earliest one is due. Adding an entry that becomes the new earliest
//! wakes the task early. A release cycle hands at most the destination's
//! max prefetch worth of messages to the routing path.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::destination::Destination;
use crate::ids::SysMessageId;
use crate::message::PacketReference;
use crate::utils::now_millis;

#[derive(Default)]
struct Entries {
    by_time: BTreeSet<(i64, SysMessageId)>,
    by_id: HashMap<SysMessageId, i64>,
}

pub struct DeliveryDelayTimer {
    entries: Mutex<Entries>,
    wake: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Default for DeliveryDelayTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryDelayTimer {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            wake: Arc::new(Notify::new()),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Hold `reference` until its delivery time.
    pub fn add_message(&self, destination: &Arc<Destination>, reference: &Arc<PacketReference>) {
        let id = reference.id();
        let time = reference.delivery_time().unwrap_or(0);
        let earliest = {
            let mut entries = self.entries.lock();
            if let Some(old) = entries.by_id.insert(id, time) {
                entries.by_time.remove(&(old, id));
            }
            entries.by_time.insert((time, id));
            entries.by_time.first() == Some(&(time, id))
        };
        debug!(destination = %destination.uid(), %id, delivery_time = time, "message delayed");
        if earliest {
            self.wake.notify_one();
        }
        self.ensure_task(destination);
    }

    pub fn remove_message(&self, id: SysMessageId) -> bool {
        let mut entries = self.entries.lock();
        match entries.by_id.remove(&id) {
            Some(time) => {
                entries.by_time.remove(&(time, id));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: SysMessageId) -> bool {
        self.entries.lock().by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_due(&self) -> Option<i64> {
        self.entries.lock().by_time.first().map(|(time, _)| *time)
    }

    /// Release what is due at `now`, at most `max_prefetch` messages, and
    /// return the next due time.
    pub fn run_task_at(&self, now: i64, destination: &Destination) -> Option<i64> {
        let limit = destination.max_prefetch().max(1);
        let due: Vec<SysMessageId> = {
            let mut entries = self.entries.lock();
            let mut due = Vec::new();
            while due.len() < limit {
                let Some(&(time, id)) = entries.by_time.first() else {
                    break;
                };
                if time > now {
                    break;
                }
                entries.by_time.remove(&(time, id));
                entries.by_id.remove(&id);
                due.push(id);
            }
            due
        };

        let released = due.len();
        for id in due {
            match destination.message(id) {
                Some(reference) => {
                    if let Err(e) = destination.forward_delivery_delayed(&reference) {
                        warn!(destination = %destination.uid(), %id, error = %e, "failed to deliver delayed message");
                    }
                }
                None => debug!(%id, "delayed message already removed"),
            }
        }
        if released > 0 {
            info!(destination = %destination.uid(), released, "delayed messages released");
        }
        self.next_due()
    }

    /// A consumer went away: release delayed topic messages whose remaining
    /// interest belonged only to consumers that are gone.
    pub fn consumer_closed(&self, destination: &Destination) {
        if destination.is_queue() {
            return;
        }
        let ids: Vec<_> = self.entries.lock().by_id.keys().copied().collect();
        for id in ids {
            let Some(reference) = destination.message(id) else {
                self.remove_message(id);
                continue;
            };
            for stored in reference.unacked_interests() {
                if destination.consumer(stored).is_some() {
                    continue;
                }
                if let Err(e) = destination.acknowledge_message(&reference, stored, stored) {
                    warn!(%id, error = %e, "failed to release delayed message");
                }
            }
        }
    }

    fn ensure_task(&self, destination: &Arc<Destination>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            // no runtime: due messages are released by explicit `run_task_at`
            return;
        };
        let weak = Arc::downgrade(destination);
        let wake = Arc::clone(&self.wake);
        *task = Some(handle.spawn(run_timer(weak, wake)));
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let mut entries = self.entries.lock();
        entries.by_time.clear();
        entries.by_id.clear();
    }
}

async fn run_timer(destination: Weak<Destination>, wake: Arc<Notify>) {
    loop {
        let Some(strong) = destination.upgrade() else {
            return;
        };
        let now = now_millis();
        let next = strong.delay_timer().run_task_at(now, &strong);
        drop(strong);
        match next {
            Some(at) => {
                let wait = Duration::from_millis((at - now).max(0) as u64);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
}

impl fmt::Debug for DeliveryDelayTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryDelayTimer")
            .field("entries", &self.len())
            .field("next_due", &self.next_due())
            .finish()
    }
}

#[cfg(test)]
mod tests;
