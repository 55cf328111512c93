//! The `session` module multiplexes delivery across a session's consumers.
//!
//! A session keeps its attached consumers and a queue of the ones that are
//! busy (have something deliverable). `fill_next_packet` walks that queue
//! round-robin and records every delivery in the session's `SessionOp`,
//! which owns the table of delivered-but-unacknowledged messages.

mod ack;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::broker::BrokerContext;
use crate::consumer::{Consumer, Delivery};
use crate::ids::{ConnectionUid, ConsumerUid, SessionUid, SysMessageId, TransactionUid};
use crate::message::PacketReference;
use crate::persistence::RemoveReason;
use crate::utils::{BrokerError, Result};

pub use ack::SessionOp;

pub struct Session {
    uid: SessionUid,
    connection: ConnectionUid,
    client_id: Option<String>,
    transacted: bool,
    consumers: Mutex<BTreeMap<ConsumerUid, Arc<Consumer>>>,
    busy: Mutex<VecDeque<ConsumerUid>>,
    op: SessionOp,
    /// Serializes delivery against acknowledgment processing.
    serial: Mutex<()>,
    valid: AtomicBool,
    paused: AtomicBool,
    work: Arc<Notify>,
}

impl Session {
    pub fn new(
        ctx: Arc<BrokerContext>,
        connection: ConnectionUid,
        client_id: Option<&str>,
        transacted: bool,
    ) -> Arc<Self> {
        let uid = SessionUid::new();
        Arc::new(Self {
            uid,
            connection,
            client_id: client_id.map(str::to_string),
            transacted,
            consumers: Mutex::new(BTreeMap::new()),
            busy: Mutex::new(VecDeque::new()),
            op: SessionOp::new(uid, ctx),
            serial: Mutex::new(()),
            valid: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            work: Arc::new(Notify::new()),
        })
    }

    pub fn uid(&self) -> SessionUid {
        self.uid
    }

    pub fn connection(&self) -> ConnectionUid {
        self.connection
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn op(&self) -> &SessionOp {
        &self.op
    }

    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.lock().values().cloned().collect()
    }

    pub fn consumer(&self, uid: ConsumerUid) -> Option<Arc<Consumer>> {
        self.consumers.lock().get(&uid).cloned()
    }

    pub(crate) fn attach_consumer(&self, consumer: &Arc<Consumer>) -> Result<()> {
        if !self.is_valid() {
            return Err(BrokerError::SessionClosed(self.uid));
        }
        consumer.set_work_signal(Arc::clone(&self.work));
        self.consumers
            .lock()
            .insert(consumer.uid(), Arc::clone(consumer));
        debug!(session = %self.uid, consumer = %consumer.uid(), "consumer attached to session");
        self.work.notify_one();
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.work.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn refresh_busy(&self) {
        let consumers = self.consumers();
        let mut busy = self.busy.lock();
        for consumer in consumers {
            if consumer.is_busy() && !busy.contains(&consumer.uid()) {
                busy.push_back(consumer.uid());
            }
        }
    }

    /// Next message to send from any busy consumer, round-robin.
    pub fn fill_next_packet(&self) -> Option<Delivery> {
        if !self.is_valid() || self.is_paused() {
            return None;
        }
        let _serial = self.serial.lock();
        self.refresh_busy();
        loop {
            let uid = self.busy.lock().pop_front()?;
            let Some(consumer) = self.consumer(uid) else {
                continue;
            };
            let Some(delivery) = consumer.get_and_fill_next_packet() else {
                continue;
            };
            let send = self.op.on_message_delivery(&consumer, &delivery);
            if consumer.is_busy() {
                let mut busy = self.busy.lock();
                if !busy.contains(&uid) {
                    busy.push_back(uid);
                }
            }
            if send {
                return Some(delivery);
            }
        }
    }

    /// Wait for the next message; `None` once the session is closed.
    pub async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            if !self.is_valid() {
                return None;
            }
            if let Some(delivery) = self.fill_next_packet() {
                return Some(delivery);
            }
            self.work.notified().await;
        }
    }

    pub fn acknowledge(
        &self,
        consumer: ConsumerUid,
        id: SysMessageId,
        tid: Option<TransactionUid>,
    ) -> Result<()> {
        let _serial = self.serial.lock();
        self.op.ack_message(consumer, id, tid)
    }

    /// Acknowledge everything delivered up to and including `id`.
    pub fn acknowledge_to(&self, consumer: ConsumerUid, id: SysMessageId) -> Result<usize> {
        let _serial = self.serial.lock();
        self.op.acknowledge_to(consumer, id)
    }

    pub fn undeliverable(
        &self,
        consumer: ConsumerUid,
        id: SysMessageId,
        delivery_count: u32,
        count_only: bool,
    ) -> Result<()> {
        let live = self.consumer(consumer);
        let _serial = self.serial.lock();
        self.op
            .handle_undeliverable(consumer, live.as_ref(), id, delivery_count, count_only)
    }

    pub fn dead(&self, consumer: ConsumerUid, id: SysMessageId, reason: RemoveReason) -> Result<bool> {
        let _serial = self.serial.lock();
        self.op.handle_dead(consumer, id, reason)
    }

    /// Negative acknowledgment: send these messages again.
    pub fn redeliver(&self, consumer: ConsumerUid, ids: &[SysMessageId]) -> Result<usize> {
        let consumer = self
            .consumer(consumer)
            .ok_or(BrokerError::ConsumerNotFound(consumer))?;
        let _serial = self.serial.lock();
        let count = self.op.redeliver(&consumer, ids);
        debug!(session = %self.uid, consumer = %consumer.uid(), count, "messages redelivered");
        Ok(count)
    }

    pub(crate) fn commit(&self, tid: TransactionUid) -> Result<usize> {
        let _serial = self.serial.lock();
        self.op.commit(tid)
    }

    pub(crate) fn rollback(&self, tid: TransactionUid) -> usize {
        let consumers = self.consumers.lock().clone();
        let _serial = self.serial.lock();
        self.op.rollback(tid, self.transacted, &consumers)
    }

    /// Detach and destroy one consumer. `last_seen` is the last message the
    /// client saw; later deliveries are redelivered.
    pub(crate) fn detach_consumer(
        &self,
        uid: ConsumerUid,
        last_seen: Option<SysMessageId>,
        redeliver_all: bool,
    ) -> Result<Arc<Consumer>> {
        let consumer = self
            .consumers
            .lock()
            .remove(&uid)
            .ok_or(BrokerError::ConsumerNotFound(uid))?;
        self.busy.lock().retain(|c| *c != uid);
        let delivered = {
            let _serial = self.serial.lock();
            self.op
                .detach_consumer(&consumer, last_seen, redeliver_all, self.transacted)
        };
        consumer.destroy_consumer(delivered, consumer.acks_on_destroy());
        Ok(consumer)
    }

    /// Close the session. Runs once; returns the consumers that were still
    /// attached, already destroyed.
    pub(crate) fn close(&self) -> Vec<Arc<Consumer>> {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        self.busy.lock().clear();
        let mut returned: HashMap<ConsumerUid, Vec<Arc<PacketReference>>> = {
            let _serial = self.serial.lock();
            self.op.close(&consumers)
        };
        let mut closed = Vec::with_capacity(consumers.len());
        for (uid, consumer) in consumers {
            let delivered = returned.remove(&uid).unwrap_or_default();
            consumer.destroy_consumer(delivered, consumer.acks_on_destroy());
            closed.push(consumer);
        }
        self.work.notify_one();
        info!(session = %self.uid, consumers = closed.len(), "session closed");
        closed
    }

    pub fn debug_state(&self) -> serde_json::Value {
        let mut state = self.op.debug_state();
        state["transacted"] = serde_json::Value::Bool(self.transacted);
        state["consumers"] = serde_json::json!(self
            .consumers
            .lock()
            .keys()
            .map(|c| c.raw())
            .collect::<Vec<_>>());
        state
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("uid", &self.uid)
            .field("connection", &self.connection)
            .field("transacted", &self.transacted)
            .field("consumers", &self.consumers.lock().len())
            .field("pending_acks", &self.op.len())
            .field("valid", &self.is_valid())
            .finish()
    }
}
