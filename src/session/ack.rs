use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::BrokerContext;
use crate::cluster::ClusterAckType;
use crate::consumer::{Consumer, Delivery};
use crate::ids::{ConsumerUid, DestinationUid, SessionUid, SysMessageId, TransactionUid};
use crate::message::{DeliveredOutcome, PacketReference, RefHandle, SharedPending};
use crate::persistence::RemoveReason;
use crate::transaction::ConsumedMessage;
use crate::utils::{BrokerError, Result, now_millis};

/// One delivered-but-unacknowledged message.
#[derive(Debug, Clone)]
struct AckEntry {
    id: SysMessageId,
    consumer: ConsumerUid,
    stored: ConsumerUid,
    handle: Option<RefHandle>,
    tid: Option<TransactionUid>,
    consumed: bool,
}

/// Pending-ack entries in delivery order, indexed by (message, consumer).
#[derive(Debug, Default)]
struct AckTable {
    entries: BTreeMap<u64, AckEntry>,
    index: HashMap<(SysMessageId, ConsumerUid), u64>,
    next: u64,
}

impl AckTable {
    fn insert(&mut self, entry: AckEntry) {
        let key = (entry.id, entry.consumer);
        if let Some(old) = self.index.remove(&key) {
            self.entries.remove(&old);
        }
        let seq = self.next;
        self.next += 1;
        self.index.insert(key, seq);
        self.entries.insert(seq, entry);
    }

    fn remove(&mut self, id: SysMessageId, consumer: ConsumerUid) -> Option<AckEntry> {
        let seq = self.index.remove(&(id, consumer))?;
        self.entries.remove(&seq)
    }

    fn get_mut(&mut self, id: SysMessageId, consumer: ConsumerUid) -> Option<&mut AckEntry> {
        let seq = self.index.get(&(id, consumer))?;
        self.entries.get_mut(seq)
    }

    fn drain_where(&mut self, mut pred: impl FnMut(&AckEntry) -> bool) -> Vec<AckEntry> {
        let seqs: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(s, _)| *s)
            .collect();
        self.remove_seqs(seqs)
    }

    /// Entries outside any transaction delivered no later than the entry of
    /// `(id, consumer)`, which must be pending.
    fn drain_through(&mut self, id: SysMessageId, consumer: ConsumerUid) -> Option<Vec<AckEntry>> {
        let last = *self.index.get(&(id, consumer))?;
        let seqs: Vec<u64> = self
            .entries
            .range(..=last)
            .filter(|(_, e)| e.tid.is_none())
            .map(|(s, _)| *s)
            .collect();
        Some(self.remove_seqs(seqs))
    }

    fn remove_seqs(&mut self, seqs: Vec<u64>) -> Vec<AckEntry> {
        let mut drained = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(entry) = self.entries.remove(&seq) {
                self.index.remove(&(entry.id, entry.consumer));
                drained.push(entry);
            }
        }
        drained
    }

    fn ids_for(&self, consumer: ConsumerUid) -> Vec<SysMessageId> {
        self.entries
            .values()
            .filter(|e| e.consumer == consumer)
            .map(|e| e.id)
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Where a detached consumer's held messages go when the session closes.
#[derive(Debug)]
struct DetachedConsumer {
    parent: Option<Arc<SharedPending>>,
    destination: DestinationUid,
}

/// Acknowledgment bookkeeping of one session.
pub struct SessionOp {
    session: SessionUid,
    ctx: Arc<BrokerContext>,
    acks: Mutex<AckTable>,
    detached: Mutex<HashMap<ConsumerUid, DetachedConsumer>>,
}

impl SessionOp {
    pub fn new(session: SessionUid, ctx: Arc<BrokerContext>) -> Self {
        Self {
            session,
            ctx,
            acks: Mutex::new(AckTable::default()),
            detached: Mutex::new(HashMap::new()),
        }
    }

    /// Look the entry's message up; a stale handle means either the message
    /// is gone or a newer copy now belongs to another consumer.
    fn resolve(&self, entry: &AckEntry, tid: Option<TransactionUid>) -> Result<Arc<PacketReference>> {
        let gone = || BrokerError::MessageGone {
            id: entry.id,
            transaction: tid,
        };
        let handle = entry.handle.ok_or_else(gone)?;
        if let Some(reference) = self.ctx.refs().get(handle) {
            return Ok(reference);
        }
        match self.ctx.refs().get_by_id(entry.id).and_then(|r| r.owner()) {
            Some(owner) => Err(BrokerError::Requeued {
                id: entry.id,
                owner,
            }),
            None => Err(gone()),
        }
    }

    /// Record a delivery. Returns `false` when the message must not be sent.
    pub fn on_message_delivery(&self, consumer: &Consumer, delivery: &Delivery) -> bool {
        let reference = &delivery.reference;
        let stored = consumer.stored_uid();
        let no_ack = consumer.is_no_ack();
        if !no_ack {
            self.acks.lock().insert(AckEntry {
                id: reference.id(),
                consumer: consumer.uid(),
                stored,
                handle: reference.handle(),
                tid: None,
                consumed: false,
            });
        }
        match reference.delivered(stored, no_ack, now_millis()) {
            DeliveredOutcome::Deliver => true,
            DeliveredOutcome::AckedOnDelivery { removable } => {
                if let Some(destination) = self.ctx.destination(reference.destination()) {
                    if let Err(e) =
                        destination.complete_acknowledgment(reference, consumer.uid(), stored, removable)
                    {
                        warn!(id = %reference.id(), error = %e, "failed to record ack on delivery");
                    }
                }
                true
            }
            DeliveredOutcome::Dead => {
                self.acks.lock().remove(reference.id(), consumer.uid());
                reference.remove_in_delivery(stored);
                self.ctx.remove_dead_message(reference, RemoveReason::Expired);
                consumer.delivery_not_sent(delivery);
                false
            }
            DeliveredOutcome::Gone => {
                self.acks.lock().remove(reference.id(), consumer.uid());
                consumer.delivery_not_sent(delivery);
                false
            }
        }
    }

    /// Client acknowledgment of one message.
    pub fn ack_message(
        &self,
        consumer: ConsumerUid,
        id: SysMessageId,
        tid: Option<TransactionUid>,
    ) -> Result<()> {
        if let Some(tid) = tid {
            return self.ack_in_transaction(consumer, id, tid);
        }
        let entry = self
            .acks
            .lock()
            .remove(id, consumer)
            .ok_or(BrokerError::MessageGone {
                id,
                transaction: None,
            })?;
        let reference = self.resolve(&entry, None)?;
        let destination = self
            .ctx
            .destination(reference.destination())
            .ok_or(BrokerError::MessageGone {
                id,
                transaction: None,
            })?;
        destination.acknowledge_message(&reference, entry.consumer, entry.stored)?;
        Ok(())
    }

    fn ack_in_transaction(
        &self,
        consumer: ConsumerUid,
        id: SysMessageId,
        tid: TransactionUid,
    ) -> Result<()> {
        let mut acks = self.acks.lock();
        let entry = acks.get_mut(id, consumer).ok_or(BrokerError::MessageGone {
            id,
            transaction: Some(tid),
        })?;
        if entry.tid.is_some_and(|t| t != tid) {
            return Err(BrokerError::Requeued {
                id,
                owner: entry.consumer,
            });
        }
        let reference = self.resolve(entry, Some(tid))?;
        self.ctx.transactions().add_consumed(
            tid,
            ConsumedMessage {
                id,
                consumer: entry.consumer,
                stored: entry.stored,
            },
        )?;
        reference.consumed(entry.stored);
        entry.tid = Some(tid);
        debug!(session = %self.session, %id, %tid, "ack recorded in transaction");
        Ok(())
    }

    /// Acknowledge every entry of the session up to and including `id`, in
    /// delivery order. Entries inside a transaction are left alone.
    pub fn acknowledge_to(&self, consumer: ConsumerUid, id: SysMessageId) -> Result<usize> {
        let entries = self
            .acks
            .lock()
            .drain_through(id, consumer)
            .ok_or(BrokerError::MessageGone {
                id,
                transaction: None,
            })?;
        let mut acked = 0;
        for entry in entries {
            let reference = match self.resolve(&entry, None) {
                Ok(reference) => reference,
                Err(e) => {
                    debug!(id = %entry.id, error = %e, "cumulative ack skipped");
                    continue;
                }
            };
            let Some(destination) = self.ctx.destination(reference.destination()) else {
                continue;
            };
            match destination.acknowledge_message(&reference, entry.consumer, entry.stored) {
                Ok(_) => acked += 1,
                Err(e) => warn!(id = %entry.id, error = %e, "cumulative ack failed"),
            }
        }
        debug!(session = %self.session, %consumer, %id, acked, "acknowledged through message");
        Ok(acked)
    }

    /// The client could not process a message it received.
    ///
    /// With `count_only` the entry stays pending and only its delivery count
    /// is raised. Otherwise the entry is dropped: a plain topic consumer's
    /// interest is acknowledged, a queue or subscription message goes back to
    /// the list shared with the consumer's siblings, and a remote one is
    /// dead-lettered, which releases it to its home broker.
    pub fn handle_undeliverable(
        &self,
        consumer: ConsumerUid,
        live: Option<&Arc<Consumer>>,
        id: SysMessageId,
        delivery_count: u32,
        count_only: bool,
    ) -> Result<()> {
        let gone = || BrokerError::MessageGone {
            id,
            transaction: None,
        };
        if count_only {
            let mut acks = self.acks.lock();
            let entry = acks.get_mut(id, consumer).ok_or_else(gone)?;
            self.resolve(entry, None)?
                .update_delivery_count(entry.stored, delivery_count);
            return Ok(());
        }
        let entry = self.acks.lock().remove(id, consumer).ok_or_else(gone)?;
        let reference = self.resolve(&entry, None)?;
        reference.remove_in_delivery(entry.stored);
        reference.update_delivery_count(entry.stored, delivery_count);
        let destination = self
            .ctx
            .destination(reference.destination())
            .ok_or_else(gone)?;
        if entry.stored == entry.consumer {
            destination.acknowledge_message(&reference, entry.consumer, entry.stored)?;
        } else if reference.is_local() {
            reference.set_redelivered();
            self.requeue_to_parent(entry.consumer, live, reference);
        } else {
            destination.remove_dead_message(&reference, RemoveReason::Undeliverable)?;
        }
        debug!(session = %self.session, %consumer, %id, "undeliverable message handled");
        Ok(())
    }

    /// The client declared a message dead. The interest is settled for this
    /// consumer; once no other interest remains the message is dead-lettered.
    /// Returns whether the message was removed.
    pub fn handle_dead(
        &self,
        consumer: ConsumerUid,
        id: SysMessageId,
        reason: RemoveReason,
    ) -> Result<bool> {
        let gone = || BrokerError::MessageGone {
            id,
            transaction: None,
        };
        let entry = self.acks.lock().remove(id, consumer).ok_or_else(gone)?;
        let reference = self.resolve(&entry, None)?;
        reference.remove_in_delivery(entry.stored);
        let destination = self
            .ctx
            .destination(reference.destination())
            .ok_or_else(gone)?;
        let others = reference
            .unacked_interests()
            .into_iter()
            .any(|uid| uid != entry.stored);
        if others {
            destination.acknowledge_message(&reference, entry.consumer, entry.stored)?;
            return Ok(false);
        }
        destination.remove_dead_message(&reference, reason)
    }

    /// Put one message back on the list the consumer draws from, whether the
    /// consumer is still attached or was detached with held entries.
    fn requeue_to_parent(
        &self,
        uid: ConsumerUid,
        live: Option<&Arc<Consumer>>,
        reference: Arc<PacketReference>,
    ) {
        let parent = live.and_then(|c| c.parent().cloned()).or_else(|| {
            self.detached
                .lock()
                .get(&uid)
                .and_then(|d| d.parent.clone())
        });
        let Some(destination) = self.ctx.destination(reference.destination()) else {
            return;
        };
        match parent {
            Some(parent) => {
                parent.add_all_ordered(std::iter::once(reference));
                destination.notify_consumers();
            }
            None => destination.requeue(vec![reference]),
        }
    }

    /// Acknowledge everything consumed in `tid`.
    pub fn commit(&self, tid: TransactionUid) -> Result<usize> {
        let entries = self.acks.lock().drain_where(|e| e.tid == Some(tid));
        let mut acked = 0;
        for entry in entries {
            let reference = match self.resolve(&entry, Some(tid)) {
                Ok(reference) => reference,
                Err(e) => {
                    debug!(id = %entry.id, error = %e, "committed ack skipped");
                    continue;
                }
            };
            if let Some(destination) = self.ctx.destination(reference.destination()) {
                destination.acknowledge_message(&reference, entry.consumer, entry.stored)?;
                acked += 1;
            }
        }
        Ok(acked)
    }

    /// Redeliver what was consumed in `tid`; a transacted session also gives
    /// back what it received but did not acknowledge yet.
    pub fn rollback(
        &self,
        tid: TransactionUid,
        include_unacked: bool,
        consumers: &BTreeMap<ConsumerUid, Arc<Consumer>>,
    ) -> usize {
        let entries = self
            .acks
            .lock()
            .drain_where(|e| e.tid == Some(tid) || (include_unacked && e.tid.is_none()));
        let mut per_consumer: BTreeMap<ConsumerUid, Vec<Arc<PacketReference>>> = BTreeMap::new();
        for entry in entries {
            let Ok(reference) = self.resolve(&entry, Some(tid)) else {
                continue;
            };
            reference.remove_in_delivery(entry.stored);
            if self.bounce(&reference, entry.stored) {
                continue;
            }
            per_consumer.entry(entry.consumer).or_default().push(reference);
        }
        let count = per_consumer.values().map(Vec::len).sum();
        for (uid, references) in per_consumer {
            self.return_to_consumer(uid, consumers.get(&uid), references);
        }
        info!(session = %self.session, %tid, count, "transaction rolled back");
        count
    }

    /// Count a bounce; dead-letters and returns `true` past the limit.
    fn bounce(&self, reference: &Arc<PacketReference>, stored: ConsumerUid) -> bool {
        let count = reference.increment_rollback(stored);
        let Some(destination) = self.ctx.destination(reference.destination()) else {
            return false;
        };
        let max = destination.settings().max_consecutive_rollbacks;
        if max == 0 || count <= max {
            return false;
        }
        if let Err(e) = destination.remove_dead_message(reference, RemoveReason::Undeliverable) {
            warn!(id = %reference.id(), error = %e, "failed to dead-letter message");
        }
        true
    }

    fn return_to_consumer(
        &self,
        uid: ConsumerUid,
        consumer: Option<&Arc<Consumer>>,
        references: Vec<Arc<PacketReference>>,
    ) {
        match consumer {
            Some(consumer) if consumer.is_valid() => {
                consumer.route_messages(references, true);
            }
            _ => self.reinject(uid, references),
        }
    }

    /// Give messages of a consumer that is no longer attached back to where
    /// they came from.
    fn reinject(&self, uid: ConsumerUid, references: Vec<Arc<PacketReference>>) {
        let detached = self.detached.lock().remove(&uid);
        match detached {
            Some(DetachedConsumer {
                parent: Some(parent),
                destination,
            }) => {
                parent.add_all_ordered(references.into_iter().filter(|r| !r.is_destroyed()));
                if let Some(destination) = self.ctx.destination(&destination) {
                    destination.notify_consumers();
                }
            }
            _ => {
                for reference in references {
                    let Some(destination) = self.ctx.destination(reference.destination()) else {
                        continue;
                    };
                    if destination.is_queue() {
                        destination.requeue(vec![reference]);
                    } else if let Err(e) =
                        destination.acknowledge_message(&reference, uid, uid)
                    {
                        debug!(id = %reference.id(), error = %e, "release of orphaned message failed");
                    }
                }
            }
        }
    }

    /// Return chosen delivered messages to the front of the consumer's list.
    pub fn redeliver(&self, consumer: &Arc<Consumer>, ids: &[SysMessageId]) -> usize {
        let entries: Vec<_> = {
            let mut acks = self.acks.lock();
            ids.iter()
                .filter_map(|id| acks.remove(*id, consumer.uid()))
                .collect()
        };
        let references: Vec<_> = entries
            .iter()
            .filter_map(|entry| self.resolve(entry, None).ok())
            .inspect(|r| {
                r.remove_in_delivery(consumer.stored_uid());
                r.set_redelivered();
            })
            .collect();
        let count = references.len();
        self.return_to_consumer(consumer.uid(), Some(consumer), references);
        count
    }

    /// Resolve a consumer's entries as it closes.
    ///
    /// Entries up to and including `last_seen` were seen by the client: they
    /// are marked consumed and stay in the table for a later ack (`None`
    /// means everything was seen). In a transacted session, entries already
    /// acknowledged in a transaction stay too. Everything else is returned
    /// for redelivery.
    pub fn detach_consumer(
        &self,
        consumer: &Consumer,
        last_seen: Option<SysMessageId>,
        redeliver_all: bool,
        transacted: bool,
    ) -> Vec<Arc<PacketReference>> {
        let mut acks = self.acks.lock();
        let mine: Vec<(u64, AckEntry)> = acks
            .entries
            .iter()
            .filter(|(_, e)| e.consumer == consumer.uid())
            .map(|(s, e)| (*s, e.clone()))
            .collect();
        let mut seen = !redeliver_all
            && last_seen.is_none_or(|id| mine.iter().any(|(_, e)| e.id == id));
        let mut redeliver = Vec::new();
        let mut held = false;

        for (_, entry) in mine {
            let was_seen = seen;
            if last_seen == Some(entry.id) {
                seen = false;
            }
            let hold = if was_seen {
                !transacted || entry.tid.is_some()
            } else {
                transacted && entry.tid.is_some()
            };
            if hold {
                if was_seen {
                    if let Some(e) = acks.get_mut(entry.id, entry.consumer) {
                        e.consumed = true;
                    }
                    if let Ok(reference) = self.resolve(&entry, entry.tid) {
                        reference.consumed(entry.stored);
                    }
                }
                held = true;
                continue;
            }
            acks.remove(entry.id, entry.consumer);
            if let Ok(reference) = self.resolve(&entry, None) {
                redeliver.push(reference);
            }
        }
        drop(acks);

        if held {
            self.detached.lock().insert(
                consumer.uid(),
                DetachedConsumer {
                    parent: consumer.parent().cloned(),
                    destination: consumer.destination().clone(),
                },
            );
        }
        debug!(session = %self.session, consumer = %consumer.uid(), redeliver = redeliver.len(), held, "consumer detached from session");
        redeliver
    }

    /// Resolve every outstanding entry as the session closes.
    ///
    /// Returns, per still-attached consumer, the messages to hand back when
    /// that consumer is destroyed.
    pub fn close(
        &self,
        consumers: &BTreeMap<ConsumerUid, Arc<Consumer>>,
    ) -> HashMap<ConsumerUid, Vec<Arc<PacketReference>>> {
        let entries = self.acks.lock().drain_where(|_| true);
        let mut returned: HashMap<ConsumerUid, Vec<Arc<PacketReference>>> = HashMap::new();
        let mut orphaned: BTreeMap<ConsumerUid, Vec<Arc<PacketReference>>> = BTreeMap::new();

        for entry in entries {
            if let Some(tid) = entry.tid {
                let decided = self
                    .ctx
                    .transactions()
                    .state(tid)
                    .is_some_and(|s| s.holds_orphans());
                if decided {
                    self.ctx.transactions().add_orphan_ack(
                        tid,
                        ConsumedMessage {
                            id: entry.id,
                            consumer: entry.consumer,
                            stored: entry.stored,
                        },
                    );
                    continue;
                }
            }
            let Ok(reference) = self.resolve(&entry, entry.tid) else {
                continue;
            };
            reference.remove_in_delivery(entry.stored);
            if !reference.is_local() {
                self.release_remote(&reference, &entry);
                continue;
            }
            if self.bounce(&reference, entry.stored) {
                continue;
            }
            if consumers.contains_key(&entry.consumer) {
                returned.entry(entry.consumer).or_default().push(reference);
            } else {
                orphaned.entry(entry.consumer).or_default().push(reference);
            }
        }

        for (uid, references) in orphaned {
            self.reinject(uid, references);
        }
        // detached consumers without leftover entries
        self.detached.lock().clear();
        returned
    }

    fn release_remote(&self, reference: &Arc<PacketReference>, entry: &AckEntry) {
        let complete = reference.acknowledged(entry.stored);
        if let Some(broker) = reference.broker_address() {
            if let Err(e) = self.ctx.cluster().acknowledge_message(
                broker,
                entry.id,
                entry.consumer,
                ClusterAckType::Undeliverable,
                None,
            ) {
                warn!(%broker, id = %entry.id, error = %e, "failed to release remote message");
            }
        }
        if complete {
            if let Some(destination) = self.ctx.destination(reference.destination()) {
                if let Err(e) = destination.remove_message(entry.id, RemoveReason::Undeliverable) {
                    warn!(id = %entry.id, error = %e, "failed to remove released remote message");
                }
            }
        }
    }

    /// Delivered-but-unacknowledged message ids for `consumer`, in delivery
    /// order.
    pub fn pending_acks(&self, consumer: ConsumerUid) -> Vec<SysMessageId> {
        self.acks.lock().ids_for(consumer)
    }

    pub fn len(&self) -> usize {
        self.acks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn debug_state(&self) -> serde_json::Value {
        let acks = self.acks.lock();
        let mut pending: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        for entry in acks.entries.values() {
            pending.entry(entry.consumer.to_string()).or_default().push(json!({
                "id": entry.id.to_string(),
                "stored": entry.stored,
                "transaction": entry.tid,
                "consumed": entry.consumed,
            }));
        }
        json!({
            "session": self.session,
            "pending": pending,
            "count": acks.len(),
            "detached": self.detached.lock().keys().collect::<Vec<_>>(),
        })
    }
}

impl fmt::Debug for SessionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOp")
            .field("session", &self.session)
            .field("pending", &self.acks.lock().len())
            .finish()
    }
}
