//! The `destination` module routes messages arriving at a queue or topic.
//!
//! A `Destination` owns every message stored on it, the registry of attached
//! consumers, its capacity limits and its delivery-delay timer. The routing
//! strategy is picked once per destination through `DestinationKind`:
//!
//! - a queue keeps one shared pending list that its active consumers pull
//!   from, with a single interest entry per message (`ConsumerUid::QUEUE`),
//! - a topic evaluates each distinct selector once per message, records an
//!   interest entry per matching consumer or subscription and routes a copy
//!   of the reference to each of them.

mod dead_letter;
mod queue;
mod rates;
mod topic;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::broker::BrokerContext;
use crate::cluster::ClusterAckType;
use crate::config::{DestinationSettings, LimitBehavior};
use crate::consumer::Consumer;
use crate::delay::DeliveryDelayTimer;
use crate::ids::{ConsumerUid, DestinationType, DestinationUid, SysMessageId};
use crate::message::{ExpirationInfo, Packet, PacketReference};
use crate::persistence::RemoveReason;
use crate::utils::{BrokerError, Result, now_millis};

pub use dead_letter::{DEAD_LETTER_CAPACITY, DeadLetter, DeadLetterQueue};
pub use queue::{LOCK_RETRY_THRESHOLD, MAX_LOCK_ATTEMPTS, QueueState, QueueStats, QueueStatsSnapshot};
pub use rates::{RateComparison, RateTracker, remote_prefetch_limit};
pub use topic::TopicState;

/// Routing strategy of a destination.
#[derive(Debug)]
pub enum DestinationKind {
    Queue(QueueState),
    Topic(TopicState),
}

/// Result of storing a message on a destination.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub reference: Arc<PacketReference>,
    /// The destination is over its limits and the producer should back off.
    pub pause_producer: bool,
}

/// Snapshot published by the monitor and used by tests.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationMetrics {
    pub name: String,
    pub kind: DestinationType,
    pub messages: usize,
    pub bytes: u64,
    pub pending: usize,
    pub delayed: usize,
    pub consumers: usize,
    pub messages_in: u64,
    pub messages_out: u64,
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStatsSnapshot>,
}

pub struct Destination {
    uid: DestinationUid,
    ctx: Arc<BrokerContext>,
    settings: RwLock<DestinationSettings>,
    /// Set when the destination was given its own settings, which then win
    /// over broker-wide updates.
    custom_settings: AtomicBool,
    messages: Mutex<HashMap<SysMessageId, Arc<PacketReference>>>,
    /// Held from the capacity check until the new message is counted.
    admission: Mutex<()>,
    bytes: AtomicU64,
    consumers: RwLock<BTreeMap<ConsumerUid, Arc<Consumer>>>,
    kind: DestinationKind,
    delay: DeliveryDelayTimer,
    expirations: Mutex<BTreeSet<ExpirationInfo>>,
    rates: RateTracker,
    valid: AtomicBool,
    created: i64,
}

/// Only local persistent messages live in this broker's store.
fn is_stored(reference: &PacketReference) -> bool {
    reference.is_persistent() && reference.is_local()
}

impl Destination {
    pub(crate) fn new(
        ctx: Arc<BrokerContext>,
        uid: DestinationUid,
        settings: Option<DestinationSettings>,
    ) -> Result<Arc<Self>> {
        if uid.is_wildcard() {
            return Err(BrokerError::InvalidDestination {
                name: uid.name().to_string(),
                reason: "wildcard patterns only select destinations".to_string(),
            });
        }
        let custom = settings.is_some();
        let settings = settings.unwrap_or_else(|| ctx.settings().destinations.clone());
        settings.validate()?;
        let kind = match uid.kind() {
            DestinationType::Queue => DestinationKind::Queue(QueueState::new(Arc::clone(ctx.order()))),
            DestinationType::Topic => DestinationKind::Topic(TopicState::default()),
        };
        info!(destination = %uid, "destination created");
        Ok(Arc::new(Self {
            uid,
            ctx,
            settings: RwLock::new(settings),
            custom_settings: AtomicBool::new(custom),
            messages: Mutex::new(HashMap::new()),
            admission: Mutex::new(()),
            bytes: AtomicU64::new(0),
            consumers: RwLock::new(BTreeMap::new()),
            kind,
            delay: DeliveryDelayTimer::new(),
            expirations: Mutex::new(BTreeSet::new()),
            rates: RateTracker::new(),
            valid: AtomicBool::new(true),
            created: now_millis(),
        }))
    }

    pub fn uid(&self) -> &DestinationUid {
        &self.uid
    }

    pub fn kind(&self) -> &DestinationKind {
        &self.kind
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.kind, DestinationKind::Queue(_))
    }

    pub fn queue_state(&self) -> Option<&QueueState> {
        match &self.kind {
            DestinationKind::Queue(q) => Some(q),
            DestinationKind::Topic(_) => None,
        }
    }

    pub fn topic_state(&self) -> Option<&TopicState> {
        match &self.kind {
            DestinationKind::Topic(t) => Some(t),
            DestinationKind::Queue(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> DestinationSettings {
        self.settings.read().clone()
    }

    pub(crate) fn context(&self) -> &Arc<BrokerContext> {
        &self.ctx
    }

    pub fn delay_timer(&self) -> &DeliveryDelayTimer {
        &self.delay
    }

    pub fn message(&self, id: SysMessageId) -> Option<Arc<PacketReference>> {
        self.messages.lock().get(&id).cloned()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    /// Messages waiting in the queue's shared list (always 0 for topics).
    pub fn pending_len(&self) -> usize {
        self.queue_state().map_or(0, |q| q.pending().len())
    }

    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.read().values().cloned().collect()
    }

    pub fn consumer(&self, uid: ConsumerUid) -> Option<Arc<Consumer>> {
        self.consumers.read().get(&uid).cloned()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Most messages handed out per routing step.
    pub fn max_prefetch(&self) -> usize {
        let settings = self.settings.read();
        let prefetch = if self.is_queue() {
            settings.queue_prefetch
        } else {
            settings.topic_prefetch
        };
        if prefetch > 0 {
            prefetch as usize
        } else {
            self.ctx.settings().consumers.unlimited_batch
        }
    }

    /// Wake every consumer that may now have work.
    pub fn notify_consumers(&self) {
        for consumer in self.consumers.read().values() {
            consumer.signal();
        }
    }

    /// Store a new message on this destination, applying capacity limits.
    ///
    /// The message is not routed yet; see `deliver`.
    pub fn queue_message(&self, packet: Packet, broker_address: Option<&str>) -> Result<QueuedMessage> {
        if !self.is_valid() {
            return Err(BrokerError::DestinationNotFound(self.uid.to_string()));
        }
        let admission = self.admission.lock();
        let pause_producer = self.enforce_limits(packet.byte_size())?;
        let order = self.ctx.order().next();
        let reference = Arc::new(match broker_address {
            Some(address) => PacketReference::remote(packet, order, address),
            None => PacketReference::new(packet, order),
        });
        let (_, replaced) = self.ctx.refs().insert(&reference);
        if let Some(old) = replaced {
            debug!(id = %old.id(), "replaced stale reference with the same id");
        }
        if let Some(old) = self.messages.lock().insert(reference.id(), Arc::clone(&reference)) {
            self.bytes.fetch_sub(old.size(), Ordering::AcqRel);
        }
        self.bytes.fetch_add(reference.size(), Ordering::AcqRel);
        drop(admission);
        self.rates.record_in();
        if let Some(expiration) = reference.expiration() {
            self.expirations
                .lock()
                .insert(ExpirationInfo::new(expiration, reference.id()));
        }
        trace!(destination = %self.uid, id = %reference.id(), "message queued");
        Ok(QueuedMessage {
            reference,
            pause_producer,
        })
    }

    /// Returns whether the producer should be paused.
    fn enforce_limits(&self, size: u64) -> Result<bool> {
        let settings = self.settings();
        let over = |count: usize, bytes: u64| {
            (settings.max_messages >= 0 && count as i64 + 1 > settings.max_messages)
                || (settings.max_bytes >= 0 && (bytes + size) as i64 > settings.max_bytes)
        };
        if !over(self.message_count(), self.bytes()) {
            return Ok(false);
        }
        let full = || BrokerError::DestinationFull {
            destination: self.uid.to_string(),
            count: self.message_count(),
            bytes: self.bytes(),
        };
        let reason = match settings.limit_behavior {
            LimitBehavior::RejectNewest => {
                warn!(destination = %self.uid, "destination full, rejecting message");
                return Err(full());
            }
            LimitBehavior::FlowControl => {
                debug!(destination = %self.uid, "destination full, pausing producer");
                return Ok(true);
            }
            LimitBehavior::RemoveOldest => RemoveReason::RemovedOldest,
            LimitBehavior::RemoveLowPriority => RemoveReason::RemovedLowPriority,
        };
        while over(self.message_count(), self.bytes()) {
            let victim = {
                let messages = self.messages.lock();
                let candidates = messages
                    .values()
                    .filter(|r| !r.any_in_delivery() && !self.delay.contains(r.id()));
                match reason {
                    RemoveReason::RemovedLowPriority => {
                        candidates.min_by_key(|r| (r.priority(), r.order())).map(|r| r.id())
                    }
                    _ => candidates.min_by_key(|r| r.order()).map(|r| r.id()),
                }
            };
            let Some(victim) = victim else {
                return Err(full());
            };
            info!(destination = %self.uid, id = %victim, %reason, "evicting message");
            self.remove_message(victim, reason)?;
        }
        Ok(false)
    }

    /// Record interest in a newly stored message and persist it.
    ///
    /// Queues return `None`: every queue consumer shares the single interest
    /// entry. Topics return the consumers and subscriptions that matched; a
    /// topic message nobody wants is removed straight away.
    pub fn route_new_message(
        &self,
        reference: &Arc<PacketReference>,
    ) -> Result<Option<Vec<Arc<Consumer>>>> {
        let (targets, interests) = match &self.kind {
            DestinationKind::Queue(_) => (None, vec![ConsumerUid::QUEUE]),
            DestinationKind::Topic(topic) => {
                let consumers = self.consumers.read();
                let targets = topic.route(reference.packet(), &consumers);
                let interests: Vec<_> = targets.iter().map(|c| c.stored_uid()).collect();
                (Some(targets), interests)
            }
        };
        if interests.is_empty() {
            debug!(destination = %self.uid, id = %reference.id(), "no interested consumers, dropping message");
            self.remove_message(reference.id(), RemoveReason::NoInterest)?;
            return Ok(Some(Vec::new()));
        }
        reference.store(&interests);
        if is_stored(reference) {
            self.ctx.store().store_message(reference.packet(), &interests)?;
        }
        Ok(targets)
    }

    /// Route a stored message: hand it to the delay timer if it is not due
    /// yet, otherwise make it available to consumers.
    pub fn deliver(self: &Arc<Self>, reference: &Arc<PacketReference>) -> Result<()> {
        let targets = self.route_new_message(reference)?;
        if reference.is_destroyed() {
            return Ok(());
        }
        if !reference.is_delivery_due(now_millis()) {
            self.delay.add_message(self, reference);
            return Ok(());
        }
        match targets {
            None => self.enqueue(Arc::clone(reference)),
            Some(targets) => self.forward_message(&targets, reference),
        }
        Ok(())
    }

    fn enqueue(&self, reference: Arc<PacketReference>) {
        if let DestinationKind::Queue(queue) = &self.kind {
            queue.pending().add(reference);
            self.notify_consumers();
        }
    }

    /// Hand a topic message to each target: local consumers get it on their
    /// private list, remote ones through the cluster.
    pub fn forward_message(&self, consumers: &[Arc<Consumer>], reference: &Arc<PacketReference>) {
        let mut remote: BTreeMap<&str, Vec<ConsumerUid>> = BTreeMap::new();
        for consumer in consumers {
            if let Some(broker) = consumer.remote() {
                remote.entry(broker).or_default().push(consumer.uid());
                continue;
            }
            if !consumer.route_message(Arc::clone(reference), false, false) {
                debug!(consumer = %consumer.uid(), id = %reference.id(), "consumer gone before routing");
                if let Err(e) = self.acknowledge_message(reference, consumer.uid(), consumer.stored_uid()) {
                    warn!(id = %reference.id(), error = %e, "failed to release interest of a closed consumer");
                }
            }
        }
        for (broker, uids) in remote {
            if let Err(e) = self.ctx.cluster().forward_message(reference, &uids) {
                warn!(%broker, id = %reference.id(), error = %e, "failed to forward message to remote consumers");
            }
        }
    }

    /// A delayed message became due.
    pub fn forward_delivery_delayed(&self, reference: &Arc<PacketReference>) -> Result<()> {
        if reference.is_destroyed() {
            return Ok(());
        }
        if self.is_queue() {
            self.enqueue(Arc::clone(reference));
            return Ok(());
        }
        let mut targets = Vec::new();
        for stored in reference.unacked_interests() {
            match self.consumer(stored) {
                Some(consumer) => targets.push(consumer),
                None => {
                    self.acknowledge_message(reference, stored, stored)?;
                }
            }
        }
        if !reference.is_destroyed() {
            self.forward_message(&targets, reference);
        }
        Ok(())
    }

    /// Acknowledge `stored`'s interest; removes the message once the last
    /// interest is acknowledged. Returns whether it was removed.
    pub fn acknowledge_message(
        &self,
        reference: &Arc<PacketReference>,
        consumer: ConsumerUid,
        stored: ConsumerUid,
    ) -> Result<bool> {
        let complete = reference.acknowledged(stored);
        self.complete_acknowledgment(reference, consumer, stored, complete)?;
        Ok(complete)
    }

    /// Store, cluster and removal side of an acknowledgment already recorded
    /// on the reference.
    pub(crate) fn complete_acknowledgment(
        &self,
        reference: &Arc<PacketReference>,
        consumer: ConsumerUid,
        stored: ConsumerUid,
        complete: bool,
    ) -> Result<()> {
        if is_stored(reference) {
            self.ctx
                .store()
                .acknowledged(reference.id(), consumer, stored, true, true)?;
        }
        if let Some(broker) = reference.broker_address() {
            if let Err(e) = self.ctx.cluster().acknowledge_message(
                broker,
                reference.id(),
                consumer,
                ClusterAckType::Acknowledged,
                None,
            ) {
                warn!(%broker, id = %reference.id(), error = %e, "failed to send remote ack");
            }
        }
        if complete {
            self.remove_message(reference.id(), RemoveReason::Acknowledged)?;
        }
        Ok(())
    }

    /// Remove a message from this destination and the store.
    ///
    /// Safe to race: only the first caller for an id gets the reference back.
    pub fn remove_message(
        &self,
        id: SysMessageId,
        reason: RemoveReason,
    ) -> Result<Option<Arc<PacketReference>>> {
        let Some(reference) = self.messages.lock().remove(&id) else {
            return Ok(None);
        };
        reference.destroy();
        if let Some(handle) = reference.handle() {
            self.ctx.refs().remove(handle);
        }
        self.bytes.fetch_sub(reference.size(), Ordering::AcqRel);
        if let DestinationKind::Queue(queue) = &self.kind {
            queue.pending().remove(id);
        }
        if let Some(expiration) = reference.expiration() {
            self.expirations
                .lock()
                .remove(&ExpirationInfo::new(expiration, id));
        }
        self.delay.remove_message(id);
        if reason == RemoveReason::Acknowledged {
            self.rates.record_out();
        }
        if is_stored(&reference) {
            self.ctx.store().remove_message(id, reason)?;
        }
        trace!(destination = %self.uid, %id, %reason, "message removed");
        Ok(Some(reference))
    }

    /// Remove a message as dead and record it in the dead-letter queue.
    pub fn remove_dead_message(
        &self,
        reference: &Arc<PacketReference>,
        reason: RemoveReason,
    ) -> Result<bool> {
        reference.mark_dead();
        let Some(removed) = self.remove_message(reference.id(), reason)? else {
            return Ok(false);
        };
        if let Some(broker) = removed.broker_address() {
            if let Err(e) = self.ctx.cluster().acknowledge_message(
                broker,
                removed.id(),
                ConsumerUid::QUEUE,
                ClusterAckType::Dead,
                None,
            ) {
                warn!(%broker, id = %removed.id(), error = %e, "failed to send dead ack");
            }
        }
        self.ctx.dead_letters().push(DeadLetter {
            id: removed.id(),
            destination: self.uid.clone(),
            reason,
            at: now_millis(),
            packet: Arc::clone(removed.packet()),
        });
        warn!(destination = %self.uid, id = %removed.id(), %reason, "message dead-lettered");
        Ok(true)
    }

    /// Dead-letter every expired message that nobody is delivering.
    pub fn reap_expired(&self, now: i64) -> usize {
        let due: Vec<ExpirationInfo> = {
            let mut expirations = self.expirations.lock();
            let keep = expirations.split_off(&ExpirationInfo::new(now.saturating_add(1), SysMessageId::new(i64::MIN, 0)));
            std::mem::replace(&mut *expirations, keep).into_iter().collect()
        };
        let mut reaped = 0;
        for info in due {
            let Some(reference) = self.message(info.id) else {
                continue;
            };
            if reference.any_in_delivery() {
                // the delivery or ack path deals with it
                self.expirations.lock().insert(info);
                continue;
            }
            match self.remove_dead_message(&reference, RemoveReason::Expired) {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(e) => warn!(id = %info.id, error = %e, "failed to remove expired message"),
            }
        }
        if reaped > 0 {
            info!(destination = %self.uid, reaped, "expired messages removed");
        }
        reaped
    }

    /// Remove every message that is not being delivered.
    pub fn purge(&self) -> Result<usize> {
        let ids: Vec<_> = self
            .messages
            .lock()
            .values()
            .filter(|r| !r.any_in_delivery())
            .map(|r| r.id())
            .collect();
        let mut purged = 0;
        for id in ids {
            if self.remove_message(id, RemoveReason::Purged)?.is_some() {
                purged += 1;
            }
        }
        info!(destination = %self.uid, purged, "destination purged");
        Ok(purged)
    }

    /// Attach a consumer (or subscription record) to this destination.
    pub fn add_consumer(&self, consumer: &Arc<Consumer>) -> Result<()> {
        match &self.kind {
            DestinationKind::Queue(queue) => {
                let settings = self.settings();
                let position =
                    queue.get_position(&self.uid, &settings, self.ctx.cluster().as_ref(), consumer)?;
                consumer.set_position(Some(position));
                self.consumers
                    .write()
                    .insert(consumer.uid(), Arc::clone(consumer));
                queue.consumer_list_changed(
                    &self.uid,
                    &settings,
                    self.ctx.cluster().as_ref(),
                    &self.consumers(),
                );
            }
            DestinationKind::Topic(topic) => {
                self.consumers
                    .write()
                    .insert(consumer.uid(), Arc::clone(consumer));
                topic.add(consumer);
                if consumer.subscription().is_some() {
                    self.load_subscription(consumer);
                }
            }
        }
        if let Err(e) = self.ctx.cluster().create_consumer(&consumer.announcement()) {
            warn!(consumer = %consumer.uid(), error = %e, "failed to announce consumer");
        }
        info!(destination = %self.uid, consumer = %consumer.uid(), position = ?consumer.position(), "consumer attached");
        consumer.signal();
        Ok(())
    }

    /// Route stored messages a subscription is still interested in.
    fn load_subscription(&self, record: &Consumer) {
        let stored = record.stored_uid();
        let mut references: Vec<_> = self
            .messages
            .lock()
            .values()
            .filter(|r| {
                r.unacked_interests().contains(&stored) && !self.delay.contains(r.id())
            })
            .cloned()
            .collect();
        references.sort_by_key(|r| r.order());
        if !references.is_empty() {
            debug!(destination = %self.uid, subscription = %stored, count = references.len(), "loading stored messages");
            record.route_messages(references, false);
        }
    }

    /// Detach a consumer; on a queue the remaining consumers are rebalanced.
    pub fn remove_consumer(&self, uid: ConsumerUid) -> Option<Arc<Consumer>> {
        let removed = self.consumers.write().remove(&uid)?;
        match &self.kind {
            DestinationKind::Queue(queue) => {
                let settings = self.settings();
                queue.release_position(&self.uid, self.ctx.cluster().as_ref(), &removed);
                queue.consumer_list_changed(
                    &self.uid,
                    &settings,
                    self.ctx.cluster().as_ref(),
                    &self.consumers(),
                );
                self.notify_consumers();
            }
            DestinationKind::Topic(topic) => topic.remove(&removed),
        }
        self.delay.consumer_closed(self);
        info!(destination = %self.uid, consumer = %uid, "consumer detached");
        Some(removed)
    }

    /// Acknowledge every message still held for `stored` (unsubscribe).
    pub fn drop_interest(&self, stored: ConsumerUid) -> Result<usize> {
        let references: Vec<_> = self
            .messages
            .lock()
            .values()
            .filter(|r| r.unacked_interests().contains(&stored))
            .cloned()
            .collect();
        let count = references.len();
        for reference in references {
            reference.remove_in_delivery(stored);
            self.acknowledge_message(&reference, stored, stored)?;
        }
        Ok(count)
    }

    /// Put messages back for redelivery in their original order.
    pub fn requeue(&self, references: Vec<Arc<PacketReference>>) {
        if let DestinationKind::Queue(queue) = &self.kind {
            queue
                .pending()
                .add_all_ordered(references.into_iter().filter(|r| !r.is_destroyed()));
            self.notify_consumers();
        }
    }

    pub fn compare_rates(&self, now: i64) -> RateComparison {
        self.rates.compare(now)
    }

    /// Prefetch to grant a remote consumer right now.
    pub fn remote_prefetch_limit(&self, now: i64) -> usize {
        remote_prefetch_limit(self.max_prefetch(), self.compare_rates(now))
    }

    pub fn metrics(&self) -> DestinationMetrics {
        DestinationMetrics {
            name: self.uid.name().to_string(),
            kind: self.uid.kind(),
            messages: self.message_count(),
            bytes: self.bytes(),
            pending: self.pending_len(),
            delayed: self.delay.len(),
            consumers: self.consumer_count(),
            messages_in: self.rates.messages_in(),
            messages_out: self.rates.messages_out(),
            created: self.created,
            queue: self.queue_state().map(|q| q.stats().snapshot()),
        }
    }

    /// Give this destination its own settings.
    pub fn update_settings(&self, settings: DestinationSettings) -> Result<()> {
        settings.validate()?;
        self.custom_settings.store(true, Ordering::Release);
        self.install_settings(settings);
        Ok(())
    }

    /// Broker-wide defaults changed; ignored when the destination has its own.
    pub(crate) fn apply_defaults(&self, settings: &DestinationSettings) {
        if self.custom_settings.load(Ordering::Acquire) {
            return;
        }
        self.install_settings(settings.clone());
    }

    fn install_settings(&self, settings: DestinationSettings) {
        *self.settings.write() = settings.clone();
        if let DestinationKind::Queue(queue) = &self.kind {
            queue.consumer_list_changed(
                &self.uid,
                &settings,
                self.ctx.cluster().as_ref(),
                &self.consumers(),
            );
        }
        debug!(destination = %self.uid, "destination settings updated");
        self.notify_consumers();
    }

    /// Reload a message from the store after a restart.
    pub(crate) fn restore(self: &Arc<Self>, packet: Packet, interests: &[ConsumerUid]) -> Result<()> {
        let now = now_millis();
        let order = self.ctx.order().next();
        let reference = Arc::new(PacketReference::new(packet, order));
        reference.set_redelivered();
        reference.store(interests);
        self.ctx.refs().insert(&reference);
        self.messages
            .lock()
            .insert(reference.id(), Arc::clone(&reference));
        self.bytes.fetch_add(reference.size(), Ordering::AcqRel);
        if let Some(expiration) = reference.expiration() {
            self.expirations
                .lock()
                .insert(ExpirationInfo::new(expiration, reference.id()));
        }
        if !reference.is_delivery_due(now) {
            self.delay.add_message(self, &reference);
            return Ok(());
        }
        if self.is_queue() {
            self.enqueue(reference);
        } else {
            let targets: Vec<_> = interests.iter().filter_map(|uid| self.consumer(*uid)).collect();
            self.forward_message(&targets, &reference);
        }
        Ok(())
    }

    /// Accept a message forwarded by another broker for local consumers.
    ///
    /// A copy with the same id replaces the earlier one; acknowledgments still
    /// pending for the earlier copy then fail as requeued to `consumers[0]`.
    pub fn put_remote_message(
        self: &Arc<Self>,
        packet: Packet,
        broker_address: &str,
        consumers: &[ConsumerUid],
    ) -> Result<Arc<PacketReference>> {
        if let Some(old) = self.message(packet.id) {
            if !old.is_local() {
                debug!(destination = %self.uid, id = %old.id(), "remote message overridden");
                self.remove_message(old.id(), RemoveReason::Overridden)?;
            }
        }
        let queued = self.queue_message(packet, Some(broker_address))?;
        let reference = queued.reference;
        if let Some(owner) = consumers.first() {
            reference.assign_owner(*owner);
        }
        if self.is_queue() {
            reference.store(&[ConsumerUid::QUEUE]);
            if reference.is_delivery_due(now_millis()) {
                self.enqueue(Arc::clone(&reference));
            } else {
                self.delay.add_message(self, &reference);
            }
            return Ok(reference);
        }
        let targets: Vec<_> = consumers.iter().filter_map(|uid| self.consumer(*uid)).collect();
        let interests: Vec<_> = targets.iter().map(|c| c.stored_uid()).collect();
        if interests.is_empty() {
            self.remove_message(reference.id(), RemoveReason::NoInterest)?;
            return Ok(reference);
        }
        reference.store(&interests);
        if reference.is_delivery_due(now_millis()) {
            self.forward_message(&targets, &reference);
        } else {
            self.delay.add_message(self, &reference);
        }
        Ok(reference)
    }

    /// Remove every message and stop the delay timer.
    pub(crate) fn destroy(&self) -> Result<usize> {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return Ok(0);
        }
        self.delay.stop();
        let ids: Vec<_> = self.messages.lock().keys().copied().collect();
        let mut removed = 0;
        for id in ids {
            if self.remove_message(id, RemoveReason::Purged)?.is_some() {
                removed += 1;
            }
        }
        self.consumers.write().clear();
        info!(destination = %self.uid, removed, "destination destroyed");
        Ok(removed)
    }

    /// Drop everything this destination holds without touching the store.
    pub(crate) fn shutdown(&self) {
        self.valid.store(false, Ordering::Release);
        self.delay.stop();
        self.consumers.write().clear();
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("uid", &self.uid)
            .field("messages", &self.message_count())
            .field("consumers", &self.consumer_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests;
