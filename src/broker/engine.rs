use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::BrokerContext;
use crate::cluster::{ClusterBroadcast, StandaloneCluster};
use crate::config::{DestinationSettings, Settings};
use crate::consumer::{
    Consumer, ConsumerInit, ConsumerSpec, Subscription, SubscriptionKey, SubscriptionSpec,
};
use crate::destination::{DeadLetter, Destination, DestinationMetrics};
use crate::ids::{
    ConnectionUid, ConsumerUid, DestinationType, DestinationUid, SessionUid, SysMessageId,
    TransactionUid,
};
use crate::message::{Packet, PacketReference};
use crate::monitor::{self, BrokerMetrics};
use crate::persistence::{MemoryStore, RemoveReason, Store};
use crate::selector::Selector;
use crate::session::Session;
use crate::transaction::ConsumedMessage;
use crate::utils::{BrokerError, Result, now_millis};

/// What the producer gets back for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub id: SysMessageId,
    /// The destination is over its limits; the producer should slow down.
    pub pause_producer: bool,
}

/// Represents the broker: the entry point to the routing core.
///
/// The broker owns the `BrokerContext` and wires its parts together. It
/// creates destinations (explicitly or on first use), sessions and consumers,
/// accepts published messages, drives transactions and runs the background
/// tasks (expiration reaping and metric snapshots).
///
/// Every operation is synchronous apart from the background tasks, which need
/// a tokio runtime and are only started by `start_background`.
pub struct Broker {
    ctx: Arc<BrokerContext>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Creates a broker over the given store and cluster collaborator.
    ///
    /// Destinations follow broker-wide setting updates unless they were given
    /// settings of their own.
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        cluster: Arc<dyn ClusterBroadcast>,
    ) -> Result<Self> {
        let ctx = BrokerContext::new(settings, store, cluster)?;
        let weak: Weak<BrokerContext> = Arc::downgrade(&ctx);
        ctx.config().subscribe(Box::new(move |old, new| {
            if old.destinations == new.destinations {
                return;
            }
            let Some(ctx) = weak.upgrade() else {
                return;
            };
            for destination in ctx.destinations() {
                destination.apply_defaults(&new.destinations);
            }
        }));
        info!(instance = %ctx.instance(), broker = %ctx.settings().broker.name, "broker created");
        Ok(Self {
            ctx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// A broker with an in-memory store and no cluster.
    pub fn standalone(settings: Settings) -> Result<Self> {
        Self::new(
            settings,
            Arc::new(MemoryStore::new()),
            Arc::new(StandaloneCluster),
        )
    }

    pub fn context(&self) -> &Arc<BrokerContext> {
        &self.ctx
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.ctx.settings()
    }

    /// Validate and install new broker-wide settings.
    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        self.ctx.config().update(settings)
    }

    /// Interned id for a destination name.
    pub fn destination_uid(&self, name: &str, kind: DestinationType) -> Result<DestinationUid> {
        self.ctx.uids().get(name, kind)
    }

    /// Creates a destination, or returns the existing one.
    ///
    /// A new topic picks up every wildcard consumer and subscription whose
    /// pattern matches it.
    pub fn create_destination(
        &self,
        uid: &DestinationUid,
        settings: Option<DestinationSettings>,
    ) -> Result<Arc<Destination>> {
        if let Some(existing) = self.ctx.destination(uid) {
            return Ok(existing);
        }
        let created = Destination::new(Arc::clone(&self.ctx), uid.clone(), settings)?;
        let destination = {
            let mut destinations = self.ctx.registry().destinations.write();
            Arc::clone(destinations.entry(uid.clone()).or_insert(created))
        };
        if !destination.is_queue() {
            self.attach_wildcards(&destination)?;
        }
        Ok(destination)
    }

    fn attach_wildcards(&self, topic: &Arc<Destination>) -> Result<()> {
        let registry = self.ctx.registry();
        let mut matching: Vec<Arc<Consumer>> = registry
            .consumers
            .read()
            .values()
            .filter(|c| c.member_of().is_none())
            .cloned()
            .collect();
        matching.extend(registry.subscriptions.read().values().cloned());
        for consumer in matching {
            let pattern = consumer.destination();
            if pattern.is_wildcard() && pattern.matches(topic.uid()) && topic.consumer(consumer.uid()).is_none() {
                debug!(topic = %topic.uid(), pattern = %pattern, consumer = %consumer.uid(), "wildcard consumer matched new topic");
                topic.add_consumer(&consumer)?;
            }
        }
        Ok(())
    }

    pub fn lookup_destination(&self, uid: &DestinationUid) -> Option<Arc<Destination>> {
        self.ctx.destination(uid)
    }

    fn lookup_or_create(&self, uid: &DestinationUid) -> Result<Arc<Destination>> {
        if let Some(destination) = self.ctx.destination(uid) {
            return Ok(destination);
        }
        if !self.ctx.settings().destinations.auto_create {
            return Err(BrokerError::DestinationNotFound(uid.to_string()));
        }
        self.create_destination(uid, None)
    }

    /// Every destination, sorted by id.
    pub fn destinations(&self) -> Vec<DestinationUid> {
        self.ctx
            .destinations()
            .iter()
            .map(|d| d.uid().clone())
            .collect()
    }

    /// Destroys a destination and every message on it.
    ///
    /// Fails while consumers other than wildcard ones are attached.
    pub fn destroy_destination(&self, uid: &DestinationUid) -> Result<usize> {
        let destination = self
            .ctx
            .destination(uid)
            .ok_or_else(|| BrokerError::DestinationNotFound(uid.to_string()))?;
        let attached = destination
            .consumers()
            .iter()
            .filter(|c| !c.destination().is_wildcard())
            .count();
        if attached > 0 {
            return Err(BrokerError::Unsupported(format!(
                "destination {uid} still has {attached} consumers"
            )));
        }
        self.ctx.registry().destinations.write().remove(uid);
        let removed = destination.destroy()?;
        self.ctx.uids().release(uid);
        Ok(removed)
    }

    pub fn create_session(
        &self,
        connection: ConnectionUid,
        client_id: Option<&str>,
        transacted: bool,
    ) -> Arc<Session> {
        let session = Session::new(Arc::clone(&self.ctx), connection, client_id, transacted);
        self.ctx
            .registry()
            .sessions
            .write()
            .insert(session.uid(), Arc::clone(&session));
        info!(session = %session.uid(), %connection, transacted, "session created");
        session
    }

    pub fn session(&self, uid: SessionUid) -> Option<Arc<Session>> {
        self.ctx.session(uid)
    }

    /// Closes a session: open transactions are rolled back, unacknowledged
    /// messages are released and every consumer is destroyed.
    pub fn close_session(&self, uid: SessionUid) -> Result<()> {
        let session = self
            .ctx
            .session(uid)
            .ok_or(BrokerError::SessionNotFound(uid))?;
        for tid in self.ctx.transactions().open_for_session(uid) {
            if let Err(e) = self.rollback(tid) {
                warn!(session = %uid, %tid, error = %e, "failed to roll back transaction of closing session");
            }
        }
        self.ctx.registry().sessions.write().remove(&uid);
        for consumer in session.close() {
            self.ctx.registry().consumers.write().remove(&consumer.uid());
            self.unregister_consumer(&consumer);
        }
        Ok(())
    }

    /// Creates a consumer on `session`.
    ///
    /// Queue consumers share the queue's pending list. Topic consumers get
    /// messages routed to them directly, or, with a subscription, through the
    /// subscription record keyed by `(client id, name)`. A wildcard topic
    /// consumer is registered with every matching topic.
    pub fn create_consumer(&self, session: SessionUid, spec: ConsumerSpec) -> Result<Arc<Consumer>> {
        let session = self
            .ctx
            .session(session)
            .ok_or(BrokerError::SessionNotFound(session))?;
        if !session.is_valid() {
            return Err(BrokerError::SessionClosed(session.uid()));
        }
        let destination = spec
            .destination
            .clone()
            .ok_or_else(|| BrokerError::InvalidDestination {
                name: String::new(),
                reason: "a consumer needs a destination".to_string(),
            })?;
        let selector = spec
            .selector
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(Selector::compile)
            .transpose()?
            .map(Arc::new);
        let uid = ConsumerUid::new();
        let settings = self.ctx.settings();
        let init = |stored_uid, prefetch, selector, parent, member_of| ConsumerInit {
            uid,
            stored_uid,
            destination: destination.clone(),
            session: Some(session.uid()),
            connection: Some(session.connection()),
            client_id: session.client_id().map(str::to_string),
            selector,
            no_local: spec.no_local,
            ack_mode: spec.ack_mode,
            prefetch,
            remote: spec.remote.clone(),
            parent,
            subscription: None,
            member_of,
        };

        let consumer = match (destination.kind(), &spec.subscription) {
            (DestinationType::Queue, Some(_)) => {
                return Err(BrokerError::Unsupported(
                    "subscriptions are only available on topics".to_string(),
                ));
            }
            (DestinationType::Queue, None) => {
                let queue = self.lookup_or_create(&destination)?;
                let pending = queue
                    .queue_state()
                    .map(|q| Arc::clone(q.pending()))
                    .ok_or_else(|| BrokerError::internal(format!("{destination} has no queue state")))?;
                let prefetch = spec.prefetch.unwrap_or(queue.settings().queue_prefetch);
                let consumer = Consumer::new(
                    Arc::clone(&self.ctx),
                    init(ConsumerUid::QUEUE, prefetch, selector, Some(pending), None),
                );
                queue.add_consumer(&consumer)?;
                consumer
            }
            (DestinationType::Topic, None) => {
                let prefetch = spec.prefetch.unwrap_or(settings.destinations.topic_prefetch);
                let consumer = Consumer::new(
                    Arc::clone(&self.ctx),
                    init(uid, prefetch, selector, None, None),
                );
                self.register_on_topics(&consumer)?;
                consumer
            }
            (DestinationType::Topic, Some(subscription)) => {
                let record = self.subscription_record(&session, &destination, selector, &spec, subscription)?;
                let key = record
                    .subscription()
                    .map(|s| s.key().clone())
                    .ok_or_else(|| BrokerError::internal("subscription record without subscription"))?;
                let prefetch = spec.prefetch.unwrap_or(settings.destinations.topic_prefetch);
                let consumer = Consumer::new(
                    Arc::clone(&self.ctx),
                    init(
                        record.stored_uid(),
                        prefetch,
                        None,
                        Some(Arc::clone(record.pending_list())),
                        Some(key),
                    ),
                );
                if let Some(subscription) = record.subscription() {
                    subscription.attach(Arc::clone(&consumer))?;
                }
                consumer
            }
        };

        self.ctx
            .registry()
            .consumers
            .write()
            .insert(uid, Arc::clone(&consumer));
        if let Err(e) = session.attach_consumer(&consumer) {
            self.ctx.registry().consumers.write().remove(&uid);
            consumer.destroy_consumer(Vec::new(), consumer.acks_on_destroy());
            self.unregister_consumer(&consumer);
            return Err(e);
        }
        if monitor::is_metrics_topic(&destination) {
            if let Some(topic) = self.ctx.destination(&destination) {
                if let Err(e) = monitor::send_snapshot_to(&self.ctx, &topic, &consumer, now_millis()) {
                    debug!(topic = %destination, error = %e, "no initial metrics snapshot");
                }
            }
        }
        info!(consumer = %uid, destination = %destination, session = %session.uid(), "consumer created");
        Ok(consumer)
    }

    /// Finds the subscription record for a subscribing consumer, creating it
    /// or replacing it when the subscription's definition changed.
    fn subscription_record(
        &self,
        session: &Session,
        destination: &DestinationUid,
        selector: Option<Arc<Selector>>,
        spec: &ConsumerSpec,
        subscription: &SubscriptionSpec,
    ) -> Result<Arc<Consumer>> {
        if subscription.durable && !subscription.shared && session.client_id().is_none() {
            return Err(BrokerError::Unsupported(
                "a durable subscription needs a client id".to_string(),
            ));
        }
        let key = SubscriptionKey::new(session.client_id(), &subscription.name);
        if let Some(record) = self.ctx.subscription(&key) {
            let same = record.destination() == destination
                && record.selector_source() == selector.as_ref().map(|s| s.source())
                && record.no_local() == spec.no_local;
            if same {
                return Ok(record);
            }
            if record.subscription().is_some_and(|s| s.has_children()) {
                return Err(BrokerError::SubscriptionInUse(key.to_string()));
            }
            info!(subscription = %key, "subscription changed, replacing it");
            self.remove_subscription(&key)?;
        }

        let record = Consumer::new(
            Arc::clone(&self.ctx),
            ConsumerInit {
                uid: key.stored_uid(),
                stored_uid: key.stored_uid(),
                destination: destination.clone(),
                session: None,
                connection: Some(session.connection()),
                client_id: session.client_id().map(str::to_string),
                selector,
                no_local: spec.no_local,
                ack_mode: Default::default(),
                prefetch: -1,
                remote: None,
                parent: None,
                subscription: Some(Subscription::new(
                    key.clone(),
                    subscription.durable,
                    subscription.shared,
                )),
                member_of: None,
            },
        );
        self.register_on_topics(&record)?;
        self.ctx
            .registry()
            .subscriptions
            .write()
            .insert(key.clone(), Arc::clone(&record));
        info!(subscription = %key, durable = subscription.durable, shared = subscription.shared, "subscription created");
        Ok(record)
    }

    /// Attach a plain topic consumer or subscription record to its topic, or
    /// to every existing topic its pattern matches.
    fn register_on_topics(&self, consumer: &Arc<Consumer>) -> Result<()> {
        let pattern = consumer.destination();
        if !pattern.is_wildcard() {
            return self.lookup_or_create(pattern)?.add_consumer(consumer);
        }
        for topic in self.ctx.destinations() {
            if !topic.is_queue() && pattern.matches(topic.uid()) {
                topic.add_consumer(consumer)?;
            }
        }
        Ok(())
    }

    fn deregister_from_destinations(&self, consumer: &Consumer) {
        let pattern = consumer.destination();
        if !pattern.is_wildcard() {
            if let Some(destination) = self.ctx.destination(pattern) {
                destination.remove_consumer(consumer.uid());
            }
            return;
        }
        for destination in self.ctx.destinations() {
            if pattern.matches(destination.uid()) {
                destination.remove_consumer(consumer.uid());
            }
        }
    }

    /// Clean up after a destroyed consumer.
    fn unregister_consumer(&self, consumer: &Consumer) {
        let Some(key) = consumer.member_of() else {
            self.deregister_from_destinations(consumer);
            return;
        };
        let Some(record) = self.ctx.subscription(key) else {
            return;
        };
        let Some(subscription) = record.subscription() else {
            return;
        };
        let remaining = subscription.detach(consumer.uid());
        if remaining == 0 && !subscription.is_durable() {
            if let Err(e) = self.remove_subscription(key) {
                warn!(subscription = %key, error = %e, "failed to remove subscription");
            }
        } else {
            record.signal();
        }
    }

    /// Drop a subscription record and acknowledge everything it still holds.
    fn remove_subscription(&self, key: &SubscriptionKey) -> Result<usize> {
        let Some(record) = self.ctx.registry().subscriptions.write().remove(key) else {
            return Ok(0);
        };
        self.deregister_from_destinations(&record);
        // a record has no parent, so its held list is just discarded; the
        // interests themselves are acknowledged and counted below
        record.destroy_consumer(Vec::new(), false);
        let mut dropped = 0;
        for destination in self.ctx.destinations() {
            if record.destination().matches(destination.uid()) {
                dropped += destination.drop_interest(record.stored_uid())?;
            }
        }
        info!(subscription = %key, dropped, "subscription removed");
        Ok(dropped)
    }

    /// Removes a durable subscription. Fails while a consumer is attached.
    pub fn unsubscribe(&self, client_id: Option<&str>, name: &str) -> Result<usize> {
        let key = SubscriptionKey::new(client_id, name);
        let record = self
            .ctx
            .subscription(&key)
            .ok_or(BrokerError::ConsumerNotFound(key.stored_uid()))?;
        if record.subscription().is_some_and(|s| s.has_children()) {
            return Err(BrokerError::SubscriptionInUse(key.to_string()));
        }
        self.remove_subscription(&key)
    }

    /// Closes one consumer. Messages delivered after `last_seen` are treated
    /// as never seen by the client.
    pub fn close_consumer(&self, uid: ConsumerUid, last_seen: Option<SysMessageId>) -> Result<()> {
        let consumer = self
            .ctx
            .consumer(uid)
            .ok_or(BrokerError::ConsumerNotFound(uid))?;
        match consumer.session().and_then(|s| self.ctx.session(s)) {
            Some(session) => {
                session.detach_consumer(uid, last_seen, false)?;
            }
            None => {
                consumer.destroy_consumer(Vec::new(), consumer.acks_on_destroy());
            }
        }
        self.ctx.registry().consumers.write().remove(&uid);
        self.unregister_consumer(&consumer);
        info!(consumer = %uid, "consumer closed");
        Ok(())
    }

    /// The client is ready for more messages on `consumer`.
    pub fn resume_flow(&self, consumer: ConsumerUid, prefetch: Option<i32>) -> Result<()> {
        let consumer = self
            .ctx
            .consumer(consumer)
            .ok_or(BrokerError::ConsumerNotFound(consumer))?;
        consumer.resume_flow(prefetch);
        Ok(())
    }

    /// A message with a fresh id for `destination`.
    pub fn new_message(&self, destination: &DestinationUid, body: impl Into<Vec<u8>>) -> Packet {
        Packet::new(self.ctx.ids().next_id(), destination.clone(), body)
    }

    /// Accepts a message from a producer.
    ///
    /// Inside a transaction the message is stored but only routed when the
    /// transaction commits.
    pub fn publish(&self, packet: Packet, tid: Option<TransactionUid>) -> Result<PublishReceipt> {
        let destination = self.lookup_or_create(&packet.destination)?;
        let queued = destination.queue_message(packet, None)?;
        let id = queued.reference.id();
        let routed = match tid {
            Some(tid) => self
                .ctx
                .transactions()
                .add_produced(tid, Arc::clone(&queued.reference)),
            None => destination.deliver(&queued.reference),
        };
        if let Err(e) = routed {
            if let Err(remove) = destination.remove_message(id, RemoveReason::Undeliverable) {
                warn!(%id, error = %remove, "failed to remove unroutable message");
            }
            return Err(e);
        }
        Ok(PublishReceipt {
            id,
            pause_producer: queued.pause_producer,
        })
    }

    /// Accepts a message forwarded by another broker for local consumers.
    pub fn remote_message(
        &self,
        packet: Packet,
        broker_address: &str,
        consumers: &[ConsumerUid],
    ) -> Result<Arc<PacketReference>> {
        let destination = self.lookup_or_create(&packet.destination)?;
        destination.put_remote_message(packet, broker_address, consumers)
    }

    pub fn acknowledge(
        &self,
        session: SessionUid,
        consumer: ConsumerUid,
        id: SysMessageId,
        tid: Option<TransactionUid>,
    ) -> Result<()> {
        self.ctx
            .session(session)
            .ok_or(BrokerError::SessionNotFound(session))?
            .acknowledge(consumer, id, tid)
    }

    /// Cumulative acknowledgment: everything the session delivered up to
    /// and including `id`.
    pub fn acknowledge_to(
        &self,
        session: SessionUid,
        consumer: ConsumerUid,
        id: SysMessageId,
    ) -> Result<usize> {
        self.ctx
            .session(session)
            .ok_or(BrokerError::SessionNotFound(session))?
            .acknowledge_to(consumer, id)
    }

    /// The client could not process `id`; see `SessionOp::handle_undeliverable`.
    pub fn undeliverable(
        &self,
        session: SessionUid,
        consumer: ConsumerUid,
        id: SysMessageId,
        delivery_count: u32,
        count_only: bool,
    ) -> Result<()> {
        self.ctx
            .session(session)
            .ok_or(BrokerError::SessionNotFound(session))?
            .undeliverable(consumer, id, delivery_count, count_only)
    }

    /// The client declared `id` dead.
    pub fn dead(
        &self,
        session: SessionUid,
        consumer: ConsumerUid,
        id: SysMessageId,
        reason: RemoveReason,
    ) -> Result<bool> {
        self.ctx
            .session(session)
            .ok_or(BrokerError::SessionNotFound(session))?
            .dead(consumer, id, reason)
    }

    pub fn begin_transaction(&self, session: SessionUid) -> Result<TransactionUid> {
        let session = self
            .ctx
            .session(session)
            .ok_or(BrokerError::SessionNotFound(session))?;
        Ok(self.ctx.transactions().begin(session.uid()))
    }

    pub fn prepare(&self, tid: TransactionUid) -> Result<()> {
        self.ctx.transactions().prepare(tid)
    }

    /// Commits a transaction: produced messages are routed, consumed ones
    /// acknowledged.
    pub fn commit(&self, tid: TransactionUid) -> Result<()> {
        let work = self.ctx.transactions().commit(tid)?;
        for reference in &work.produced {
            let Some(destination) = self.ctx.destination(reference.destination()) else {
                warn!(%tid, id = %reference.id(), "destination of a committed message is gone");
                continue;
            };
            if let Err(e) = destination.deliver(reference) {
                warn!(%tid, id = %reference.id(), error = %e, "failed to route committed message");
            }
        }
        let acknowledged = match work.session.and_then(|s| self.ctx.session(s)) {
            Some(session) => session.commit(tid)?,
            None => 0,
        };
        let orphans = work.orphan_acks.len();
        for orphan in work.orphan_acks {
            self.replay_orphan_ack(orphan);
        }
        self.ctx.transactions().remove(tid);
        info!(%tid, produced = work.produced.len(), acknowledged, orphans, "transaction committed");
        Ok(())
    }

    fn replay_orphan_ack(&self, orphan: ConsumedMessage) {
        let Some(reference) = self.ctx.refs().get_by_id(orphan.id) else {
            return;
        };
        reference.remove_in_delivery(orphan.stored);
        if let Err(e) = self.ctx.acknowledge(&reference, orphan.consumer, orphan.stored) {
            warn!(id = %orphan.id, error = %e, "failed to replay orphaned ack");
        }
    }

    /// Rolls a transaction back: produced messages are dropped, consumed ones
    /// made available again.
    pub fn rollback(&self, tid: TransactionUid) -> Result<()> {
        let work = self.ctx.transactions().rollback(tid)?;
        for reference in &work.produced {
            if let Some(destination) = self.ctx.destination(reference.destination()) {
                destination.remove_message(reference.id(), RemoveReason::RolledBack)?;
            }
        }
        let released = match work.session.and_then(|s| self.ctx.session(s)) {
            Some(session) => session.rollback(tid),
            None => 0,
        };
        for orphan in work.orphan_acks {
            self.release_orphan(orphan);
        }
        self.ctx.transactions().remove(tid);
        info!(%tid, produced = work.produced.len(), released, "transaction rolled back");
        Ok(())
    }

    /// A message consumed in a rolled back transaction whose session is gone.
    fn release_orphan(&self, orphan: ConsumedMessage) {
        let Some(reference) = self.ctx.refs().get_by_id(orphan.id) else {
            return;
        };
        let Some(destination) = self.ctx.destination(reference.destination()) else {
            return;
        };
        reference.remove_in_delivery(orphan.stored);
        reference.set_redelivered();
        if destination.is_queue() {
            destination.requeue(vec![reference]);
            return;
        }
        let routed = destination
            .consumer(orphan.stored)
            .is_some_and(|c| c.route_message(Arc::clone(&reference), true, false));
        if !routed {
            if let Err(e) = destination.acknowledge_message(&reference, orphan.consumer, orphan.stored) {
                warn!(id = %orphan.id, error = %e, "failed to release orphaned message");
            }
        }
    }

    /// Reload what the store still holds after a restart.
    pub fn recover(&self) -> Result<usize> {
        let mut restored = 0;
        for stored in self.ctx.store().messages()? {
            let id = stored.packet.id;
            let interests = stored.unacked();
            if interests.is_empty() {
                self.ctx.store().remove_message(id, RemoveReason::Acknowledged)?;
                continue;
            }
            let destination = match self.lookup_or_create(&stored.packet.destination) {
                Ok(destination) => destination,
                Err(e) => {
                    warn!(%id, error = %e, "stored message has no destination");
                    continue;
                }
            };
            if destination.message(id).is_some() {
                continue;
            }
            destination.restore(stored.packet, &interests)?;
            restored += 1;
        }
        info!(restored, "messages recovered from store");
        Ok(restored)
    }

    /// Dead-letter every expired message that is not being delivered.
    pub fn reap_expired(&self) -> usize {
        reap_expired(&self.ctx, now_millis())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.ctx.dead_letters().snapshot()
    }

    pub fn metrics(&self) -> BrokerMetrics {
        BrokerMetrics::collect(&self.ctx, now_millis())
    }

    pub fn destination_metrics(&self, uid: &DestinationUid) -> Option<DestinationMetrics> {
        self.ctx.destination(uid).map(|d| d.metrics())
    }

    /// Starts the expiration reaper and, when enabled, the metrics monitor.
    /// Does nothing outside a tokio runtime.
    pub fn start_background(&self) {
        let Ok(handle) = Handle::try_current() else {
            warn!("no tokio runtime, background tasks not started");
            return;
        };
        let settings = self.ctx.settings();
        let mut tasks = self.tasks.lock();

        let interval = Duration::from_millis(settings.timers.expiration_interval_ms);
        let weak = Arc::downgrade(&self.ctx);
        tasks.push(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                reap_expired(&ctx, now_millis());
            }
        }));

        if settings.timers.monitor_enabled {
            let interval = Duration::from_secs(settings.timers.monitor_interval_secs);
            tasks.push(monitor::spawn(Arc::downgrade(&self.ctx), interval));
        }
        info!(tasks = tasks.len(), "background tasks started");
    }

    /// Stops background work, closes every session and releases the
    /// context's registries. Stored messages stay in the store.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let sessions: Vec<_> = self
            .ctx
            .registry()
            .sessions
            .read()
            .keys()
            .copied()
            .collect();
        for session in sessions {
            if let Err(e) = self.close_session(session) {
                debug!(%session, error = %e, "session already closed");
            }
        }
        for destination in self.ctx.destinations() {
            destination.shutdown();
        }
        self.ctx.clear();
        info!(instance = %self.ctx.instance(), "broker shut down");
    }
}

fn reap_expired(ctx: &BrokerContext, now: i64) -> usize {
    ctx.destinations()
        .iter()
        .map(|destination| destination.reap_expired(now))
        .sum()
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("ctx", &self.ctx)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}
