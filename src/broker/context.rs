use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::cluster::ClusterBroadcast;
use crate::config::{ConfigWatcher, Settings};
use crate::consumer::{Consumer, SubscriptionKey};
use crate::destination::{DeadLetter, DeadLetterQueue, Destination};
use crate::ids::{ConsumerUid, DestinationUid, MessageIdGenerator, SessionUid, UidInterner};
use crate::message::{OrderSequence, PacketReference, RefTable};
use crate::persistence::{RemoveReason, Store};
use crate::session::Session;
use crate::transaction::TransactionList;
use crate::utils::{Result, now_millis};

/// Registries of live destinations, consumers, sessions and subscriptions.
#[derive(Debug, Default)]
pub struct Registry {
    pub(crate) destinations: RwLock<HashMap<DestinationUid, Arc<Destination>>>,
    pub(crate) consumers: RwLock<HashMap<ConsumerUid, Arc<Consumer>>>,
    pub(crate) sessions: RwLock<HashMap<SessionUid, Arc<Session>>>,
    pub(crate) subscriptions: RwLock<HashMap<SubscriptionKey, Arc<Consumer>>>,
}

impl Registry {
    fn clear(&self) {
        self.destinations.write().clear();
        self.consumers.write().clear();
        self.sessions.write().clear();
        self.subscriptions.write().clear();
    }
}

/// Everything the routing core shares, owned explicitly instead of living
/// in process-wide statics.
pub struct BrokerContext {
    instance: String,
    config: ConfigWatcher,
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterBroadcast>,
    refs: RefTable,
    ids: MessageIdGenerator,
    order: Arc<OrderSequence>,
    uids: UidInterner,
    registry: Registry,
    transactions: TransactionList,
    dead_letters: DeadLetterQueue,
}

impl BrokerContext {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        cluster: Arc<dyn ClusterBroadcast>,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            instance: format!("broker-{}", uuid::Uuid::new_v4()),
            config: ConfigWatcher::new(settings)?,
            store,
            cluster,
            refs: RefTable::new(),
            ids: MessageIdGenerator::new(),
            order: Arc::new(OrderSequence::new()),
            uids: UidInterner::new(),
            registry: Registry::default(),
            transactions: TransactionList::new(),
            dead_letters: DeadLetterQueue::default(),
        }))
    }

    /// Unique for each broker run.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn config(&self) -> &ConfigWatcher {
        &self.config
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.config.current()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterBroadcast> {
        &self.cluster
    }

    pub fn refs(&self) -> &RefTable {
        &self.refs
    }

    pub fn ids(&self) -> &MessageIdGenerator {
        &self.ids
    }

    pub fn order(&self) -> &Arc<OrderSequence> {
        &self.order
    }

    pub fn uids(&self) -> &UidInterner {
        &self.uids
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transactions(&self) -> &TransactionList {
        &self.transactions
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub fn destination(&self, uid: &DestinationUid) -> Option<Arc<Destination>> {
        self.registry.destinations.read().get(uid).cloned()
    }

    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        let mut destinations: Vec<_> = self.registry.destinations.read().values().cloned().collect();
        destinations.sort_by(|a, b| a.uid().cmp(b.uid()));
        destinations
    }

    pub fn session(&self, uid: SessionUid) -> Option<Arc<Session>> {
        self.registry.sessions.read().get(&uid).cloned()
    }

    pub fn consumer(&self, uid: ConsumerUid) -> Option<Arc<Consumer>> {
        self.registry.consumers.read().get(&uid).cloned()
    }

    pub fn subscription(&self, key: &SubscriptionKey) -> Option<Arc<Consumer>> {
        self.registry.subscriptions.read().get(key).cloned()
    }

    /// Acknowledge through the message's own destination.
    pub fn acknowledge(
        &self,
        reference: &Arc<PacketReference>,
        consumer: ConsumerUid,
        stored: ConsumerUid,
    ) -> Result<bool> {
        match self.destination(reference.destination()) {
            Some(destination) => destination.acknowledge_message(reference, consumer, stored),
            None => Ok(false),
        }
    }

    /// Dead-letter a message, even when its destination is already gone.
    pub fn remove_dead_message(&self, reference: &Arc<PacketReference>, reason: RemoveReason) {
        if let Some(destination) = self.destination(reference.destination()) {
            if let Err(e) = destination.remove_dead_message(reference, reason) {
                warn!(id = %reference.id(), error = %e, "failed to dead-letter message");
            }
            return;
        }
        reference.mark_dead();
        reference.destroy();
        if let Some(handle) = reference.handle() {
            self.refs.remove(handle);
        }
        self.dead_letters.push(DeadLetter {
            id: reference.id(),
            destination: reference.destination().clone(),
            reason,
            at: now_millis(),
            packet: Arc::clone(reference.packet()),
        });
    }

    /// Drop every registry entry, breaking the context <-> destination and
    /// context <-> consumer reference cycles.
    pub(crate) fn clear(&self) {
        self.registry.clear();
        self.refs.clear();
        self.transactions.clear();
    }
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerContext")
            .field("instance", &self.instance)
            .field("destinations", &self.registry.destinations.read().len())
            .field("consumers", &self.registry.consumers.read().len())
            .field("sessions", &self.registry.sessions.read().len())
            .field("refs", &self.refs.len())
            .field("store", &self.store)
            .field("cluster", &self.cluster)
            .finish()
    }
}
