use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::consumer::Consumer;
use crate::ids::ConsumerUid;
use crate::message::Packet;

/// Topic-only state: registered consumers grouped by selector text, so each
/// distinct selector is evaluated once per message.
#[derive(Debug, Default)]
pub struct TopicState {
    groups: RwLock<BTreeMap<Option<String>, Vec<ConsumerUid>>>,
}

impl TopicState {
    pub(super) fn add(&self, consumer: &Consumer) {
        let key = consumer.selector_source().map(str::to_string);
        let mut groups = self.groups.write();
        let members = groups.entry(key).or_default();
        if !members.contains(&consumer.uid()) {
            members.push(consumer.uid());
        }
    }

    pub(super) fn remove(&self, consumer: &Consumer) {
        let key = consumer.selector_source().map(str::to_string);
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(&key) {
            members.retain(|uid| *uid != consumer.uid());
            if members.is_empty() {
                groups.remove(&key);
            }
        }
    }

    /// Consumers that should get `packet`, in consumer id order.
    pub(super) fn route(
        &self,
        packet: &Packet,
        consumers: &BTreeMap<ConsumerUid, Arc<Consumer>>,
    ) -> Vec<Arc<Consumer>> {
        let groups = self.groups.read();
        let mut targets = Vec::new();
        for members in groups.values() {
            let live: Vec<&Arc<Consumer>> =
                members.iter().filter_map(|uid| consumers.get(uid)).collect();
            let Some(first) = live.first() else {
                continue;
            };
            if !first.matches(packet) {
                continue;
            }
            targets.extend(
                live.into_iter()
                    .filter(|c| !produced_locally(c, packet))
                    .cloned(),
            );
        }
        targets.sort_by_key(|c| c.uid());
        targets.dedup_by_key(|c| c.uid());
        targets
    }
}

/// No-local check: durable subscriptions compare client ids, everything else
/// compares the producing connection.
fn produced_locally(consumer: &Consumer, packet: &Packet) -> bool {
    if !consumer.no_local() {
        return false;
    }
    let durable = consumer.subscription().is_some_and(|s| s.is_durable());
    if durable {
        consumer.client_id().is_some() && consumer.client_id() == packet.client_id.as_deref()
    } else {
        consumer.connection().is_some() && consumer.connection() == packet.producer_connection
    }
}
