use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::Serialize;

use crate::ids::{ConsumerUid, DestinationUid, SysMessageId};
use crate::message::{Packet, RefHandle};

/// Acknowledgment progress of one stored consumer's interest in a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    #[default]
    Routed,
    Delivered,
    Consumed,
    Acknowledged,
}

/// What `PacketReference::delivered` decided about a message being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveredOutcome {
    /// Send it and wait for the client's acknowledgment.
    Deliver,
    /// Acknowledged as it was sent (no-ack consumer). `removable` is set on the
    /// call that acknowledged the last outstanding interest.
    AckedOnDelivery { removable: bool },
    /// Expired before it went out.
    Dead,
    /// Removed from its destination concurrently.
    Gone,
}

#[derive(Debug, Default)]
struct Interest {
    state: AckState,
    in_delivery: bool,
    deliveries: u32,
    rollbacks: u32,
}

#[derive(Debug, Default)]
struct RefState {
    interests: HashMap<ConsumerUid, Interest>,
    acked: usize,
    owner: Option<ConsumerUid>,
    redelivered: bool,
    dead: bool,
    invalid: bool,
    destroyed: bool,
}

/// Shared handle to one stored message.
///
/// Interest is tracked per *stored* consumer id: the shared queue identity for
/// queue messages, the subscription id for subscriptions, the consumer id for
/// plain topic consumers.
pub struct PacketReference {
    packet: Arc<Packet>,
    order: u64,
    size: u64,
    broker_address: Option<String>,
    state: Mutex<RefState>,
    handle: OnceLock<RefHandle>,
}

impl PacketReference {
    /// Reference to a message produced on this broker.
    pub fn new(packet: Packet, order: u64) -> Self {
        Self::build(packet, order, None)
    }

    /// Reference to a message forwarded from the broker at `broker_address`.
    pub fn remote(packet: Packet, order: u64, broker_address: &str) -> Self {
        Self::build(packet, order, Some(broker_address.to_string()))
    }

    fn build(packet: Packet, order: u64, broker_address: Option<String>) -> Self {
        let size = packet.byte_size();
        Self {
            packet: Arc::new(packet),
            order,
            size,
            broker_address,
            state: Mutex::new(RefState::default()),
            handle: OnceLock::new(),
        }
    }

    pub fn id(&self) -> SysMessageId {
        self.packet.id
    }

    pub fn destination(&self) -> &DestinationUid {
        &self.packet.destination
    }

    pub fn priority(&self) -> u8 {
        self.packet.priority
    }

    pub fn packet(&self) -> &Arc<Packet> {
        &self.packet
    }

    /// Arrival-order key, used to restore relative order on replay.
    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_persistent(&self) -> bool {
        self.packet.persistent
    }

    pub fn is_local(&self) -> bool {
        self.broker_address.is_none()
    }

    pub fn broker_address(&self) -> Option<&str> {
        self.broker_address.as_deref()
    }

    pub fn expiration(&self) -> Option<i64> {
        self.packet.expiration
    }

    pub fn delivery_time(&self) -> Option<i64> {
        self.packet.delivery_time
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.packet.is_expired_at(now)
    }

    pub fn is_delivery_due(&self, now: i64) -> bool {
        self.packet.delivery_time.is_none_or(|t| t <= now)
    }

    pub fn handle(&self) -> Option<RefHandle> {
        self.handle.get().copied()
    }

    pub(crate) fn set_handle(&self, handle: RefHandle) {
        let _ = self.handle.set(handle);
    }

    /// Record the stored consumers interested in this message.
    pub fn store(&self, consumers: &[ConsumerUid]) {
        let mut state = self.state.lock();
        for uid in consumers {
            state.interests.entry(*uid).or_default();
        }
    }

    pub fn interests(&self) -> Vec<ConsumerUid> {
        let mut uids: Vec<_> = self.state.lock().interests.keys().copied().collect();
        uids.sort();
        uids
    }

    pub fn unacked_interests(&self) -> Vec<ConsumerUid> {
        let mut uids: Vec<_> = self
            .state
            .lock()
            .interests
            .iter()
            .filter(|(_, i)| i.state != AckState::Acknowledged)
            .map(|(uid, _)| *uid)
            .collect();
        uids.sort();
        uids
    }

    pub fn ack_state(&self, stored: ConsumerUid) -> Option<AckState> {
        self.state.lock().interests.get(&stored).map(|i| i.state)
    }

    /// Atomically claim the message for delivery under `stored`.
    ///
    /// Fails when the message is being removed, when `stored` has no
    /// outstanding interest, or when another consumer sharing `stored`
    /// already holds it in delivery.
    pub fn check_removal_and_set_in_delivery(
        &self,
        stored: ConsumerUid,
        consumer: ConsumerUid,
    ) -> bool {
        let mut state = self.state.lock();
        if state.destroyed || state.invalid || state.dead {
            return false;
        }
        let Some(interest) = state.interests.get_mut(&stored) else {
            return false;
        };
        if interest.in_delivery || interest.state == AckState::Acknowledged {
            return false;
        }
        interest.in_delivery = true;
        state.owner = Some(consumer);
        true
    }

    pub fn remove_in_delivery(&self, stored: ConsumerUid) {
        if let Some(interest) = self.state.lock().interests.get_mut(&stored) {
            interest.in_delivery = false;
        }
    }

    pub fn any_in_delivery(&self) -> bool {
        self.state.lock().interests.values().any(|i| i.in_delivery)
    }

    /// Consumer the message was last claimed for.
    pub fn owner(&self) -> Option<ConsumerUid> {
        self.state.lock().owner
    }

    /// Copy of the message stamped for delivery to `consumer`.
    pub fn delivery_packet(&self, consumer: ConsumerUid, stored: ConsumerUid) -> Packet {
        let (redelivered, previous) = {
            let state = self.state.lock();
            let previous = state.interests.get(&stored).map_or(0, |i| i.deliveries);
            (state.redelivered || previous > 0, previous)
        };
        let mut packet = (*self.packet).clone();
        packet.consumer_id = Some(consumer);
        packet.redelivered = redelivered;
        packet.delivery_count = previous + 1;
        packet
    }

    /// Move `stored`'s interest to delivered.
    pub fn delivered(&self, stored: ConsumerUid, no_ack: bool, now: i64) -> DeliveredOutcome {
        let mut state = self.state.lock();
        if state.destroyed || state.invalid {
            return DeliveredOutcome::Gone;
        }
        if self.packet.is_expired_at(now) {
            state.dead = true;
            return DeliveredOutcome::Dead;
        }
        let total = state.interests.len();
        let Some(interest) = state.interests.get_mut(&stored) else {
            return DeliveredOutcome::Deliver;
        };
        interest.deliveries += 1;
        if interest.state < AckState::Delivered {
            interest.state = AckState::Delivered;
        }
        if !no_ack {
            return DeliveredOutcome::Deliver;
        }
        if interest.state == AckState::Acknowledged {
            return DeliveredOutcome::AckedOnDelivery { removable: false };
        }
        interest.state = AckState::Acknowledged;
        interest.in_delivery = false;
        state.acked += 1;
        DeliveredOutcome::AckedOnDelivery {
            removable: state.acked == total,
        }
    }

    /// The client has seen the message but not acknowledged it yet.
    pub fn consumed(&self, stored: ConsumerUid) {
        if let Some(interest) = self.state.lock().interests.get_mut(&stored) {
            if interest.state < AckState::Consumed {
                interest.state = AckState::Consumed;
            }
        }
    }

    /// Acknowledge `stored`'s interest.
    ///
    /// Returns `true` on exactly one call: the one that acknowledged the last
    /// outstanding interest, after which the message can be removed.
    pub fn acknowledged(&self, stored: ConsumerUid) -> bool {
        let mut state = self.state.lock();
        let total = state.interests.len();
        let Some(interest) = state.interests.get_mut(&stored) else {
            return false;
        };
        if interest.state == AckState::Acknowledged {
            return false;
        }
        interest.state = AckState::Acknowledged;
        interest.in_delivery = false;
        state.acked += 1;
        state.acked == total
    }

    pub fn is_acknowledged(&self, stored: ConsumerUid) -> bool {
        self.ack_state(stored) == Some(AckState::Acknowledged)
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        let state = self.state.lock();
        !state.interests.is_empty() && state.acked == state.interests.len()
    }

    pub fn set_redelivered(&self) {
        self.state.lock().redelivered = true;
    }

    pub fn is_redelivered(&self) -> bool {
        self.state.lock().redelivered
    }

    /// Count one more rollback or session-close bounce for `stored`.
    pub fn increment_rollback(&self, stored: ConsumerUid) -> u32 {
        let mut state = self.state.lock();
        state.redelivered = true;
        let interest = state.interests.entry(stored).or_default();
        interest.rollbacks += 1;
        interest.rollbacks
    }

    /// Raise `stored`'s delivery count to what the client reports.
    pub fn update_delivery_count(&self, stored: ConsumerUid, count: u32) {
        if let Some(interest) = self.state.lock().interests.get_mut(&stored) {
            interest.deliveries = interest.deliveries.max(count);
        }
    }

    pub fn delivery_count(&self, stored: ConsumerUid) -> u32 {
        self.state
            .lock()
            .interests
            .get(&stored)
            .map_or(0, |i| i.deliveries)
    }

    pub fn mark_dead(&self) {
        self.state.lock().dead = true;
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    pub fn is_invalid(&self) -> bool {
        self.state.lock().invalid
    }

    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.invalid = true;
        state.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Record the consumer a re-sent remote copy is meant for, before it is
    /// claimed for delivery.
    pub fn assign_owner(&self, owner: ConsumerUid) {
        self.state.lock().owner = Some(owner);
    }
}

impl fmt::Debug for PacketReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PacketReference")
            .field("id", &self.packet.id)
            .field("destination", &self.packet.destination)
            .field("priority", &self.packet.priority)
            .field("interests", &state.interests.len())
            .field("acked", &state.acked)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
