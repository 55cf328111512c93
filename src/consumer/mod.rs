//! The `consumer` module holds the per-consumer delivery state.
//!
//! A consumer owns a private pending list. Queue consumers and subscription
//! children pull from a shared *parent* list (the queue's pending list or the
//! subscription record's private list) whenever their own list runs dry;
//! plain topic consumers are routed to directly and have no parent.
//!
//! Consumers are driven by their session: `get_and_fill_next_packet` hands
//! out the next deliverable message and `destroy_consumer` returns what is
//! left to the parent list exactly once.

mod subscription;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::BrokerContext;
use crate::cluster::{ClusterAckType, ConsumerAnnouncement};
use crate::ids::{ConnectionUid, ConsumerUid, DestinationUid, SessionUid};
use crate::message::{Packet, PacketReference, SharedPending};
use crate::persistence::RemoveReason;
use crate::selector::Selector;
use crate::utils::now_millis;

pub use subscription::{Subscription, SubscriptionKey};

/// How the client acknowledges what it receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    DupsOk,
    /// Messages count as acknowledged the moment they are sent.
    NoAck,
}

/// Subscription requested by a topic consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub name: String,
    pub durable: bool,
    pub shared: bool,
}

/// What a client asks for when it creates a consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumerSpec {
    pub destination: Option<DestinationUid>,
    pub selector: Option<String>,
    pub no_local: bool,
    pub ack_mode: AckMode,
    /// Overrides the destination's default prefetch; `-1` is unlimited.
    pub prefetch: Option<i32>,
    pub subscription: Option<SubscriptionSpec>,
    /// Broker address when the consumer lives on another broker.
    pub remote: Option<String>,
}

impl ConsumerSpec {
    pub fn new(destination: DestinationUid) -> Self {
        Self {
            destination: Some(destination),
            ..Default::default()
        }
    }

    pub fn with_selector(mut self, selector: &str) -> Self {
        self.selector = Some(selector.to_string());
        self
    }

    pub fn with_no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_prefetch(mut self, prefetch: i32) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn durable(mut self, name: &str) -> Self {
        self.subscription = Some(SubscriptionSpec {
            name: name.to_string(),
            durable: true,
            shared: false,
        });
        self
    }

    pub fn shared(mut self, name: &str, durable: bool) -> Self {
        self.subscription = Some(SubscriptionSpec {
            name: name.to_string(),
            durable,
            shared: true,
        });
        self
    }

    pub fn remote(mut self, broker: &str) -> Self {
        self.remote = Some(broker.to_string());
        self
    }
}

/// Everything needed to build a consumer record.
#[derive(Debug)]
pub(crate) struct ConsumerInit {
    pub uid: ConsumerUid,
    pub stored_uid: ConsumerUid,
    pub destination: DestinationUid,
    pub session: Option<SessionUid>,
    pub connection: Option<ConnectionUid>,
    pub client_id: Option<String>,
    pub selector: Option<Arc<Selector>>,
    pub no_local: bool,
    pub ack_mode: AckMode,
    pub prefetch: i32,
    pub remote: Option<String>,
    pub parent: Option<Arc<SharedPending>>,
    pub subscription: Option<Subscription>,
    pub member_of: Option<SubscriptionKey>,
}

/// A message taken for delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Copy stamped for this delivery (consumer id, redelivered flag, counts).
    pub packet: Packet,
    pub reference: Arc<PacketReference>,
}

#[derive(Debug, Default)]
struct FlowState {
    prefetch: i32,
    delivered: usize,
    paused: bool,
    /// Remote messages whose delivered-ack waits for the flow resume.
    pending_resumes: Vec<Arc<PacketReference>>,
}

pub struct Consumer {
    uid: ConsumerUid,
    stored_uid: ConsumerUid,
    destination: DestinationUid,
    session: Option<SessionUid>,
    connection: Option<ConnectionUid>,
    client_id: Option<String>,
    selector: Option<Arc<Selector>>,
    no_local: bool,
    ack_mode: AckMode,
    remote: Option<String>,
    ctx: Arc<BrokerContext>,
    msgs: Arc<SharedPending>,
    parent: Option<Arc<SharedPending>>,
    subscription: Option<Subscription>,
    member_of: Option<SubscriptionKey>,
    /// Destroy lock: `false` once the consumer is destroyed.
    valid: Mutex<bool>,
    pause_count: AtomicI32,
    active: AtomicBool,
    position: Mutex<Option<usize>>,
    flow: Mutex<FlowState>,
    work: OnceLock<Arc<Notify>>,
}

impl Consumer {
    pub(crate) fn new(ctx: Arc<BrokerContext>, init: ConsumerInit) -> Arc<Self> {
        let msgs = Arc::new(SharedPending::new(Arc::clone(ctx.order())));
        Arc::new(Self {
            uid: init.uid,
            stored_uid: init.stored_uid,
            destination: init.destination,
            session: init.session,
            connection: init.connection,
            client_id: init.client_id,
            selector: init.selector,
            no_local: init.no_local,
            ack_mode: init.ack_mode,
            remote: init.remote,
            ctx,
            msgs,
            parent: init.parent,
            subscription: init.subscription,
            member_of: init.member_of,
            valid: Mutex::new(true),
            pause_count: AtomicI32::new(0),
            active: AtomicBool::new(true),
            position: Mutex::new(None),
            flow: Mutex::new(FlowState {
                prefetch: init.prefetch,
                ..Default::default()
            }),
            work: OnceLock::new(),
        })
    }

    pub fn uid(&self) -> ConsumerUid {
        self.uid
    }

    /// Identity this consumer acknowledges under.
    pub fn stored_uid(&self) -> ConsumerUid {
        self.stored_uid
    }

    pub fn destination(&self) -> &DestinationUid {
        &self.destination
    }

    pub fn session(&self) -> Option<SessionUid> {
        self.session
    }

    pub fn connection(&self) -> Option<ConnectionUid> {
        self.connection
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn selector(&self) -> Option<&Arc<Selector>> {
        self.selector.as_ref()
    }

    pub fn selector_source(&self) -> Option<&str> {
        self.selector.as_ref().map(|s| s.source())
    }

    pub fn no_local(&self) -> bool {
        self.no_local
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn is_no_ack(&self) -> bool {
        self.ack_mode == AckMode::NoAck
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn is_local(&self) -> bool {
        self.remote.is_none()
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Subscription this consumer is a child of.
    pub fn member_of(&self) -> Option<&SubscriptionKey> {
        self.member_of.as_ref()
    }

    pub fn parent(&self) -> Option<&Arc<SharedPending>> {
        self.parent.as_ref()
    }

    /// The private list; a subscription record's list is its children's parent.
    pub(crate) fn pending_list(&self) -> &Arc<SharedPending> {
        &self.msgs
    }

    /// Plain topic consumers and subscription records have nowhere to return
    /// messages to, so whatever they still hold is acknowledged on destroy.
    pub fn acks_on_destroy(&self) -> bool {
        self.parent.is_none()
    }

    pub fn prefetch(&self) -> i32 {
        self.flow.lock().prefetch
    }

    pub fn pending_len(&self) -> usize {
        self.msgs.len()
    }

    pub fn pending_ids(&self) -> Vec<crate::ids::SysMessageId> {
        self.msgs.ids()
    }

    pub fn announcement(&self) -> ConsumerAnnouncement {
        ConsumerAnnouncement {
            consumer: self.uid,
            destination: self.destination.clone(),
            selector: self.selector_source().map(str::to_string),
            durable_name: self
                .subscription
                .as_ref()
                .filter(|s| s.is_durable())
                .map(|s| s.key().name.clone()),
            client_id: self.client_id.clone(),
        }
    }

    /// Whether this consumer wants `packet` given its selector.
    pub fn matches(&self, packet: &Packet) -> bool {
        self.selector.as_ref().is_none_or(|s| s.matches(packet))
    }

    pub(crate) fn set_work_signal(&self, work: Arc<Notify>) {
        let _ = self.work.set(work);
    }

    /// Wake whoever delivers for this consumer.
    pub fn signal(&self) {
        if let Some(subscription) = &self.subscription {
            subscription.signal_children();
        } else if let Some(work) = self.work.get() {
            work.notify_one();
        }
    }

    pub fn is_valid(&self) -> bool {
        *self.valid.lock()
    }

    /// Put a message on this consumer's private list.
    ///
    /// Returns `false` once the consumer has been destroyed.
    pub fn route_message(
        &self,
        reference: Arc<PacketReference>,
        to_front: bool,
        ordered: bool,
    ) -> bool {
        {
            let valid = self.valid.lock();
            if !*valid {
                return false;
            }
            if to_front {
                self.msgs.add_all_to_front(vec![reference]);
            } else if ordered {
                self.msgs.add_ordered(reference);
            } else {
                self.msgs.add(reference);
            }
        }
        self.signal();
        true
    }

    /// Put a batch back on the private list, either ahead of everything or in
    /// original arrival order.
    pub fn route_messages(&self, references: Vec<Arc<PacketReference>>, to_front: bool) -> bool {
        if references.is_empty() {
            return self.is_valid();
        }
        {
            let valid = self.valid.lock();
            if !*valid {
                return false;
            }
            if to_front {
                self.msgs.add_all_to_front(references);
            } else {
                self.msgs.add_all_ordered(references);
            }
        }
        self.signal();
        true
    }

    /// Stop delivery; every `pause` needs a matching `resume`.
    pub fn pause(&self, reason: &str) {
        let count = self.pause_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(consumer = %self.uid, %reason, count, "consumer paused");
    }

    pub fn resume(&self, reason: &str) {
        let previous = self
            .pause_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c > 0).then(|| c - 1))
            .unwrap_or(0);
        debug!(consumer = %self.uid, %reason, count = previous.saturating_sub(1), "consumer resumed");
        if previous == 1 {
            self.signal();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::Acquire) > 0
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        if self.active.swap(active, Ordering::AcqRel) != active && active {
            self.signal();
        }
    }

    pub fn position(&self) -> Option<usize> {
        *self.position.lock()
    }

    pub(crate) fn set_position(&self, position: Option<usize>) {
        *self.position.lock() = position;
    }

    pub fn is_flow_paused(&self) -> bool {
        self.flow.lock().paused
    }

    /// Whether the session should poll this consumer.
    pub fn is_busy(&self) -> bool {
        self.is_valid()
            && !self.is_paused()
            && self.is_active()
            && !self.is_flow_paused()
            && self.subscription.is_none()
            && (!self.msgs.is_empty() || self.parent.as_ref().is_some_and(|p| !p.is_empty()))
    }

    fn fill_batch(&self) -> usize {
        let flow = self.flow.lock();
        if flow.prefetch > 0 {
            (flow.prefetch as usize).saturating_sub(flow.delivered).max(1)
        } else {
            self.ctx.settings().consumers.unlimited_batch
        }
    }

    /// Top up the private list from the parent list.
    fn fill_from_parent(&self) {
        let Some(parent) = &self.parent else {
            return;
        };
        let batch = self.fill_batch();
        let references = parent.take(batch);
        if references.is_empty() {
            return;
        }
        // private list is empty here, so the parent's order carries over
        self.msgs.add_all_to_front(references);
    }

    /// Next message to send, claimed for delivery, or `None` when there is
    /// nothing deliverable right now.
    ///
    /// Expired messages found on the way are dead-lettered. When the message
    /// handed out fills the prefetch window it carries the consumer-flow
    /// marker and delivery pauses until `resume_flow`.
    pub fn get_and_fill_next_packet(&self) -> Option<Delivery> {
        if !self.is_valid() || self.is_paused() || !self.is_active() || self.is_flow_paused() {
            return None;
        }
        let flow_control = self.ctx.settings().consumers.flow_control;
        let now = now_millis();
        loop {
            if self.msgs.is_empty() {
                self.fill_from_parent();
            }
            let reference = self.msgs.lock().pop_front()?;
            if reference.is_destroyed() || reference.is_invalid() {
                continue;
            }
            if !reference.check_removal_and_set_in_delivery(self.stored_uid, self.uid) {
                continue;
            }
            if reference.is_expired_at(now) {
                reference.remove_in_delivery(self.stored_uid);
                self.ctx
                    .remove_dead_message(&reference, RemoveReason::Expired);
                continue;
            }

            let mut packet = reference.delivery_packet(self.uid, self.stored_uid);
            packet.is_last = self.msgs.is_empty()
                && self.parent.as_ref().is_none_or(|p| p.is_empty());

            let mut flow = self.flow.lock();
            flow.delivered += 1;
            if flow_control && flow.prefetch > 0 && flow.delivered >= flow.prefetch as usize {
                packet.consumer_flow = true;
                flow.paused = true;
                if !reference.is_local() {
                    flow.pending_resumes.push(Arc::clone(&reference));
                }
                debug!(consumer = %self.uid, delivered = flow.delivered, "consumer flow paused");
            }
            return Some(Delivery { packet, reference });
        }
    }

    /// A claimed delivery was dropped instead of sent. It no longer counts
    /// against the prefetch window, and a flow pause it carried is undone so
    /// the next message can take the marker.
    pub(crate) fn delivery_not_sent(&self, delivery: &Delivery) {
        {
            let mut flow = self.flow.lock();
            flow.delivered = flow.delivered.saturating_sub(1);
            if !delivery.packet.consumer_flow {
                return;
            }
            flow.paused = false;
            flow.pending_resumes
                .retain(|r| !Arc::ptr_eq(r, &delivery.reference));
        }
        debug!(consumer = %self.uid, id = %delivery.packet.id, "consumer flow pause withdrawn");
        self.signal();
    }

    /// The client asked for more: reopen the prefetch window and send the
    /// delivered-acks held back for remote messages.
    pub fn resume_flow(&self, prefetch: Option<i32>) {
        let resumes = {
            let mut flow = self.flow.lock();
            if let Some(prefetch) = prefetch {
                flow.prefetch = prefetch;
            }
            flow.paused = false;
            flow.delivered = 0;
            std::mem::take(&mut flow.pending_resumes)
        };
        let props = HashMap::from([("resume_flow".to_string(), "true".to_string())]);
        for reference in resumes {
            let Some(broker) = reference.broker_address() else {
                continue;
            };
            if let Err(e) = self.ctx.cluster().acknowledge_message(
                broker,
                reference.id(),
                self.uid,
                ClusterAckType::Delivered,
                Some(&props),
            ) {
                warn!(consumer = %self.uid, id = %reference.id(), error = %e, "failed to send delivered ack");
            }
        }
        self.signal();
    }

    /// Tear the consumer down. Runs once; later calls return `0`.
    ///
    /// `delivered` are messages the session still held for this consumer.
    /// With `ack_on_destroy` everything left is acknowledged under the stored
    /// id; otherwise it goes back to the parent list in arrival order.
    /// Returns how many messages went back to the parent.
    pub fn destroy_consumer(
        &self,
        delivered: Vec<Arc<PacketReference>>,
        ack_on_destroy: bool,
    ) -> usize {
        let undelivered = {
            let mut valid = self.valid.lock();
            if !*valid {
                return 0;
            }
            *valid = false;
            self.msgs.drain()
        };
        self.flow.lock().pending_resumes.clear();

        for reference in &delivered {
            reference.remove_in_delivery(self.stored_uid);
            reference.set_redelivered();
        }

        let remote: Vec<_> = delivered
            .iter()
            .chain(undelivered.iter())
            .filter(|r| !r.is_local())
            .map(|r| r.id())
            .collect();

        let mut returned = 0;
        if ack_on_destroy {
            for reference in delivered.into_iter().chain(undelivered) {
                if reference.is_destroyed() {
                    continue;
                }
                if let Err(e) = self.ctx.acknowledge(&reference, self.uid, self.stored_uid) {
                    debug!(consumer = %self.uid, id = %reference.id(), error = %e, "ack on destroy skipped");
                }
            }
        } else if let Some(parent) = &self.parent {
            let references: Vec<_> = delivered
                .into_iter()
                .chain(undelivered)
                .filter(|r| !r.is_destroyed())
                .collect();
            returned = references.len();
            parent.add_all_ordered(references);
        }

        if let Err(e) = self.ctx.cluster().destroy_consumer(self.uid, &remote) {
            warn!(consumer = %self.uid, error = %e, "failed to announce consumer removal");
        }
        debug!(consumer = %self.uid, returned, "consumer destroyed");
        returned
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("uid", &self.uid)
            .field("stored_uid", &self.stored_uid)
            .field("destination", &self.destination)
            .field("selector", &self.selector_source())
            .field("remote", &self.remote)
            .field("active", &self.is_active())
            .field("pending", &self.msgs.len())
            .field("subscription", &self.subscription)
            .finish()
    }
}
