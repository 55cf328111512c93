//! The `monitor` module publishes metric snapshots as ordinary messages.
//!
//! Clients watch the broker by subscribing to reserved topics:
//!
//! - `mq.metrics.broker`: broker-wide counters,
//! - `mq.metrics.destination_list`: every user destination,
//! - `mq.metrics.destination.queue.<name>` / `mq.metrics.destination.topic.<name>`:
//!   the counters of one destination.
//!
//! Snapshots go through the normal topic delivery path, so they are only
//! produced for metric topics that currently have consumers. A consumer that
//! attaches to a metric topic gets one snapshot straight away.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::BrokerContext;
use crate::consumer::Consumer;
use crate::destination::Destination;
use crate::ids::{DestinationType, DestinationUid};
use crate::message::Packet;
use crate::persistence::RemoveReason;
use crate::utils::{BrokerError, Result, now_millis};

pub const METRICS_PREFIX: &str = "mq.metrics.";

/// Lifetime of a snapshot message.
pub const METRICS_TTL_MS: i64 = 300_000;

/// What a metric topic reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsArea {
    Broker,
    DestinationList,
    Destination(DestinationUid),
}

fn bad_name(name: &str, reason: &str) -> BrokerError {
    BrokerError::InvalidDestination {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

impl MetricsArea {
    /// Parse a topic name; `None` for names outside the metrics namespace.
    pub fn parse(name: &str) -> Result<Option<Self>> {
        let Some(area) = name.strip_prefix(METRICS_PREFIX) else {
            return Ok(None);
        };
        let parsed = match area {
            "broker" => MetricsArea::Broker,
            "destination_list" => MetricsArea::DestinationList,
            _ => {
                let Some(target) = area.strip_prefix("destination.") else {
                    return Err(bad_name(name, "unknown metrics area"));
                };
                let (kind, target) = if let Some(queue) = target.strip_prefix("queue.") {
                    (DestinationType::Queue, queue)
                } else if let Some(topic) = target.strip_prefix("topic.") {
                    (DestinationType::Topic, topic)
                } else {
                    return Err(bad_name(name, "expected destination.queue.<name> or destination.topic.<name>"));
                };
                if target.is_empty() {
                    return Err(bad_name(name, "missing destination name"));
                }
                MetricsArea::Destination(DestinationUid::new(target, kind)?)
            }
        };
        Ok(Some(parsed))
    }
}

pub fn is_metrics_topic(uid: &DestinationUid) -> bool {
    !uid.is_queue() && uid.name().starts_with(METRICS_PREFIX)
}

/// Broker-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerMetrics {
    pub broker: String,
    pub address: String,
    pub instance: String,
    pub timestamp: i64,
    pub destinations: usize,
    pub sessions: usize,
    pub consumers: usize,
    pub subscriptions: usize,
    pub messages: usize,
    pub bytes: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub references: usize,
    pub transactions: usize,
    pub dead_letters: usize,
}

impl BrokerMetrics {
    pub fn collect(ctx: &BrokerContext, now: i64) -> Self {
        let settings = ctx.settings();
        let registry = ctx.registry();
        let mut metrics = BrokerMetrics {
            broker: settings.broker.name.clone(),
            address: settings.broker.address.clone(),
            instance: ctx.instance().to_string(),
            timestamp: now,
            destinations: 0,
            sessions: registry.sessions.read().len(),
            consumers: registry.consumers.read().len(),
            subscriptions: registry.subscriptions.read().len(),
            messages: 0,
            bytes: 0,
            messages_in: 0,
            messages_out: 0,
            references: ctx.refs().len(),
            transactions: ctx.transactions().len(),
            dead_letters: ctx.dead_letters().len(),
        };
        for destination in ctx.destinations() {
            if is_metrics_topic(destination.uid()) {
                continue;
            }
            let m = destination.metrics();
            metrics.destinations += 1;
            metrics.messages += m.messages;
            metrics.bytes += m.bytes;
            metrics.messages_in += m.messages_in;
            metrics.messages_out += m.messages_out;
        }
        metrics
    }
}

#[derive(Debug, Serialize)]
struct DestinationListEntry {
    name: String,
    kind: DestinationType,
    metrics_topic: String,
}

fn metrics_topic_name(uid: &DestinationUid) -> String {
    format!("{METRICS_PREFIX}destination.{}.{}", uid.kind(), uid.name())
}

/// Snapshot for one metric topic; `None` when the target does not exist.
pub fn collect(ctx: &BrokerContext, area: &MetricsArea, now: i64) -> Result<Option<Value>> {
    let value = match area {
        MetricsArea::Broker => serde_json::to_value(BrokerMetrics::collect(ctx, now))?,
        MetricsArea::DestinationList => {
            let entries: Vec<_> = ctx
                .destinations()
                .into_iter()
                .filter(|d| !is_metrics_topic(d.uid()))
                .map(|d| DestinationListEntry {
                    name: d.uid().name().to_string(),
                    kind: d.uid().kind(),
                    metrics_topic: metrics_topic_name(d.uid()),
                })
                .collect();
            serde_json::to_value(entries)?
        }
        MetricsArea::Destination(uid) => match ctx.destination(uid) {
            Some(destination) => serde_json::to_value(destination.metrics())?,
            None => return Ok(None),
        },
    };
    Ok(Some(value))
}

fn snapshot_packet(ctx: &BrokerContext, topic: &DestinationUid, body: &Value, now: i64) -> Result<Packet> {
    let settings = ctx.settings();
    Ok(Packet::new(ctx.ids().next_id(), topic.clone(), serde_json::to_vec(body)?)
        .with_type(topic.name())
        .with_expiration(now + METRICS_TTL_MS)
        .with_property("timestamp", now)
        .with_property("broker_address", settings.broker.address.as_str()))
}

/// Publish one snapshot on `topic` to everyone subscribed to it.
fn publish(ctx: &BrokerContext, topic: &Arc<Destination>, now: i64) -> Result<bool> {
    let Some(area) = MetricsArea::parse(topic.uid().name())? else {
        return Ok(false);
    };
    let Some(body) = collect(ctx, &area, now)? else {
        return Ok(false);
    };
    let packet = snapshot_packet(ctx, topic.uid(), &body, now)?;
    let queued = topic.queue_message(packet, None)?;
    topic.deliver(&queued.reference)?;
    Ok(true)
}

/// One round over every watched metric topic. Returns how many snapshots
/// were published.
pub fn publish_snapshots(ctx: &BrokerContext, now: i64) -> usize {
    let mut published = 0;
    for topic in ctx.destinations() {
        if !is_metrics_topic(topic.uid()) || topic.consumer_count() == 0 {
            continue;
        }
        match publish(ctx, &topic, now) {
            Ok(true) => published += 1,
            Ok(false) => {}
            Err(e) => debug!(topic = %topic.uid(), error = %e, "unable to publish metrics"),
        }
    }
    published
}

/// Hand a fresh snapshot to a consumer that just attached to `topic`.
pub fn send_snapshot_to(
    ctx: &BrokerContext,
    topic: &Destination,
    consumer: &Consumer,
    now: i64,
) -> Result<bool> {
    let Some(area) = MetricsArea::parse(topic.uid().name())? else {
        return Ok(false);
    };
    let Some(body) = collect(ctx, &area, now)? else {
        return Ok(false);
    };
    let packet = snapshot_packet(ctx, topic.uid(), &body, now)?;
    let queued = topic.queue_message(packet, None)?;
    queued.reference.store(&[consumer.stored_uid()]);
    if !consumer.route_message(Arc::clone(&queued.reference), false, false) {
        topic.remove_message(queued.reference.id(), RemoveReason::NoInterest)?;
        return Ok(false);
    }
    Ok(true)
}

/// Publish snapshots every `interval` until the broker goes away.
pub fn spawn(ctx: Weak<BrokerContext>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        info!(interval_secs = interval.as_secs(), "metrics monitor started");
        loop {
            ticker.tick().await;
            let Some(ctx) = ctx.upgrade() else {
                break;
            };
            let published = publish_snapshots(&ctx, now_millis());
            if published > 0 {
                debug!(published, "metrics snapshots published");
            }
        }
        warn!("metrics monitor stopped");
    })
}
