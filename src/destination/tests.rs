use std::sync::Arc;

use proptest::prelude::*;

use super::*;
use crate::config::LimitBehavior;
use crate::consumer::ConsumerSpec;
use crate::tests::support::{self, broker, broker_with, drain, queue, topic};

fn publish(broker: &crate::broker::Broker, uid: &DestinationUid, body: &str) -> SysMessageId {
    let packet = broker.new_message(uid, body);
    broker.publish(packet, None).unwrap().id
}

#[test]
fn test_wildcard_cannot_be_a_destination() {
    let ctx = support::context();
    let err = Destination::new(ctx, topic("prices.*"), None).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidDestination { .. }));
}

#[test]
fn test_reject_newest_when_full() {
    let broker = broker_with(|s| s.destinations.max_messages = 2);
    let q = queue("orders");
    publish(&broker, &q, "a");
    publish(&broker, &q, "b");
    let err = broker.publish(broker.new_message(&q, "c"), None).unwrap_err();
    assert!(matches!(err, BrokerError::DestinationFull { count: 2, .. }));
    assert_eq!(broker.lookup_destination(&q).unwrap().message_count(), 2);
}

#[test]
fn test_concurrent_producers_respect_message_limit() {
    let broker = broker_with(|s| s.destinations.max_messages = 10);
    let q = queue("orders");
    broker.create_destination(&q, None).unwrap();

    let accepted: usize = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    (0..25)
                        .filter(|_| broker.publish(broker.new_message(&q, "x"), None).is_ok())
                        .count()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });
    assert_eq!(accepted, 10);
    assert_eq!(broker.lookup_destination(&q).unwrap().message_count(), 10);
}

#[test]
fn test_remove_oldest_evicts_first_message() {
    let broker = broker_with(|s| {
        s.destinations.max_messages = 2;
        s.destinations.limit_behavior = LimitBehavior::RemoveOldest;
    });
    let q = queue("orders");
    let first = publish(&broker, &q, "a");
    let second = publish(&broker, &q, "b");
    let third = publish(&broker, &q, "c");

    let dest = broker.lookup_destination(&q).unwrap();
    assert!(dest.message(first).is_none());
    assert!(dest.message(second).is_some());
    assert!(dest.message(third).is_some());
    assert_eq!(dest.pending_len(), 2);
}

#[test]
fn test_remove_low_priority_evicts_lowest_priority() {
    let broker = broker_with(|s| {
        s.destinations.max_messages = 3;
        s.destinations.limit_behavior = LimitBehavior::RemoveLowPriority;
    });
    let q = queue("orders");
    let mut ids = Vec::new();
    for priority in [9, 1, 5] {
        let packet = broker.new_message(&q, "x").with_priority(priority);
        ids.push(broker.publish(packet, None).unwrap().id);
    }
    let newest = broker
        .publish(broker.new_message(&q, "y").with_priority(5), None)
        .unwrap()
        .id;

    let dest = broker.lookup_destination(&q).unwrap();
    assert!(dest.message(ids[1]).is_none());
    assert!(dest.message(ids[0]).is_some());
    assert!(dest.message(ids[2]).is_some());
    assert!(dest.message(newest).is_some());
}

#[test]
fn test_flow_control_limit_pauses_producer() {
    let broker = broker_with(|s| {
        s.destinations.max_messages = 1;
        s.destinations.limit_behavior = LimitBehavior::FlowControl;
    });
    let q = queue("orders");
    let first = broker.publish(broker.new_message(&q, "a"), None).unwrap();
    assert!(!first.pause_producer);
    let second = broker.publish(broker.new_message(&q, "b"), None).unwrap();
    assert!(second.pause_producer);
    assert_eq!(broker.lookup_destination(&q).unwrap().message_count(), 2);
}

#[test]
fn test_byte_limit_applies() {
    let broker = broker_with(|s| s.destinations.max_bytes = 10);
    let q = queue("blobs");
    let big = broker.new_message(&q, vec![0u8; 64]);
    let err = broker.publish(big, None).unwrap_err();
    assert!(matches!(err, BrokerError::DestinationFull { .. }));
}

#[test]
fn test_topic_message_without_interest_is_dropped() {
    let broker = broker();
    let t = topic("news");
    let id = publish(&broker, &t, "nobody listens");
    let dest = broker.lookup_destination(&t).unwrap();
    assert!(dest.message(id).is_none());
    assert_eq!(dest.message_count(), 0);
    assert_eq!(broker.context().refs().len(), 0);
}

#[test]
fn test_reap_expired_dead_letters_message() {
    let broker = broker();
    let q = queue("orders");
    let past = crate::utils::now_millis() - 1_000;
    let packet = broker.new_message(&q, "stale").with_expiration(past);
    let id = broker.publish(packet, None).unwrap().id;
    publish(&broker, &q, "fresh");

    assert_eq!(broker.reap_expired(), 1);
    let dest = broker.lookup_destination(&q).unwrap();
    assert!(dest.message(id).is_none());
    assert_eq!(dest.message_count(), 1);

    let letters = broker.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].id, id);
    assert_eq!(letters[0].reason, RemoveReason::Expired);
}

#[test]
fn test_purge_keeps_messages_in_delivery() {
    let broker = broker();
    let q = queue("orders");
    let session = support::session(&broker);
    broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()))
        .unwrap();
    let first = publish(&broker, &q, "a");
    publish(&broker, &q, "b");
    publish(&broker, &q, "c");

    let delivered = session.fill_next_packet().unwrap();
    assert_eq!(delivered.packet.id, first);

    let dest = broker.lookup_destination(&q).unwrap();
    assert_eq!(dest.purge().unwrap(), 2);
    assert_eq!(dest.message_count(), 1);
    assert!(dest.message(first).is_some());
    // purged messages are skipped by the consumer
    assert!(session.fill_next_packet().is_none());
}

#[test]
fn test_topic_message_removed_after_last_interest() {
    let broker = broker();
    let t = topic("news");
    let s1 = support::session(&broker);
    let s2 = support::session(&broker);
    let c1 = broker.create_consumer(s1.uid(), ConsumerSpec::new(t.clone())).unwrap();
    let c2 = broker.create_consumer(s2.uid(), ConsumerSpec::new(t.clone())).unwrap();
    let id = publish(&broker, &t, "hello");

    let dest = broker.lookup_destination(&t).unwrap();
    assert_eq!(dest.message(id).unwrap().interests().len(), 2);

    assert_eq!(drain(&s1).len(), 1);
    assert_eq!(drain(&s2).len(), 1);
    broker.acknowledge(s1.uid(), c1.uid(), id, None).unwrap();
    assert!(dest.message(id).is_some());
    broker.acknowledge(s2.uid(), c2.uid(), id, None).unwrap();
    assert!(dest.message(id).is_none());
}

#[test]
fn test_custom_settings_win_over_broker_defaults() {
    let broker = broker();
    let custom = queue("custom");
    let plain = queue("plain");
    let settings = DestinationSettings {
        max_messages: 5,
        ..Default::default()
    };
    let custom_dest = broker.create_destination(&custom, Some(settings)).unwrap();
    let plain_dest = broker.create_destination(&plain, None).unwrap();

    let mut updated = (*broker.settings()).clone();
    updated.destinations.max_messages = 1;
    broker.update_settings(updated).unwrap();

    assert_eq!(custom_dest.settings().max_messages, 5);
    assert_eq!(plain_dest.settings().max_messages, 1);
}

#[test]
fn test_invalid_destination_settings_rejected() {
    let broker = broker();
    let settings = DestinationSettings {
        queue_prefetch: 0,
        ..Default::default()
    };
    assert!(broker.create_destination(&queue("bad"), Some(settings)).is_err());
    assert!(broker.lookup_destination(&queue("bad")).is_none());
}

#[test]
fn test_destroy_destination_requires_no_consumers() {
    let broker = broker();
    let q = queue("orders");
    let session = support::session(&broker);
    let consumer = broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()))
        .unwrap();
    publish(&broker, &q, "a");

    assert!(matches!(
        broker.destroy_destination(&q),
        Err(BrokerError::Unsupported(_))
    ));
    broker.close_consumer(consumer.uid(), None).unwrap();
    assert_eq!(broker.destroy_destination(&q).unwrap(), 1);
    assert!(broker.lookup_destination(&q).is_none());
}

#[test]
fn test_queue_stats_track_active_and_failover() {
    let broker = broker_with(|s| {
        s.destinations.max_active_consumers = 1;
        s.destinations.max_failover_consumers = 1;
    });
    let q = queue("jobs");
    let session = support::session(&broker);
    broker.create_consumer(session.uid(), ConsumerSpec::new(q.clone())).unwrap();
    broker.create_consumer(session.uid(), ConsumerSpec::new(q.clone())).unwrap();

    let metrics = broker.destination_metrics(&q).unwrap();
    let stats = metrics.queue.unwrap();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.failover, 1);
    assert_eq!(stats.peak_active, 1);
    assert_eq!(metrics.consumers, 2);

    let err = broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()))
        .unwrap_err();
    assert!(matches!(err, BrokerError::QueueAttachFailed { .. }));
}

#[test]
fn test_huge_consumer_limits_are_unbounded() {
    let broker = broker_with(|s| {
        s.destinations.max_active_consumers = i64::MAX;
        s.destinations.max_failover_consumers = 1;
    });
    let q = queue("jobs");
    let session = support::session(&broker);
    for expected in 0..3 {
        let consumer = broker
            .create_consumer(session.uid(), ConsumerSpec::new(q.clone()))
            .unwrap();
        assert_eq!(consumer.position(), Some(expected));
        assert!(consumer.is_active());
    }
    let stats = broker.destination_metrics(&q).unwrap().queue.unwrap();
    assert_eq!(stats.active, 3);
    assert_eq!(stats.failover, 0);
}

#[test]
fn test_rate_comparison_window() {
    let rates = RateTracker::new();
    assert_eq!(rates.compare(0), RateComparison::Unknown);
    rates.record_in();
    rates.record_in();
    // inside the one second window the previous answer stands
    assert_eq!(rates.compare(500), RateComparison::Unknown);
    assert_eq!(rates.compare(1_500), RateComparison::InGreater);
    for _ in 0..3 {
        rates.record_out();
    }
    assert_eq!(rates.compare(2_600), RateComparison::OutGreaterOrEqual);
}

#[test]
fn test_destination_rates_follow_traffic() {
    let broker = broker();
    let q = queue("orders");
    let dest = broker.create_destination(&q, None).unwrap();
    let now = crate::utils::now_millis();
    assert_eq!(dest.compare_rates(now), RateComparison::Unknown);
    let max = dest.max_prefetch();
    assert_eq!(dest.remote_prefetch_limit(now), (max / 2).max(1));

    publish(&broker, &q, "a");
    publish(&broker, &q, "b");
    assert_eq!(dest.compare_rates(now + 1_000), RateComparison::InGreater);
    assert_eq!(dest.remote_prefetch_limit(now + 1_500), 1);
}

#[test]
fn test_dead_letter_queue_is_bounded() {
    let letters = DeadLetterQueue::with_capacity(2);
    let ids: Vec<_> = (0..3).map(|n| SysMessageId::new(1, n)).collect();
    for id in &ids {
        letters.push(DeadLetter {
            id: *id,
            destination: queue("q"),
            reason: RemoveReason::Undeliverable,
            at: 0,
            packet: Arc::new(Packet::new(*id, queue("q"), Vec::new())),
        });
    }
    assert_eq!(letters.len(), 2);
    assert!(!letters.contains(ids[0]));
    assert!(letters.contains(ids[2]));
    assert_eq!(letters.drain().len(), 2);
    assert!(letters.is_empty());
}

proptest! {
    #[test]
    fn prop_remote_prefetch_limit_is_monotonic(configured in 1usize..100_000) {
        let low = remote_prefetch_limit(configured, RateComparison::InGreater);
        let mid = remote_prefetch_limit(configured, RateComparison::Unknown);
        let high = remote_prefetch_limit(configured, RateComparison::OutGreaterOrEqual);
        prop_assert!(low >= 1);
        prop_assert!(low <= mid);
        prop_assert!(mid <= high);
        prop_assert_eq!(high, configured);
    }
}
