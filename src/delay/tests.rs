use std::time::Duration;

use crate::config::DestinationSettings;
use crate::consumer::ConsumerSpec;
use crate::tests::support::{self, bodies, broker, drain, queue, topic};
use crate::utils::now_millis;

#[test]
fn test_delayed_message_waits_for_delivery_time() {
    let broker = broker();
    let q = queue("later");
    let session = support::session(&broker);
    broker.create_consumer(session.uid(), ConsumerSpec::new(q.clone())).unwrap();

    let now = now_millis();
    let packet = broker.new_message(&q, "soon").with_delivery_time(now + 60_000);
    broker.publish(packet, None).unwrap();

    let dest = broker.lookup_destination(&q).unwrap();
    assert_eq!(dest.delay_timer().len(), 1);
    assert_eq!(dest.pending_len(), 0);
    assert!(drain(&session).is_empty());

    assert_eq!(dest.delay_timer().run_task_at(now + 59_999, &dest), Some(now + 60_000));
    assert!(drain(&session).is_empty());

    assert_eq!(dest.delay_timer().run_task_at(now + 60_000, &dest), None);
    assert!(dest.delay_timer().is_empty());
    assert_eq!(bodies(&drain(&session)), vec!["soon"]);
}

#[test]
fn test_earlier_delivery_time_released_first() {
    let broker = broker();
    let q = queue("later");
    let session = support::session(&broker);
    broker.create_consumer(session.uid(), ConsumerSpec::new(q.clone())).unwrap();

    let now = now_millis();
    let a = broker.new_message(&q, "A").with_delivery_time(now + 100);
    let b = broker.new_message(&q, "B").with_delivery_time(now + 50);
    broker.publish(a, None).unwrap();
    broker.publish(b, None).unwrap();

    let dest = broker.lookup_destination(&q).unwrap();
    assert_eq!(dest.delay_timer().next_due(), Some(now + 50));
    dest.delay_timer().run_task_at(now + 1_000, &dest);
    assert_eq!(bodies(&drain(&session)), vec!["B", "A"]);
}

#[test]
fn test_release_is_bounded_by_max_prefetch() {
    let broker = broker();
    let q = queue("later");
    let settings = DestinationSettings {
        queue_prefetch: 2,
        ..Default::default()
    };
    let dest = broker.create_destination(&q, Some(settings)).unwrap();

    let now = now_millis();
    for n in 0..5 {
        let packet = broker
            .new_message(&q, format!("m{n}"))
            .with_delivery_time(now + 10 + n);
        broker.publish(packet, None).unwrap();
    }

    let next = dest.delay_timer().run_task_at(now + 1_000, &dest);
    assert_eq!(next, Some(now + 12));
    assert_eq!(dest.delay_timer().len(), 3);
    assert_eq!(dest.pending_len(), 2);

    dest.delay_timer().run_task_at(now + 1_000, &dest);
    dest.delay_timer().run_task_at(now + 1_000, &dest);
    assert!(dest.delay_timer().is_empty());
    assert_eq!(dest.pending_len(), 5);
}

#[test]
fn test_removed_message_leaves_the_timer() {
    let broker = broker();
    let q = queue("later");
    let now = now_millis();
    let packet = broker.new_message(&q, "x").with_delivery_time(now + 60_000);
    let id = broker.publish(packet, None).unwrap().id;

    let dest = broker.lookup_destination(&q).unwrap();
    assert!(dest.delay_timer().contains(id));
    assert_eq!(dest.purge().unwrap(), 1);
    assert!(!dest.delay_timer().contains(id));
    assert_eq!(dest.delay_timer().run_task_at(now + 60_000, &dest), None);
    assert_eq!(dest.pending_len(), 0);
}

#[test]
fn test_closed_topic_consumer_releases_delayed_interest() {
    let broker = broker();
    let t = topic("alerts");
    let session = support::session(&broker);
    let consumer = broker.create_consumer(session.uid(), ConsumerSpec::new(t.clone())).unwrap();

    let now = now_millis();
    let packet = broker.new_message(&t, "x").with_delivery_time(now + 60_000);
    let id = broker.publish(packet, None).unwrap().id;
    let dest = broker.lookup_destination(&t).unwrap();
    assert!(dest.message(id).is_some());

    broker.close_consumer(consumer.uid(), None).unwrap();
    assert!(dest.message(id).is_none());
    assert!(dest.delay_timer().is_empty());
}

#[test]
fn test_delayed_topic_message_reaches_subscribers_when_due() {
    let broker = broker();
    let t = topic("alerts");
    let session = support::session(&broker);
    broker.create_consumer(session.uid(), ConsumerSpec::new(t.clone())).unwrap();

    let now = now_millis();
    let packet = broker.new_message(&t, "wake up").with_delivery_time(now + 500);
    broker.publish(packet, None).unwrap();
    assert!(drain(&session).is_empty());

    let dest = broker.lookup_destination(&t).unwrap();
    dest.delay_timer().run_task_at(now + 500, &dest);
    assert_eq!(bodies(&drain(&session)), vec!["wake up"]);
}

#[tokio::test]
async fn test_timer_task_releases_due_messages() {
    let broker = broker();
    let q = queue("later");
    let session = support::session(&broker);
    broker.create_consumer(session.uid(), ConsumerSpec::new(q.clone())).unwrap();

    let packet = broker
        .new_message(&q, "tick")
        .with_delivery_time(now_millis() + 50);
    broker.publish(packet, None).unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(5), session.next_delivery())
        .await
        .expect("delayed message was never released")
        .unwrap();
    assert_eq!(delivery.packet.body, b"tick");
    broker.shutdown();
}
