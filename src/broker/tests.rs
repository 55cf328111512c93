use std::sync::Arc;

use super::Broker;
use crate::cluster::StandaloneCluster;
use crate::consumer::ConsumerSpec;
use crate::ids::{ConnectionUid, DestinationType};
use crate::persistence::{MemoryStore, Store};
use crate::tests::support::{self, bodies, broker, broker_with, drain, queue, settings, topic};
use crate::utils::BrokerError;

#[test]
fn test_create_destination_is_idempotent() {
    let broker = broker();
    let q = queue("orders");
    let first = broker.create_destination(&q, None).unwrap();
    let second = broker.create_destination(&q, None).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(broker.destinations(), vec![q]);
}

#[test]
fn test_destination_uid_is_interned() {
    let broker = broker();
    let a = broker.destination_uid("orders", DestinationType::Queue).unwrap();
    let b = broker.destination_uid("orders", DestinationType::Queue).unwrap();
    assert_eq!(a, b);
    assert!(matches!(
        broker.destination_uid("orders.*", DestinationType::Queue),
        Err(BrokerError::QueueWildcard(_))
    ));
}

#[test]
fn test_auto_create_disabled() {
    let broker = broker_with(|s| s.destinations.auto_create = false);
    let q = queue("orders");
    let err = broker.publish(broker.new_message(&q, "x"), None).unwrap_err();
    assert!(matches!(err, BrokerError::DestinationNotFound(_)));

    let session = support::session(&broker);
    let err = broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()))
        .unwrap_err();
    assert!(matches!(err, BrokerError::DestinationNotFound(_)));

    broker.create_destination(&q, None).unwrap();
    assert!(broker.publish(broker.new_message(&q, "x"), None).is_ok());
}

#[test]
fn test_queue_subscription_is_unsupported() {
    let broker = broker();
    let session = broker.create_session(ConnectionUid::new(), Some("client"), false);
    let err = broker
        .create_consumer(session.uid(), ConsumerSpec::new(queue("orders")).durable("sub"))
        .unwrap_err();
    assert!(matches!(err, BrokerError::Unsupported(_)));
}

#[test]
fn test_consumer_without_destination_is_rejected() {
    let broker = broker();
    let session = support::session(&broker);
    let err = broker
        .create_consumer(session.uid(), ConsumerSpec::default())
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidDestination { .. }));
}

#[test]
fn test_unknown_session_and_consumer() {
    let broker = broker();
    let session = support::session(&broker);
    broker.close_session(session.uid()).unwrap();
    assert!(matches!(
        broker.begin_transaction(session.uid()),
        Err(BrokerError::SessionNotFound(_))
    ));
    let consumer = crate::ids::ConsumerUid::new();
    assert!(matches!(
        broker.close_consumer(consumer, None),
        Err(BrokerError::ConsumerNotFound(_))
    ));
    assert!(matches!(
        broker.resume_flow(consumer, None),
        Err(BrokerError::ConsumerNotFound(_))
    ));
}

#[test]
fn test_wildcard_consumer_follows_new_topics() {
    let broker = broker();
    let existing = topic("stock.ibm");
    broker.create_destination(&existing, None).unwrap();

    let session = support::session(&broker);
    let consumer = broker
        .create_consumer(session.uid(), ConsumerSpec::new(topic("stock.*")))
        .unwrap();
    let later = topic("stock.acme");
    broker.create_destination(&later, None).unwrap();
    broker.create_destination(&topic("bonds.acme"), None).unwrap();

    broker.publish(broker.new_message(&existing, "ibm"), None).unwrap();
    broker.publish(broker.new_message(&later, "acme"), None).unwrap();
    broker
        .publish(broker.new_message(&topic("bonds.acme"), "bond"), None)
        .unwrap();
    assert_eq!(bodies(&drain(&session)), vec!["ibm", "acme"]);

    broker.close_consumer(consumer.uid(), None).unwrap();
    for uid in [&existing, &later] {
        assert_eq!(broker.lookup_destination(uid).unwrap().consumer_count(), 0);
    }
}

#[test]
fn test_wildcard_consumers_do_not_block_destroy() {
    let broker = broker();
    let t = topic("stock.ibm");
    broker.create_destination(&t, None).unwrap();
    let session = support::session(&broker);
    broker
        .create_consumer(session.uid(), ConsumerSpec::new(topic("stock.>")))
        .unwrap();
    assert_eq!(broker.destroy_destination(&t).unwrap(), 0);
    assert!(broker.lookup_destination(&t).is_none());
}

#[test]
fn test_durable_subscription_requires_client_id() {
    let broker = broker();
    let session = support::session(&broker);
    let err = broker
        .create_consumer(session.uid(), ConsumerSpec::new(topic("news")).durable("daily"))
        .unwrap_err();
    assert!(matches!(err, BrokerError::Unsupported(_)));
}

#[test]
fn test_unsubscribe() {
    let broker = broker();
    let t = topic("news");
    let session = broker.create_session(ConnectionUid::new(), Some("reader"), false);
    let consumer = broker
        .create_consumer(session.uid(), ConsumerSpec::new(t.clone()).durable("daily"))
        .unwrap();

    assert!(matches!(
        broker.unsubscribe(Some("reader"), "daily"),
        Err(BrokerError::SubscriptionInUse(_))
    ));
    broker.close_consumer(consumer.uid(), None).unwrap();
    broker.publish(broker.new_message(&t, "kept"), None).unwrap();
    assert_eq!(broker.lookup_destination(&t).unwrap().message_count(), 1);

    assert_eq!(broker.unsubscribe(Some("reader"), "daily").unwrap(), 1);
    assert_eq!(broker.lookup_destination(&t).unwrap().message_count(), 0);
    assert!(matches!(
        broker.unsubscribe(Some("reader"), "daily"),
        Err(BrokerError::ConsumerNotFound(_))
    ));
}

#[test]
fn test_changed_subscription_replaces_unused_record() {
    let broker = broker();
    let t = topic("news");
    let session = broker.create_session(ConnectionUid::new(), Some("reader"), false);
    let first = broker
        .create_consumer(session.uid(), ConsumerSpec::new(t.clone()).durable("daily"))
        .unwrap();
    let old_stored = first.stored_uid();

    // a live consumer pins the definition
    let err = broker
        .create_consumer(
            session.uid(),
            ConsumerSpec::new(t.clone()).durable("daily").with_selector("urgent = true"),
        )
        .unwrap_err();
    assert!(matches!(err, BrokerError::SubscriptionInUse(_)));

    broker.close_consumer(first.uid(), None).unwrap();
    broker.publish(broker.new_message(&t, "old"), None).unwrap();
    let second = broker
        .create_consumer(
            session.uid(),
            ConsumerSpec::new(t.clone()).durable("daily").with_selector("urgent = true"),
        )
        .unwrap();
    assert_eq!(second.stored_uid(), old_stored);
    // messages held for the old definition were dropped with it
    assert!(drain(&session).is_empty());
    assert_eq!(broker.lookup_destination(&t).unwrap().message_count(), 0);

    let urgent = broker.new_message(&t, "urgent").with_property("urgent", true);
    broker.publish(urgent, None).unwrap();
    broker.publish(broker.new_message(&t, "routine"), None).unwrap();
    assert_eq!(bodies(&drain(&session)), vec!["urgent"]);
}

#[test]
fn test_recover_restores_persistent_messages() {
    let store = Arc::new(MemoryStore::new());
    let q = queue("orders");
    {
        let broker = Broker::new(settings(), store.clone(), Arc::new(StandaloneCluster)).unwrap();
        let persistent = broker.new_message(&q, "keep").with_persistent(true);
        broker.publish(persistent, None).unwrap();
        broker.publish(broker.new_message(&q, "lose"), None).unwrap();
        broker.shutdown();
    }
    assert_eq!(store.len().unwrap(), 1);

    let broker = Broker::new(settings(), store.clone(), Arc::new(StandaloneCluster)).unwrap();
    assert_eq!(broker.recover().unwrap(), 1);
    let session = support::session(&broker);
    let consumer = broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()))
        .unwrap();
    let deliveries = drain(&session);
    assert_eq!(bodies(&deliveries), vec!["keep"]);
    assert!(deliveries[0].packet.redelivered);

    broker
        .acknowledge(session.uid(), consumer.uid(), deliveries[0].packet.id, None)
        .unwrap();
    assert_eq!(store.len().unwrap(), 0);
    assert_eq!(broker.recover().unwrap(), 0);
}

#[test]
fn test_invalid_settings_update_is_rejected() {
    let broker = broker();
    let mut bad = (*broker.settings()).clone();
    bad.destinations.max_active_consumers = 0;
    assert!(matches!(
        broker.update_settings(bad),
        Err(BrokerError::InvalidConfig(_))
    ));
    assert_eq!(broker.settings().destinations.max_active_consumers, -1);
}

#[test]
fn test_start_background_without_runtime_is_a_no_op() {
    let broker = broker();
    broker.start_background();
    broker.shutdown();
    assert!(broker.destinations().is_empty());
}

#[tokio::test]
async fn test_background_reaper_removes_expired_messages() {
    let broker = broker_with(|s| s.timers.expiration_interval_ms = 20);
    let q = queue("orders");
    let packet = broker
        .new_message(&q, "stale")
        .with_expiration(crate::utils::now_millis() + 10);
    broker.publish(packet, None).unwrap();
    broker.start_background();

    let dest = broker.lookup_destination(&q).unwrap();
    for _ in 0..100 {
        if dest.message_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(dest.message_count(), 0);
    assert_eq!(broker.dead_letters().len(), 1);
    broker.shutdown();
}

#[test]
fn test_shutdown_closes_sessions() {
    let broker = broker();
    let q = queue("orders");
    let session = support::session(&broker);
    let consumer = broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()))
        .unwrap();
    broker.publish(broker.new_message(&q, "x"), None).unwrap();
    drain(&session);

    broker.shutdown();
    assert!(!session.is_valid());
    assert!(!consumer.is_valid());
    assert!(broker.session(session.uid()).is_none());
    assert!(broker.destinations().is_empty());
}
