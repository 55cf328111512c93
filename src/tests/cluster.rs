//! Interaction with the cluster layer, observed through a recording
//! collaborator.

use crate::cluster::ClusterAckType;
use crate::consumer::ConsumerSpec;
use crate::tests::support::{
    self, ClusterCall, RecordingCluster, bodies, clustered_broker, drain, ids, queue, topic,
};
use crate::utils::BrokerError;

#[test]
fn test_consumers_are_announced_and_withdrawn() {
    let cluster = RecordingCluster::new();
    let broker = clustered_broker(cluster.clone(), |_| {});
    let session = support::session(&broker);
    let consumer = broker
        .create_consumer(session.uid(), ConsumerSpec::new(topic("news")))
        .unwrap();
    assert!(cluster.calls().contains(&ClusterCall::CreateConsumer(consumer.uid())));

    broker.close_consumer(consumer.uid(), None).unwrap();
    assert!(
        cluster
            .calls()
            .contains(&ClusterCall::DestroyConsumer(consumer.uid(), Vec::new()))
    );
}

#[test]
fn test_remote_queue_consumer_skips_position_held_elsewhere() {
    let cluster = RecordingCluster::new();
    cluster.held_elsewhere.lock().push(0);
    let broker = clustered_broker(cluster.clone(), |_| {});
    let q = queue("jobs");
    let session = support::session(&broker);

    let remote = broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()).remote("broker-b"))
        .unwrap();
    assert_eq!(remote.position(), Some(1));
    let calls = cluster.calls();
    assert!(calls.contains(&ClusterCall::Lock(0, remote.uid())));
    assert!(calls.contains(&ClusterCall::Lock(1, remote.uid())));

    // local consumers never ask the cluster
    let local = broker.create_consumer(session.uid(), ConsumerSpec::new(q)).unwrap();
    assert_eq!(local.position(), Some(0));
    assert!(
        !cluster
            .calls()
            .iter()
            .any(|c| matches!(c, ClusterCall::Lock(_, uid) if *uid == local.uid()))
    );

    broker.close_consumer(remote.uid(), None).unwrap();
    assert!(cluster.calls().contains(&ClusterCall::Unlock(1, remote.uid())));
}

#[test]
fn test_topic_message_forwarded_to_remote_consumer() {
    let cluster = RecordingCluster::new();
    let broker = clustered_broker(cluster.clone(), |_| {});
    let t = topic("prices");
    let session = support::session(&broker);
    let remote = broker
        .create_consumer(session.uid(), ConsumerSpec::new(t.clone()).remote("broker-b"))
        .unwrap();
    broker.create_consumer(session.uid(), ConsumerSpec::new(t.clone())).unwrap();

    let id = broker.publish(broker.new_message(&t, "tick"), None).unwrap().id;
    assert!(cluster.calls().contains(&ClusterCall::Forward(id, vec![remote.uid()])));
    assert_eq!(bodies(&drain(&session)), vec!["tick"]);
}

#[test]
fn test_failed_forward_does_not_fail_publish() {
    let cluster = RecordingCluster::new();
    *cluster.fail_forward.lock() = true;
    let broker = clustered_broker(cluster.clone(), |_| {});
    let t = topic("prices");
    let session = support::session(&broker);
    broker
        .create_consumer(session.uid(), ConsumerSpec::new(t.clone()).remote("broker-b"))
        .unwrap();

    assert!(broker.publish(broker.new_message(&t, "tick"), None).is_ok());
}

#[test]
fn test_ack_of_remote_message_goes_back_to_origin() {
    let cluster = RecordingCluster::new();
    let broker = clustered_broker(cluster.clone(), |_| {});
    let q = queue("jobs");
    let session = support::session(&broker);
    let consumer = broker.create_consumer(session.uid(), ConsumerSpec::new(q.clone())).unwrap();

    let packet = broker.new_message(&q, "from b");
    let reference = broker
        .remote_message(packet, "broker-b", &[consumer.uid()])
        .unwrap();
    assert!(!reference.is_local());
    let id = reference.id();
    assert_eq!(ids(&drain(&session)), vec![id]);

    broker.acknowledge(session.uid(), consumer.uid(), id, None).unwrap();
    assert_eq!(cluster.acks(ClusterAckType::Acknowledged), vec![id]);
    assert!(cluster.calls().iter().any(|c| matches!(
        c,
        ClusterCall::Ack { broker, consumer: uid, .. } if broker == "broker-b" && *uid == consumer.uid()
    )));
    assert!(broker.lookup_destination(&q).unwrap().message(id).is_none());
}

#[test]
fn test_resume_flow_reports_delivered_remote_messages() {
    let cluster = RecordingCluster::new();
    let broker = clustered_broker(cluster.clone(), |_| {});
    let q = queue("jobs");
    let session = support::session(&broker);
    let consumer = broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()).with_prefetch(1))
        .unwrap();
    let id = broker
        .remote_message(broker.new_message(&q, "from b"), "broker-b", &[consumer.uid()])
        .unwrap()
        .id();

    let delivered = drain(&session);
    assert!(delivered[0].packet.consumer_flow);
    assert!(cluster.acks(ClusterAckType::Delivered).is_empty());

    broker.resume_flow(consumer.uid(), None).unwrap();
    let calls = cluster.calls();
    assert!(calls.contains(&ClusterCall::Ack {
        broker: "broker-b".to_string(),
        id,
        consumer: consumer.uid(),
        ack_type: ClusterAckType::Delivered,
        resume_flow: true,
    }));
}

#[test]
fn test_overridden_remote_message_ack_is_requeued() {
    let cluster = RecordingCluster::new();
    let broker = clustered_broker(cluster.clone(), |_| {});
    let q = queue("jobs");
    let s1 = support::session(&broker);
    let s2 = support::session(&broker);
    let c1 = broker.create_consumer(s1.uid(), ConsumerSpec::new(q.clone())).unwrap();
    let c2 = broker.create_consumer(s2.uid(), ConsumerSpec::new(q.clone())).unwrap();

    let packet = broker.new_message(&q, "moving");
    let id = broker
        .remote_message(packet.clone(), "broker-b", &[c1.uid()])
        .unwrap()
        .id();
    assert_eq!(ids(&drain(&s1)), vec![id]);

    // the origin resent the message for another consumer
    broker.remote_message(packet, "broker-b", &[c2.uid()]).unwrap();
    let err = broker.acknowledge(s1.uid(), c1.uid(), id, None).unwrap_err();
    assert!(matches!(err, BrokerError::Requeued { owner, .. } if owner == c2.uid()));
    assert_eq!(err.disposition(), crate::utils::Disposition::Retarget);
}

#[test]
fn test_closing_session_releases_remote_messages() {
    let cluster = RecordingCluster::new();
    let broker = clustered_broker(cluster.clone(), |_| {});
    let q = queue("jobs");
    let session = support::session(&broker);
    let consumer = broker.create_consumer(session.uid(), ConsumerSpec::new(q.clone())).unwrap();
    let id = broker
        .remote_message(broker.new_message(&q, "from b"), "broker-b", &[consumer.uid()])
        .unwrap()
        .id();
    drain(&session);

    broker.close_session(session.uid()).unwrap();
    assert_eq!(cluster.acks(ClusterAckType::Undeliverable), vec![id]);
    assert!(broker.lookup_destination(&q).unwrap().message(id).is_none());
}

#[test]
fn test_remote_consumer_stands_by_while_local_one_is_active() {
    let cluster = RecordingCluster::new();
    let broker = clustered_broker(cluster.clone(), |s| {
        s.destinations.local_delivery_preferred = true;
    });
    let q = queue("jobs");
    let session = support::session(&broker);
    let remote = broker
        .create_consumer(session.uid(), ConsumerSpec::new(q.clone()).remote("broker-b"))
        .unwrap();
    assert!(remote.is_active());

    let local = broker.create_consumer(session.uid(), ConsumerSpec::new(q.clone())).unwrap();
    assert!(local.is_active());
    assert!(!remote.is_active());
    let locks_before = cluster
        .calls()
        .iter()
        .filter(|c| matches!(c, ClusterCall::Lock(_, uid) if *uid == remote.uid()))
        .count();

    broker.close_consumer(local.uid(), None).unwrap();
    assert!(remote.is_active());
    assert_eq!(remote.position(), Some(0));
    let locks_after = cluster
        .calls()
        .iter()
        .filter(|c| matches!(c, ClusterCall::Lock(_, uid) if *uid == remote.uid()))
        .count();
    assert_eq!(locks_before, locks_after);
}
