//! Shared fixtures for the unit and flow tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::broker::{Broker, BrokerContext};
use crate::cluster::{ClusterAckType, ClusterBroadcast, ConsumerAnnouncement, StandaloneCluster};
use crate::config::Settings;
use crate::consumer::Delivery;
use crate::ids::{ConnectionUid, ConsumerUid, DestinationUid, SysMessageId};
use crate::message::PacketReference;
use crate::persistence::MemoryStore;
use crate::session::Session;
use crate::utils::{BrokerError, Result};

pub fn settings() -> Settings {
    Settings::default()
}

pub fn broker() -> Broker {
    Broker::standalone(settings()).unwrap()
}

pub fn broker_with(configure: impl FnOnce(&mut Settings)) -> Broker {
    let mut settings = settings();
    configure(&mut settings);
    Broker::standalone(settings).unwrap()
}

pub fn context() -> Arc<BrokerContext> {
    BrokerContext::new(settings(), Arc::new(MemoryStore::new()), Arc::new(StandaloneCluster)).unwrap()
}

pub fn queue(name: &str) -> DestinationUid {
    DestinationUid::queue(name).unwrap()
}

pub fn topic(name: &str) -> DestinationUid {
    DestinationUid::topic(name).unwrap()
}

pub fn session(broker: &Broker) -> Arc<Session> {
    broker.create_session(ConnectionUid::new(), None, false)
}

/// Everything the session can hand out right now.
pub fn drain(session: &Session) -> Vec<Delivery> {
    std::iter::from_fn(|| session.fill_next_packet()).collect()
}

pub fn ids(deliveries: &[Delivery]) -> Vec<SysMessageId> {
    deliveries.iter().map(|d| d.packet.id).collect()
}

/// Bodies as strings, for readable assertions.
pub fn bodies(deliveries: &[Delivery]) -> Vec<String> {
    deliveries
        .iter()
        .map(|d| String::from_utf8_lossy(&d.packet.body).into_owned())
        .collect()
}

/// One recorded call into the cluster layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCall {
    CreateConsumer(ConsumerUid),
    DestroyConsumer(ConsumerUid, Vec<SysMessageId>),
    Ack {
        broker: String,
        id: SysMessageId,
        consumer: ConsumerUid,
        ack_type: ClusterAckType,
        resume_flow: bool,
    },
    Forward(SysMessageId, Vec<ConsumerUid>),
    Lock(usize, ConsumerUid),
    Unlock(usize, ConsumerUid),
}

/// Cluster collaborator that records every call. Position locks are granted
/// unless the position is listed in `held_elsewhere`.
#[derive(Debug, Default)]
pub struct RecordingCluster {
    pub calls: Mutex<Vec<ClusterCall>>,
    pub held_elsewhere: Mutex<Vec<usize>>,
    pub fail_forward: Mutex<bool>,
}

impl RecordingCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.calls.lock().clone()
    }

    pub fn acks(&self, ack_type: ClusterAckType) -> Vec<SysMessageId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ClusterCall::Ack { id, ack_type: t, .. } if *t == ack_type => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl ClusterBroadcast for RecordingCluster {
    fn is_clustered(&self) -> bool {
        true
    }

    fn create_consumer(&self, consumer: &ConsumerAnnouncement) -> Result<()> {
        self.calls.lock().push(ClusterCall::CreateConsumer(consumer.consumer));
        Ok(())
    }

    fn destroy_consumer(&self, consumer: ConsumerUid, pending: &[SysMessageId]) -> Result<()> {
        self.calls
            .lock()
            .push(ClusterCall::DestroyConsumer(consumer, pending.to_vec()));
        Ok(())
    }

    fn acknowledge_message(
        &self,
        broker: &str,
        id: SysMessageId,
        consumer: ConsumerUid,
        ack_type: ClusterAckType,
        props: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        self.calls.lock().push(ClusterCall::Ack {
            broker: broker.to_string(),
            id,
            consumer,
            ack_type,
            resume_flow: props.is_some_and(|p| p.get("resume_flow").is_some_and(|v| v == "true")),
        });
        Ok(())
    }

    fn forward_message(&self, reference: &PacketReference, consumers: &[ConsumerUid]) -> Result<()> {
        if *self.fail_forward.lock() {
            return Err(BrokerError::Internal("cluster link down".into()));
        }
        self.calls
            .lock()
            .push(ClusterCall::Forward(reference.id(), consumers.to_vec()));
        Ok(())
    }

    fn get_consumer_lock(
        &self,
        _queue: &DestinationUid,
        position: usize,
        consumer: ConsumerUid,
    ) -> Result<bool> {
        self.calls.lock().push(ClusterCall::Lock(position, consumer));
        Ok(!self.held_elsewhere.lock().contains(&position))
    }

    fn unlock_consumer(&self, _queue: &DestinationUid, position: usize, consumer: ConsumerUid) {
        self.calls.lock().push(ClusterCall::Unlock(position, consumer));
    }
}

pub fn clustered_broker(cluster: Arc<RecordingCluster>, configure: impl FnOnce(&mut Settings)) -> Broker {
    let mut settings = settings();
    configure(&mut settings);
    Broker::new(settings, Arc::new(MemoryStore::new()), cluster).unwrap()
}
