//! Hand-off points to the cluster layer.
//!
//! The routing core never talks to other brokers itself. Whenever a decision
//! has to be propagated off-box (a consumer appears or goes away, a remote
//! message is delivered or acknowledged, a queue position must be locked
//! cluster-wide) it calls a `ClusterBroadcast`. Failures are logged by the
//! caller and degrade to local-only behaviour.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::trace;

use crate::ids::{ConsumerUid, DestinationUid, SysMessageId};
use crate::message::PacketReference;
use crate::utils::Result;

/// Kind of acknowledgment sent back to the broker a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAckType {
    Delivered,
    Consumed,
    Acknowledged,
    Undeliverable,
    Dead,
}

impl fmt::Display for ClusterAckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ClusterAckType::Delivered => "delivered",
            ClusterAckType::Consumed => "consumed",
            ClusterAckType::Acknowledged => "acknowledged",
            ClusterAckType::Undeliverable => "undeliverable",
            ClusterAckType::Dead => "dead",
        };
        f.write_str(text)
    }
}

/// What the cluster needs to know about a consumer.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerAnnouncement {
    pub consumer: ConsumerUid,
    pub destination: DestinationUid,
    pub selector: Option<String>,
    pub durable_name: Option<String>,
    pub client_id: Option<String>,
}

pub trait ClusterBroadcast: Send + Sync + fmt::Debug {
    fn is_clustered(&self) -> bool;

    fn create_consumer(&self, consumer: &ConsumerAnnouncement) -> Result<()>;

    /// A consumer went away; `pending` lists remote messages it still held.
    fn destroy_consumer(&self, consumer: ConsumerUid, pending: &[SysMessageId]) -> Result<()>;

    fn acknowledge_message(
        &self,
        broker: &str,
        id: SysMessageId,
        consumer: ConsumerUid,
        ack_type: ClusterAckType,
        props: Option<&HashMap<String, String>>,
    ) -> Result<()>;

    fn forward_message(&self, reference: &PacketReference, consumers: &[ConsumerUid]) -> Result<()>;

    /// Try to take the cluster-wide lock on a queue position.
    ///
    /// `Ok(false)` means another broker holds it.
    fn get_consumer_lock(
        &self,
        queue: &DestinationUid,
        position: usize,
        consumer: ConsumerUid,
    ) -> Result<bool>;

    fn unlock_consumer(&self, queue: &DestinationUid, position: usize, consumer: ConsumerUid);
}

/// Cluster collaborator for a broker running alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandaloneCluster;

impl ClusterBroadcast for StandaloneCluster {
    fn is_clustered(&self) -> bool {
        false
    }

    fn create_consumer(&self, _consumer: &ConsumerAnnouncement) -> Result<()> {
        Ok(())
    }

    fn destroy_consumer(&self, _consumer: ConsumerUid, _pending: &[SysMessageId]) -> Result<()> {
        Ok(())
    }

    fn acknowledge_message(
        &self,
        broker: &str,
        id: SysMessageId,
        consumer: ConsumerUid,
        ack_type: ClusterAckType,
        _props: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        trace!(%broker, %id, %consumer, %ack_type, "standalone broker drops remote ack");
        Ok(())
    }

    fn forward_message(&self, _reference: &PacketReference, _consumers: &[ConsumerUid]) -> Result<()> {
        Ok(())
    }

    fn get_consumer_lock(
        &self,
        _queue: &DestinationUid,
        _position: usize,
        _consumer: ConsumerUid,
    ) -> Result<bool> {
        Ok(true)
    }

    fn unlock_consumer(&self, _queue: &DestinationUid, _position: usize, _consumer: ConsumerUid) {}
}
