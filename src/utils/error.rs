//! The `error` module defines the error type shared by every part of the
//! routing core.
//!
//! Errors fall into three groups that callers treat differently:
//!
//! - conditions worth retrying (the message is gone, the destination is full),
//! - conditions fatal to the single request (bad selector, bad destination
//!   name, unsupported feature),
//! - conditions that ask the caller to retarget (the message was requeued to a
//!   different consumer).
//!
//! `BrokerError::disposition` exposes that grouping.

use thiserror::Error;
use tracing::error;

use crate::ids::{ConsumerUid, SessionUid, SysMessageId, TransactionUid};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// How a caller should react to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient: the caller may retry or abandon the ack/transaction.
    Retry,
    /// The request itself is invalid and must not be retried unchanged.
    Fatal,
    /// Ownership moved; redirect the request to the new owner.
    Retarget,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("message {id} is gone{}", in_transaction(.transaction))]
    MessageGone {
        id: SysMessageId,
        transaction: Option<TransactionUid>,
    },

    #[error("message {id} was requeued to consumer {owner}")]
    Requeued { id: SysMessageId, owner: ConsumerUid },

    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("invalid destination name `{name}`: {reason}")]
    InvalidDestination { name: String, reason: String },

    #[error("wildcards are not supported for queues: {0}")]
    QueueWildcard(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("destination {destination} is full ({count} messages, {bytes} bytes)")]
    DestinationFull {
        destination: String,
        count: usize,
        bytes: u64,
    },

    #[error("cannot attach consumer to queue {queue}: max active {max_active}, max failover {max_failover}")]
    QueueAttachFailed {
        queue: String,
        max_active: i64,
        max_failover: i64,
    },

    #[error("subscription {0} already has an active consumer")]
    SubscriptionInUse(String),

    #[error("destination {0} not found")]
    DestinationNotFound(String),

    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerUid),

    #[error("session {0} not found")]
    SessionNotFound(SessionUid),

    #[error("session {0} is closed")]
    SessionClosed(SessionUid),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionUid),

    #[error("transaction {tid} is {state}, cannot {operation}")]
    InvalidTransactionState {
        tid: TransactionUid,
        state: String,
        operation: &'static str,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal broker error: {0}")]
    Internal(String),
}

fn in_transaction(tid: &Option<TransactionUid>) -> String {
    match tid {
        Some(t) => format!(" (transaction {t})"),
        None => String::new(),
    }
}

impl BrokerError {
    /// Log an unexpected state with its context and fold it into the generic
    /// internal error.
    pub fn internal(context: impl Into<String>) -> Self {
        let context = context.into();
        error!(%context, "internal broker error");
        BrokerError::Internal(context)
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            BrokerError::MessageGone { .. }
            | BrokerError::DestinationFull { .. }
            | BrokerError::Store(_)
            | BrokerError::Internal(_) => Disposition::Retry,
            BrokerError::Requeued { .. } => Disposition::Retarget,
            _ => Disposition::Fatal,
        }
    }
}

impl From<sled::Error> for BrokerError {
    fn from(e: sled::Error) -> Self {
        BrokerError::Store(e.to_string())
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(e: config::ConfigError) -> Self {
        BrokerError::InvalidConfig(e.to_string())
    }
}
