//! The `transaction` module tracks local transactions for the routing core.
//!
//! A transaction records the messages produced in it (stored but not routed
//! until commit) and the messages consumed in it (acknowledged on commit,
//! redelivered on rollback). Acknowledgments whose session closed while the
//! transaction was prepared or committed are kept as *orphan acks* and
//! replayed when the transaction completes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::ids::{ConsumerUid, SessionUid, SysMessageId, TransactionUid};
use crate::message::PacketReference;
use crate::utils::{BrokerError, Result, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Started,
    Failed,
    Incomplete,
    Complete,
    Prepared,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransactionState::Started => "started",
            TransactionState::Failed => "failed",
            TransactionState::Incomplete => "incomplete",
            TransactionState::Complete => "complete",
            TransactionState::Prepared => "prepared",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        };
        f.write_str(text)
    }
}

impl TransactionState {
    /// Still collecting work.
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Started | TransactionState::Incomplete)
    }

    /// The outcome is decided, so acks from a closed session must be kept.
    pub fn holds_orphans(&self) -> bool {
        matches!(self, TransactionState::Prepared | TransactionState::Committed)
    }
}

/// A message acknowledged inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumedMessage {
    pub id: SysMessageId,
    pub consumer: ConsumerUid,
    pub stored: ConsumerUid,
}

#[derive(Debug)]
pub struct TransactionRecord {
    pub tid: TransactionUid,
    pub session: SessionUid,
    pub state: TransactionState,
    pub produced: Vec<Arc<PacketReference>>,
    pub consumed: Vec<ConsumedMessage>,
    pub orphan_acks: Vec<ConsumedMessage>,
    pub created: i64,
}

/// Work to carry out once a transaction completes.
#[derive(Debug, Default)]
pub struct TransactionWork {
    pub session: Option<SessionUid>,
    pub produced: Vec<Arc<PacketReference>>,
    pub orphan_acks: Vec<ConsumedMessage>,
}

#[derive(Debug, Default)]
pub struct TransactionList {
    records: Mutex<HashMap<TransactionUid, TransactionRecord>>,
}

fn invalid_state(tid: TransactionUid, state: TransactionState, operation: &'static str) -> BrokerError {
    BrokerError::InvalidTransactionState {
        tid,
        state: state.to_string(),
        operation,
    }
}

impl TransactionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, session: SessionUid) -> TransactionUid {
        let tid = TransactionUid::new();
        self.records.lock().insert(
            tid,
            TransactionRecord {
                tid,
                session,
                state: TransactionState::Started,
                produced: Vec::new(),
                consumed: Vec::new(),
                orphan_acks: Vec::new(),
                created: now_millis(),
            },
        );
        debug!(%tid, %session, "transaction started");
        tid
    }

    pub fn state(&self, tid: TransactionUid) -> Option<TransactionState> {
        self.records.lock().get(&tid).map(|r| r.state)
    }

    pub fn session(&self, tid: TransactionUid) -> Option<SessionUid> {
        self.records.lock().get(&tid).map(|r| r.session)
    }

    fn with_open<T>(
        &self,
        tid: TransactionUid,
        operation: &'static str,
        f: impl FnOnce(&mut TransactionRecord) -> T,
    ) -> Result<T> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&tid)
            .ok_or(BrokerError::TransactionNotFound(tid))?;
        if !record.state.is_open() {
            return Err(invalid_state(tid, record.state, operation));
        }
        Ok(f(record))
    }

    pub fn add_produced(&self, tid: TransactionUid, reference: Arc<PacketReference>) -> Result<()> {
        self.with_open(tid, "produce", |r| r.produced.push(reference))
    }

    pub fn add_consumed(&self, tid: TransactionUid, message: ConsumedMessage) -> Result<()> {
        self.with_open(tid, "acknowledge", |r| {
            if !r.consumed.contains(&message) {
                r.consumed.push(message);
            }
        })
    }

    /// Transaction a message was consumed in by `consumer`, if any.
    pub fn consumed_in_transaction(
        &self,
        id: SysMessageId,
        consumer: ConsumerUid,
    ) -> Option<TransactionUid> {
        self.records
            .lock()
            .values()
            .find(|r| r.consumed.iter().any(|m| m.id == id && m.consumer == consumer))
            .map(|r| r.tid)
    }

    pub fn add_orphan_ack(&self, tid: TransactionUid, message: ConsumedMessage) {
        if let Some(record) = self.records.lock().get_mut(&tid) {
            debug!(%tid, id = %message.id, "orphan ack recorded");
            record.orphan_acks.push(message);
        }
    }

    pub fn orphan_acks(&self, tid: TransactionUid) -> Vec<ConsumedMessage> {
        self.records
            .lock()
            .get(&tid)
            .map(|r| r.orphan_acks.clone())
            .unwrap_or_default()
    }

    pub fn prepare(&self, tid: TransactionUid) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&tid)
            .ok_or(BrokerError::TransactionNotFound(tid))?;
        match record.state {
            TransactionState::Started | TransactionState::Incomplete | TransactionState::Complete => {
                record.state = TransactionState::Prepared;
                info!(%tid, "transaction prepared");
                Ok(())
            }
            state => Err(invalid_state(tid, state, "prepare")),
        }
    }

    /// Mark the transaction committed and take the work to carry out.
    pub fn commit(&self, tid: TransactionUid) -> Result<TransactionWork> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&tid)
            .ok_or(BrokerError::TransactionNotFound(tid))?;
        match record.state {
            TransactionState::Started
            | TransactionState::Incomplete
            | TransactionState::Complete
            | TransactionState::Prepared => {
                record.state = TransactionState::Committed;
                Ok(TransactionWork {
                    session: Some(record.session),
                    produced: std::mem::take(&mut record.produced),
                    orphan_acks: std::mem::take(&mut record.orphan_acks),
                })
            }
            state => Err(invalid_state(tid, state, "commit")),
        }
    }

    /// Mark the transaction rolled back and take the work to undo.
    pub fn rollback(&self, tid: TransactionUid) -> Result<TransactionWork> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&tid)
            .ok_or(BrokerError::TransactionNotFound(tid))?;
        match record.state {
            TransactionState::Committed | TransactionState::RolledBack => {
                Err(invalid_state(tid, record.state, "roll back"))
            }
            _ => {
                record.state = TransactionState::RolledBack;
                Ok(TransactionWork {
                    session: Some(record.session),
                    produced: std::mem::take(&mut record.produced),
                    orphan_acks: std::mem::take(&mut record.orphan_acks),
                })
            }
        }
    }

    pub fn set_failed(&self, tid: TransactionUid) {
        if let Some(record) = self.records.lock().get_mut(&tid) {
            record.state = TransactionState::Failed;
        }
    }

    /// Forget a finished transaction.
    pub fn remove(&self, tid: TransactionUid) -> Option<TransactionRecord> {
        self.records.lock().remove(&tid)
    }

    pub fn open_for_session(&self, session: SessionUid) -> Vec<TransactionUid> {
        let mut tids: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| r.session == session && r.state.is_open())
            .map(|r| r.tid)
            .collect();
        tids.sort();
        tids
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
