use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::ClusterBroadcast;
use crate::config::DestinationSettings;
use crate::consumer::Consumer;
use crate::ids::{ConsumerUid, DestinationUid};
use crate::message::{OrderSequence, SharedPending};
use crate::utils::{BrokerError, Result};

/// Failed cluster lock attempts on one position before trying the next one.
pub const LOCK_RETRY_THRESHOLD: u32 = 10;
/// Cluster lock attempts before a consumer attach is abandoned.
pub const MAX_LOCK_ATTEMPTS: u32 = 100;

fn lock_backoff(retry: u32) -> Duration {
    Duration::from_millis(u64::from(retry.min(5)))
}

fn active_limit(settings: &DestinationSettings) -> usize {
    usize::try_from(settings.max_active_consumers).unwrap_or(usize::MAX)
}

/// Total positions (active plus failover), `None` when unlimited.
fn position_limit(settings: &DestinationSettings) -> Option<usize> {
    if settings.max_active_consumers < 0 || settings.max_failover_consumers < 0 {
        return None;
    }
    settings
        .max_active_consumers
        .checked_add(settings.max_failover_consumers)
        .and_then(|total| usize::try_from(total).ok())
}

/// Queue-only state: the shared pending list and consumer positions.
///
/// Position `p < max_active` is an active slot, anything above is failover.
#[derive(Debug)]
pub struct QueueState {
    pending: Arc<SharedPending>,
    positions: Mutex<BTreeMap<usize, ConsumerUid>>,
    stats: QueueStats,
}

impl QueueState {
    pub fn new(order: Arc<OrderSequence>) -> Self {
        Self {
            pending: Arc::new(SharedPending::new(order)),
            positions: Mutex::new(BTreeMap::new()),
            stats: QueueStats::default(),
        }
    }

    pub fn pending(&self) -> &Arc<SharedPending> {
        &self.pending
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn positions(&self) -> BTreeMap<usize, ConsumerUid> {
        self.positions.lock().clone()
    }

    /// Pick the lowest free position for `consumer`.
    ///
    /// Remote consumers on a clustered broker must also win the cluster-wide
    /// lock on the position. No local lock is held across cluster calls.
    pub(super) fn get_position(
        &self,
        queue: &DestinationUid,
        settings: &DestinationSettings,
        cluster: &dyn ClusterBroadcast,
        consumer: &Consumer,
    ) -> Result<usize> {
        let limit = position_limit(settings);
        let attach_failed = || BrokerError::QueueAttachFailed {
            queue: queue.name().to_string(),
            max_active: settings.max_active_consumers,
            max_failover: settings.max_failover_consumers,
        };
        let needs_lock = !consumer.is_local() && cluster.is_clustered();

        if !needs_lock {
            let mut positions = self.positions.lock();
            let position = (0..).find(|p| !positions.contains_key(p)).unwrap_or(0);
            if limit.is_some_and(|l| position >= l) {
                return Err(attach_failed());
            }
            positions.insert(position, consumer.uid());
            return Ok(position);
        }

        let mut candidate = 0usize;
        let mut retries = 0u32;
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let position = {
                let positions = self.positions.lock();
                (candidate..).find(|p| !positions.contains_key(p)).unwrap_or(candidate)
            };
            if limit.is_some_and(|l| position >= l) {
                return Err(attach_failed());
            }
            match cluster.get_consumer_lock(queue, position, consumer.uid()) {
                Ok(true) => {
                    let mut positions = self.positions.lock();
                    if positions.contains_key(&position) {
                        drop(positions);
                        cluster.unlock_consumer(queue, position, consumer.uid());
                        candidate = position;
                        continue;
                    }
                    positions.insert(position, consumer.uid());
                    return Ok(position);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(queue = %queue, position, error = %e, "cluster consumer lock failed");
                }
            }
            retries += 1;
            if retries >= LOCK_RETRY_THRESHOLD {
                debug!(queue = %queue, position, "position still locked, trying the next one");
                candidate = position + 1;
                retries = 0;
            } else {
                candidate = position;
                thread::sleep(lock_backoff(retries));
            }
        }
        Err(attach_failed())
    }

    pub(super) fn release_position(
        &self,
        queue: &DestinationUid,
        cluster: &dyn ClusterBroadcast,
        consumer: &Consumer,
    ) {
        let Some(position) = consumer.position() else {
            return;
        };
        let released = {
            let mut positions = self.positions.lock();
            if positions.get(&position) == Some(&consumer.uid()) {
                positions.remove(&position);
                true
            } else {
                false
            }
        };
        consumer.set_position(None);
        if released && !consumer.is_local() && cluster.is_clustered() {
            cluster.unlock_consumer(queue, position, consumer.uid());
        }
    }

    /// Re-evaluate which consumers are active after the consumer set changed.
    ///
    /// Failover consumers move into freed active slots; with local delivery
    /// preferred, remote active consumers stand down while a local one is
    /// active.
    pub(super) fn consumer_list_changed(
        &self,
        queue: &DestinationUid,
        settings: &DestinationSettings,
        cluster: &dyn ClusterBroadcast,
        consumers: &[Arc<Consumer>],
    ) {
        let active = active_limit(settings);
        let by_uid: HashMap<ConsumerUid, &Arc<Consumer>> =
            consumers.iter().map(|c| (c.uid(), c)).collect();

        if active != usize::MAX {
            self.promote_failover(queue, active, cluster, &by_uid);
        }

        let local_active = settings.local_delivery_preferred
            && consumers
                .iter()
                .any(|c| c.is_local() && c.position().is_some_and(|p| p < active));

        let mut active_count = 0;
        let mut failover_count = 0;
        for consumer in consumers {
            let in_active_slot = consumer.position().is_some_and(|p| p < active);
            let should_be_active = in_active_slot && !(local_active && !consumer.is_local());
            if in_active_slot {
                active_count += 1;
            } else {
                failover_count += 1;
            }
            if should_be_active != consumer.is_active() {
                consumer.set_active(should_be_active);
                if should_be_active {
                    info!(queue = %queue, consumer = %consumer.uid(), position = ?consumer.position(), "consumer activated");
                } else {
                    info!(queue = %queue, consumer = %consumer.uid(), position = ?consumer.position(), "consumer is standing by");
                }
            }
        }
        self.stats.record(active_count, failover_count);
    }

    fn promote_failover(
        &self,
        queue: &DestinationUid,
        active: usize,
        cluster: &dyn ClusterBroadcast,
        consumers: &HashMap<ConsumerUid, &Arc<Consumer>>,
    ) {
        loop {
            let next = {
                let positions = self.positions.lock();
                let free = (0..active).find(|p| !positions.contains_key(p));
                let waiting = positions.range(active..).next().map(|(p, c)| (*p, *c));
                free.zip(waiting)
            };
            let Some((slot, (from, uid))) = next else {
                return;
            };
            let Some(consumer) = consumers.get(&uid) else {
                // stale position entry
                self.positions.lock().remove(&from);
                continue;
            };
            let clustered = !consumer.is_local() && cluster.is_clustered();
            if clustered {
                match cluster.get_consumer_lock(queue, slot, uid) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        warn!(queue = %queue, position = slot, error = %e, "cluster consumer lock failed");
                        return;
                    }
                }
            }
            {
                let mut positions = self.positions.lock();
                if positions.contains_key(&slot) || positions.get(&from) != Some(&uid) {
                    drop(positions);
                    if clustered {
                        cluster.unlock_consumer(queue, slot, uid);
                    }
                    continue;
                }
                positions.remove(&from);
                positions.insert(slot, uid);
            }
            consumer.set_position(Some(slot));
            if clustered {
                cluster.unlock_consumer(queue, from, uid);
            }
            info!(queue = %queue, consumer = %uid, from, to = slot, "failover consumer promoted");
        }
    }
}

fn update_average(average: &AtomicU64, samples: u64, value: f64) {
    let _ = average.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        let current = f64::from_bits(bits);
        Some((current + (value - current) / samples as f64).to_bits())
    });
}

/// Consumer-count statistics for a queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    active: AtomicUsize,
    failover: AtomicUsize,
    peak_active: AtomicUsize,
    peak_failover: AtomicUsize,
    average_active: AtomicU64,
    average_failover: AtomicU64,
    samples: AtomicU64,
}

/// Point-in-time copy of `QueueStats`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueStatsSnapshot {
    pub active: usize,
    pub failover: usize,
    pub peak_active: usize,
    pub peak_failover: usize,
    pub average_active: f64,
    pub average_failover: f64,
}

impl QueueStats {
    pub fn record(&self, active: usize, failover: usize) {
        self.active.store(active, Ordering::Relaxed);
        self.failover.store(failover, Ordering::Relaxed);
        self.peak_active.fetch_max(active, Ordering::Relaxed);
        self.peak_failover.fetch_max(failover, Ordering::Relaxed);
        let samples = self.samples.fetch_add(1, Ordering::AcqRel) + 1;
        update_average(&self.average_active, samples, active as f64);
        update_average(&self.average_failover, samples, failover as f64);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            failover: self.failover.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            peak_failover: self.peak_failover.load(Ordering::Relaxed),
            average_active: f64::from_bits(self.average_active.load(Ordering::Relaxed)),
            average_failover: f64::from_bits(self.average_failover.load(Ordering::Relaxed)),
        }
    }
}
