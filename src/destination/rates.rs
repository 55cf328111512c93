use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Samples closer together than this reuse the previous comparison.
const MIN_SAMPLE_INTERVAL_MS: i64 = 1000;

/// Inbound versus outbound message rate of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RateComparison {
    InGreater = 0,
    Unknown = 1,
    OutGreaterOrEqual = 2,
}

#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: i64,
    messages_in: u64,
    messages_out: u64,
    result: RateComparison,
}

/// In/out counters with a one-second comparison window.
#[derive(Debug, Default)]
pub struct RateTracker {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    last: Mutex<Option<RateSample>>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_in(&self) -> u64 {
        self.messages_in.load(Ordering::Relaxed)
    }

    pub fn messages_out(&self) -> u64 {
        self.messages_out.load(Ordering::Relaxed)
    }

    /// Compare the rates since the last sample.
    ///
    /// The first sample is `Unknown`.
    pub fn compare(&self, now: i64) -> RateComparison {
        let messages_in = self.messages_in();
        let messages_out = self.messages_out();
        let mut last = self.last.lock();
        let result = match *last {
            Some(prev) if now - prev.at < MIN_SAMPLE_INTERVAL_MS => return prev.result,
            Some(prev) => {
                let delta_in = messages_in.saturating_sub(prev.messages_in);
                let delta_out = messages_out.saturating_sub(prev.messages_out);
                if delta_in > delta_out {
                    RateComparison::InGreater
                } else {
                    RateComparison::OutGreaterOrEqual
                }
            }
            None => RateComparison::Unknown,
        };
        *last = Some(RateSample {
            at: now,
            messages_in,
            messages_out,
            result,
        });
        result
    }
}

/// Prefetch to grant a remote consumer, throttled while producers outpace
/// consumers.
pub fn remote_prefetch_limit(configured: usize, comparison: RateComparison) -> usize {
    match comparison {
        RateComparison::InGreater => 1,
        RateComparison::Unknown => (configured / 2).max(1),
        RateComparison::OutGreaterOrEqual => configured.max(1),
    }
}
