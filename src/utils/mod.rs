//! The `utils` module holds the pieces every other module leans on: the
//! crate error type, logging setup and the broker clock.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Disposition, Result};

/// Wall-clock time in epoch milliseconds, the unit of every message timestamp.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
