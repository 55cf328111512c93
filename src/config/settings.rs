use serde::{Deserialize, Serialize};

use crate::utils::{BrokerError, Result};

/// Top-level configuration settings for the broker core.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub destinations: DestinationSettings,
    pub consumers: ConsumerSettings,
    pub timers: TimerSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

/// Identity of this broker.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub name: String,
    /// Address other brokers in a cluster know this broker by.
    pub address: String,
}

/// What a destination does when it is full.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitBehavior {
    /// Refuse the new message.
    #[default]
    RejectNewest,
    /// Drop the oldest message nobody is consuming.
    RemoveOldest,
    /// Drop the oldest message of the lowest priority nobody is consuming.
    RemoveLowPriority,
    /// Accept the message and ask the producer to slow down.
    FlowControl,
}

/// Defaults applied to every destination.
///
/// `-1` means unlimited for the consumer and capacity limits.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DestinationSettings {
    pub queue_prefetch: i32,
    pub topic_prefetch: i32,
    pub max_active_consumers: i64,
    pub max_failover_consumers: i64,
    pub local_delivery_preferred: bool,
    pub max_messages: i64,
    pub max_bytes: i64,
    pub limit_behavior: LimitBehavior,
    /// Redeliveries after rollback or session close before a message is
    /// dead-lettered. `0` never dead-letters.
    pub max_consecutive_rollbacks: u32,
    pub auto_create: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub flow_control: bool,
    /// Batch pulled into a consumer with unlimited prefetch.
    pub unlimited_batch: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TimerSettings {
    pub expiration_interval_ms: u64,
    pub monitor_interval_secs: u64,
    pub monitor_enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct PersistenceSettings {
    /// Directory of the sled store; in-memory when unset.
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Settings as read from a file or the environment. Missing values are
/// filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub destinations: Option<PartialDestinationSettings>,
    pub consumers: Option<PartialConsumerSettings>,
    pub timers: Option<PartialTimerSettings>,
    pub persistence: Option<PersistenceSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDestinationSettings {
    pub queue_prefetch: Option<i32>,
    pub topic_prefetch: Option<i32>,
    pub max_active_consumers: Option<i64>,
    pub max_failover_consumers: Option<i64>,
    pub local_delivery_preferred: Option<bool>,
    pub max_messages: Option<i64>,
    pub max_bytes: Option<i64>,
    pub limit_behavior: Option<LimitBehavior>,
    pub max_consecutive_rollbacks: Option<u32>,
    pub auto_create: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub flow_control: Option<bool>,
    pub unlimited_batch: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTimerSettings {
    pub expiration_interval_ms: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
    pub monitor_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let destinations = self.destinations.unwrap_or_default();
        let consumers = self.consumers.unwrap_or_default();
        let timers = self.timers.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();
        let d = default.destinations;

        Settings {
            broker: BrokerSettings {
                name: broker.name.unwrap_or(default.broker.name),
                address: broker.address.unwrap_or(default.broker.address),
            },
            destinations: DestinationSettings {
                queue_prefetch: destinations.queue_prefetch.unwrap_or(d.queue_prefetch),
                topic_prefetch: destinations.topic_prefetch.unwrap_or(d.topic_prefetch),
                max_active_consumers: destinations
                    .max_active_consumers
                    .unwrap_or(d.max_active_consumers),
                max_failover_consumers: destinations
                    .max_failover_consumers
                    .unwrap_or(d.max_failover_consumers),
                local_delivery_preferred: destinations
                    .local_delivery_preferred
                    .unwrap_or(d.local_delivery_preferred),
                max_messages: destinations.max_messages.unwrap_or(d.max_messages),
                max_bytes: destinations.max_bytes.unwrap_or(d.max_bytes),
                limit_behavior: destinations.limit_behavior.unwrap_or(d.limit_behavior),
                max_consecutive_rollbacks: destinations
                    .max_consecutive_rollbacks
                    .unwrap_or(d.max_consecutive_rollbacks),
                auto_create: destinations.auto_create.unwrap_or(d.auto_create),
            },
            consumers: ConsumerSettings {
                flow_control: consumers
                    .flow_control
                    .unwrap_or(default.consumers.flow_control),
                unlimited_batch: consumers
                    .unlimited_batch
                    .unwrap_or(default.consumers.unlimited_batch),
            },
            timers: TimerSettings {
                expiration_interval_ms: timers
                    .expiration_interval_ms
                    .unwrap_or(default.timers.expiration_interval_ms),
                monitor_interval_secs: timers
                    .monitor_interval_secs
                    .unwrap_or(default.timers.monitor_interval_secs),
                monitor_enabled: timers
                    .monitor_enabled
                    .unwrap_or(default.timers.monitor_enabled),
            },
            persistence: self.persistence.unwrap_or(default.persistence),
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                name: "brokercore".to_string(),
                address: "localhost:7676".to_string(),
            },
            destinations: DestinationSettings::default(),
            consumers: ConsumerSettings {
                flow_control: true,
                unlimited_batch: 1000,
            },
            timers: TimerSettings {
                expiration_interval_ms: 5000,
                monitor_interval_secs: 60,
                monitor_enabled: false,
            },
            persistence: PersistenceSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for DestinationSettings {
    fn default() -> Self {
        Self {
            queue_prefetch: 1000,
            topic_prefetch: 1000,
            max_active_consumers: -1,
            max_failover_consumers: 0,
            local_delivery_preferred: false,
            max_messages: -1,
            max_bytes: -1,
            limit_behavior: LimitBehavior::RejectNewest,
            max_consecutive_rollbacks: 0,
            auto_create: true,
        }
    }
}

fn invalid(message: String) -> BrokerError {
    BrokerError::InvalidConfig(message)
}

fn check_limit(name: &str, value: i64) -> Result<()> {
    if value < -1 {
        return Err(invalid(format!("{name} must be -1 (unlimited) or >= 0, got {value}")));
    }
    Ok(())
}

fn check_prefetch(name: &str, value: i32) -> Result<()> {
    if value == 0 || value < -1 {
        return Err(invalid(format!("{name} must be -1 (unlimited) or > 0, got {value}")));
    }
    Ok(())
}

impl DestinationSettings {
    pub fn validate(&self) -> Result<()> {
        check_prefetch("queue_prefetch", self.queue_prefetch)?;
        check_prefetch("topic_prefetch", self.topic_prefetch)?;
        check_limit("max_active_consumers", self.max_active_consumers)?;
        if self.max_active_consumers == 0 {
            return Err(invalid("max_active_consumers must not be 0".to_string()));
        }
        check_limit("max_failover_consumers", self.max_failover_consumers)?;
        check_limit("max_messages", self.max_messages)?;
        check_limit("max_bytes", self.max_bytes)?;
        Ok(())
    }
}

impl Settings {
    /// Reject out-of-range tunables. Nothing is applied when this fails.
    pub fn validate(&self) -> Result<()> {
        self.destinations.validate()?;
        if self.consumers.unlimited_batch == 0 {
            return Err(invalid("unlimited_batch must be > 0".to_string()));
        }
        if self.timers.expiration_interval_ms == 0 {
            return Err(invalid("expiration_interval_ms must be > 0".to_string()));
        }
        if self.timers.monitor_interval_secs == 0 {
            return Err(invalid("monitor_interval_secs must be > 0".to_string()));
        }
        if self.broker.address.is_empty() {
            return Err(invalid("broker address must not be empty".to_string()));
        }
        Ok(())
    }
}
