//! The message representation the routing core works with.
//!
//! A `Packet` carries the headers routing needs (id, destination, priority,
//! expiration, delivery time, producer identity), the application properties
//! selectors evaluate, and an opaque body. The delivery-side fields
//! (`consumer_id`, `redelivered`, `delivery_count`, `is_last`,
//! `consumer_flow`) are only set on the copy handed to a consumer.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionUid, ConsumerUid, DestinationUid, SysMessageId};

pub const MAX_PRIORITY: u8 = 9;
pub const DEFAULT_PRIORITY: u8 = 4;

/// A typed message property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Double(d) => write!(f, "{d}"),
            PropertyValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub id: SysMessageId,
    pub destination: DestinationUid,
    pub priority: u8,
    pub persistent: bool,
    /// Epoch milliseconds after which the message is dead; `None` never expires.
    pub expiration: Option<i64>,
    /// Epoch milliseconds before which the message must not be delivered.
    pub delivery_time: Option<i64>,
    pub timestamp: i64,
    pub producer_connection: Option<ConnectionUid>,
    pub client_id: Option<String>,
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, PropertyValue>,
    pub body: Vec<u8>,

    pub consumer_id: Option<ConsumerUid>,
    pub redelivered: bool,
    pub delivery_count: u32,
    pub is_last: bool,
    pub consumer_flow: bool,
}

impl Packet {
    pub fn new(id: SysMessageId, destination: DestinationUid, body: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: id.timestamp(),
            id,
            destination,
            priority: DEFAULT_PRIORITY,
            persistent: false,
            expiration: None,
            delivery_time: None,
            producer_connection: None,
            client_id: None,
            message_type: None,
            correlation_id: None,
            properties: HashMap::new(),
            body: body.into(),
            consumer_id: None,
            redelivered: false,
            delivery_count: 0,
            is_last: false,
            consumer_flow: false,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_expiration(mut self, expiration: i64) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_delivery_time(mut self, delivery_time: i64) -> Self {
        self.delivery_time = Some(delivery_time);
        self
    }

    pub fn with_producer(mut self, connection: ConnectionUid, client_id: Option<&str>) -> Self {
        self.producer_connection = Some(connection);
        self.client_id = client_id.map(str::to_string);
        self
    }

    pub fn with_type(mut self, message_type: &str) -> Self {
        self.message_type = Some(message_type.to_string());
        self
    }

    pub fn with_property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Value of a `JMS*` header field, as a selector sees it.
    pub fn header(&self, name: &str) -> Option<PropertyValue> {
        match name {
            "JMSPriority" => Some(PropertyValue::Int(self.priority as i64)),
            "JMSMessageID" => Some(PropertyValue::String(self.id.to_string())),
            "JMSTimestamp" => Some(PropertyValue::Int(self.timestamp)),
            "JMSExpiration" => Some(PropertyValue::Int(self.expiration.unwrap_or(0))),
            "JMSDeliveryTime" => Some(PropertyValue::Int(self.delivery_time.unwrap_or(0))),
            "JMSDeliveryMode" => Some(PropertyValue::String(
                if self.persistent {
                    "PERSISTENT"
                } else {
                    "NON_PERSISTENT"
                }
                .to_string(),
            )),
            "JMSType" => self.message_type.clone().map(PropertyValue::String),
            "JMSCorrelationID" => self.correlation_id.clone().map(PropertyValue::String),
            _ => None,
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        matches!(self.expiration, Some(exp) if exp > 0 && exp <= now)
    }

    /// Approximate in-memory size used for destination byte accounting.
    pub fn byte_size(&self) -> u64 {
        let props: usize = self
            .properties
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        PropertyValue::String(s) => s.len(),
                        _ => 8,
                    }
            })
            .sum();
        (self.body.len() + props + 64) as u64
    }
}
