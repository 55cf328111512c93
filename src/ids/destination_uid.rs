//! Destination identifiers and wildcard topic patterns.
//!
//! A destination is named by `(name, kind)`. Topic names may be wildcard
//! patterns over dot-separated tokens:
//!
//! - `*` matches exactly one token (`stock.*` matches `stock.ibm`)
//! - `**` matches one or more tokens
//! - a trailing `>` matches the prefix itself and anything below it
//!   (`stock.>` matches `stock`, `stock.ibm` and `stock.ibm.nyse`)
//!
//! Patterns are compiled to a `regex::Regex` once, when the id is created.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

use crate::utils::{BrokerError, Result};

/// Characters a single `*` token may match.
const ONE_TOKEN: &str = r"[\p{L}\p{N}$_]+";
const MANY_TOKENS: &str = r"\S+";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    Queue,
    Topic,
}

impl DestinationType {
    fn prefix(&self) -> &'static str {
        match self {
            DestinationType::Queue => "Q:",
            DestinationType::Topic => "T:",
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::Queue => f.write_str("queue"),
            DestinationType::Topic => f.write_str("topic"),
        }
    }
}

struct Inner {
    name: String,
    kind: DestinationType,
    unique: String,
    pattern: Option<Regex>,
}

/// Identifies a queue or topic. Cheap to clone.
#[derive(Clone)]
pub struct DestinationUid(Arc<Inner>);

pub fn is_wildcard(name: &str) -> bool {
    name.contains('*') || name.contains('>')
}

fn malformed(name: &str, reason: &str) -> BrokerError {
    BrokerError::InvalidDestination {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_segments(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(malformed(name, "name is empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(malformed(name, "name contains whitespace"));
    }
    if name.starts_with('.') {
        return Err(malformed(name, "name starts with ."));
    }
    if name.ends_with('.') {
        return Err(malformed(name, "name ends with ."));
    }
    if name.contains("..") {
        return Err(malformed(name, "name contains .."));
    }
    Ok(())
}

/// Translate a wildcard pattern into an anchored regular expression.
///
/// A trailing `>` matches the prefix and everything below it. The dot before
/// it is optional: `stock>` is the short spelling of `stock.>`, and neither
/// matches `stocks`.
pub fn wildcard_regex(pattern: &str) -> Result<String> {
    validate_segments(pattern)?;

    let (body, to_end) = match pattern.strip_suffix('>') {
        Some(rest) => (rest.strip_suffix('.').unwrap_or(rest), true),
        None => (pattern, false),
    };
    if body.contains('>') {
        return Err(malformed(pattern, "> must be the last character"));
    }

    let mut re = String::with_capacity(pattern.len() * 4);
    re.push('^');
    if body.is_empty() {
        re.push_str(MANY_TOKENS);
        re.push('$');
        return Ok(re);
    }
    for (i, token) in body.split('.').enumerate() {
        if i > 0 {
            re.push_str(r"\.");
        }
        match token {
            "*" => re.push_str(ONE_TOKEN),
            "**" => re.push_str(MANY_TOKENS),
            t if t.contains('*') => {
                return Err(malformed(pattern, "wildcard should be surrounded by ."));
            }
            t => re.push_str(&regex::escape(t)),
        }
    }
    if to_end {
        re.push_str(r"(\.\S+)?");
    }
    re.push('$');
    Ok(re)
}

fn unique_string(name: &str, kind: DestinationType) -> String {
    let mut unique = String::with_capacity(name.len() + 2);
    unique.push_str(kind.prefix());
    unique.extend(name.chars().map(|c| if c == '/' { '_' } else { c }));
    unique
}

impl DestinationUid {
    pub fn new(name: &str, kind: DestinationType) -> Result<Self> {
        validate_segments(name)?;
        let pattern = if is_wildcard(name) {
            if kind == DestinationType::Queue {
                return Err(BrokerError::QueueWildcard(name.to_string()));
            }
            let re = wildcard_regex(name)?;
            let compiled = Regex::new(&re).map_err(|e| malformed(name, &e.to_string()))?;
            Some(compiled)
        } else {
            None
        };
        Ok(Self(Arc::new(Inner {
            name: name.to_string(),
            kind,
            unique: unique_string(name, kind),
            pattern,
        })))
    }

    pub fn queue(name: &str) -> Result<Self> {
        Self::new(name, DestinationType::Queue)
    }

    pub fn topic(name: &str) -> Result<Self> {
        Self::new(name, DestinationType::Topic)
    }

    /// Rebuild an id from its unique form (`Q:name` / `T:name`).
    pub fn parse(unique: &str) -> Result<Self> {
        if let Some(name) = unique.strip_prefix("Q:") {
            Self::queue(name)
        } else if let Some(name) = unique.strip_prefix("T:") {
            Self::topic(name)
        } else {
            Err(malformed(unique, "missing Q: or T: prefix"))
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> DestinationType {
        self.0.kind
    }

    pub fn is_queue(&self) -> bool {
        self.0.kind == DestinationType::Queue
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.pattern.is_some()
    }

    pub fn unique_name(&self) -> &str {
        &self.0.unique
    }

    pub fn long_name(&self) -> String {
        format!("{}:{}", self.0.kind, self.0.name)
    }

    /// Does `self` match `other`, where at most one of the two is a wildcard?
    ///
    /// Two wildcards never match each other.
    pub fn matches(&self, other: &DestinationUid) -> bool {
        if self.kind() != other.kind() {
            return false;
        }
        match (&self.0.pattern, &other.0.pattern) {
            (None, None) => self == other,
            (Some(p), None) => p.is_match(other.name()),
            (None, Some(p)) => p.is_match(self.name()),
            (Some(_), Some(_)) => {
                debug!(left = %self, right = %other, "cannot compare two wildcards");
                false
            }
        }
    }
}

impl PartialEq for DestinationUid {
    fn eq(&self, other: &Self) -> bool {
        self.0.unique == other.0.unique
    }
}

impl Eq for DestinationUid {}

impl Hash for DestinationUid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.unique.hash(state);
    }
}

impl PartialOrd for DestinationUid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DestinationUid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.unique.cmp(&other.0.unique)
    }
}

impl fmt::Display for DestinationUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.unique)
    }
}

impl fmt::Debug for DestinationUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DestinationUid").field(&self.0.unique).finish()
    }
}

impl Serialize for DestinationUid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.unique)
    }
}

impl<'de> Deserialize<'de> for DestinationUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let unique = String::deserialize(deserializer)?;
        DestinationUid::parse(&unique).map_err(de::Error::custom)
    }
}

/// Shares one `DestinationUid` per `(name, kind)`.
///
/// Entries are released explicitly, or swept once the interner holds the
/// only remaining handle.
#[derive(Default)]
pub struct UidInterner {
    queues: Mutex<HashMap<String, DestinationUid>>,
    topics: Mutex<HashMap<String, DestinationUid>>,
}

impl UidInterner {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: DestinationType) -> &Mutex<HashMap<String, DestinationUid>> {
        match kind {
            DestinationType::Queue => &self.queues,
            DestinationType::Topic => &self.topics,
        }
    }

    pub fn get(&self, name: &str, kind: DestinationType) -> Result<DestinationUid> {
        let mut table = self.table(kind).lock();
        if let Some(uid) = table.get(name) {
            return Ok(uid.clone());
        }
        let uid = DestinationUid::new(name, kind)?;
        table.insert(name.to_string(), uid.clone());
        Ok(uid)
    }

    pub fn release(&self, uid: &DestinationUid) {
        self.table(uid.kind()).lock().remove(uid.name());
    }

    /// Drop every entry nobody outside the interner still holds.
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;
        for kind in [DestinationType::Queue, DestinationType::Topic] {
            let mut table = self.table(kind).lock();
            let before = table.len();
            table.retain(|_, uid| Arc::strong_count(&uid.0) > 1);
            evicted += before - table.len();
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len() + self.topics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for UidInterner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UidInterner")
            .field("entries", &self.len())
            .finish()
    }
}
