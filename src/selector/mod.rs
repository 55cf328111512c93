//! Message selectors: the SQL-92 subset JMS uses to filter messages on their
//! properties and `JMS*` headers.
//!
//! A selector is compiled once, when a consumer subscribes; a compile error is
//! returned to the subscriber. Evaluation uses three-valued logic and anything
//! that is not definitely `TRUE` (unknown, type mismatch, missing property)
//! does not match.

mod parser;

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;

use crate::message::{Packet, PropertyValue};
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl From<PropertyValue> for Value {
    fn from(v: PropertyValue) -> Self {
        match v {
            PropertyValue::Bool(b) => Value::Bool(b),
            PropertyValue::Int(i) => Value::Int(i),
            PropertyValue::Double(d) => Value::Double(d),
            PropertyValue::String(s) => Value::Str(s),
        }
    }
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Expr {
    Literal(Value),
    Identifier(String),
    Negate(Box<Expr>),
    Arith {
        op: char,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: &'static str,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Value>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Regex,
        negated: bool,
    },
}

fn negate(result: Option<bool>, negated: bool) -> Option<bool> {
    if negated { result.map(|b| !b) } else { result }
}

impl Expr {
    fn visit_identifiers(&self, f: &mut impl FnMut(&str)) {
        match self {
            Expr::Literal(_) => {}
            Expr::Identifier(name) => f(name),
            Expr::Negate(e) | Expr::Not(e) => e.visit_identifiers(f),
            Expr::IsNull { expr, .. } | Expr::In { expr, .. } | Expr::Like { expr, .. } => {
                expr.visit_identifiers(f)
            }
            Expr::Arith { left, right, .. }
            | Expr::Compare { left, right, .. }
            | Expr::And(left, right)
            | Expr::Or(left, right) => {
                left.visit_identifiers(f);
                right.visit_identifiers(f);
            }
            Expr::Between { expr, low, high, .. } => {
                expr.visit_identifiers(f);
                low.visit_identifiers(f);
                high.visit_identifiers(f);
            }
        }
    }

    fn value(&self, packet: &Packet) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Identifier(name) => {
                let found = if name.starts_with("JMS") {
                    packet.header(name)
                } else {
                    packet.property(name).cloned()
                };
                found.map_or(Value::Null, Value::from)
            }
            Expr::Negate(e) => match e.value(packet) {
                Value::Int(i) => i.checked_neg().map_or(Value::Null, Value::Int),
                Value::Double(d) => Value::Double(-d),
                _ => Value::Null,
            },
            Expr::Arith { op, left, right } => arith(*op, left.value(packet), right.value(packet)),
            other => match other.truth(packet) {
                Some(b) => Value::Bool(b),
                None => Value::Null,
            },
        }
    }

    fn truth(&self, packet: &Packet) -> Option<bool> {
        match self {
            Expr::And(l, r) => match (l.truth(packet), r.truth(packet)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Expr::Or(l, r) => match (l.truth(packet), r.truth(packet)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            Expr::Not(e) => e.truth(packet).map(|b| !b),
            Expr::Compare { op, left, right } => {
                let (l, r) = (left.value(packet), right.value(packet));
                if l == Value::Null || r == Value::Null {
                    return None;
                }
                let ordering = l.compare(&r)?;
                let bool_or_string = matches!(l, Value::Bool(_) | Value::Str(_));
                match *op {
                    "=" => Some(ordering == Ordering::Equal),
                    "<>" => Some(ordering != Ordering::Equal),
                    _ if bool_or_string => None,
                    "<" => Some(ordering == Ordering::Less),
                    "<=" => Some(ordering != Ordering::Greater),
                    ">" => Some(ordering == Ordering::Greater),
                    ">=" => Some(ordering != Ordering::Less),
                    _ => None,
                }
            }
            Expr::IsNull { expr, negated } => {
                let is_null = expr.value(packet) == Value::Null;
                Some(is_null != *negated)
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let v = expr.value(packet);
                let (lo, hi) = (low.value(packet), high.value(packet));
                v.as_f64()?;
                let inside = v.compare(&lo)? != Ordering::Less && v.compare(&hi)? != Ordering::Greater;
                negate(Some(inside), *negated)
            }
            Expr::In { expr, list, negated } => {
                let v = expr.value(packet);
                if v == Value::Null {
                    return None;
                }
                let found = list
                    .iter()
                    .any(|item| v.compare(item) == Some(Ordering::Equal));
                negate(Some(found), *negated)
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => match expr.value(packet) {
                Value::Str(s) => negate(Some(pattern.is_match(&s)), *negated),
                _ => None,
            },
            other => match other.value(packet) {
                Value::Bool(b) => Some(b),
                _ => None,
            },
        }
    }
}

fn arith(op: char, left: Value, right: Value) -> Value {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => match op {
            '+' => a.checked_add(*b).map_or(Value::Null, Value::Int),
            '-' => a.checked_sub(*b).map_or(Value::Null, Value::Int),
            '*' => a.checked_mul(*b).map_or(Value::Null, Value::Int),
            _ => a.checked_div(*b).map_or(Value::Null, Value::Int),
        },
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => Value::Double(match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                _ => a / b,
            }),
            _ => Value::Null,
        },
    }
}

/// A compiled message selector.
pub struct Selector {
    source: String,
    expr: Expr,
    uses_properties: bool,
    uses_headers: bool,
}

impl Selector {
    pub fn compile(source: &str) -> Result<Self> {
        let invalid = |reason: String| BrokerError::InvalidSelector {
            selector: source.to_string(),
            reason,
        };
        let expr = parser::Parser::new(source)
            .and_then(|p| p.parse())
            .map_err(invalid)?;

        let mut uses_properties = false;
        let mut uses_headers = false;
        expr.visit_identifiers(&mut |name| {
            if name.starts_with("JMS") {
                uses_headers = true;
            } else {
                uses_properties = true;
            }
        });
        Ok(Self {
            source: source.to_string(),
            expr,
            uses_properties,
            uses_headers,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn uses_properties(&self) -> bool {
        self.uses_properties
    }

    pub fn uses_headers(&self) -> bool {
        self.uses_headers
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        self.expr.truth(packet) == Some(true)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Selector").field(&self.source).finish()
    }
}

#[cfg(test)]
mod tests;
