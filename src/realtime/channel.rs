//! # Channel Keys
//!
//! Canonical channel keys and row filters.
//!
//! Two requests with the same scoping parameters always produce the same
//! key, which is what lets the registry share one transport channel
//! between any number of subscribers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};

/// Filter operator for row filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    /// Operator name as used in channel keys
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
        }
    }
}

/// Row filter scoping an entity subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFilter {
    /// Column to filter on
    pub column: String,
    /// Operator
    pub op: FilterOp,
    /// Value to compare
    pub value: Value,
}

impl ChangeFilter {
    /// Equality filter, the common case
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: canonical_value(value),
        }
    }

    /// Same filter with integral floats written as integers
    pub fn canonical(mut self) -> Self {
        self.value = canonical_value(self.value);
        self
    }

    /// Parse `column=op.value`, e.g. `status=eq.active` or `age=gt.30`.
    ///
    /// The value is read as JSON when it parses, otherwise as a string.
    pub fn parse(text: &str) -> RealtimeResult<Self> {
        let (column, rest) = text
            .split_once('=')
            .ok_or_else(|| RealtimeError::InvalidTopic(format!("filter '{}' has no '='", text)))?;
        let (op, raw) = rest
            .split_once('.')
            .ok_or_else(|| RealtimeError::InvalidTopic(format!("filter '{}' has no operator", text)))?;

        let op = match op {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "in" => FilterOp::In,
            other => {
                return Err(RealtimeError::InvalidTopic(format!(
                    "unknown filter operator '{}'",
                    other
                )))
            }
        };

        validate_name("filter column", column)?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

        Ok(Self {
            column: column.to_string(),
            op,
            value: canonical_value(value),
        })
    }

    /// Check if a record matches this filter
    pub fn matches(&self, record: &Value) -> bool {
        let Some(field_value) = record.get(&self.column) else {
            return false;
        };

        let ordered = |cmp: fn(f64, f64) -> bool| match (field_value.as_f64(), self.value.as_f64()) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => false,
        };

        match self.op {
            FilterOp::Eq => same_value(field_value, &self.value),
            FilterOp::Neq => !same_value(field_value, &self.value),
            FilterOp::Gt => ordered(|a, b| a > b),
            FilterOp::Gte => ordered(|a, b| a >= b),
            FilterOp::Lt => ordered(|a, b| a < b),
            FilterOp::Lte => ordered(|a, b| a <= b),
            FilterOp::In => self
                .value
                .as_array()
                .map(|arr| arr.iter().any(|v| same_value(field_value, v)))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // serde_json renders compactly and deterministically
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

/// What a channel is scoped to
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelScope {
    /// Row changes of one entity, optionally filtered
    Entity {
        entity: String,
        filter: Option<ChangeFilter>,
    },
    /// Presence room
    Presence { room: String },
    /// Broadcast topic
    Broadcast { topic: String },
}

impl ChannelScope {
    /// Derive the canonical key for this scope
    pub fn key(&self) -> ChannelKey {
        let raw = match self {
            ChannelScope::Entity {
                entity,
                filter: None,
            } => format!("entity:{}/*", entity),
            ChannelScope::Entity {
                entity,
                filter: Some(filter),
            } => format!("entity:{}/{}", entity, filter),
            ChannelScope::Presence { room } => format!("presence:{}", room),
            ChannelScope::Broadcast { topic } => format!("broadcast:{}", topic),
        };
        ChannelKey(raw)
    }
}

/// Canonical, opaque channel key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Key for row changes on an entity
    pub fn entity(entity: &str, filter: Option<&ChangeFilter>) -> RealtimeResult<Self> {
        Ok(Self::entity_scope(entity, filter)?.key())
    }

    /// Key for a presence room
    pub fn presence(room: &str) -> RealtimeResult<Self> {
        validate_name("room", room)?;
        Ok(ChannelScope::Presence {
            room: room.to_string(),
        }
        .key())
    }

    /// Key for a broadcast topic
    pub fn broadcast(topic: &str) -> RealtimeResult<Self> {
        validate_name("topic", topic)?;
        Ok(ChannelScope::Broadcast {
            topic: topic.to_string(),
        }
        .key())
    }

    pub(crate) fn entity_scope(
        entity: &str,
        filter: Option<&ChangeFilter>,
    ) -> RealtimeResult<ChannelScope> {
        validate_name("entity", entity)?;
        if let Some(filter) = filter {
            validate_name("filter column", &filter.column)?;
        }
        Ok(ChannelScope::Entity {
            entity: entity.to_string(),
            filter: filter.cloned().map(ChangeFilter::canonical),
        })
    }

    /// Key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Largest magnitude at which every integer is exact in an f64
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Rewrite integral floats (`1.0`) as integers (`1`), recursing into arrays
fn canonical_value(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() <= MAX_EXACT_FLOAT => Value::from(f as i64),
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_value).collect()),
        other => other,
    }
}

/// JSON equality where numbers compare by value (`1 == 1.0`)
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_f64() || y.is_f64() => {
            x.as_f64() == y.as_f64()
        }
        _ => a == b,
    }
}

fn validate_name(what: &str, name: &str) -> RealtimeResult<()> {
    if name.is_empty() {
        return Err(RealtimeError::InvalidTopic(format!("{} must not be empty", what)));
    }
    if name.contains(['/', ':']) {
        return Err(RealtimeError::InvalidTopic(format!(
            "{} '{}' must not contain '/' or ':'",
            what, name
        )));
    }
    Ok(())
}
