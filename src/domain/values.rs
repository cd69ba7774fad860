//! Typed operands carried by resolved clauses and predicate leaves.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Serialize, Serializer};
use time::Date;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

pub(crate) const DATE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// A typed operand.
///
/// Identifier operands are always decoded integers by the time a `Value` exists;
/// opaque tokens never reach a predicate tree.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Value {
    Id(u64),
    Int(i64),
    Float(f64),
    Text(String),
    #[serde(serialize_with = "serialize_date")]
    Date(Date),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    /// Parse a numeric operand, preferring integers.
    pub fn parse_number(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(value) = raw.parse::<i64>() {
            return Some(Value::Int(value));
        }
        raw.parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(Value::Float)
    }

    /// Parse a `YYYY-MM-DD` date operand.
    pub fn parse_date(raw: &str) -> Option<Self> {
        Date::parse(raw.trim(), DATE_FORMAT).ok().map(Value::Date)
    }

    pub fn as_id(&self) -> Option<u64> {
        match self {
            Value::Id(id) => Some(*id),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Id(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
        }
    }

    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        out.push(0x40 + self.rank());
        match self {
            Value::Id(id) => out.extend_from_slice(&id.to_be_bytes()),
            Value::Int(value) => out.extend_from_slice(&value.to_be_bytes()),
            Value::Float(value) => out.extend_from_slice(&value.to_bits().to_be_bytes()),
            Value::Text(value) => {
                let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(value.as_bytes());
            }
            Value::Date(date) => out.extend_from_slice(&date.to_julian_day().to_be_bytes()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Id(a), Value::Id(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Id(id) => id.hash(state),
            Value::Int(value) => value.hash(state),
            Value::Float(value) => value.to_bits().hash(state),
            Value::Text(value) => value.hash(state),
            Value::Date(date) => date.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Id(id) => write!(f, "{id}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Text(value) => write!(f, "{value:?}"),
            Value::Date(date) => write!(f, "{date}"),
        }
    }
}

fn serialize_date<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(date)
}
