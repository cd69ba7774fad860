//! Field paths and the descriptors resolved from an entity schema.

use std::fmt;

use serde::{Serialize, Serializer};

use super::operators::{OperatorKind, OperatorSet};

/// An ordered list of path segments; every segment but the last names a
/// relation to traverse.
///
/// Produced once when a schema is compiled and reused by every clause that
/// references the field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path. Empty segments are rejected.
    pub fn parse(dotted: &str) -> Option<Self> {
        let segments: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if segments.iter().any(|segment| segment.trim().is_empty()) {
            return None;
        }
        Some(Self { segments })
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self {
            segments: vec![name.into()],
        }
    }

    pub fn from_segments(segments: Vec<String>) -> Option<Self> {
        (!segments.is_empty() && segments.iter().all(|segment| !segment.is_empty()))
            .then_some(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Relation segments leading to the leaf column.
    pub fn relation(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    pub fn leaf(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    pub fn is_relation(&self) -> bool {
        self.segments.len() > 1
    }

    /// Extend this path with one more segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        let count = u32::try_from(self.segments.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&count.to_be_bytes());
        for segment in &self.segments {
            let len = u32::try_from(segment.len()).unwrap_or(u32::MAX);
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(segment.as_bytes());
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// How operands for a field are typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Scalar,
    IdentifierList,
    DateRange,
    Numeric,
}

/// A canonical, typed description of a filterable field.
///
/// Immutable once compiled; shared by reference between resolutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub path: FieldPath,
    pub value_type: ValueType,
    pub is_obfuscated_id: bool,
    pub is_relation_count: bool,
    pub default_operator: OperatorKind,
    pub allowed_operators: OperatorSet,
}

impl FieldDescriptor {
    pub fn allows(&self, operator: OperatorKind) -> bool {
        self.allowed_operators.contains(operator)
    }
}
