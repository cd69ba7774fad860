//! Write events that drive cache invalidation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::tags::{entity_tag, record_tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Create,
    Update,
    Delete,
}

impl WriteOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOperation::Create => "create",
            WriteOperation::Update => "update",
            WriteOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted by a write path after it mutates records of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationEvent {
    /// Unique per event; lets retried deliveries be correlated in logs.
    pub id: Uuid,
    pub entity: String,
    pub affected_ids: BTreeSet<u64>,
    pub operation: WriteOperation,
    pub occurred_at: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(
        entity: impl Into<String>,
        operation: WriteOperation,
        affected_ids: impl IntoIterator<Item = u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity: entity.into(),
            affected_ids: affected_ids.into_iter().collect(),
            operation,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn created(entity: impl Into<String>, id: u64) -> Self {
        Self::new(entity, WriteOperation::Create, [id])
    }

    pub fn updated(entity: impl Into<String>, id: u64) -> Self {
        Self::new(entity, WriteOperation::Update, [id])
    }

    pub fn deleted(entity: impl Into<String>, id: u64) -> Self {
        Self::new(entity, WriteOperation::Delete, [id])
    }

    /// The entity tag plus one record tag per affected id.
    pub fn tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = self
            .affected_ids
            .iter()
            .map(|id| record_tag(&self.entity, *id))
            .collect();
        tags.insert(entity_tag(&self.entity));
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_cover_collection_and_records() {
        let event = InvalidationEvent::new("users", WriteOperation::Update, [42, 7]);
        let tags: Vec<String> = event.tags().into_iter().collect();
        assert_eq!(tags, ["users", "users:42", "users:7"]);
    }

    #[test]
    fn events_get_unique_ids() {
        assert_ne!(
            InvalidationEvent::created("users", 1).id,
            InvalidationEvent::created("users", 1).id
        );
    }
}
