//! The boundary to whatever executes finished queries.

use std::collections::BTreeSet;
use std::num::NonZeroU64;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::fields::FieldPath;
use crate::domain::predicate::PredicateNode;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("query engine failure: {0}")]
    Backend(String),
    #[error("query engine timed out")]
    Timeout,
}

impl EngineError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: SortDirection,
}

/// One-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pagination {
    pub page: NonZeroU64,
    pub per_page: NonZeroU64,
}

impl Pagination {
    pub const DEFAULT_PER_PAGE: NonZeroU64 = NonZeroU64::MIN.saturating_add(14);

    /// Zero values are raised to the first page and the default page size.
    pub fn new(page: u64, per_page: u64) -> Self {
        Self {
            page: NonZeroU64::new(page).unwrap_or(NonZeroU64::MIN),
            per_page: NonZeroU64::new(per_page).unwrap_or(Self::DEFAULT_PER_PAGE),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page.get() - 1).saturating_mul(self.per_page.get())
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_PER_PAGE.get())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Everything an engine needs to run one query.
///
/// The engine receives only this structured form, never query-language text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySpec {
    pub entity: String,
    /// `None` matches every record.
    pub predicate: Option<PredicateNode>,
    pub order_by: Vec<OrderBy>,
    pub includes: BTreeSet<String>,
    pub counts: BTreeSet<String>,
    pub columns: BTreeSet<String>,
}

impl QuerySpec {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            order_by: Vec::new(),
            includes: BTreeSet::new(),
            counts: BTreeSet::new(),
            columns: BTreeSet::new(),
        }
    }
}

/// Executes structured queries against a data source.
///
/// Calls are synchronous from this crate's point of view; an async adapter
/// belongs at the integration boundary. An `in` leaf with no operands matches
/// no rows.
pub trait QueryEngine: Send + Sync {
    type Row: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn fetch(&self, query: &QuerySpec) -> Result<Vec<Self::Row>, EngineError>;

    fn paginate(
        &self,
        query: &QuerySpec,
        pagination: Pagination,
    ) -> Result<Page<Self::Row>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_pagination_values_fall_back_to_defaults() {
        let pagination = Pagination::new(0, 0);
        assert_eq!(pagination.page.get(), 1);
        assert_eq!(pagination.per_page.get(), 15);
        assert_eq!(pagination.offset(), 0);
    }

    #[test]
    fn offset_skips_previous_pages() {
        assert_eq!(Pagination::new(3, 20).offset(), 40);
    }
}
