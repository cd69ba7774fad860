//! Reusable query-narrowing criteria and the per-call context they feed.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::application::repos::OrderBy;
use crate::domain::predicate::PredicateNode;
use crate::domain::schema::EntitySchema;

/// Identity of a criterion. Clones of a criterion share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CriterionId(Uuid);

impl CriterionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CriterionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a custom criterion sees when it contributes its subtree.
#[derive(Debug, Clone, Copy)]
pub struct CriteriaScope<'a> {
    pub schema: &'a EntitySchema,
}

type CustomFn = dyn Fn(&CriteriaScope<'_>) -> Option<PredicateNode> + Send + Sync;

#[derive(Clone)]
enum CriteriaKind {
    Fixed(PredicateNode),
    Custom(Arc<CustomFn>),
}

/// A named unit of query-narrowing logic.
#[derive(Clone)]
pub struct Criteria {
    id: CriterionId,
    name: String,
    kind: CriteriaKind,
}

impl Criteria {
    /// A criterion that always contributes `predicate`.
    pub fn predicate(name: impl Into<String>, predicate: PredicateNode) -> Self {
        Self {
            id: CriterionId::new(),
            name: name.into(),
            kind: CriteriaKind::Fixed(predicate),
        }
    }

    /// A criterion computed from the entity being queried.
    ///
    /// `build` must be pure: it may be called once per terminal operation and
    /// its result feeds the cache key.
    pub fn custom<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn(&CriteriaScope<'_>) -> Option<PredicateNode> + Send + Sync + 'static,
    {
        Self {
            id: CriterionId::new(),
            name: name.into(),
            kind: CriteriaKind::Custom(Arc::new(build)),
        }
    }

    pub fn id(&self) -> CriterionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contribute(&self, scope: &CriteriaScope<'_>) -> Option<PredicateNode> {
        match &self.kind {
            CriteriaKind::Fixed(predicate) => Some(predicate.clone()),
            CriteriaKind::Custom(build) => build(scope),
        }
    }
}

impl fmt::Debug for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            CriteriaKind::Fixed(_) => "fixed",
            CriteriaKind::Custom(_) => "custom",
        };
        f.debug_struct("Criteria")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

/// Ordered criteria applied to every query of a repository.
///
/// Insertion order is preserved exactly when the stack is applied.
#[derive(Debug, Default, Clone)]
pub struct CriteriaStack {
    entries: Vec<Criteria>,
    skip: bool,
}

impl CriteriaStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, criteria: Criteria) -> CriterionId {
        let id = criteria.id();
        self.entries.push(criteria);
        id
    }

    /// Remove the first entry with this identity.
    pub fn pop(&mut self, id: CriterionId) -> Option<Criteria> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Skip criteria on the next terminal operation only.
    pub fn skip(&mut self, skip: bool) {
        self.skip = skip;
    }

    /// Read and reset the skip flag.
    pub fn take_skip(&mut self) -> bool {
        std::mem::take(&mut self.skip)
    }

    pub fn is_skipping(&self) -> bool {
        self.skip
    }

    pub fn ids(&self) -> Vec<CriterionId> {
        self.entries.iter().map(Criteria::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Criteria> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything configured for one terminal operation.
///
/// Built fresh per call chain and consumed once.
#[derive(Debug, Clone, Default)]
pub struct CriteriaContext {
    /// Identities of the criteria that were applied, in order.
    pub stack: Vec<CriterionId>,
    pub skip_criteria: bool,
    pub skip_cache: bool,
    pub cache_ttl: Option<Duration>,
    pub cache_key_override: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub includes: BTreeSet<String>,
    pub counts: BTreeSet<String>,
    pub columns: BTreeSet<String>,
}
