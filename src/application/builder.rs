//! Folds resolved clauses and criteria into one predicate tree.
//!
//! Each part added to a [`PredicateBuilder`] becomes one AND-ed child, so the
//! internal join mode of a grammar group never leaks into its neighbours.

use crate::application::resolver::ResolvedClause;
use crate::domain::predicate::{Connector, PredicateNode};

/// Join a grammar group's clauses with its single join mode.
pub fn fold_clauses(clauses: Vec<ResolvedClause>, join: Connector) -> Option<PredicateNode> {
    PredicateNode::group(join, clauses.into_iter().map(ResolvedClause::into_predicate))
}

/// Accumulates subtrees in insertion order and ANDs them.
#[derive(Debug, Default, Clone)]
pub struct PredicateBuilder {
    parts: Vec<PredicateNode>,
}

impl PredicateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subtree; `None` contributes nothing.
    pub fn and(mut self, part: Option<PredicateNode>) -> Self {
        if let Some(part) = part {
            self.parts.push(part);
        }
        self
    }

    /// Add a grammar group as a single child.
    pub fn clauses(self, clauses: Vec<ResolvedClause>, join: Connector) -> Self {
        self.and(fold_clauses(clauses, join))
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// `None` when nothing was added, meaning "match all".
    pub fn build(self) -> Option<PredicateNode> {
        PredicateNode::all(self.parts)
    }
}
