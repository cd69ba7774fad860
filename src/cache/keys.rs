//! Cache identities for repository queries.
//!
//! A key is derived from a canonical byte stream describing the query, so two
//! requests that differ only in clause order share one entry while any change
//! to filters, sorting, includes, projection or paging yields a new key.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::xxh3_128;

use crate::application::criteria::CriteriaContext;
use crate::application::repos::{Pagination, QuerySpec, SortDirection};

const ENCODING_VERSION: u8 = 1;

/// Terminal operations whose results can be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    All,
    Find,
    Paginate,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::All => "all",
            OperationKind::Find => "find",
            OperationKind::Paginate => "paginate",
        }
    }
}

/// A terminal operation with the arguments that shape its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOperation {
    All,
    Find(u64),
    Paginate(Pagination),
}

impl CacheOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            CacheOperation::All => OperationKind::All,
            CacheOperation::Find(_) => OperationKind::Find,
            CacheOperation::Paginate(_) => OperationKind::Paginate,
        }
    }
}

#[derive(Clone)]
enum KeyHasher {
    /// xxh3-128; fine for a private store.
    Fast,
    /// Secret-prefixed SHA-256, so keys cannot be predicted by other tenants.
    Keyed(Vec<u8>),
}

#[derive(Clone)]
pub struct CacheKeyComputer {
    prefix: String,
    hasher: KeyHasher,
}

impl CacheKeyComputer {
    pub fn new(prefix: impl Into<String>, secret: Option<&str>) -> Self {
        let hasher = match secret {
            Some(secret) if !secret.is_empty() => KeyHasher::Keyed(secret.as_bytes().to_vec()),
            _ => KeyHasher::Fast,
        };
        Self {
            prefix: prefix.into(),
            hasher,
        }
    }

    /// `{prefix}:{entity}:{hex digest}`, or the context's override verbatim.
    pub fn compute_key(
        &self,
        query: &QuerySpec,
        context: &CriteriaContext,
        operation: &CacheOperation,
    ) -> String {
        if let Some(key) = &context.cache_key_override {
            return key.clone();
        }
        let bytes = canonical_bytes(query, operation);
        format!("{}:{}:{}", self.prefix, query.entity, self.digest(&bytes))
    }

    fn digest(&self, bytes: &[u8]) -> String {
        match &self.hasher {
            KeyHasher::Fast => hex::encode(xxh3_128(bytes).to_be_bytes()),
            KeyHasher::Keyed(secret) => {
                let mut hasher = Sha256::new();
                hasher.update((secret.len() as u64).to_be_bytes());
                hasher.update(secret);
                hasher.update(bytes);
                hex::encode(hasher.finalize())
            }
        }
    }
}

impl fmt::Debug for CacheKeyComputer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hasher = match self.hasher {
            KeyHasher::Fast => "xxh3-128",
            KeyHasher::Keyed(_) => "sha256-keyed",
        };
        f.debug_struct("CacheKeyComputer")
            .field("prefix", &self.prefix)
            .field("hasher", &hasher)
            .finish()
    }
}

/// Serialize the parts of a query that determine its result.
///
/// The predicate is written in canonical form; sets are already sorted; the
/// order-by list keeps its order because it changes the result.
pub(crate) fn canonical_bytes(query: &QuerySpec, operation: &CacheOperation) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.push(ENCODING_VERSION);
    write_str(&mut out, &query.entity);

    match &query.predicate {
        Some(predicate) => {
            out.push(0x01);
            predicate.canonical().write_canonical(&mut out);
        }
        None => out.push(0x00),
    }

    write_len(&mut out, query.order_by.len());
    for order in &query.order_by {
        order.field.write_canonical(&mut out);
        out.push(match order.direction {
            SortDirection::Asc => 0x00,
            SortDirection::Desc => 0x01,
        });
    }

    for set in [&query.includes, &query.counts, &query.columns] {
        write_len(&mut out, set.len());
        for item in set {
            write_str(&mut out, item);
        }
    }

    match operation {
        CacheOperation::All => out.push(0x00),
        CacheOperation::Find(id) => {
            out.push(0x01);
            out.extend_from_slice(&id.to_be_bytes());
        }
        CacheOperation::Paginate(pagination) => {
            out.push(0x02);
            out.extend_from_slice(&pagination.page.get().to_be_bytes());
            out.extend_from_slice(&pagination.per_page.get().to_be_bytes());
        }
    }
    out
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
}

fn write_str(out: &mut Vec<u8>, value: &str) {
    write_len(out, value.len());
    out.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::repos::OrderBy;
    use crate::domain::fields::FieldPath;
    use crate::domain::operators::OperatorKind;
    use crate::domain::predicate::{Condition, PredicateNode};
    use crate::domain::values::Value;

    fn eq(field: &str, value: &str) -> PredicateNode {
        PredicateNode::leaf(Condition::field(
            FieldPath::single(field),
            OperatorKind::Eq,
            vec![Value::text(value)],
        ))
    }

    fn query(predicate: Option<PredicateNode>) -> QuerySpec {
        QuerySpec {
            predicate,
            ..QuerySpec::new("users")
        }
    }

    fn key(query: &QuerySpec, operation: CacheOperation) -> String {
        CacheKeyComputer::new("sifter", None).compute_key(
            query,
            &CriteriaContext::default(),
            &operation,
        )
    }

    #[test]
    fn key_has_prefix_entity_and_digest() {
        let key = key(&query(None), CacheOperation::All);
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts[0], "sifter");
        assert_eq!(parts[1], "users");
        assert_eq!(parts[2].len(), 32);
    }

    #[test]
    fn reordered_clauses_share_a_key() {
        let left = query(PredicateNode::all([eq("status", "active"), eq("verified", "true")]));
        let right = query(PredicateNode::all([eq("verified", "true"), eq("status", "active")]));
        assert_eq!(key(&left, CacheOperation::All), key(&right, CacheOperation::All));
    }

    #[test]
    fn every_shaping_input_changes_the_key() {
        let base = query(PredicateNode::all([eq("status", "active")]));
        let base_key = key(&base, CacheOperation::Paginate(Pagination::new(1, 15)));

        let mut value = base.clone();
        value.predicate = PredicateNode::all([eq("status", "banned")]);

        let mut sorted = base.clone();
        sorted.order_by.push(OrderBy {
            field: FieldPath::single("name"),
            direction: SortDirection::Desc,
        });
        let mut sorted_asc = base.clone();
        sorted_asc.order_by.push(OrderBy {
            field: FieldPath::single("name"),
            direction: SortDirection::Asc,
        });

        let mut included = base.clone();
        included.includes.insert("roles".to_string());

        let mut projected = base.clone();
        projected.columns.insert("email".to_string());

        let variants = [
            key(&value, CacheOperation::Paginate(Pagination::new(1, 15))),
            key(&sorted, CacheOperation::Paginate(Pagination::new(1, 15))),
            key(&sorted_asc, CacheOperation::Paginate(Pagination::new(1, 15))),
            key(&included, CacheOperation::Paginate(Pagination::new(1, 15))),
            key(&projected, CacheOperation::Paginate(Pagination::new(1, 15))),
            key(&base, CacheOperation::Paginate(Pagination::new(2, 15))),
            key(&base, CacheOperation::All),
        ];
        for variant in &variants {
            assert_ne!(variant, &base_key);
        }
        assert_ne!(variants[1], variants[2]);
    }

    #[test]
    fn override_bypasses_computation() {
        let context = CriteriaContext {
            cache_key_override: Some("manual".to_string()),
            ..CriteriaContext::default()
        };
        let key = CacheKeyComputer::new("sifter", None).compute_key(
            &query(None),
            &context,
            &CacheOperation::All,
        );
        assert_eq!(key, "manual");
    }

    #[test]
    fn keyed_hashing_depends_on_the_secret() {
        let spec = query(None);
        let context = CriteriaContext::default();
        let one = CacheKeyComputer::new("sifter", Some("one"));
        let two = CacheKeyComputer::new("sifter", Some("two"));
        let first = one.compute_key(&spec, &context, &CacheOperation::All);
        assert_ne!(first, two.compute_key(&spec, &context, &CacheOperation::All));
        assert_eq!(first.rsplit(':').next().map(str::len), Some(64));
        assert!(!format!("{one:?}").contains("one\""));
    }
}
