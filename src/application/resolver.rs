//! Maps raw clauses onto an entity's field map.
//!
//! This is where client input meets the schema: relation traversal, operator
//! acceptance and identifier decoding are all enforced here, before anything
//! reaches a predicate tree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::application::error::RequestError;
use crate::application::grammar::{ParseError, RawClause, RawSort, SearchField, SearchItem};
use crate::application::repos::OrderBy;
use crate::domain::fields::{FieldDescriptor, FieldPath, ValueType};
use crate::domain::opaque_id::OpaqueIdCodec;
use crate::domain::operators::{Arity, OperatorKind, OperatorSet};
use crate::domain::predicate::{Condition, Connector, PredicateNode, Target};
use crate::domain::schema::{EntitySchema, FieldLookup};
use crate::domain::values::Value;

/// Whether a problem rejects the request or drops the offending part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    #[default]
    Strict,
    Lenient,
}

/// Process-wide resolution rules. Both strictness switches default to strict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPolicy {
    /// Unknown fields and undeclared relations.
    pub unknown_fields: Strictness,
    /// Identifier tokens that fail to decode.
    pub identifier_decode: Strictness,
    pub accepted_operators: OperatorSet,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            unknown_fields: Strictness::Strict,
            identifier_decode: Strictness::Strict,
            accepted_operators: OperatorSet::all(),
        }
    }
}

/// A clause bound to its field descriptor with typed operands.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedClause {
    pub descriptor: Arc<FieldDescriptor>,
    pub operator: OperatorKind,
    pub operands: Vec<Value>,
    pub connector: Connector,
    /// A nested sub-expression that must hold together with this clause.
    pub group: Option<PredicateNode>,
}

impl ResolvedClause {
    pub fn into_predicate(self) -> PredicateNode {
        let target = if self.descriptor.is_relation_count {
            Target::RelationCount(self.descriptor.path.clone())
        } else {
            Target::Field(self.descriptor.path.clone())
        };
        let leaf = PredicateNode::leaf(Condition::new(target, self.operator, self.operands));
        match self.group {
            Some(group) => PredicateNode::all([leaf.clone(), group]).unwrap_or(leaf),
            None => leaf,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldResolver {
    schema: Arc<EntitySchema>,
    codec: Arc<OpaqueIdCodec>,
    policy: Arc<ResolutionPolicy>,
}

impl FieldResolver {
    pub fn new(
        schema: Arc<EntitySchema>,
        codec: Arc<OpaqueIdCodec>,
        policy: Arc<ResolutionPolicy>,
    ) -> Self {
        Self {
            schema,
            codec,
            policy,
        }
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn codec(&self) -> &OpaqueIdCodec {
        &self.codec
    }

    pub fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    pub fn resolve_filter(&self, clauses: &[RawClause]) -> Result<Vec<ResolvedClause>, RequestError> {
        let mut resolved = Vec::with_capacity(clauses.len());
        for clause in clauses {
            if let Some(clause) = self.resolve_clause(clause, None)? {
                resolved.push(clause);
            }
        }
        Ok(resolved)
    }

    /// Resolve the `search` grammar.
    ///
    /// When `fields` is given it limits which fields may be searched and may
    /// override their operators. Bare terms expand to one clause per searchable
    /// field; fields whose type cannot hold the term are skipped.
    pub fn resolve_search(
        &self,
        items: &[SearchItem],
        fields: Option<&[SearchField]>,
        join: Connector,
    ) -> Result<Vec<ResolvedClause>, RequestError> {
        let overrides = match fields {
            Some(fields) => Some(self.search_overrides(fields)?),
            None => None,
        };

        let mut resolved = Vec::new();
        for item in items {
            match item {
                SearchItem::Clause(clause) => {
                    let operator = match &overrides {
                        Some(overrides) => match overrides.get(&clause.field) {
                            Some(operator) => operator.as_deref(),
                            None => {
                                self.reject_unknown(&clause.field)?;
                                continue;
                            }
                        },
                        None => None,
                    };
                    if let Some(clause) = self.resolve_clause(clause, operator)? {
                        resolved.push(clause);
                    }
                }
                SearchItem::Term { text } => {
                    resolved.extend(self.expand_term(text, overrides.as_ref(), join)?);
                }
            }
        }
        Ok(resolved)
    }

    /// Resolve one clause, or drop it under a lenient policy.
    ///
    /// `operator_override` applies only when the clause names no operator.
    pub fn resolve_clause(
        &self,
        raw: &RawClause,
        operator_override: Option<&str>,
    ) -> Result<Option<ResolvedClause>, RequestError> {
        let Some(descriptor) = self.lookup(&raw.field)? else {
            return Ok(None);
        };

        let operator = match raw.operator.as_deref().or(operator_override) {
            Some(token) => token
                .parse::<OperatorKind>()
                .map_err(|_| RequestError::unsupported_operator(&raw.field, token))?,
            None => descriptor.default_operator,
        };
        if !self.policy.accepted_operators.contains(operator) || !descriptor.allows(operator) {
            return Err(RequestError::unsupported_operator(
                &raw.field,
                operator.as_str(),
            ));
        }

        let operands = if descriptor.is_obfuscated_id {
            match self.decode_operands(&raw.field, operator, raw)? {
                Some(operands) => operands,
                None => return Ok(None),
            }
        } else {
            self.type_operands(&descriptor, &raw.field, operator, raw)?
        };

        debug!(
            entity = self.schema.name(),
            field = %descriptor.path,
            operator = operator.as_str(),
            operand_count = operands.len(),
            "Resolved clause"
        );

        Ok(Some(ResolvedClause {
            descriptor,
            operator,
            operands,
            connector: raw.connector,
            group: None,
        }))
    }

    /// Resolve `orderBy`/`sortedBy`. The primary key is always sortable.
    pub fn resolve_sort(&self, sorts: &[RawSort]) -> Result<Vec<OrderBy>, RequestError> {
        let mut order_by = Vec::with_capacity(sorts.len());
        for sort in sorts {
            let field = if sort.field == self.schema.primary_key() {
                FieldPath::single(sort.field.clone())
            } else {
                match self.lookup(&sort.field)? {
                    Some(descriptor) if !descriptor.is_relation_count => descriptor.path.clone(),
                    // counts are filterable but not sortable
                    Some(_) => {
                        self.reject_unknown(&sort.field)?;
                        continue;
                    }
                    None => continue,
                }
            };
            order_by.push(OrderBy {
                field,
                direction: sort.direction,
            });
        }
        Ok(order_by)
    }

    /// Resolve a `with` list against relations declared includable.
    pub fn resolve_includes(&self, relations: &[String]) -> Result<BTreeSet<String>, RequestError> {
        self.resolve_relations(relations, |schema, relation| schema.is_includable(relation))
    }

    /// Resolve a `withCount` list against relations declared countable.
    pub fn resolve_counts(&self, relations: &[String]) -> Result<BTreeSet<String>, RequestError> {
        self.resolve_relations(relations, |schema, relation| schema.is_countable(relation))
    }

    /// Decode a single identifier token. Always strict.
    pub fn decode_identifier(&self, field: &str, token: &str) -> Result<u64, RequestError> {
        self.codec
            .decode(token)
            .map_err(|_| RequestError::identifier_decode(field, token))
    }

    fn resolve_relations(
        &self,
        relations: &[String],
        allowed: impl Fn(&EntitySchema, &str) -> bool,
    ) -> Result<BTreeSet<String>, RequestError> {
        let mut resolved = BTreeSet::new();
        for relation in relations {
            if allowed(&self.schema, relation) {
                resolved.insert(relation.clone());
                continue;
            }
            match self.policy.unknown_fields {
                Strictness::Strict => {
                    return Err(RequestError::disallowed_relation(
                        self.schema.name(),
                        relation,
                    ));
                }
                Strictness::Lenient => {
                    warn!(
                        entity = self.schema.name(),
                        relation = relation.as_str(),
                        "Dropped relation that is not available to requests"
                    );
                }
            }
        }
        Ok(resolved)
    }

    /// `Ok(None)` means the field was dropped under the lenient policy.
    fn lookup(&self, field: &str) -> Result<Option<Arc<FieldDescriptor>>, RequestError> {
        match self.schema.lookup(field) {
            FieldLookup::Found(descriptor) => Ok(Some(descriptor)),
            FieldLookup::DisallowedRelation(relation) => match self.policy.unknown_fields {
                Strictness::Strict => Err(RequestError::disallowed_relation(
                    self.schema.name(),
                    relation,
                )),
                Strictness::Lenient => {
                    warn!(
                        entity = self.schema.name(),
                        field,
                        relation = relation.as_str(),
                        "Dropped clause that traverses an undeclared relation"
                    );
                    Ok(None)
                }
            },
            FieldLookup::Unknown => {
                self.reject_unknown(field)?;
                Ok(None)
            }
        }
    }

    /// Errors under the strict policy; `Ok` means the field is dropped.
    fn reject_unknown(&self, field: &str) -> Result<(), RequestError> {
        match self.policy.unknown_fields {
            Strictness::Strict => Err(RequestError::unknown_field(self.schema.name(), field)),
            Strictness::Lenient => {
                warn!(
                    entity = self.schema.name(),
                    field, "Dropped clause on unknown field"
                );
                Ok(())
            }
        }
    }

    fn search_overrides(
        &self,
        fields: &[SearchField],
    ) -> Result<BTreeMap<String, Option<String>>, RequestError> {
        let mut overrides = BTreeMap::new();
        for field in fields {
            if self.lookup(&field.field)?.is_some() {
                overrides.insert(field.field.clone(), field.operator.clone());
            }
        }
        Ok(overrides)
    }

    fn expand_term(
        &self,
        text: &str,
        overrides: Option<&BTreeMap<String, Option<String>>>,
        join: Connector,
    ) -> Result<Vec<ResolvedClause>, RequestError> {
        let targets: Vec<(String, Option<String>)> = match overrides {
            Some(overrides) => overrides
                .iter()
                .map(|(field, operator)| (field.clone(), operator.clone()))
                .collect(),
            None => self
                .schema
                .default_search_fields()
                .iter()
                .map(|field| (field.clone(), None))
                .collect(),
        };

        let mut resolved = Vec::with_capacity(targets.len());
        for (field, operator) in targets {
            let raw = RawClause {
                field,
                operator: None,
                value: text.to_string(),
                operands: vec![text.to_string()],
                connector: join,
            };
            match self.resolve_clause(&raw, operator.as_deref()) {
                Ok(Some(clause)) => resolved.push(clause),
                Ok(None) => {}
                Err(RequestError::Parse(_) | RequestError::IdentifierDecode { .. }) => {
                    debug!(
                        entity = self.schema.name(),
                        field = raw.field.as_str(),
                        "Search term does not fit field type; skipped"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(resolved)
    }

    /// Decode identifier operands. `Ok(None)` drops the clause.
    fn decode_operands(
        &self,
        field: &str,
        operator: OperatorKind,
        raw: &RawClause,
    ) -> Result<Option<Vec<Value>>, RequestError> {
        let tokens = self.split_operands(field, operator, raw)?;
        let mut operands = Vec::with_capacity(tokens.len());
        for token in tokens {
            match self.codec.decode(&token) {
                Ok(id) => operands.push(Value::Id(id)),
                Err(_) => match self.policy.identifier_decode {
                    Strictness::Strict => {
                        return Err(RequestError::identifier_decode(field, token));
                    }
                    Strictness::Lenient if operator.arity() == Arity::List => {
                        warn!(
                            entity = self.schema.name(),
                            field,
                            "Dropped identifier operand that failed to decode"
                        );
                    }
                    Strictness::Lenient => {
                        warn!(
                            entity = self.schema.name(),
                            field,
                            "Dropped clause whose identifier failed to decode"
                        );
                        return Ok(None);
                    }
                },
            }
        }
        // An `in` list with nothing left matches no record; `not_in` with
        // nothing left excludes none, so dropping it is equivalent.
        if operands.is_empty() && operator.arity() != Arity::None && operator != OperatorKind::In {
            return Ok(None);
        }
        Ok(Some(operands))
    }

    fn type_operands(
        &self,
        descriptor: &FieldDescriptor,
        field: &str,
        operator: OperatorKind,
        raw: &RawClause,
    ) -> Result<Vec<Value>, RequestError> {
        self.split_operands(field, operator, raw)?
            .into_iter()
            .map(|operand| type_operand(descriptor, field, operator, operand))
            .collect::<Result<Vec<_>, _>>()
            .map_err(RequestError::from)
    }

    /// Check operand count for the operator and return the raw operands.
    fn split_operands(
        &self,
        field: &str,
        operator: OperatorKind,
        raw: &RawClause,
    ) -> Result<Vec<String>, RequestError> {
        let count_error = |expected: &'static str, actual: usize| {
            RequestError::Parse(ParseError::OperandCount {
                field: field.to_string(),
                operator: operator.as_str().to_string(),
                expected,
                actual,
            })
        };
        match operator.arity() {
            Arity::None => {
                if raw.value.is_empty() {
                    Ok(Vec::new())
                } else {
                    Err(RequestError::Parse(ParseError::UnexpectedValue {
                        field: field.to_string(),
                        operator: operator.as_str().to_string(),
                    }))
                }
            }
            Arity::One => Ok(vec![raw.value.clone()]),
            Arity::Two => {
                if raw.operands.len() == 2 {
                    Ok(raw.operands.clone())
                } else {
                    Err(count_error("exactly 2", raw.operands.len()))
                }
            }
            Arity::List => {
                if raw.operands.is_empty() {
                    Err(count_error("at least 1", 0))
                } else {
                    Ok(raw.operands.clone())
                }
            }
        }
    }
}

fn type_operand(
    descriptor: &FieldDescriptor,
    field: &str,
    operator: OperatorKind,
    operand: String,
) -> Result<Value, ParseError> {
    if operator.is_like() {
        return Ok(Value::Text(wrap_like(operand)));
    }
    let wants_date = operator.is_date() || descriptor.value_type == ValueType::DateRange;
    let wants_number = descriptor.value_type == ValueType::Numeric
        || matches!(operator, OperatorKind::Between | OperatorKind::NotBetween);

    if wants_date {
        Value::parse_date(&operand).ok_or_else(|| ParseError::NotDate {
            field: field.to_string(),
            value: operand,
        })
    } else if wants_number {
        Value::parse_number(&operand).ok_or_else(|| ParseError::NotNumeric {
            field: field.to_string(),
            value: operand,
        })
    } else {
        Ok(Value::Text(operand))
    }
}

/// Wrap a LIKE operand in `%` unless the client placed wildcards already.
fn wrap_like(operand: String) -> String {
    if operand.contains('%') {
        operand
    } else {
        format!("%{operand}%")
    }
}
