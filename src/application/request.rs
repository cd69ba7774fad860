//! Query-parameter intake: from a key/value map to resolved request criteria.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::instrument;

use crate::application::builder::PredicateBuilder;
use crate::application::error::RequestError;
use crate::application::grammar::{
    self, CLAUSE_SEPARATOR, ParseError, RawClause, RawSort, SearchField, SearchItem,
};
use crate::application::repos::OrderBy;
use crate::application::resolver::FieldResolver;
use crate::domain::predicate::{Connector, PredicateNode};

pub const PARAM_SEARCH: &str = "search";
pub const PARAM_SEARCH_FIELDS: &str = "searchFields";
pub const PARAM_SEARCH_JOIN: &str = "searchJoin";
pub const PARAM_FILTER: &str = "filter";
pub const PARAM_ORDER_BY: &str = "orderBy";
pub const PARAM_SORTED_BY: &str = "sortedBy";
pub const PARAM_WITH: &str = "with";
pub const PARAM_WITH_COUNT: &str = "withCount";
pub const PARAM_SKIP_CACHE: &str = "skipCache";

/// Request parameters as delivered by the request layer.
///
/// A key may carry several values; they are joined with `;` and so behave like
/// additional clauses of the same grammar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    values: BTreeMap<String, Vec<String>>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut params = Self::new();
        for (key, value) in pairs {
            params.insert(key, value);
        }
        params
    }

    /// Parse an `application/x-www-form-urlencoded` query string.
    pub fn from_query_str(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()).into_owned())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_default().push(value.into());
    }

    /// Every value for `key`, joined as clauses.
    ///
    /// Values are checked for a trailing escape before joining so one cannot
    /// escape the separator that follows it.
    pub fn get(&self, key: &str) -> Result<Option<String>, ParseError> {
        let Some(values) = self.values.get(key) else {
            return Ok(None);
        };
        for value in values {
            grammar::reject_dangling_escape(value)?;
        }
        let separator = CLAUSE_SEPARATOR.to_string();
        Ok(Some(values.join(&separator)))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The request grammars, tokenized but not yet bound to a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedRequest {
    pub search: Vec<SearchItem>,
    pub search_fields: Option<Vec<SearchField>>,
    pub search_join: Connector,
    pub filter: Vec<RawClause>,
    pub sort: Vec<RawSort>,
    pub with: Vec<String>,
    pub with_count: Vec<String>,
    pub skip_cache: bool,
}

impl ParsedRequest {
    /// `searchJoin` defaults to OR.
    pub fn parse(params: &QueryParams) -> Result<Self, ParseError> {
        let search_join = match params.get(PARAM_SEARCH_JOIN)? {
            Some(raw) => grammar::parse_join(&raw)?,
            None => Connector::Or,
        };
        let search = match params.get(PARAM_SEARCH)? {
            Some(raw) => grammar::parse_search(&raw, search_join)?,
            None => Vec::new(),
        };
        let search_fields = params
            .get(PARAM_SEARCH_FIELDS)?
            .map(|raw| grammar::parse_search_fields(&raw))
            .transpose()?;
        let filter = match params.get(PARAM_FILTER)? {
            Some(raw) => grammar::parse_filter(&raw)?,
            None => Vec::new(),
        };
        let sort = match params.get(PARAM_ORDER_BY)? {
            Some(raw) => grammar::parse_sort(&raw, params.get(PARAM_SORTED_BY)?.as_deref())?,
            None => Vec::new(),
        };
        let with = match params.get(PARAM_WITH)? {
            Some(raw) => grammar::parse_relation_list(&raw)?,
            None => Vec::new(),
        };
        let with_count = match params.get(PARAM_WITH_COUNT)? {
            Some(raw) => grammar::parse_relation_list(&raw)?,
            None => Vec::new(),
        };
        let skip_cache = match params.get(PARAM_SKIP_CACHE)? {
            Some(raw) => grammar::parse_bool(&raw)?,
            None => false,
        };

        Ok(Self {
            search,
            search_fields,
            search_join,
            filter,
            sort,
            with,
            with_count,
            skip_cache,
        })
    }
}

/// A request bound to an entity schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestCriteria {
    /// Search and filter groups joined with AND; `None` matches all.
    pub predicate: Option<PredicateNode>,
    pub order_by: Vec<OrderBy>,
    pub includes: BTreeSet<String>,
    pub counts: BTreeSet<String>,
    pub skip_cache: bool,
}

impl RequestCriteria {
    #[instrument(skip_all, fields(entity = resolver.schema().name()))]
    pub fn from_params(params: &QueryParams, resolver: &FieldResolver) -> Result<Self, RequestError> {
        let parsed = ParsedRequest::parse(params)?;
        Self::resolve(&parsed, resolver)
    }

    pub fn resolve(parsed: &ParsedRequest, resolver: &FieldResolver) -> Result<Self, RequestError> {
        let search = resolver.resolve_search(
            &parsed.search,
            parsed.search_fields.as_deref(),
            parsed.search_join,
        )?;
        let filter = resolver.resolve_filter(&parsed.filter)?;

        let predicate = PredicateBuilder::new()
            .clauses(search, parsed.search_join)
            .clauses(filter, Connector::And)
            .build();

        Ok(Self {
            predicate,
            order_by: resolver.resolve_sort(&parsed.sort)?,
            includes: resolver.resolve_includes(&parsed.with)?,
            counts: resolver.resolve_counts(&parsed.with_count)?,
            skip_cache: parsed.skip_cache,
        })
    }
}
