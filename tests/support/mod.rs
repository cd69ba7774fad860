#![allow(dead_code)]

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value as Json, json};
use sifter::application::repos::{EngineError, Page, Pagination, QueryEngine, QuerySpec, SortDirection};
use sifter::cache::{CacheConfig, CacheEntry, CacheStore, CacheStoreError, MemoryStore};
use sifter::config::Settings;
use sifter::domain::operators::OperatorKind;
use sifter::domain::predicate::{Condition, Connector, PredicateNode, Target};
use sifter::domain::values::Value;
use time::Date;
use time::macros::format_description;

pub const SALT: &str = "integration salt";

/// Settings for a `users` entity with a `roles` relation; `resolution` is the
/// body of the `[resolution]` table.
pub fn settings(resolution: &str) -> Settings {
    settings_with(resolution, "")
}

/// As [`settings`], with the body of the `[cache]` table.
pub fn settings_with(resolution: &str, cache: &str) -> Settings {
    let source = format!(
        r#"
[codec]
salt = "{SALT}"

[resolution]
{resolution}

[cache]
{cache}

[entities.users.fields.name]
default_operator = "like"
allowed_operators = ["=", "like", "ilike", "not_like", "in"]

[entities.users.fields.email]
allowed_operators = ["=", "like"]

[entities.users.fields.status]
allowed_operators = ["=", "!=", "in", "not_in"]

[entities.users.fields.role_id]
type = "numeric"
identifier = true
allowed_operators = ["=", "in", "not_in", "null", "not_null"]

[entities.users.fields.age]
type = "numeric"
allowed_operators = ["=", ">", "<", ">=", "<=", "between", "not_between"]

[entities.users.fields.created_at]
type = "date"
default_operator = "date_equals"
allowed_operators = ["date_between", "date_equals", "null", "not_null"]

[entities.users.relations.roles]
includable = true
searchable = true
countable = true

[entities.users.relations.roles.fields.name]
allowed_operators = ["=", "like"]

[entities.users.relations.secrets]
includable = false
"#
    );
    Settings::from_toml_str(&source).expect("fixture settings are valid")
}

pub fn users() -> Vec<Json> {
    vec![
        json!({
            "id": 1, "name": "John Smith", "email": "john@example.com", "status": "active",
            "role_id": 1, "age": 34, "created_at": "2024-01-15",
            "roles": [{"name": "admin"}, {"name": "editor"}]
        }),
        json!({
            "id": 2, "name": "Bob Jones", "email": "bob@example.com", "status": "active",
            "role_id": 2, "age": 27, "created_at": "2024-03-02",
            "roles": [{"name": "editor"}]
        }),
        json!({
            "id": 3, "name": "Carol White", "email": "carol@example.com", "status": "banned",
            "role_id": 3, "age": 45, "created_at": "2023-11-30",
            "roles": []
        }),
        json!({
            "id": 4, "name": "Johnny Banned", "email": "johnny@example.com", "status": "banned",
            "role_id": null, "age": 19, "created_at": null,
            "roles": [{"name": "viewer"}]
        }),
    ]
}

pub fn ids(rows: &[Json]) -> Vec<u64> {
    rows.iter().filter_map(|row| row["id"].as_u64()).collect()
}

/// Evaluates predicate trees over JSON rows and counts how often it runs.
pub struct MemoryEngine {
    rows: Vec<Json>,
    calls: AtomicUsize,
    delay: Duration,
}

impl MemoryEngine {
    pub fn new(rows: Vec<Json>) -> Self {
        Self {
            rows,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn select(&self, query: &QuerySpec) -> Vec<Json> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let mut rows: Vec<Json> = self
            .rows
            .iter()
            .filter(|row| query.predicate.as_ref().is_none_or(|node| matches(node, row)))
            .cloned()
            .collect();
        if let Some(order) = query.order_by.first() {
            let segments = order.field.segments();
            rows.sort_by(|a, b| {
                let ordering = compare_json(lookup(a, segments).first().copied(), lookup(b, segments).first().copied());
                match order.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }
        rows
    }
}

impl QueryEngine for MemoryEngine {
    type Row = Json;

    fn fetch(&self, query: &QuerySpec) -> Result<Vec<Json>, EngineError> {
        Ok(self.select(query))
    }

    fn paginate(&self, query: &QuerySpec, pagination: Pagination) -> Result<Page<Json>, EngineError> {
        let rows = self.select(query);
        let total = rows.len() as u64;
        let offset = usize::try_from(pagination.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(pagination.per_page.get()).unwrap_or(usize::MAX);
        Ok(Page {
            items: rows.into_iter().skip(offset).take(limit).collect(),
            total,
            page: pagination.page.get(),
            per_page: pagination.per_page.get(),
        })
    }
}

pub fn matches(node: &PredicateNode, row: &Json) -> bool {
    match node {
        PredicateNode::Leaf(condition) => matches_condition(condition, row),
        PredicateNode::Group(group) => match group.connector() {
            Connector::And => group.children().iter().all(|child| matches(child, row)),
            Connector::Or => group.children().iter().any(|child| matches(child, row)),
        },
    }
}

fn matches_condition(condition: &Condition, row: &Json) -> bool {
    let operands = condition.operands();
    let count;
    let values: Vec<&Json> = match condition.target() {
        Target::Field(path) => lookup(row, path.segments()),
        Target::RelationCount(path) => {
            let related = lookup_raw(row, path.segments())
                .and_then(Json::as_array)
                .map_or(0, Vec::len);
            count = json!(related);
            vec![&count]
        }
    };
    let present: Vec<&Json> = values.into_iter().filter(|value| !value.is_null()).collect();

    let any = |test: &dyn Fn(&Json) -> bool| present.iter().any(|value| test(*value));
    let cmp = |value: &Json, operand: &Value| compare(value, operand);

    match condition.operator() {
        OperatorKind::Eq | OperatorKind::DateEquals => {
            any(&|value| cmp(value, &operands[0]) == Some(CmpOrdering::Equal))
        }
        OperatorKind::NotEq => !any(&|value| cmp(value, &operands[0]) == Some(CmpOrdering::Equal)),
        OperatorKind::Gt => any(&|value| cmp(value, &operands[0]) == Some(CmpOrdering::Greater)),
        OperatorKind::Lt => any(&|value| cmp(value, &operands[0]) == Some(CmpOrdering::Less)),
        OperatorKind::Gte => any(&|value| {
            matches!(cmp(value, &operands[0]), Some(CmpOrdering::Greater | CmpOrdering::Equal))
        }),
        OperatorKind::Lte => any(&|value| {
            matches!(cmp(value, &operands[0]), Some(CmpOrdering::Less | CmpOrdering::Equal))
        }),
        OperatorKind::Like => any(&|value| like(value, &operands[0])),
        OperatorKind::ILike => any(&|value| like(value, &operands[0])),
        OperatorKind::NotLike => !any(&|value| like(value, &operands[0])),
        OperatorKind::In => any(&|value| {
            operands
                .iter()
                .any(|operand| cmp(value, operand) == Some(CmpOrdering::Equal))
        }),
        OperatorKind::NotIn => !any(&|value| {
            operands
                .iter()
                .any(|operand| cmp(value, operand) == Some(CmpOrdering::Equal))
        }),
        OperatorKind::Between | OperatorKind::DateBetween => {
            any(&|value| between(value, &operands[0], &operands[1]))
        }
        OperatorKind::NotBetween => !any(&|value| between(value, &operands[0], &operands[1])),
        OperatorKind::Null => present.is_empty(),
        OperatorKind::NotNull => !present.is_empty(),
    }
}

fn between(value: &Json, low: &Value, high: &Value) -> bool {
    matches!(compare(value, low), Some(CmpOrdering::Greater | CmpOrdering::Equal))
        && matches!(compare(value, high), Some(CmpOrdering::Less | CmpOrdering::Equal))
}

/// `%` wildcards only. Matching ignores case the way a default SQL collation does.
fn like(value: &Json, pattern: &Value) -> bool {
    let (Some(text), Value::Text(pattern)) = (value.as_str(), pattern) else {
        return false;
    };
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    let [first, middle @ .., last] = parts.as_slice() else {
        return text == pattern;
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

fn compare(value: &Json, operand: &Value) -> Option<CmpOrdering> {
    match operand {
        Value::Id(id) => value.as_u64().map(|value| value.cmp(id)),
        Value::Int(expected) => value.as_f64()?.partial_cmp(&(*expected as f64)),
        Value::Float(expected) => value.as_f64()?.partial_cmp(expected),
        Value::Text(expected) => match value {
            Json::String(text) => Some(text.as_str().cmp(expected.as_str())),
            other => Some(other.to_string().as_str().cmp(expected.as_str())),
        },
        Value::Date(expected) => {
            let text = value.as_str()?;
            let date = Date::parse(text.get(..10)?, format_description!("[year]-[month]-[day]")).ok()?;
            Some(date.cmp(expected))
        }
    }
}

fn compare_json(a: Option<&Json>, b: Option<&Json>) -> CmpOrdering {
    match (a, b) {
        (Some(Json::Number(a)), Some(Json::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Json::String(a)), Some(Json::String(b))) => a.cmp(b),
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        _ => CmpOrdering::Equal,
    }
}

fn lookup_raw<'a>(row: &'a Json, segments: &[String]) -> Option<&'a Json> {
    segments.iter().try_fold(row, |node, segment| node.get(segment))
}

/// Values at a path; relation segments holding arrays fan out.
fn lookup<'a>(row: &'a Json, segments: &[String]) -> Vec<&'a Json> {
    let Some((first, rest)) = segments.split_first() else {
        return vec![row];
    };
    match row {
        Json::Array(items) => items.iter().flat_map(|item| lookup(item, segments)).collect(),
        Json::Object(map) => match map.get(first) {
            Some(next) => lookup(next, rest),
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// A memory store whose operations can be switched to fail.
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new(failing: bool) -> Self {
        Self {
            inner: MemoryStore::new(&CacheConfig::default()),
            failing: AtomicBool::new(failing),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheStoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl CacheStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>, CacheStoreError> {
        self.check()?;
        self.inner.get(key)
    }

    fn set(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        self.check()?;
        self.inner.set(entry)
    }

    fn remove(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.check()?;
        self.inner.remove(key)
    }

    fn contains_key(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.check()?;
        self.inner.contains_key(key)
    }
}
