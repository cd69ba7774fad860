//! Tokenizer for the query-parameter filter grammar.
//!
//! Clauses look like `field:operator:value` and are separated by `;`. Operand
//! lists inside a value are separated by `,`. A backslash escapes one of
//! `: ; , \`; any other escape is rejected so that a stray separator can never
//! silently truncate a value.

use serde::Serialize;
use thiserror::Error;

use crate::application::repos::SortDirection;
use crate::domain::predicate::Connector;

pub const CLAUSE_SEPARATOR: char = ';';
pub const SEGMENT_SEPARATOR: char = ':';
pub const OPERAND_SEPARATOR: char = ',';
const ESCAPE: char = '\\';

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid escape `\\{escaped}` in `{input}`")]
    InvalidEscape { input: String, escaped: char },
    #[error("`{input}` ends with an unfinished escape")]
    DanglingEscape { input: String },
    #[error("clause `{clause}` has more than three segments; escape a literal `:` as `\\:`")]
    TooManySegments { clause: String },
    #[error("clause `{clause}` needs a value")]
    MissingValue { clause: String },
    #[error("clause `{clause}` has an empty field name")]
    MissingField { clause: String },
    #[error("unknown join mode `{0}`; expected `and` or `or`")]
    JoinMode(String),
    #[error("unknown sort direction `{0}`; expected `asc` or `desc`")]
    SortDirection(String),
    #[error("`{0}` is not a boolean")]
    InvalidBoolean(String),
    #[error("operator `{operator}` on `{field}` expects {expected} operand(s), got {actual}")]
    OperandCount {
        field: String,
        operator: String,
        expected: &'static str,
        actual: usize,
    },
    #[error("operator `{operator}` on `{field}` takes no value")]
    UnexpectedValue { field: String, operator: String },
    #[error("`{value}` is not a number (field `{field}`)")]
    NotNumeric { field: String, value: String },
    #[error("`{value}` is not a YYYY-MM-DD date (field `{field}`)")]
    NotDate { field: String, value: String },
}

/// One `field[:operator]:value` clause as written by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawClause {
    pub field: String,
    pub operator: Option<String>,
    /// The whole value segment, unescaped.
    pub value: String,
    /// The value split on unescaped `,`, each operand unescaped and trimmed.
    pub operands: Vec<String>,
    pub connector: Connector,
}

/// An entry of the `search` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchItem {
    /// A bare term, searched across the default or listed fields.
    Term { text: String },
    Clause(RawClause),
}

/// An entry of the `searchFields` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchField {
    pub field: String,
    pub operator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawSort {
    pub field: String,
    pub direction: SortDirection,
}

/// Parse a `filter` parameter. Every clause joins with AND.
pub fn parse_filter(input: &str) -> Result<Vec<RawClause>, ParseError> {
    let mut clauses = Vec::new();
    for clause in split_clauses(input)? {
        let segments = split_escaped(&clause, SEGMENT_SEPARATOR);
        if segments.len() < 2 {
            return Err(ParseError::MissingValue {
                clause: unescape(&clause),
            });
        }
        clauses.push(build_clause(&clause, segments, Connector::And)?);
    }
    Ok(clauses)
}

/// Parse a `search` parameter; `join` applies to every clause.
pub fn parse_search(input: &str, join: Connector) -> Result<Vec<SearchItem>, ParseError> {
    let mut items = Vec::new();
    for clause in split_clauses(input)? {
        let segments = split_escaped(&clause, SEGMENT_SEPARATOR);
        if segments.len() == 1 {
            let text = unescape(&segments[0]).trim().to_string();
            if !text.is_empty() {
                items.push(SearchItem::Term { text });
            }
            continue;
        }
        items.push(SearchItem::Clause(build_clause(&clause, segments, join)?));
    }
    Ok(items)
}

/// Parse a `searchFields` parameter: `field[:operator]` entries.
pub fn parse_search_fields(input: &str) -> Result<Vec<SearchField>, ParseError> {
    let mut fields = Vec::new();
    for clause in split_clauses(input)? {
        let mut segments = split_escaped(&clause, SEGMENT_SEPARATOR).into_iter();
        let field = segments.next().map(|raw| unescape(&raw)).unwrap_or_default();
        let operator = segments.next().map(|raw| unescape(&raw));
        if segments.next().is_some() {
            return Err(ParseError::TooManySegments {
                clause: unescape(&clause),
            });
        }
        let field = field.trim().to_string();
        if field.is_empty() {
            return Err(ParseError::MissingField {
                clause: unescape(&clause),
            });
        }
        let operator = operator
            .map(|operator| operator.trim().to_string())
            .filter(|operator| !operator.is_empty());
        fields.push(SearchField { field, operator });
    }
    Ok(fields)
}

/// Parse a `searchJoin` parameter.
pub fn parse_join(input: &str) -> Result<Connector, ParseError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "and" => Ok(Connector::And),
        "or" => Ok(Connector::Or),
        _ => Err(ParseError::JoinMode(input.to_string())),
    }
}

/// Zip `orderBy` fields with `sortedBy` directions by position.
///
/// Fields without a matching direction sort ascending; surplus directions are
/// ignored.
pub fn parse_sort(order_by: &str, sorted_by: Option<&str>) -> Result<Vec<RawSort>, ParseError> {
    let fields = split_clauses(order_by)?;
    let directions = match sorted_by {
        Some(raw) => split_escaped(raw, CLAUSE_SEPARATOR)
            .into_iter()
            .map(|direction| parse_direction(&unescape(&direction)))
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let mut sorts = Vec::with_capacity(fields.len());
    for (index, field) in fields.iter().enumerate() {
        let field = unescape(field).trim().to_string();
        let direction = directions
            .get(index)
            .copied()
            .flatten()
            .unwrap_or(SortDirection::Asc);
        sorts.push(RawSort { field, direction });
    }
    Ok(sorts)
}

/// Parse a `with` or `withCount` relation list, keeping first occurrences.
pub fn parse_relation_list(input: &str) -> Result<Vec<String>, ParseError> {
    let mut relations: Vec<String> = Vec::new();
    for raw in split_clauses(input)? {
        let relation = unescape(&raw).trim().to_string();
        if !relations.contains(&relation) {
            relations.push(relation);
        }
    }
    Ok(relations)
}

pub fn parse_bool(input: &str) -> Result<bool, ParseError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ParseError::InvalidBoolean(input.to_string())),
    }
}

fn parse_direction(raw: &str) -> Result<Option<SortDirection>, ParseError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "asc" => Ok(Some(SortDirection::Asc)),
        "desc" => Ok(Some(SortDirection::Desc)),
        _ => Err(ParseError::SortDirection(raw.to_string())),
    }
}

fn build_clause(
    clause: &str,
    segments: Vec<String>,
    connector: Connector,
) -> Result<RawClause, ParseError> {
    let (field, operator, value) = match segments.as_slice() {
        [field, value] => (field, None, value),
        [field, operator, value] => (field, Some(operator), value),
        _ => {
            return Err(ParseError::TooManySegments {
                clause: unescape(clause),
            });
        }
    };

    let field = unescape(field).trim().to_string();
    if field.is_empty() {
        return Err(ParseError::MissingField {
            clause: unescape(clause),
        });
    }
    let operator = operator
        .map(|operator| unescape(operator).trim().to_string())
        .filter(|operator| !operator.is_empty());
    let operands = split_escaped(value, OPERAND_SEPARATOR)
        .iter()
        .map(|operand| unescape(operand).trim().to_string())
        .filter(|operand| !operand.is_empty())
        .collect();

    Ok(RawClause {
        field,
        operator,
        value: unescape(value).trim().to_string(),
        operands,
        connector,
    })
}

/// Validate escapes, then split on unescaped `;`, dropping blank clauses.
fn split_clauses(input: &str) -> Result<Vec<String>, ParseError> {
    validate_escapes(input)?;
    Ok(split_escaped(input, CLAUSE_SEPARATOR)
        .into_iter()
        .filter(|clause| !clause.trim().is_empty())
        .collect())
}

/// Fail when `input` ends inside an escape sequence.
pub(crate) fn reject_dangling_escape(input: &str) -> Result<(), ParseError> {
    let trailing = input.chars().rev().take_while(|ch| *ch == ESCAPE).count();
    if trailing % 2 == 1 {
        return Err(ParseError::DanglingEscape {
            input: input.to_string(),
        });
    }
    Ok(())
}

fn validate_escapes(input: &str) -> Result<(), ParseError> {
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != ESCAPE {
            continue;
        }
        match chars.next() {
            Some(CLAUSE_SEPARATOR | SEGMENT_SEPARATOR | OPERAND_SEPARATOR | ESCAPE) => {}
            Some(escaped) => {
                return Err(ParseError::InvalidEscape {
                    input: input.to_string(),
                    escaped,
                });
            }
            None => {
                return Err(ParseError::DanglingEscape {
                    input: input.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Split on unescaped `separator`, keeping escape sequences intact.
fn split_escaped(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch == ESCAPE {
            current.push(ch);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if ch == separator {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    parts.push(current);
    parts
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch == ESCAPE {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}
