use thiserror::Error;

use crate::application::grammar::ParseError;
use crate::application::repos::EngineError;

/// Why a client request could not be turned into a query.
///
/// Every variant rejects the request as a whole; nothing is partially applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unknown field `{field}` on `{entity}`")]
    UnknownField { entity: String, field: String },
    #[error("relation `{relation}` on `{entity}` is not available to requests")]
    DisallowedRelation { entity: String, relation: String },
    #[error("operator `{operator}` is not supported on `{field}`")]
    UnsupportedOperator { field: String, operator: String },
    #[error("`{token}` is not a valid identifier for `{field}`")]
    IdentifierDecode { field: String, token: String },
}

impl RequestError {
    pub fn unknown_field(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            entity: entity.into(),
            field: field.into(),
        }
    }

    pub fn disallowed_relation(entity: impl Into<String>, relation: impl Into<String>) -> Self {
        Self::DisallowedRelation {
            entity: entity.into(),
            relation: relation.into(),
        }
    }

    pub fn unsupported_operator(field: impl Into<String>, operator: impl Into<String>) -> Self {
        Self::UnsupportedOperator {
            field: field.into(),
            operator: operator.into(),
        }
    }

    pub fn identifier_decode(field: impl Into<String>, token: impl Into<String>) -> Self {
        Self::IdentifierDecode {
            field: field.into(),
            token: token.into(),
        }
    }
}

/// Failure of a terminal repository operation.
///
/// Cache failures never appear here; the cache layer fails open.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
