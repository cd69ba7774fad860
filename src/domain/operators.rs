//! Comparison operators accepted by the filter grammar.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A normalised comparison operator.
///
/// `<>` and `!=` both parse to [`OperatorKind::NotEq`], so equivalent filters
/// always produce the same tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperatorKind {
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    ILike,
    NotLike,
    In,
    NotIn,
    Between,
    NotBetween,
    DateBetween,
    DateEquals,
    Null,
    NotNull,
}

/// How many operands an operator takes once the value segment is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    One,
    Two,
    List,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown operator `{0}`")]
pub struct UnknownOperator(pub String);

impl OperatorKind {
    pub const ALL: [OperatorKind; 17] = [
        OperatorKind::Eq,
        OperatorKind::NotEq,
        OperatorKind::Gt,
        OperatorKind::Lt,
        OperatorKind::Gte,
        OperatorKind::Lte,
        OperatorKind::Like,
        OperatorKind::ILike,
        OperatorKind::NotLike,
        OperatorKind::In,
        OperatorKind::NotIn,
        OperatorKind::Between,
        OperatorKind::NotBetween,
        OperatorKind::DateBetween,
        OperatorKind::DateEquals,
        OperatorKind::Null,
        OperatorKind::NotNull,
    ];

    /// Operators a relation-count pseudo-field may use.
    pub const NUMERIC: [OperatorKind; 8] = [
        OperatorKind::Eq,
        OperatorKind::NotEq,
        OperatorKind::Gt,
        OperatorKind::Lt,
        OperatorKind::Gte,
        OperatorKind::Lte,
        OperatorKind::Between,
        OperatorKind::NotBetween,
    ];

    /// Canonical grammar token.
    pub fn as_str(self) -> &'static str {
        match self {
            OperatorKind::Eq => "=",
            OperatorKind::NotEq => "!=",
            OperatorKind::Gt => ">",
            OperatorKind::Lt => "<",
            OperatorKind::Gte => ">=",
            OperatorKind::Lte => "<=",
            OperatorKind::Like => "like",
            OperatorKind::ILike => "ilike",
            OperatorKind::NotLike => "not_like",
            OperatorKind::In => "in",
            OperatorKind::NotIn => "not_in",
            OperatorKind::Between => "between",
            OperatorKind::NotBetween => "not_between",
            OperatorKind::DateBetween => "date_between",
            OperatorKind::DateEquals => "date_equals",
            OperatorKind::Null => "null",
            OperatorKind::NotNull => "not_null",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            OperatorKind::Null | OperatorKind::NotNull => Arity::None,
            OperatorKind::In | OperatorKind::NotIn => Arity::List,
            OperatorKind::Between | OperatorKind::NotBetween | OperatorKind::DateBetween => {
                Arity::Two
            }
            _ => Arity::One,
        }
    }

    pub fn is_like(self) -> bool {
        matches!(
            self,
            OperatorKind::Like | OperatorKind::ILike | OperatorKind::NotLike
        )
    }

    pub fn is_date(self) -> bool {
        matches!(self, OperatorKind::DateBetween | OperatorKind::DateEquals)
    }

    pub fn is_numeric(self) -> bool {
        Self::NUMERIC.contains(&self)
    }

    /// Whether operand order carries no meaning, so a canonical form may sort it.
    pub fn is_set_valued(self) -> bool {
        matches!(self, OperatorKind::In | OperatorKind::NotIn)
    }

    /// Stable discriminant for canonical encodings.
    pub(crate) fn tag(self) -> u8 {
        match self {
            OperatorKind::Eq => 0x01,
            OperatorKind::NotEq => 0x02,
            OperatorKind::Gt => 0x03,
            OperatorKind::Lt => 0x04,
            OperatorKind::Gte => 0x05,
            OperatorKind::Lte => 0x06,
            OperatorKind::Like => 0x07,
            OperatorKind::ILike => 0x08,
            OperatorKind::NotLike => 0x09,
            OperatorKind::In => 0x0a,
            OperatorKind::NotIn => 0x0b,
            OperatorKind::Between => 0x0c,
            OperatorKind::NotBetween => 0x0d,
            OperatorKind::DateBetween => 0x0e,
            OperatorKind::DateEquals => 0x0f,
            OperatorKind::Null => 0x10,
            OperatorKind::NotNull => 0x11,
        }
    }
}

impl FromStr for OperatorKind {
    type Err = UnknownOperator;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let operator = match token.trim().to_ascii_lowercase().as_str() {
            "=" => OperatorKind::Eq,
            "!=" | "<>" => OperatorKind::NotEq,
            ">" => OperatorKind::Gt,
            "<" => OperatorKind::Lt,
            ">=" => OperatorKind::Gte,
            "<=" => OperatorKind::Lte,
            "like" => OperatorKind::Like,
            "ilike" => OperatorKind::ILike,
            "not_like" => OperatorKind::NotLike,
            "in" => OperatorKind::In,
            "not_in" => OperatorKind::NotIn,
            "between" => OperatorKind::Between,
            "not_between" => OperatorKind::NotBetween,
            "date_between" => OperatorKind::DateBetween,
            "date_equals" => OperatorKind::DateEquals,
            "null" => OperatorKind::Null,
            "not_null" => OperatorKind::NotNull,
            _ => return Err(UnknownOperator(token.to_string())),
        };
        Ok(operator)
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OperatorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OperatorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        token.parse().map_err(serde::de::Error::custom)
    }
}

/// An immutable set of operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSet(BTreeSet<OperatorKind>);

impl OperatorSet {
    /// Every operator the grammar knows.
    pub fn all() -> Self {
        Self(OperatorKind::ALL.into_iter().collect())
    }

    pub fn numeric() -> Self {
        Self(OperatorKind::NUMERIC.into_iter().collect())
    }

    pub fn contains(&self, operator: OperatorKind) -> bool {
        self.0.contains(&operator)
    }

    pub fn intersection(&self, other: &OperatorSet) -> OperatorSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = OperatorKind> + '_ {
        self.0.iter().copied()
    }
}

impl Default for OperatorSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<OperatorKind> for OperatorSet {
    fn from_iter<I: IntoIterator<Item = OperatorKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angle_brackets_normalise_to_not_equal() {
        assert_eq!("<>".parse::<OperatorKind>(), Ok(OperatorKind::NotEq));
        assert_eq!("!=".parse::<OperatorKind>(), Ok(OperatorKind::NotEq));
    }

    #[test]
    fn tokens_round_trip_through_display() {
        for operator in OperatorKind::ALL {
            assert_eq!(operator.as_str().parse::<OperatorKind>(), Ok(operator));
        }
    }

    #[test]
    fn parsing_is_case_insensitive() {
        assert_eq!("ILIKE".parse::<OperatorKind>(), Ok(OperatorKind::ILike));
        assert_eq!("Not_In".parse::<OperatorKind>(), Ok(OperatorKind::NotIn));
    }

    #[test]
    fn unknown_token_is_rejected() {
        assert_eq!(
            "regex".parse::<OperatorKind>(),
            Err(UnknownOperator("regex".to_string()))
        );
    }

    #[test]
    fn arity_matches_operator_family() {
        assert_eq!(OperatorKind::Null.arity(), Arity::None);
        assert_eq!(OperatorKind::In.arity(), Arity::List);
        assert_eq!(OperatorKind::DateBetween.arity(), Arity::Two);
        assert_eq!(OperatorKind::DateEquals.arity(), Arity::One);
    }

    #[test]
    fn numeric_set_excludes_text_operators() {
        let numeric = OperatorSet::numeric();
        assert!(numeric.contains(OperatorKind::Gte));
        assert!(!numeric.contains(OperatorKind::Like));
        assert!(!numeric.contains(OperatorKind::In));
    }
}
