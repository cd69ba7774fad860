//! Predicate trees handed to the query engine.
//!
//! A tree is either a single comparison leaf or a group of children joined by
//! one connector. Groups are never empty: the constructors return `None` when
//! there is nothing to combine, and callers treat an absent tree as "match all".

use std::fmt;

use serde::Serialize;

use super::fields::FieldPath;
use super::operators::OperatorKind;
use super::values::Value;

/// How a group's children combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connector {
    And,
    Or,
}

impl Connector {
    pub fn as_str(self) -> &'static str {
        match self {
            Connector::And => "AND",
            Connector::Or => "OR",
        }
    }
}

/// What a leaf compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Target {
    /// A column, possibly reached through relation segments.
    Field(FieldPath),
    /// The number of related records along a relation path.
    RelationCount(FieldPath),
}

impl Target {
    pub fn path(&self) -> &FieldPath {
        match self {
            Target::Field(path) | Target::RelationCount(path) => path,
        }
    }
}

/// A single comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Condition {
    target: Target,
    operator: OperatorKind,
    operands: Vec<Value>,
}

impl Condition {
    pub fn new(target: Target, operator: OperatorKind, operands: Vec<Value>) -> Self {
        Self {
            target,
            operator,
            operands,
        }
    }

    pub fn field(path: FieldPath, operator: OperatorKind, operands: Vec<Value>) -> Self {
        Self::new(Target::Field(path), operator, operands)
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn operator(&self) -> OperatorKind {
        self.operator
    }

    pub fn operands(&self) -> &[Value] {
        &self.operands
    }
}

/// A non-empty list of children joined by one connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PredicateGroup {
    connector: Connector,
    children: Vec<PredicateNode>,
}

impl PredicateGroup {
    pub fn connector(&self) -> Connector {
        self.connector
    }

    pub fn children(&self) -> &[PredicateNode] {
        &self.children
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateNode {
    Leaf(Condition),
    Group(PredicateGroup),
}

impl PredicateNode {
    pub fn leaf(condition: Condition) -> Self {
        PredicateNode::Leaf(condition)
    }

    /// Join `children` with `connector`, preserving their order.
    ///
    /// Returns `None` for no children and the child itself for exactly one.
    pub fn group(
        connector: Connector,
        children: impl IntoIterator<Item = PredicateNode>,
    ) -> Option<Self> {
        let mut children: Vec<PredicateNode> = children.into_iter().collect();
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(PredicateNode::Group(PredicateGroup {
                connector,
                children,
            })),
        }
    }

    pub fn all(children: impl IntoIterator<Item = PredicateNode>) -> Option<Self> {
        Self::group(Connector::And, children)
    }

    pub fn any(children: impl IntoIterator<Item = PredicateNode>) -> Option<Self> {
        Self::group(Connector::Or, children)
    }

    /// An order-insensitive normal form.
    ///
    /// Nested groups with the same connector are flattened, children are sorted
    /// and deduplicated, and set-valued operands (`in`, `not_in`) are sorted.
    /// Two trees that differ only in clause order normalise to equal values.
    /// The result is meant for identity (hashing), not for execution.
    pub fn canonical(&self) -> PredicateNode {
        match self {
            PredicateNode::Leaf(condition) => {
                let mut operands = condition.operands.clone();
                if condition.operator.is_set_valued() {
                    operands.sort();
                    operands.dedup();
                }
                PredicateNode::Leaf(Condition {
                    target: condition.target.clone(),
                    operator: condition.operator,
                    operands,
                })
            }
            PredicateNode::Group(group) => {
                let mut children = Vec::with_capacity(group.children.len());
                for child in &group.children {
                    match child.canonical() {
                        PredicateNode::Group(inner) if inner.connector == group.connector => {
                            children.extend(inner.children);
                        }
                        other => children.push(other),
                    }
                }
                children.sort();
                children.dedup();
                // dedup may leave a single child
                if children.len() == 1 {
                    if let Some(only) = children.pop() {
                        return only;
                    }
                }
                PredicateNode::Group(PredicateGroup {
                    connector: group.connector,
                    children,
                })
            }
        }
    }

    /// Append a length-prefixed, tagged byte encoding of this tree.
    ///
    /// Callers hash the canonical form; the encoding itself preserves order.
    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            PredicateNode::Leaf(condition) => {
                out.push(0x01);
                match &condition.target {
                    Target::Field(path) => {
                        out.push(0x00);
                        path.write_canonical(out);
                    }
                    Target::RelationCount(path) => {
                        out.push(0x01);
                        path.write_canonical(out);
                    }
                }
                out.push(condition.operator.tag());
                write_len(out, condition.operands.len());
                for operand in &condition.operands {
                    operand.write_canonical(out);
                }
            }
            PredicateNode::Group(group) => {
                out.push(0x02);
                out.push(match group.connector {
                    Connector::And => 0x00,
                    Connector::Or => 0x01,
                });
                write_len(out, group.children.len());
                for child in &group.children {
                    child.write_canonical(out);
                }
            }
        }
    }

    /// Visit every leaf in depth-first order.
    pub fn leaves(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            PredicateNode::Leaf(condition) => out.push(condition),
            PredicateNode::Group(group) => {
                for child in &group.children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Field(path) => write!(f, "{path}")?,
            Target::RelationCount(path) => write!(f, "count({path})")?,
        }
        let operands = self.operands.as_slice();
        match self.operator {
            OperatorKind::Null => f.write_str(" IS NULL"),
            OperatorKind::NotNull => f.write_str(" IS NOT NULL"),
            OperatorKind::In | OperatorKind::NotIn => {
                let keyword = if self.operator == OperatorKind::In {
                    "IN"
                } else {
                    "NOT IN"
                };
                write!(f, " {keyword} (")?;
                for (index, operand) in operands.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{operand}")?;
                }
                f.write_str(")")
            }
            OperatorKind::Between | OperatorKind::NotBetween | OperatorKind::DateBetween => {
                let keyword = if self.operator == OperatorKind::NotBetween {
                    "NOT BETWEEN"
                } else {
                    "BETWEEN"
                };
                match operands {
                    [low, high] => write!(f, " {keyword} {low} AND {high}"),
                    _ => write!(f, " {keyword} <{} operands>", operands.len()),
                }
            }
            operator => {
                let keyword = match operator {
                    OperatorKind::Like => "LIKE",
                    OperatorKind::ILike => "ILIKE",
                    OperatorKind::NotLike => "NOT LIKE",
                    OperatorKind::DateEquals => "ON",
                    other => other.as_str(),
                };
                write!(f, " {keyword}")?;
                for operand in operands {
                    write!(f, " {operand}")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for PredicateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredicateNode::Leaf(condition) => write!(f, "{condition}"),
            PredicateNode::Group(group) => {
                f.write_str("(")?;
                for (index, child) in group.children.iter().enumerate() {
                    if index > 0 {
                        write!(f, " {} ", group.connector.as_str())?;
                    }
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(field: &str, value: &str) -> PredicateNode {
        PredicateNode::leaf(Condition::field(
            FieldPath::single(field),
            OperatorKind::Eq,
            vec![Value::text(value)],
        ))
    }

    #[test]
    fn empty_group_is_absent() {
        assert!(PredicateNode::all(Vec::new()).is_none());
    }

    #[test]
    fn single_child_group_collapses() {
        let node = PredicateNode::any(vec![eq("status", "active")]).expect("node");
        assert_eq!(node, eq("status", "active"));
    }

    #[test]
    fn group_preserves_insertion_order() {
        let node = PredicateNode::all(vec![eq("b", "2"), eq("a", "1")]).expect("node");
        assert_eq!(node.to_string(), r#"(b = "2" AND a = "1")"#);
    }

    #[test]
    fn canonical_form_ignores_child_order() {
        let left = PredicateNode::all(vec![eq("status", "active"), eq("verified", "true")]);
        let right = PredicateNode::all(vec![eq("verified", "true"), eq("status", "active")]);
        assert_eq!(
            left.expect("left").canonical(),
            right.expect("right").canonical()
        );
    }

    #[test]
    fn canonical_form_flattens_same_connector_groups() {
        let nested = PredicateNode::all(vec![
            eq("a", "1"),
            PredicateNode::all(vec![eq("b", "2"), eq("c", "3")]).expect("inner"),
        ])
        .expect("outer");
        let flat = PredicateNode::all(vec![eq("c", "3"), eq("a", "1"), eq("b", "2")]).expect("flat");
        assert_eq!(nested.canonical(), flat.canonical());
    }

    #[test]
    fn canonical_form_keeps_or_inside_and_distinct() {
        let or_inside = PredicateNode::all(vec![
            eq("a", "1"),
            PredicateNode::any(vec![eq("b", "2"), eq("c", "3")]).expect("or"),
        ])
        .expect("and");
        let all_and = PredicateNode::all(vec![eq("a", "1"), eq("b", "2"), eq("c", "3")]).expect("and");
        assert_ne!(or_inside.canonical(), all_and.canonical());
    }

    #[test]
    fn canonical_form_sorts_in_operands_but_not_between() {
        let in_leaf = PredicateNode::leaf(Condition::field(
            FieldPath::single("id"),
            OperatorKind::In,
            vec![Value::Id(3), Value::Id(1), Value::Id(3)],
        ));
        let PredicateNode::Leaf(condition) = in_leaf.canonical() else {
            panic!("leaf expected");
        };
        assert_eq!(condition.operands(), [Value::Id(1), Value::Id(3)]);

        let between = PredicateNode::leaf(Condition::field(
            FieldPath::single("age"),
            OperatorKind::Between,
            vec![Value::Int(9), Value::Int(1)],
        ));
        let PredicateNode::Leaf(condition) = between.canonical() else {
            panic!("leaf expected");
        };
        assert_eq!(condition.operands(), [Value::Int(9), Value::Int(1)]);
    }

    #[test]
    fn canonical_bytes_match_for_reordered_trees() {
        let left = PredicateNode::all(vec![eq("a", "1"), eq("b", "2")]).expect("left");
        let right = PredicateNode::all(vec![eq("b", "2"), eq("a", "1")]).expect("right");
        let mut left_bytes = Vec::new();
        left.canonical().write_canonical(&mut left_bytes);
        let mut right_bytes = Vec::new();
        right.canonical().write_canonical(&mut right_bytes);
        assert_eq!(left_bytes, right_bytes);

        let mut raw = Vec::new();
        right.write_canonical(&mut raw);
        assert_ne!(left_bytes, raw);
    }

    #[test]
    fn display_renders_operator_families() {
        let node = PredicateNode::any(vec![
            PredicateNode::leaf(Condition::field(
                FieldPath::single("deleted_at"),
                OperatorKind::Null,
                Vec::new(),
            )),
            PredicateNode::leaf(Condition::new(
                Target::RelationCount(FieldPath::single("roles")),
                OperatorKind::Gte,
                vec![Value::Int(2)],
            )),
            PredicateNode::leaf(Condition::field(
                FieldPath::single("age"),
                OperatorKind::Between,
                vec![Value::Int(18), Value::Int(30)],
            )),
        ])
        .expect("group");
        insta::assert_snapshot!(
            node.to_string(),
            @"(deleted_at IS NULL OR count(roles) >= 2 OR age BETWEEN 18 AND 30)"
        );
    }
}
