//! Per-entity searchable-field maps, compiled once into shared descriptors.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use super::error::DomainError;
use super::fields::{FieldDescriptor, FieldPath, ValueType};
use super::operators::{OperatorKind, OperatorSet};

/// Suffix that turns a countable relation name into a count pseudo-field.
pub const COUNT_SUFFIX: &str = "_count";

const DEFAULT_PRIMARY_KEY: &str = "id";

/// Operators that make sense on an identifier column.
const IDENTIFIER_OPERATORS: [OperatorKind; 6] = [
    OperatorKind::Eq,
    OperatorKind::NotEq,
    OperatorKind::In,
    OperatorKind::NotIn,
    OperatorKind::Null,
    OperatorKind::NotNull,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Scalar,
    Numeric,
    Date,
}

/// Declared behaviour of one searchable field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub default_operator: OperatorKind,
    pub allowed_operators: OperatorSet,
    pub identifier: bool,
}

impl Default for FieldSpec {
    fn default() -> Self {
        Self {
            kind: FieldKind::Scalar,
            default_operator: OperatorKind::Eq,
            allowed_operators: OperatorSet::all(),
            identifier: false,
        }
    }
}

/// A relation the entity exposes to clients, with the fields reachable
/// through it and any nested relations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationSpec {
    pub includable: bool,
    pub searchable: bool,
    pub countable: bool,
    pub fields: BTreeMap<String, FieldSpec>,
    pub relations: BTreeMap<String, RelationSpec>,
}

/// Flags of a declared relation, keyed by its dotted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationAccess {
    pub includable: bool,
    pub searchable: bool,
    pub countable: bool,
}

/// Outcome of looking a client-supplied field name up in a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLookup {
    Found(Arc<FieldDescriptor>),
    /// The name traverses a relation that is not open to clients.
    DisallowedRelation(String),
    Unknown,
}

/// The compiled, immutable field map of one entity.
#[derive(Debug)]
pub struct EntitySchema {
    name: String,
    primary_key: String,
    descriptors: BTreeMap<String, Arc<FieldDescriptor>>,
    relations: BTreeMap<String, RelationAccess>,
    default_search_fields: Vec<String>,
}

impl EntitySchema {
    /// Validate the declared maps and compile every descriptor.
    pub fn compile(
        name: impl Into<String>,
        primary_key: Option<String>,
        fields: BTreeMap<String, FieldSpec>,
        relations: BTreeMap<String, RelationSpec>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::schema("entity name must not be empty"));
        }
        let primary_key = primary_key.unwrap_or_else(|| DEFAULT_PRIMARY_KEY.to_string());
        if primary_key.trim().is_empty() || primary_key.contains('.') {
            return Err(DomainError::schema(format!(
                "entity `{name}` has an invalid primary key `{primary_key}`"
            )));
        }

        let mut compiler = Compiler {
            entity: &name,
            descriptors: BTreeMap::new(),
            relations: BTreeMap::new(),
        };

        for (field, spec) in &fields {
            if field.contains('.') {
                return Err(DomainError::schema(format!(
                    "entity `{name}` field `{field}` must be declared under its relation"
                )));
            }
            compiler.add_field(&[], field, spec)?;
        }
        compiler.add_relations(&[], &relations, true)?;

        let default_search_fields = compiler
            .descriptors
            .iter()
            .filter(|(_, descriptor)| {
                !descriptor.path.is_relation()
                    && !descriptor.is_relation_count
                    && !descriptor.is_obfuscated_id
                    && descriptor.value_type == ValueType::Scalar
            })
            .map(|(key, _)| key.clone())
            .collect();

        let Compiler {
            descriptors,
            relations,
            ..
        } = compiler;

        Ok(Self {
            name,
            primary_key,
            descriptors,
            relations,
            default_search_fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn descriptor(&self, field: &str) -> Option<&Arc<FieldDescriptor>> {
        self.descriptors.get(field)
    }

    /// Resolve a client-supplied field name.
    ///
    /// Names that reach through a relation the entity does not open for search
    /// are reported separately from plain unknown names.
    pub fn lookup(&self, field: &str) -> FieldLookup {
        if let Some(descriptor) = self.descriptors.get(field) {
            return FieldLookup::Found(Arc::clone(descriptor));
        }

        if let Some(relation) = field.strip_suffix(COUNT_SUFFIX) {
            if let Some(access) = self.relations.get(relation) {
                if !access.countable {
                    return FieldLookup::DisallowedRelation(relation.to_string());
                }
            }
        }

        if let Some((relation, _)) = field.rsplit_once('.') {
            return match self.relations.get(relation) {
                Some(access) if access.searchable => FieldLookup::Unknown,
                _ => FieldLookup::DisallowedRelation(relation.to_string()),
            };
        }

        FieldLookup::Unknown
    }

    pub fn relation(&self, path: &str) -> Option<RelationAccess> {
        self.relations.get(path).copied()
    }

    pub fn is_includable(&self, path: &str) -> bool {
        self.relation(path).is_some_and(|access| access.includable)
    }

    pub fn is_countable(&self, path: &str) -> bool {
        self.relation(path).is_some_and(|access| access.countable)
    }

    /// Fields a bare search term expands to when no `searchFields` are given.
    pub fn default_search_fields(&self) -> &[String] {
        &self.default_search_fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }
}

struct Compiler<'a> {
    entity: &'a str,
    descriptors: BTreeMap<String, Arc<FieldDescriptor>>,
    relations: BTreeMap<String, RelationAccess>,
}

impl Compiler<'_> {
    fn add_field(
        &mut self,
        relation: &[String],
        field: &str,
        spec: &FieldSpec,
    ) -> Result<(), DomainError> {
        let mut segments = relation.to_vec();
        segments.push(field.to_string());
        let path = FieldPath::from_segments(segments).ok_or_else(|| {
            DomainError::schema(format!(
                "entity `{}` declares an empty field name",
                self.entity
            ))
        })?;
        let key = path.to_string();

        if spec.allowed_operators.is_empty() {
            return Err(self.field_error(&key, "allows no operators"));
        }
        if !spec.allowed_operators.contains(spec.default_operator) {
            return Err(self.field_error(
                &key,
                &format!(
                    "default operator `{}` is not among its allowed operators",
                    spec.default_operator
                ),
            ));
        }
        if spec.identifier {
            if let Some(operator) = spec
                .allowed_operators
                .iter()
                .find(|operator| !IDENTIFIER_OPERATORS.contains(operator))
            {
                return Err(self.field_error(
                    &key,
                    &format!("is an identifier and cannot allow `{operator}`"),
                ));
            }
        }

        let value_type = match (spec.identifier, spec.kind) {
            (true, _) => ValueType::IdentifierList,
            (false, FieldKind::Scalar) => ValueType::Scalar,
            (false, FieldKind::Numeric) => ValueType::Numeric,
            (false, FieldKind::Date) => ValueType::DateRange,
        };

        self.insert(
            key,
            FieldDescriptor {
                path,
                value_type,
                is_obfuscated_id: spec.identifier,
                is_relation_count: false,
                default_operator: spec.default_operator,
                allowed_operators: spec.allowed_operators.clone(),
            },
        )
    }

    fn add_relations(
        &mut self,
        parent: &[String],
        relations: &BTreeMap<String, RelationSpec>,
        parent_searchable: bool,
    ) -> Result<(), DomainError> {
        for (name, spec) in relations {
            if name.is_empty() || name.contains('.') {
                return Err(DomainError::schema(format!(
                    "entity `{}` declares an invalid relation name `{name}`",
                    self.entity
                )));
            }
            let mut path = parent.to_vec();
            path.push(name.clone());
            let key = path.join(".");
            let searchable = parent_searchable && spec.searchable;

            if !spec.fields.is_empty() && !searchable {
                return Err(DomainError::schema(format!(
                    "entity `{}` relation `{key}` declares fields but is not searchable",
                    self.entity
                )));
            }

            self.relations.insert(
                key.clone(),
                RelationAccess {
                    includable: spec.includable,
                    searchable,
                    countable: spec.countable,
                },
            );

            for (field, field_spec) in &spec.fields {
                self.add_field(&path, field, field_spec)?;
            }

            if spec.countable {
                let relation_path = FieldPath::from_segments(path.clone()).ok_or_else(|| {
                    DomainError::schema(format!(
                        "entity `{}` declares an empty relation path",
                        self.entity
                    ))
                })?;
                self.insert(
                    format!("{key}{COUNT_SUFFIX}"),
                    FieldDescriptor {
                        path: relation_path,
                        value_type: ValueType::Numeric,
                        is_obfuscated_id: false,
                        is_relation_count: true,
                        default_operator: OperatorKind::Eq,
                        allowed_operators: OperatorSet::numeric(),
                    },
                )?;
            }

            self.add_relations(&path, &spec.relations, searchable)?;
        }
        Ok(())
    }

    fn insert(&mut self, key: String, descriptor: FieldDescriptor) -> Result<(), DomainError> {
        if self.descriptors.contains_key(&key) {
            return Err(self.field_error(&key, "is declared more than once"));
        }
        self.descriptors.insert(key, Arc::new(descriptor));
        Ok(())
    }

    fn field_error(&self, field: &str, reason: &str) -> DomainError {
        DomainError::schema(format!("entity `{}` field `{field}` {reason}", self.entity))
    }
}

/// Every configured entity, by name.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, schema: EntitySchema) {
        self.entities
            .insert(schema.name().to_string(), Arc::new(schema));
    }

    pub fn get(&self, entity: &str) -> Result<Arc<EntitySchema>, DomainError> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| DomainError::unknown_entity(entity))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
