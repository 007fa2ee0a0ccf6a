//! Declarative entity definitions.
//!
//! These are the inputs to the canonicalizer and the model builder. They are
//! produced by an external schema parser and deserialize from the camelCase
//! JSON shape used by schema files:
//!
//! ```json
//! {
//!   "User": {
//!     "table": "users",
//!     "fields": {
//!       "id":    { "type": "uuid", "primary": true, "generated": true },
//!       "email": { "type": "string", "required": true, "unique": true }
//!     }
//!   }
//! }
//! ```

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A set of entities keyed by entity name.
///
/// Declaration order is preserved for diagnostics but never affects hashing.
pub type EntitySet = IndexMap<String, EntityDefinition>;

/// Logical field type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Uuid,
    #[default]
    String,
    Text,
    Number,
    Integer,
    Boolean,
    Timestamp,
    Jsonb,
}

impl FieldType {
    /// Get the schema-file spelling of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::String => "string",
            Self::Text => "text",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Jsonb => "jsonb",
        }
    }

    /// Check if this is a numeric type.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Integer)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field of an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityField {
    /// Logical type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Column name override (defaults to the field name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_column: Option<String>,
    /// SQL type override, always preferred over the type mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_type: Option<String>,
    /// Part of the primary key.
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary: bool,
    /// Value is generated by the database.
    #[serde(default, skip_serializing_if = "is_false")]
    pub generated: bool,
    /// Explicit nullability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    /// Required fields are never nullable.
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    /// Default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Create a single-column index.
    #[serde(default, skip_serializing_if = "is_false")]
    pub index: bool,
    /// Create a single-column unique index.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    /// Lower bound (value or length).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound (value or length). For strings this is the VARCHAR length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Validation pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Allowed values.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl EntityField {
    /// Create a new field of the given type.
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            ..Default::default()
        }
    }

    /// Mark the field as part of the primary key.
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Mark the field as database-generated.
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Mark the field as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set explicit nullability.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    /// Mark the field as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark the field as indexed.
    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    /// Override the column name.
    pub fn db_column(mut self, column: impl Into<String>) -> Self {
        self.db_column = Some(column.into());
        self
    }

    /// Override the SQL type.
    pub fn db_type(mut self, sql_type: impl Into<String>) -> Self {
        self.db_type = Some(sql_type.into());
        self
    }

    /// Set the default value.
    pub fn default_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the upper bound.
    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Resolve the column name for a field declared as `name`.
    pub fn column_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.db_column.as_deref().unwrap_or(name)
    }

    /// Effective nullability: primary keys and required fields are never null.
    pub fn is_nullable(&self) -> bool {
        !self.primary && !self.required && self.nullable.unwrap_or(true)
    }
}

/// A composite index declared on an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Explicit index name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Field names covered by the index.
    pub fields: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

impl IndexDefinition {
    /// Create an index over the given fields.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Set the index name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Make the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Kind of relation between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    BelongsTo,
    HasMany,
    HasOne,
    ManyToMany,
}

/// Referential action for foreign keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl ReferentialAction {
    /// SQL spelling of the action.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::NoAction => "NO ACTION",
        }
    }
}

/// A relation from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDefinition {
    /// Relation kind.
    #[serde(rename = "type")]
    pub kind: RelationKind,
    /// Target entity name.
    pub target: String,
    /// Foreign-key field name, overriding the generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    /// Join table for many-to-many relations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub through: Option<String>,
    /// Whether the generated foreign key is NOT NULL.
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    /// Action on delete of the referenced row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ReferentialAction>,
}

impl RelationDefinition {
    /// Create a relation of the given kind.
    pub fn new(kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            foreign_key: None,
            through: None,
            required: false,
            on_delete: None,
        }
    }

    /// Create a belongs-to relation.
    pub fn belongs_to(target: impl Into<String>) -> Self {
        Self::new(RelationKind::BelongsTo, target)
    }

    /// Create a has-many relation.
    pub fn has_many(target: impl Into<String>) -> Self {
        Self::new(RelationKind::HasMany, target)
    }

    /// Create a has-one relation.
    pub fn has_one(target: impl Into<String>) -> Self {
        Self::new(RelationKind::HasOne, target)
    }

    /// Create a many-to-many relation.
    pub fn many_to_many(target: impl Into<String>) -> Self {
        Self::new(RelationKind::ManyToMany, target)
    }

    /// Set the foreign key field.
    pub fn foreign_key(mut self, field: impl Into<String>) -> Self {
        self.foreign_key = Some(field.into());
        self
    }

    /// Set the join table.
    pub fn through(mut self, table: impl Into<String>) -> Self {
        self.through = Some(table.into());
        self
    }

    /// Make the foreign key required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the on-delete action.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }
}

/// A declarative entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinition {
    /// Table name.
    pub table: String,
    /// Fields by name.
    #[serde(default)]
    pub fields: IndexMap<String, EntityField>,
    /// Composite indexes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDefinition>,
    /// Relations by name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub relations: IndexMap<String, RelationDefinition>,
}

impl EntityDefinition {
    /// Create an empty entity mapped to `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Add a field.
    pub fn field(mut self, name: impl Into<String>, field: EntityField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Add a composite index.
    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Add a relation.
    pub fn relation(mut self, name: impl Into<String>, relation: RelationDefinition) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    /// Primary-key fields in declaration order.
    pub fn primary_fields(&self) -> impl Iterator<Item = (&String, &EntityField)> {
        self.fields.iter().filter(|(_, f)| f.primary)
    }

    /// Find a field by its column name.
    pub fn field_by_column(&self, column: &str) -> Option<(&String, &EntityField)> {
        self.fields
            .iter()
            .find(|(name, field)| field.column_name(name) == column)
    }
}

/// Lower-camel-case an entity name (`BlogPost` → `blogPost`).
pub fn lower_camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_entity_json() {
        let json = r#"{
            "table": "users",
            "fields": {
                "id": { "type": "uuid", "primary": true },
                "email": { "type": "string", "required": true, "unique": true, "dbColumn": "email_address" }
            },
            "relations": {
                "team": { "type": "belongsTo", "target": "Team", "onDelete": "cascade" }
            }
        }"#;

        let entity: EntityDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(entity.table, "users");
        assert_eq!(entity.fields.len(), 2);

        let email = &entity.fields["email"];
        assert_eq!(email.field_type, FieldType::String);
        assert_eq!(email.column_name("email"), "email_address");
        assert!(email.required && email.unique);

        let team = &entity.relations["team"];
        assert_eq!(team.kind, RelationKind::BelongsTo);
        assert_eq!(team.on_delete, Some(ReferentialAction::Cascade));
    }

    #[test]
    fn test_primary_is_never_nullable() {
        let field = EntityField::new(FieldType::Uuid).primary().nullable(true);
        assert!(!field.is_nullable());
    }

    #[test]
    fn test_nullability_defaults() {
        assert!(EntityField::new(FieldType::String).is_nullable());
        assert!(!EntityField::new(FieldType::String).required().is_nullable());
        assert!(!EntityField::new(FieldType::String).nullable(false).is_nullable());
        assert!(
            !EntityField::new(FieldType::String)
                .required()
                .nullable(true)
                .is_nullable()
        );
    }

    #[test]
    fn test_serialize_skips_unset_keys() {
        let field = EntityField::new(FieldType::Integer);
        let json = serde_json::to_string(&field).unwrap();
        assert_eq!(json, r#"{"type":"integer"}"#);
    }

    #[test]
    fn test_lower_camel() {
        assert_eq!(lower_camel("BlogPost"), "blogPost");
        assert_eq!(lower_camel("user"), "user");
        assert_eq!(lower_camel(""), "");
    }
}
