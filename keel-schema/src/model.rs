//! Relational model built from an entity set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canonical::{canonicalize_resolved, content_hash, model_hash};
use crate::entity::{EntityDefinition, EntityField, EntitySet, FieldType, ReferentialAction};
use crate::error::{SchemaError, SchemaResult};
use crate::relation::{ResolvedSchema, resolve_relations};
use crate::types::{StandardTypes, TypeMapper, resolve_sql_type};

/// Tables keyed by table name.
pub type Tables = BTreeMap<String, Table>;

/// Canonical form of an empty entity set.
const EMPTY_CANONICAL: &str = "{}";

/// How a column value is generated by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generated {
    Uuid,
    Increment,
    Now,
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<Generated>,
}

impl Column {
    /// Create a nullable, non-primary column.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            primary: false,
            default: None,
            generated: None,
        }
    }

    /// Make the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Make the column part of the primary key (implies NOT NULL).
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.nullable = false;
        self
    }

    /// Set the default expression.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Identity of an index for diffing: sorted columns plus uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey {
    pub columns: Vec<String>,
    pub unique: bool,
}

/// A table index. Columns are kept sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    /// Create an index with the default `<table>_<columns>_idx` name.
    pub fn new<I, S>(table: &str, columns: I, unique: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        columns.sort();
        columns.dedup();
        Self {
            name: default_index_name(table, &columns),
            columns,
            unique,
        }
    }

    /// Rename the index.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Diff identity of this index.
    pub fn key(&self) -> IndexKey {
        let mut columns = self.columns.clone();
        columns.sort();
        IndexKey {
            columns,
            unique: self.unique,
        }
    }
}

/// Default index name: `<table>_<col1>_<col2>_idx`.
pub fn default_index_name(table: &str, columns: &[String]) -> String {
    format!("{}_{}_idx", table, columns.join("_"))
}

/// Default foreign key name: `<table>_<col1>_fkey`.
pub fn default_foreign_key_name(table: &str, columns: &[String]) -> String {
    format!("{}_{}_fkey", table, columns.join("_"))
}

/// A foreign-key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ReferentialAction>,
}

/// A table in the relational model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub columns: BTreeMap<String, Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<Index>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: BTreeMap::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Add a column, keyed by its name.
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.insert(column.name.clone(), column);
        self
    }

    /// Get a column.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Get an index by name.
    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Get a foreign key by name.
    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.name == name)
    }

    /// Primary-key column names.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .values()
            .filter(|c| c.primary)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Copy of the table without indexes and foreign keys.
    pub fn without_constraints(&self) -> Self {
        Self {
            name: self.name.clone(),
            columns: self.columns.clone(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Copy of the table with indexes and foreign keys sorted by name.
    pub fn normalized(&self) -> Self {
        let mut table = self.clone();
        for index in &mut table.indexes {
            index.columns.sort();
        }
        table.indexes.sort_by(|a, b| a.name.cmp(&b.name));
        table.foreign_keys.sort_by(|a, b| a.name.cmp(&b.name));
        table
    }
}

/// Hash of the relational structure alone.
///
/// Two table sets with the same columns, indexes and foreign keys hash the
/// same regardless of the order constraints were added in. Entity-only
/// metadata (validation bounds, logical types sharing a SQL type) is not
/// part of this hash.
pub fn structure_hash(tables: &Tables) -> SchemaResult<String> {
    let normalized: BTreeMap<&String, Table> = tables
        .iter()
        .map(|(name, table)| (name, table.normalized()))
        .collect();
    let encoded = serde_json::to_vec(&normalized).map_err(|source| SchemaError::Encode { source })?;
    Ok(content_hash(encoded))
}

/// An immutable, content-addressed relational model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Hash of the canonical entity set and the type mapping, see
    /// [`model_hash`](crate::model_hash).
    pub hash: String,
    /// Fingerprint of a non-standard [`TypeMapper`], if one built the tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_mapping: Option<String>,
    /// The entities the model was built from.
    pub entities: BTreeMap<String, EntityDefinition>,
    /// Relational projection.
    pub tables: Tables,
}

impl Model {
    /// The model of an empty entity set.
    pub fn empty() -> Self {
        Self {
            hash: content_hash(EMPTY_CANONICAL),
            type_mapping: None,
            entities: BTreeMap::new(),
            tables: Tables::new(),
        }
    }

    /// Get a table.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Hash of the relational projection, see [`structure_hash`].
    pub fn structure_hash(&self) -> SchemaResult<String> {
        structure_hash(&self.tables)
    }

    /// The entities as an entity set, ordered by name.
    pub fn entity_set(&self) -> EntitySet {
        self.entities
            .iter()
            .map(|(name, entity)| (name.clone(), entity.clone()))
            .collect()
    }
}

/// Builds [`Model`]s with an injectable type mapping.
pub struct ModelBuilder {
    types: Box<dyn TypeMapper>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self {
            types: Box::new(StandardTypes),
        }
    }
}

impl ModelBuilder {
    /// Create a builder using [`StandardTypes`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different type mapping.
    pub fn with_type_mapper(mut self, mapper: impl TypeMapper + 'static) -> Self {
        self.types = Box::new(mapper);
        self
    }

    /// Build a model from an entity set.
    pub fn build(&self, entities: &EntitySet) -> SchemaResult<Model> {
        let resolved = resolve_relations(entities)?;
        // An empty set has no tables to map, so it keeps the empty model's hash.
        let type_mapping = if resolved.entities.is_empty() {
            None
        } else {
            self.types.fingerprint()
        };
        let hash = model_hash(&canonicalize_resolved(&resolved)?, type_mapping.as_deref());

        let mut tables = Tables::new();
        for (name, entity) in &resolved.entities {
            if entity.table.is_empty() {
                return Err(SchemaError::invalid_entity(name, "table name must not be empty"));
            }
            if tables.contains_key(&entity.table) {
                return Err(SchemaError::duplicate("table", &entity.table));
            }
            let table = self.build_table(name, entity)?;
            tables.insert(table.name.clone(), table);
        }

        attach_foreign_keys(&resolved, &mut tables)?;

        debug!(hash = %hash, tables = tables.len(), "built model");

        Ok(Model {
            hash,
            type_mapping,
            entities: entities
                .iter()
                .map(|(name, entity)| (name.clone(), entity.clone()))
                .collect(),
            tables,
        })
    }

    fn build_table(&self, name: &str, entity: &EntityDefinition) -> SchemaResult<Table> {
        let mut table = Table::new(&entity.table);

        for (field_name, field) in &entity.fields {
            let column_name = field.column_name(field_name).to_string();
            if table.columns.contains_key(&column_name) {
                return Err(SchemaError::duplicate(
                    "column",
                    format!("{}.{}", entity.table, column_name),
                ));
            }

            let column = Column {
                name: column_name.clone(),
                sql_type: resolve_sql_type(self.types.as_ref(), field),
                nullable: field.is_nullable(),
                primary: field.primary,
                default: render_default(name, field_name, field)?,
                generated: generation(name, field_name, field)?,
            };
            table.columns.insert(column_name, column);
        }

        for definition in &entity.indexes {
            if definition.fields.is_empty() {
                return Err(SchemaError::invalid_entity(
                    name,
                    "index must cover at least one field",
                ));
            }

            let mut columns = Vec::with_capacity(definition.fields.len());
            for field_name in &definition.fields {
                let Some(field) = entity.fields.get(field_name) else {
                    return Err(SchemaError::invalid_entity(
                        name,
                        format!("index references unknown field `{}`", field_name),
                    ));
                };
                columns.push(field.column_name(field_name).to_string());
            }

            let mut index = Index::new(&table.name, columns, definition.unique);
            if let Some(index_name) = &definition.name {
                index = index.named(index_name.clone());
            }
            push_index(&mut table, index)?;
        }

        for (field_name, field) in &entity.fields {
            if !field.unique && !field.index {
                continue;
            }
            let column = field.column_name(field_name).to_string();
            let covered = table.indexes.iter().any(|existing| {
                existing.columns == [column.as_str()] && (existing.unique || !field.unique)
            });
            if covered {
                continue;
            }
            let index = Index::new(&table.name, [column], field.unique);
            push_index(&mut table, index)?;
        }

        table.indexes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(table)
    }
}

/// Build a model with the standard type mapping.
pub fn build_model(entities: &EntitySet) -> SchemaResult<Model> {
    ModelBuilder::new().build(entities)
}

fn push_index(table: &mut Table, index: Index) -> SchemaResult<()> {
    let key = index.key();
    if table.indexes.iter().any(|existing| existing.key() == key) {
        return Ok(());
    }
    if table.index(&index.name).is_some() {
        return Err(SchemaError::duplicate(
            "index",
            format!("{}.{}", table.name, index.name),
        ));
    }
    table.indexes.push(index);
    Ok(())
}

fn attach_foreign_keys(resolved: &ResolvedSchema, tables: &mut Tables) -> SchemaResult<()> {
    for spec in &resolved.foreign_keys {
        let owner = lookup(resolved, &spec.entity)?;
        let target = lookup(resolved, &spec.target)?;

        let columns = column_names(owner, &spec.entity, &spec.fields)?;
        let referenced_columns = column_names(target, &spec.target, &spec.target_fields)?;

        let foreign_key = ForeignKey {
            name: default_foreign_key_name(&owner.table, &columns),
            columns,
            referenced_table: target.table.clone(),
            referenced_columns,
            on_delete: spec.on_delete,
        };

        let Some(table) = tables.get_mut(&owner.table) else {
            return Err(SchemaError::invalid_entity(&spec.entity, "table was not built"));
        };
        match table.foreign_key(&foreign_key.name) {
            Some(existing) if *existing == foreign_key => continue,
            Some(_) => {
                return Err(SchemaError::duplicate(
                    "foreign key",
                    format!("{}.{}", table.name, foreign_key.name),
                ));
            }
            None => table.foreign_keys.push(foreign_key),
        }
    }

    for table in tables.values_mut() {
        table.foreign_keys.sort_by(|a, b| a.name.cmp(&b.name));
    }
    Ok(())
}

fn lookup<'a>(resolved: &'a ResolvedSchema, entity: &str) -> SchemaResult<&'a EntityDefinition> {
    resolved
        .entities
        .get(entity)
        .ok_or_else(|| SchemaError::invalid_entity(entity, "entity is not defined"))
}

fn column_names(
    entity: &EntityDefinition,
    entity_name: &str,
    fields: &[String],
) -> SchemaResult<Vec<String>> {
    fields
        .iter()
        .map(|field_name| {
            entity
                .fields
                .get(field_name)
                .map(|f| f.column_name(field_name).to_string())
                .ok_or_else(|| {
                    SchemaError::invalid_field(entity_name, field_name, "foreign key field is missing")
                })
        })
        .collect()
}

fn generation(entity: &str, field_name: &str, field: &EntityField) -> SchemaResult<Option<Generated>> {
    if !field.generated {
        return Ok(None);
    }
    match field.field_type {
        FieldType::Uuid => Ok(Some(Generated::Uuid)),
        FieldType::Number | FieldType::Integer => Ok(Some(Generated::Increment)),
        FieldType::Timestamp => Ok(Some(Generated::Now)),
        other => Err(SchemaError::invalid_field(
            entity,
            field_name,
            format!("fields of type `{}` cannot be generated", other),
        )),
    }
}

fn render_default(entity: &str, field_name: &str, field: &EntityField) -> SchemaResult<Option<String>> {
    use serde_json::Value;

    let Some(value) = &field.default else {
        return Ok(None);
    };

    let rendered = match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) if field.field_type == FieldType::Timestamp && s.eq_ignore_ascii_case("now") => {
            "CURRENT_TIMESTAMP".to_string()
        }
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) if field.field_type == FieldType::Jsonb => {
            let encoded = serde_json::to_string(value).map_err(|source| SchemaError::Encode { source })?;
            quote_literal(&encoded)
        }
        Value::Array(_) | Value::Object(_) => {
            return Err(SchemaError::invalid_field(
                entity,
                field_name,
                "structured defaults are only allowed on jsonb fields",
            ));
        }
    };

    Ok(Some(rendered))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
