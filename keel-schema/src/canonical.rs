//! Canonical form and content hashing.
//!
//! The canonical form is the hashing input for a [`Model`](crate::Model). It
//! is a compact JSON document in which no byte depends on declaration order:
//! entities, fields and relations are emitted from sorted maps, index field
//! lists and index lists are sorted, unset keys are omitted, and JSON default
//! values are re-emitted with sorted object keys.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::entity::{EntityField, EntitySet, FieldType, IndexDefinition, RelationDefinition};
use crate::error::{SchemaError, SchemaResult};
use crate::relation::{ResolvedSchema, resolve_relations};

/// Canonicalize an entity set into a stable JSON string.
pub fn canonicalize(entities: &EntitySet) -> SchemaResult<String> {
    let resolved = resolve_relations(entities)?;
    canonicalize_resolved(&resolved)
}

/// Canonicalize an already resolved schema.
pub fn canonicalize_resolved(resolved: &ResolvedSchema) -> SchemaResult<String> {
    let entities: BTreeMap<&str, CanonicalEntity<'_>> = resolved
        .entities
        .iter()
        .map(|(name, entity)| {
            let fields = entity
                .fields
                .iter()
                .map(|(field_name, field)| (field_name.as_str(), CanonicalField::from(field)))
                .collect();

            let mut indexes: Vec<CanonicalIndex<'_>> =
                entity.indexes.iter().map(CanonicalIndex::from).collect();
            indexes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

            let relations = entity
                .relations
                .iter()
                .map(|(relation_name, relation)| (relation_name.as_str(), relation))
                .collect();

            (
                name.as_str(),
                CanonicalEntity {
                    table: &entity.table,
                    fields,
                    indexes,
                    relations,
                },
            )
        })
        .collect();

    serde_json::to_string(&entities).map_err(|source| SchemaError::Encode { source })
}

/// Hash of a canonical entity set built with an optional type mapping.
///
/// Without a mapping fingerprint this is `content_hash(canonical)`.
pub fn model_hash(canonical: &str, type_mapping: Option<&str>) -> String {
    match type_mapping {
        Some(mapping) => content_hash(format!("{}\n{}", canonical, mapping)),
        None => content_hash(canonical),
    }
}

/// Compute the lowercase hex SHA-256 of some content.
pub fn content_hash(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    hex::encode(hasher.finalize())
}

#[derive(Serialize)]
struct CanonicalEntity<'a> {
    table: &'a str,
    fields: BTreeMap<&'a str, CanonicalField<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    indexes: Vec<CanonicalIndex<'a>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    relations: BTreeMap<&'a str, &'a RelationDefinition>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalField<'a> {
    #[serde(rename = "type")]
    field_type: FieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    db_column: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    db_type: Option<&'a str>,
    #[serde(skip_serializing_if = "is_false")]
    primary: bool,
    #[serde(skip_serializing_if = "is_false")]
    generated: bool,
    nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "is_false")]
    index: bool,
    #[serde(skip_serializing_if = "is_false")]
    unique: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pattern: Option<&'a str>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    enum_values: Option<&'a [String]>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl<'a> From<&'a EntityField> for CanonicalField<'a> {
    fn from(field: &'a EntityField) -> Self {
        Self {
            field_type: field.field_type,
            db_column: field.db_column.as_deref(),
            db_type: field.db_type.as_deref(),
            primary: field.primary,
            generated: field.generated,
            nullable: field.is_nullable(),
            default: field.default.as_ref().map(canonical_value),
            index: field.index,
            unique: field.unique,
            min: field.min,
            max: field.max,
            pattern: field.pattern.as_deref(),
            enum_values: field.enum_values.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct CanonicalIndex<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    fields: Vec<&'a str>,
    #[serde(skip_serializing_if = "is_false")]
    unique: bool,
}

impl CanonicalIndex<'_> {
    /// Orders on every emitted key.
    fn sort_key(&self) -> (String, Option<&str>, &[&str], bool) {
        let key = match self.name {
            Some(name) => name.to_string(),
            None => self.fields.join(","),
        };
        (key, self.name, self.fields.as_slice(), self.unique)
    }
}

impl<'a> From<&'a IndexDefinition> for CanonicalIndex<'a> {
    fn from(index: &'a IndexDefinition) -> Self {
        let mut fields: Vec<&str> = index.fields.iter().map(String::as_str).collect();
        fields.sort_unstable();
        Self {
            name: index.name.as_deref(),
            fields,
            unique: index.unique,
        }
    }
}

/// Rebuild a JSON value with object keys in sorted order.
fn canonical_value(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = serde_json::Map::new();
            for (key, inner) in sorted {
                out.insert(key.clone(), canonical_value(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}
