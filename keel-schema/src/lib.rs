//! # keel-schema
//!
//! Entity schema types and relational model building for Keel.
//!
//! This crate provides:
//! - Entity definition types deserializable from JSON
//! - Relation resolution into foreign-key fields and join entities
//! - A canonical form and content hash independent of declaration order
//! - The relational [`Model`] (tables, columns, indexes, foreign keys)
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_schema::{EntityDefinition, EntityField, EntitySet, FieldType, build_model};
//!
//! let mut entities = EntitySet::new();
//! entities.insert(
//!     "User".into(),
//!     EntityDefinition::new("users")
//!         .field("id", EntityField::new(FieldType::Uuid).primary())
//!         .field("email", EntityField::new(FieldType::String).required().unique()),
//! );
//!
//! let model = build_model(&entities)?;
//! assert!(model.table("users").is_some());
//! ```

pub mod canonical;
pub mod entity;
pub mod error;
pub mod model;
pub mod relation;
pub mod types;

pub use canonical::{canonicalize, canonicalize_resolved, content_hash, model_hash};
pub use entity::{
    EntityDefinition, EntityField, EntitySet, FieldType, IndexDefinition, ReferentialAction,
    RelationDefinition, RelationKind,
};
pub use error::{SchemaError, SchemaResult};
pub use model::{
    Column, ForeignKey, Generated, Index, IndexKey, Model, ModelBuilder, Table, Tables,
    build_model, structure_hash,
};
pub use relation::{ForeignKeySpec, ResolvedSchema, resolve_relations};
pub use types::{StandardTypes, TypeMapper, resolve_sql_type};
