//! Error types for entity resolution and model building.

// These warnings are false positives - the fields are used by derive macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Result type for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while canonicalizing or building a model from an entity set.
///
/// These are always caused by the input schema and are fixed by editing it.
#[derive(Error, Debug, Diagnostic)]
pub enum SchemaError {
    /// Invalid entity definition.
    #[error("invalid entity `{entity}`: {message}")]
    #[diagnostic(code(keel::schema::invalid_entity))]
    InvalidEntity { entity: String, message: String },

    /// Invalid field definition.
    #[error("invalid field `{entity}.{field}`: {message}")]
    #[diagnostic(code(keel::schema::invalid_field))]
    InvalidField {
        entity: String,
        field: String,
        message: String,
    },

    /// Invalid relation definition.
    #[error("invalid relation `{entity}.{relation}`: {message}")]
    #[diagnostic(code(keel::schema::invalid_relation))]
    InvalidRelation {
        entity: String,
        relation: String,
        message: String,
    },

    /// A relation points at an entity that does not exist.
    #[error("relation `{entity}.{relation}` targets unknown entity `{target}`")]
    #[diagnostic(code(keel::schema::unknown_entity))]
    UnknownEntity {
        entity: String,
        relation: String,
        target: String,
    },

    /// A hasMany/hasOne relation whose foreign key cannot be found on the target.
    #[error(
        "relation `{entity}.{relation}` expects foreign key `{target}.{foreign_key}`, \
         but no such field exists or is generated"
    )]
    #[diagnostic(
        code(keel::schema::unresolved_relation),
        help("add a `belongsTo` relation on `{target}` or declare the field explicitly")
    )]
    UnresolvedRelation {
        entity: String,
        relation: String,
        target: String,
        foreign_key: String,
    },

    /// A generated foreign-key field clashes with an existing or generated field.
    #[error("foreign key `{entity}.{field}` generated by relation `{relation}` collides: {message}")]
    #[diagnostic(code(keel::schema::foreign_key_collision))]
    ForeignKeyCollision {
        entity: String,
        field: String,
        relation: String,
        message: String,
    },

    /// Duplicate definition.
    #[error("duplicate {kind} `{name}`")]
    #[diagnostic(code(keel::schema::duplicate))]
    Duplicate { kind: String, name: String },

    /// The canonical form could not be encoded.
    #[error("failed to encode canonical schema")]
    #[diagnostic(code(keel::schema::encode))]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

impl SchemaError {
    /// Create an invalid entity error.
    pub fn invalid_entity(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create an invalid field error.
    pub fn invalid_field(
        entity: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidField {
            entity: entity.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an invalid relation error.
    pub fn invalid_relation(
        entity: impl Into<String>,
        relation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidRelation {
            entity: entity.into(),
            relation: relation.into(),
            message: message.into(),
        }
    }

    /// Create a foreign key collision error.
    pub fn foreign_key_collision(
        entity: impl Into<String>,
        field: impl Into<String>,
        relation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ForeignKeyCollision {
            entity: entity.into(),
            field: field.into(),
            relation: relation.into(),
            message: message.into(),
        }
    }

    /// Create a duplicate definition error.
    pub fn duplicate(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Duplicate {
            kind: kind.into(),
            name: name.into(),
        }
    }
}
