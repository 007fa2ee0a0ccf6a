//! Logical type to SQL type mapping.

use crate::entity::{EntityField, FieldType};

/// Default VARCHAR length for strings without a `max` bound.
pub const DEFAULT_VARCHAR_LENGTH: u32 = 255;

/// Strategy that maps an entity field to a SQL column type.
///
/// An explicit `dbType` on the field always wins; mappers only see fields
/// without one.
pub trait TypeMapper: Send + Sync {
    /// Map a field without a `dbType` override.
    fn sql_type(&self, field: &EntityField) -> String;

    /// Stable identifier of a non-standard mapping.
    ///
    /// Folded into the model hash, so the same entities mapped two ways
    /// never share a hash. [`StandardTypes`] returns `None`.
    fn fingerprint(&self) -> Option<String> {
        None
    }
}

/// The standard mapping table.
///
/// | type | SQL |
/// |------|-----|
/// | uuid | `UUID` |
/// | string | `VARCHAR(max)` or `VARCHAR(255)` |
/// | text | `TEXT` |
/// | number, integer | `INTEGER` |
/// | boolean | `BOOLEAN` |
/// | timestamp | `TIMESTAMP` |
/// | jsonb | `JSONB` |
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardTypes;

impl TypeMapper for StandardTypes {
    fn sql_type(&self, field: &EntityField) -> String {
        match field.field_type {
            FieldType::Uuid => "UUID".to_string(),
            FieldType::String => format!("VARCHAR({})", varchar_length(field)),
            FieldType::Text => "TEXT".to_string(),
            FieldType::Number | FieldType::Integer => "INTEGER".to_string(),
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Timestamp => "TIMESTAMP".to_string(),
            FieldType::Jsonb => "JSONB".to_string(),
        }
    }
}

fn varchar_length(field: &EntityField) -> u32 {
    match field.max {
        Some(max) if max >= 1.0 && max.fract() == 0.0 && max <= f64::from(u32::MAX) => max as u32,
        _ => DEFAULT_VARCHAR_LENGTH,
    }
}

/// Resolve the SQL type of a field, honoring `dbType`.
pub fn resolve_sql_type(mapper: &dyn TypeMapper, field: &EntityField) -> String {
    match &field.db_type {
        Some(db_type) => db_type.clone(),
        None => mapper.sql_type(field),
    }
}
