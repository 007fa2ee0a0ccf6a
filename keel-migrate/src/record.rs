//! Migration records.
//!
//! A record links two model hashes with the steps between them. Records are
//! stored as pretty-printed JSON; keys this version does not know about are
//! kept in [`MigrationRecord::extra`] and written back unchanged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_schema::{Model, Tables, content_hash};
use serde::{Deserialize, Serialize};

use crate::diff::MigrationDiff;
use crate::error::{MigrateResult, MigrationError};
use crate::step::MigrationStep;

/// A versioned migration between two model hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    /// Content id: SHA-256 of `(fromHash, toHash, steps)`.
    #[serde(default)]
    pub id: String,
    pub from_hash: String,
    pub to_hash: String,
    pub steps: Vec<MigrationStep>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Unknown keys, preserved on round-trip.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdInput<'a> {
    from_hash: &'a str,
    to_hash: &'a str,
    steps: &'a [MigrationStep],
}

/// Compute the content id of a migration.
pub fn migration_id(from_hash: &str, to_hash: &str, steps: &[MigrationStep]) -> MigrateResult<String> {
    let encoded = serde_json::to_vec(&IdInput {
        from_hash,
        to_hash,
        steps,
    })?;
    Ok(content_hash(encoded))
}

impl MigrationRecord {
    /// Create a record from parts, computing its id.
    pub fn new(
        from_hash: impl Into<String>,
        to_hash: impl Into<String>,
        steps: Vec<MigrationStep>,
    ) -> MigrateResult<Self> {
        let from_hash = from_hash.into();
        let to_hash = to_hash.into();
        let id = migration_id(&from_hash, &to_hash, &steps)?;
        Ok(Self {
            id,
            from_hash,
            to_hash,
            steps,
            created_at: Utc::now(),
            description: String::new(),
            extra: BTreeMap::new(),
        })
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Check the id against the content.
    pub fn verify_id(&self) -> MigrateResult<()> {
        let expected = migration_id(&self.from_hash, &self.to_hash, &self.steps)?;
        if expected != self.id {
            return Err(MigrationError::invalid_migration(format!(
                "migration {} -> {} has id {} but its content hashes to {}",
                self.from_hash, self.to_hash, self.id, expected
            )));
        }
        Ok(())
    }

    /// Whether any step can lose data.
    pub fn is_destructive(&self) -> bool {
        self.steps.iter().any(MigrationStep::is_destructive)
    }

    /// The record that undoes this one: hashes swapped, steps inverted newest first.
    pub fn inverse(&self) -> MigrateResult<Self> {
        let steps = self.steps.iter().rev().map(MigrationStep::inverse).collect();
        let mut inverse = Self::new(&self.to_hash, &self.from_hash, steps)?;
        inverse.created_at = self.created_at;
        inverse.description = format!("Rollback of {}", self.id);
        Ok(inverse)
    }
}

/// Create a migration record from a diff between two models.
pub fn create_migration(from: &Model, to: &Model, diff: &MigrationDiff) -> MigrateResult<MigrationRecord> {
    if diff.from_hash != from.hash || diff.to_hash != to.hash {
        return Err(MigrationError::invalid_migration(format!(
            "diff {} -> {} does not connect models {} -> {}",
            diff.from_hash, diff.to_hash, from.hash, to.hash
        )));
    }
    if !diff.has_changes() {
        return Err(MigrationError::NoChanges);
    }
    MigrationRecord::new(&from.hash, &to.hash, diff.steps.clone())
}

/// Serialize a record to pretty JSON.
pub fn serialize_migration(record: &MigrationRecord) -> MigrateResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(record)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Deserialize a record. A missing id is computed from the content.
pub fn deserialize_migration(bytes: &[u8]) -> MigrateResult<MigrationRecord> {
    let mut record: MigrationRecord = serde_json::from_slice(bytes)?;
    if record.from_hash.is_empty() || record.to_hash.is_empty() {
        return Err(MigrationError::invalid_migration(
            "migration record must have non-empty fromHash and toHash",
        ));
    }
    if record.id.is_empty() {
        record.id = migration_id(&record.from_hash, &record.to_hash, &record.steps)?;
    }
    Ok(record)
}

/// Validate a record against the hash and tables it is about to be applied to.
///
/// Returns the tables after all steps. Fails with
/// [`MigrationError::HashMismatch`] when the record starts elsewhere and with
/// [`MigrationError::StepDependency`] when a step references something that
/// neither `base` nor an earlier step establishes.
pub fn validate_migration(
    record: &MigrationRecord,
    expected_from_hash: &str,
    base: &Tables,
) -> MigrateResult<Tables> {
    if record.from_hash != expected_from_hash {
        return Err(MigrationError::HashMismatch {
            migration: record.id.clone(),
            expected: expected_from_hash.to_string(),
            actual: record.from_hash.clone(),
        });
    }

    let mut tables = base.clone();
    for (step_index, step) in record.steps.iter().enumerate() {
        step.apply_to(&mut tables)
            .map_err(|reason| MigrationError::StepDependency {
                migration: record.id.clone(),
                from_hash: record.from_hash.clone(),
                step_index,
                step: step.to_string(),
                reason,
            })?;
    }
    Ok(tables)
}
