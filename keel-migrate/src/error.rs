//! Error types for the migration engine.

use std::fmt;

use keel_schema::SchemaError;
use thiserror::Error;

use crate::step::MigrationStep;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Malformed entity input.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// A migration was authored against a different schema state.
    #[error("Hash mismatch for migration '{migration}': expected fromHash {expected}, got {actual}")]
    HashMismatch {
        /// Migration ID.
        migration: String,
        /// Hash the caller expected the migration to start from.
        expected: String,
        /// Hash the migration actually starts from.
        actual: String,
    },

    /// A step references an object that does not exist at that point.
    #[error(
        "Step {step_index} of migration '{migration}' (from {from_hash}) cannot apply `{step}`: {reason}"
    )]
    StepDependency {
        /// Migration ID.
        migration: String,
        /// fromHash of the migration.
        from_hash: String,
        /// Index of the failing step.
        step_index: usize,
        /// Rendered step.
        step: String,
        /// What is missing or inconsistent.
        reason: String,
    },

    /// Applying a migration failed and its transaction was rolled back.
    #[error("Replay failed at migration '{migration}' ({from_hash} -> {to_hash}){}: {source}", fmt_step(.step_index))]
    ReplayFailed {
        /// Migration ID.
        migration: String,
        /// fromHash of the migration.
        from_hash: String,
        /// toHash of the migration.
        to_hash: String,
        /// Index of the failing step, if a step failed.
        step_index: Option<usize>,
        /// Underlying failure.
        #[source]
        source: Box<MigrationError>,
    },

    /// Divergent branches touch the same object.
    #[error(transparent)]
    Conflict(Box<ConflictError>),

    /// An environment moved since it was read.
    #[error(
        "Environment '{environment}' state conflict: expected {}, found {}",
        fmt_hash(.expected),
        fmt_hash(.actual)
    )]
    StateConflict {
        /// Environment name.
        environment: String,
        /// Hash the caller expected.
        expected: Option<String>,
        /// Hash actually recorded.
        actual: Option<String>,
    },

    /// Snapshot or migration not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Lock acquisition failed.
    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),

    /// Data loss would occur.
    #[error("Data loss would occur: {0}")]
    DataLoss(String),

    /// No changes to migrate.
    #[error("No schema changes detected")]
    NoChanges,

    /// Invalid migration record.
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// Database operation error.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn fmt_step(step_index: &Option<usize>) -> String {
    match step_index {
        Some(index) => format!(" at step {}", index),
        None => String::new(),
    }
}

fn fmt_hash(hash: &Option<String>) -> &str {
    hash.as_deref().unwrap_or("<none>")
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a data loss error.
    pub fn data_loss(msg: impl Into<String>) -> Self {
        Self::DataLoss(msg.into())
    }

    /// Create a lock failed error.
    pub fn lock_failed(msg: impl Into<String>) -> Self {
        Self::LockFailed(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid migration error.
    pub fn invalid_migration(msg: impl Into<String>) -> Self {
        Self::InvalidMigration(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this is a recoverable error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockFailed(_) | Self::StateConflict { .. } | Self::NoChanges
        )
    }
}

impl From<ConflictError> for MigrationError {
    fn from(err: ConflictError) -> Self {
        Self::Conflict(Box::new(err))
    }
}

/// Two branches changed the same object differently.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictError {
    /// Common ancestor hash.
    pub base_hash: String,
    /// Local branch hash.
    pub local_hash: String,
    /// Remote branch hash.
    pub remote_hash: String,
    /// Table involved.
    pub table: String,
    /// Column, index or foreign key involved, if narrower than the table.
    pub column: Option<String>,
    /// What disagrees.
    pub detail: String,
    /// The local step, if the conflict is between steps.
    pub local_step: Option<Box<MigrationStep>>,
    /// The remote step, if the conflict is between steps.
    pub remote_step: Option<Box<MigrationStep>>,
}

impl ConflictError {
    /// Create a conflict on a table.
    pub fn new(
        base_hash: impl Into<String>,
        local_hash: impl Into<String>,
        remote_hash: impl Into<String>,
        table: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            base_hash: base_hash.into(),
            local_hash: local_hash.into(),
            remote_hash: remote_hash.into(),
            table: table.into(),
            column: None,
            detail: detail.into(),
            local_step: None,
            remote_step: None,
        }
    }

    /// Narrow the conflict to a column or constraint.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Attach the conflicting steps.
    pub fn steps(mut self, local: MigrationStep, remote: MigrationStep) -> Self {
        self.local_step = Some(Box::new(local));
        self.remote_step = Some(Box::new(remote));
        self
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conflict on table '{}'", self.table)?;
        if let Some(column) = &self.column {
            write!(f, " ('{}')", column)?;
        }
        write!(
            f,
            " between local {} and remote {} (base {}): {}",
            self.local_hash, self.remote_hash, self.base_hash, self.detail
        )?;
        if let (Some(local), Some(remote)) = (&self.local_step, &self.remote_step) {
            write!(f, "; local `{}` vs remote `{}`", local, remote)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConflictError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::not_found("snapshot abc123");
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn test_hash_mismatch_display() {
        let err = MigrationError::HashMismatch {
            migration: "m1".to_string(),
            expected: "abc".to_string(),
            actual: "xyz".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("xyz"));
    }

    #[test]
    fn test_replay_failed_display() {
        let err = MigrationError::ReplayFailed {
            migration: "m1".to_string(),
            from_hash: "aaa".to_string(),
            to_hash: "bbb".to_string(),
            step_index: Some(2),
            source: Box::new(MigrationError::database("relation exists")),
        };
        let msg = err.to_string();
        assert!(msg.contains("aaa -> bbb"));
        assert!(msg.contains("at step 2"));
        assert!(msg.contains("relation exists"));
    }

    #[test]
    fn test_state_conflict_display() {
        let err = MigrationError::StateConflict {
            environment: "staging".to_string(),
            expected: None,
            actual: Some("def".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("<none>"));
        assert!(msg.contains("def"));
    }

    #[test]
    fn test_conflict_display() {
        let err: MigrationError = ConflictError::new("b", "l", "r", "users", "both changed")
            .column("email")
            .into();
        let msg = err.to_string();
        assert!(msg.contains("users"));
        assert!(msg.contains("email"));
        assert!(msg.contains("base b"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(MigrationError::NoChanges.is_recoverable());
        assert!(MigrationError::lock_failed("timeout").is_recoverable());
        assert!(!MigrationError::database("connection").is_recoverable());
    }
}
