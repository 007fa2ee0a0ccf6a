//! # keel-migrate
//!
//! Migration engine for Keel models.
//!
//! This crate provides functionality for:
//! - Deterministic, dependency-ordered diffs between two [`Model`](keel_schema::Model)s
//! - Content-addressed migration records with validation and inverses
//! - A file-backed snapshot store with per-environment state
//! - Transactional replay and rollback through an injected connection
//! - Three-way merging of divergent snapshot branches
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ Entity Set   │────▶│ Model Builder  │────▶│ Differ           │
//! └──────────────┘     └────────────────┘     └──────────────────┘
//!                                                     │
//!                                                     ▼
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ Environment  │◀────│ Replay Engine  │◀────│ Migration Record │
//! │ State        │     └────────────────┘     └──────────────────┘
//! └──────────────┘             │                      │
//!                              ▼                      ▼
//!                      ┌────────────────┐     ┌──────────────────┐
//!                      │ Database       │     │ Snapshot Store   │
//!                      └────────────────┘     └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_migrate::{MigrationConfig, MigrationEngine};
//!
//! async fn deploy(entities: &keel_schema::EntitySet) -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = MigrationEngine::new(MigrationConfig::from_file("keel.toml")?);
//!     engine.initialize().await?;
//!
//!     engine.create_snapshot(entities, "add users").await?;
//!
//!     let plan = engine.plan("staging").await?;
//!     println!("Plan: {}", plan.summary());
//!
//!     let mut conn = /* your SchemaConnection */;
//!     let result = engine.deploy("staging", &mut conn).await?;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Store Layout
//!
//! ```text
//! .keel/
//! ├── history.json
//! ├── versions/<hash>.json
//! ├── migrations/<toHash>.json
//! └── environments/<env>.json
//! ```

pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
mod fs;
pub mod lock;
pub mod record;
pub mod replay;
pub mod resolve;
pub mod sql;
pub mod state;
pub mod step;
pub mod store;

// Re-exports
pub use config::{EnvironmentConfig, MigrationConfig};
pub use diff::{MigrationDiff, diff, diff_tables, order_steps};
pub use engine::{DeployPlan, DeployResult, EngineStatus, EnvironmentStatus, MigrationEngine};
pub use error::{ConflictError, MigrateResult, MigrationError};
pub use lock::FileLock;
pub use record::{
    MigrationRecord, create_migration, deserialize_migration, migration_id, serialize_migration,
    validate_migration,
};
pub use replay::{ReplayEngine, SchemaConnection, replay_migrations, rollback_migrations};
pub use resolve::{MergedMigration, resolve, resolve_with};
pub use sql::{PostgresDialect, SqlDialect};
pub use state::{EnvironmentLock, EnvironmentState};
pub use step::{MigrationStep, PrimaryKeyChange, StepPhase, StepTarget};
pub use store::{History, Snapshot, SnapshotOutcome, SnapshotStore, StoredSnapshot, VersionEntry};
