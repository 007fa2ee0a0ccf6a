//! # Keel
//!
//! Content-addressed schema models, deterministic diffs and replayable
//! migrations.
//!
//! Keel provides:
//! - A declarative entity schema with relations, hashed into a canonical model
//! - Deterministic, dependency-ordered diffs between any two models
//! - Versioned snapshots with per-environment state
//! - Transactional replay and rollback against an injected database connection
//! - Three-way merging of divergent migration branches
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let entities: EntitySet = serde_json::from_str(r#"{
//!         "User": {
//!             "table": "users",
//!             "fields": {
//!                 "id": { "type": "uuid", "primary": true, "generated": true },
//!                 "email": { "type": "string", "required": true, "unique": true }
//!             }
//!         }
//!     }"#)?;
//!
//!     let engine = MigrationEngine::new(MigrationConfig::from_file("keel.toml")?);
//!     engine.initialize().await?;
//!     engine.create_snapshot(&entities, "add users").await?;
//!
//!     println!("{}", engine.plan("production").await?.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Entity schema types and model building.
pub mod schema {
    pub use keel_schema::*;
}

/// Diffing, migration records, snapshots and replay.
pub mod migrate {
    pub use keel_migrate::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::migrate::{
        MigrationConfig, MigrationEngine, MigrationRecord, MigrationStep, SchemaConnection,
        SnapshotOutcome,
    };
    pub use crate::schema::{
        EntityDefinition, EntityField, EntitySet, FieldType, Model, RelationDefinition,
        build_model,
    };
}

// Re-export key types at the crate root
pub use migrate::{MigrateResult, MigrationError};
pub use schema::{Model, SchemaError};
