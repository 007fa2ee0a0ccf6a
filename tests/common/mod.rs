//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use keel::migrate::{MigrateResult, MigrationError, MigrationStep, SchemaConnection, SqlDialect};
use keel::schema::{EntitySet, Tables, structure_hash};

/// Renders each step as its JSON form so [`MemoryConnection`] can apply it.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDialect;

impl SqlDialect for JsonDialect {
    fn name(&self) -> &'static str {
        "json"
    }

    fn render(&self, step: &MigrationStep) -> Vec<String> {
        vec![serde_json::to_string(step).expect("step serializes")]
    }
}

/// An in-memory database whose schema is a table set.
///
/// Statements must come from [`JsonDialect`]. Changes are staged per
/// transaction and only become visible on commit.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    pub tables: Tables,
    staged: Option<Tables>,
    pub executed: Vec<String>,
    pub commits: usize,
    pub rollbacks: usize,
    fail_on: Option<String>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any statement containing `needle`.
    pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    pub fn stop_failing(&mut self) {
        self.fail_on = None;
    }

    /// Structure hash of the committed schema.
    pub fn introspect(&self) -> String {
        structure_hash(&self.tables).expect("tables encode")
    }
}

#[async_trait]
impl SchemaConnection for MemoryConnection {
    async fn begin(&mut self) -> MigrateResult<()> {
        if self.staged.is_some() {
            return Err(MigrationError::database("transaction already open"));
        }
        self.staged = Some(self.tables.clone());
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> MigrateResult<()> {
        let Some(staged) = self.staged.as_mut() else {
            return Err(MigrationError::database("no open transaction"));
        };
        if self.fail_on.as_deref().is_some_and(|needle| statement.contains(needle)) {
            return Err(MigrationError::database(format!("injected failure: {}", statement)));
        }
        let step: MigrationStep = serde_json::from_str(statement)?;
        step.apply_to(staged).map_err(MigrationError::database)?;
        self.executed.push(statement.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> MigrateResult<()> {
        let Some(staged) = self.staged.take() else {
            return Err(MigrationError::database("no open transaction"));
        };
        self.tables = staged;
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> MigrateResult<()> {
        self.staged = None;
        self.rollbacks += 1;
        Ok(())
    }
}

/// Parse an entity set from JSON.
pub fn entities(json: &str) -> EntitySet {
    serde_json::from_str(json).expect("valid entity json")
}

pub fn users() -> EntitySet {
    entities(
        r#"{
            "User": {
                "table": "users",
                "fields": {
                    "id": { "type": "uuid", "primary": true },
                    "email": { "type": "string", "required": true, "unique": true }
                }
            }
        }"#,
    )
}

pub fn users_with_name() -> EntitySet {
    entities(
        r#"{
            "User": {
                "table": "users",
                "fields": {
                    "id": { "type": "uuid", "primary": true },
                    "email": { "type": "string", "required": true, "unique": true },
                    "name": { "type": "string" }
                }
            }
        }"#,
    )
}

pub fn blog() -> EntitySet {
    entities(
        r#"{
            "User": {
                "table": "users",
                "fields": {
                    "id": { "type": "uuid", "primary": true, "generated": true },
                    "email": { "type": "string", "required": true, "unique": true },
                    "name": { "type": "string" }
                }
            },
            "Post": {
                "table": "posts",
                "fields": {
                    "id": { "type": "integer", "primary": true, "generated": true },
                    "title": { "type": "string", "required": true, "max": 120 },
                    "publishedAt": { "type": "timestamp", "default": "now" }
                },
                "indexes": [{ "fields": ["title", "publishedAt"] }],
                "relations": {
                    "author": { "type": "belongsTo", "target": "User", "required": true, "onDelete": "cascade" }
                }
            }
        }"#,
    )
}
