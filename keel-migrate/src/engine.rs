//! Migration engine.
//!
//! Wires the snapshot store, differ, replay engine and resolver into the
//! operations a command line front end runs: snapshot, plan, deploy,
//! rollback, resolve and status.

use std::time::Instant;

use keel_schema::{EntitySet, Model, ModelBuilder, structure_hash};
use tracing::{debug, info};

use crate::config::MigrationConfig;
use crate::diff::diff;
use crate::error::{MigrateResult, MigrationError};
use crate::record::{MigrationRecord, create_migration, validate_migration};
use crate::replay::{ReplayEngine, SchemaConnection};
use crate::resolve::{MergedMigration, resolve_with};
use crate::sql::{PostgresDialect, SqlDialect};
use crate::state::EnvironmentLock;
use crate::step::MigrationStep;
use crate::store::{Snapshot, SnapshotOutcome, SnapshotStore};

/// What a deploy or rollback would do.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployPlan {
    /// Environment being planned.
    pub environment: String,
    /// Environment's recorded hash, `None` if it was never deployed.
    pub current: Option<String>,
    /// Hash the run starts at.
    pub from_hash: String,
    /// Hash the run ends at.
    pub to_hash: String,
    /// Records in application order. Rollbacks appear as inverse records.
    pub migrations: Vec<MigrationRecord>,
    /// Rendered statements in execution order.
    pub statements: Vec<String>,
}

impl DeployPlan {
    /// Check if there's anything to apply.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Steps that can lose data, with the record they belong to.
    pub fn destructive_steps(&self) -> Vec<(&MigrationRecord, &MigrationStep)> {
        self.migrations
            .iter()
            .flat_map(|record| {
                record
                    .steps
                    .iter()
                    .filter(|step| step.is_destructive())
                    .map(move |step| (record, step))
            })
            .collect()
    }

    /// Get a summary of the plan.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "No changes to apply".to_string();
        }
        let mut parts = vec![format!(
            "{} pending migrations ({} statements)",
            self.migrations.len(),
            self.statements.len()
        )];
        let destructive = self.destructive_steps().len();
        if destructive > 0 {
            parts.push(format!("{} destructive steps", destructive));
        }
        parts.join("; ")
    }
}

/// Result of a deploy or rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub environment: String,
    pub from_hash: String,
    /// Hash the environment is at now.
    pub to_hash: String,
    /// IDs of applied records.
    pub applied: Vec<String>,
    /// Statements executed, or that would be executed in dry-run mode.
    pub statements: Vec<String>,
    pub dry_run: bool,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl DeployResult {
    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        if self.dry_run {
            return format!(
                "Dry run: {} statements for {} -> {}",
                self.statements.len(),
                self.from_hash,
                self.to_hash
            );
        }
        if self.applied.is_empty() {
            "No migrations applied".to_string()
        } else {
            format!("{} applied in {}ms", self.applied.len(), self.duration_ms)
        }
    }
}

/// Status of one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentStatus {
    pub environment: String,
    pub current_snapshot_hash: String,
    /// Records between the environment and the current snapshot.
    pub pending: usize,
}

/// Status of the store and its environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    /// Current snapshot, `None` before the first snapshot.
    pub current: Option<String>,
    /// Number of recorded versions.
    pub versions: usize,
    pub environments: Vec<EnvironmentStatus>,
}

impl EngineStatus {
    /// Get a summary of the status.
    pub fn summary(&self) -> String {
        let Some(current) = &self.current else {
            return "No snapshots".to_string();
        };
        let mut lines = vec![format!("{} snapshots, current {}", self.versions, current)];
        for env in &self.environments {
            if env.pending == 0 {
                lines.push(format!("{}: up to date", env.environment));
            } else {
                lines.push(format!("{}: {} pending", env.environment, env.pending));
            }
        }
        lines.join("\n")
    }
}

/// The main migration engine.
pub struct MigrationEngine<D: SqlDialect = PostgresDialect> {
    config: MigrationConfig,
    store: SnapshotStore,
    replay: ReplayEngine<D>,
    builder: ModelBuilder,
}

impl MigrationEngine<PostgresDialect> {
    /// Create a new migration engine for PostgreSQL.
    pub fn new(config: MigrationConfig) -> Self {
        Self::with_dialect(config, PostgresDialect)
    }
}

impl<D: SqlDialect> MigrationEngine<D> {
    /// Create a new migration engine with a dialect.
    pub fn with_dialect(config: MigrationConfig, dialect: D) -> Self {
        let store = SnapshotStore::new(&config.store_dir).with_lock_timeout(config.lock_timeout());
        Self {
            config,
            store,
            replay: ReplayEngine::with_dialect(dialect),
            builder: ModelBuilder::new(),
        }
    }

    /// Use a different model builder, e.g. for a custom type mapping.
    pub fn with_model_builder(mut self, builder: ModelBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// The named environment, or the configured default when none is given.
    pub fn environment<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        self.config.environment_or_default(name)
    }

    /// Get the configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Get the snapshot store.
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Initialize the snapshot store.
    pub async fn initialize(&self) -> MigrateResult<()> {
        self.store.initialize().await
    }

    /// Build a model with the engine's type mapping.
    pub fn build_model(&self, entities: &EntitySet) -> MigrateResult<Model> {
        Ok(self.builder.build(entities)?)
    }

    /// Model of the current snapshot, or the empty model.
    pub async fn current_model(&self) -> MigrateResult<Model> {
        match self.store.load_history().await?.current {
            Some(hash) => self.store.load_model(&hash).await,
            None => Ok(Model::empty()),
        }
    }

    /// Snapshot `entities` on top of the current snapshot.
    pub async fn create_snapshot(
        &self,
        entities: &EntitySet,
        description: impl Into<String>,
    ) -> MigrateResult<SnapshotOutcome> {
        let parent = self.store.load_history().await?.current;
        self.create_snapshot_from(parent.as_deref(), entities, description)
            .await
    }

    /// Snapshot `entities` on top of `parent`, or of the empty model when
    /// `parent` is `None`. Creating a snapshot that already exists changes
    /// nothing.
    pub async fn create_snapshot_from(
        &self,
        parent: Option<&str>,
        entities: &EntitySet,
        description: impl Into<String>,
    ) -> MigrateResult<SnapshotOutcome> {
        let model = self.build_model(entities)?;
        if self.store.snapshot_exists(&model.hash).await? {
            debug!(hash = %model.hash, "snapshot unchanged");
            return Ok(SnapshotOutcome::Unchanged(model.hash));
        }

        let parent_model = match parent {
            Some(hash) => self.store.load_model(hash).await?,
            None => Model::empty(),
        };
        let description = description.into();
        let record = create_migration(&parent_model, &model, &diff(&parent_model, &model))?
            .with_description(description.clone());
        self.store.save_migration(&record).await?;

        let snapshot = Snapshot::new(&model.hash)
            .parent(parent.map(str::to_string))
            .created_by(&self.config.created_by)
            .description(description);
        if !self.store.save_snapshot(&snapshot, &model).await? {
            return Ok(SnapshotOutcome::Unchanged(model.hash));
        }

        info!(
            hash = %model.hash,
            parent = ?parent,
            steps = record.steps.len(),
            "created snapshot"
        );
        Ok(SnapshotOutcome::Created(snapshot))
    }

    /// Records leading from `from` to `to`: inverses down to their common
    /// ancestor, then forward records up to `to`.
    async fn route(&self, from: &str, to: &str) -> MigrateResult<Vec<MigrationRecord>> {
        if from == to {
            return Ok(Vec::new());
        }
        let empty = Model::empty().hash;
        let base = if from == empty || to == empty {
            empty
        } else {
            self.store
                .common_ancestor(from, to)
                .await?
                .unwrap_or(empty)
        };

        let mut records = Vec::new();
        for record in self.store.migration_chain(&base, from).await?.iter().rev() {
            records.push(record.inverse()?);
        }
        records.extend(self.store.migration_chain(&base, to).await?);
        Ok(records)
    }

    fn plan_route(
        &self,
        environment: &str,
        current: Option<String>,
        to: String,
        records: Vec<MigrationRecord>,
    ) -> DeployPlan {
        let from_hash = current.clone().unwrap_or_else(|| Model::empty().hash);
        let statements = records
            .iter()
            .flat_map(|record| self.replay.statements(record))
            .collect();
        DeployPlan {
            environment: environment.to_string(),
            current,
            from_hash,
            to_hash: to,
            migrations: records,
            statements,
        }
    }

    /// Plan bringing `environment` to the current snapshot.
    pub async fn plan(&self, environment: &str) -> MigrateResult<DeployPlan> {
        let current = self.store.get_current_snapshot(environment).await?;
        let from = current.clone().unwrap_or_else(|| Model::empty().hash);
        let Some(target) = self.store.load_history().await?.current else {
            return Ok(self.plan_route(environment, current, from, Vec::new()));
        };
        let records = self.route(&from, &target).await?;
        Ok(self.plan_route(environment, current, target, records))
    }

    /// Plan moving `environment` back to `target`, which must be an ancestor
    /// of (or equal to) its current snapshot.
    pub async fn plan_rollback(&self, environment: &str, target: &str) -> MigrateResult<DeployPlan> {
        let Some(current) = self.store.get_current_snapshot(environment).await? else {
            return Err(MigrationError::not_found(format!(
                "deployed snapshot for environment '{}'",
                environment
            )));
        };
        let mut records = Vec::new();
        for record in self.store.migration_chain(target, &current).await?.iter().rev() {
            records.push(record.inverse()?);
        }
        Ok(self.plan_route(environment, Some(current), target.to_string(), records))
    }

    /// Bring `environment` to the current snapshot.
    pub async fn deploy<C>(&self, environment: &str, conn: &mut C) -> MigrateResult<DeployResult>
    where
        C: SchemaConnection + ?Sized,
    {
        let lock = self.store.lock_environment(environment).await?;
        let plan = self.plan(environment).await?;
        self.execute(&lock, conn, plan).await
    }

    /// Move `environment` back to `target`.
    pub async fn rollback<C>(
        &self,
        environment: &str,
        conn: &mut C,
        target: &str,
    ) -> MigrateResult<DeployResult>
    where
        C: SchemaConnection + ?Sized,
    {
        let lock = self.store.lock_environment(environment).await?;
        let plan = self.plan_rollback(environment, target).await?;
        self.execute(&lock, conn, plan).await
    }

    /// Undo the last migration applied to `environment`.
    pub async fn rollback_last<C>(&self, environment: &str, conn: &mut C) -> MigrateResult<DeployResult>
    where
        C: SchemaConnection + ?Sized,
    {
        let lock = self.store.lock_environment(environment).await?;
        let Some(current) = self.store.get_current_snapshot(environment).await? else {
            return Err(MigrationError::not_found(format!(
                "deployed snapshot for environment '{}'",
                environment
            )));
        };
        let target = self.store.load_migration(&current).await?.from_hash;
        let plan = self.plan_rollback(environment, &target).await?;
        self.execute(&lock, conn, plan).await
    }

    /// Re-validate every record of a plan against the stored models.
    async fn verify(&self, plan: &DeployPlan) -> MigrateResult<()> {
        for record in &plan.migrations {
            let from = self.store.load_model(&record.from_hash).await?;
            let tables = validate_migration(record, &from.hash, &from.tables)?;
            let to = self.store.load_model(&record.to_hash).await?;
            let actual = structure_hash(&tables)?;
            if actual != to.structure_hash()? {
                return Err(MigrationError::invalid_migration(format!(
                    "migration {} ({} -> {}) does not reproduce snapshot {}",
                    record.id, record.from_hash, record.to_hash, record.to_hash
                )));
            }
        }
        Ok(())
    }

    async fn execute<C>(
        &self,
        lock: &EnvironmentLock,
        conn: &mut C,
        plan: DeployPlan,
    ) -> MigrateResult<DeployResult>
    where
        C: SchemaConnection + ?Sized,
    {
        let started = Instant::now();
        let environment = lock.environment();

        if self.config.verify_steps {
            self.verify(&plan).await?;
        }

        let destructive = plan.destructive_steps();
        if !destructive.is_empty() && !self.config.allow_data_loss_for(environment) {
            let steps: Vec<String> = destructive.iter().map(|(_, step)| step.to_string()).collect();
            return Err(MigrationError::data_loss(format!(
                "moving '{}' from {} to {} would run destructive steps: {}. Set allow_data_loss=true to proceed.",
                environment,
                plan.from_hash,
                plan.to_hash,
                steps.join(", ")
            )));
        }

        if self.config.dry_run {
            debug!(environment = %environment, statements = plan.statements.len(), "dry run");
            return Ok(DeployResult {
                environment: environment.to_string(),
                from_hash: plan.from_hash.clone(),
                to_hash: plan.to_hash,
                applied: Vec::new(),
                statements: plan.statements,
                dry_run: true,
                duration_ms: 0,
            });
        }

        let mut expected = plan.current.clone();
        let mut current = plan.from_hash.clone();
        let mut applied = Vec::with_capacity(plan.migrations.len());
        for record in &plan.migrations {
            current = self.replay.apply(conn, record, &current).await?;
            self.store
                .update_state_locked(lock, expected.as_deref(), &current)
                .await?;
            expected = Some(current.clone());
            applied.push(record.id.clone());
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            environment = %environment,
            from = %plan.from_hash,
            to = %current,
            applied = applied.len(),
            duration_ms,
            "deployed"
        );

        Ok(DeployResult {
            environment: environment.to_string(),
            from_hash: plan.from_hash,
            to_hash: current,
            applied,
            statements: plan.statements,
            dry_run: false,
            duration_ms,
        })
    }

    /// Merge two snapshots into a new one whose parent is their common
    /// ancestor. The merged snapshot becomes current.
    pub async fn resolve(&self, local: &str, remote: &str) -> MigrateResult<MergedMigration> {
        let base_hash = self.store.common_ancestor(local, remote).await?;
        let base = match &base_hash {
            Some(hash) => self.store.load_model(hash).await?,
            None => Model::empty(),
        };
        let local_model = self.store.load_model(local).await?;
        let remote_model = self.store.load_model(remote).await?;

        let merged = resolve_with(&self.builder, &base, &local_model, &remote_model)?;

        if self.store.snapshot_exists(&merged.model.hash).await? {
            let existing = self.store.load_snapshot(&merged.model.hash).await?;
            self.store.record_version(&existing.snapshot).await?;
            debug!(hash = %merged.model.hash, "merge result already stored");
            return Ok(merged);
        }

        self.store.save_migration(&merged.record).await?;
        let snapshot = Snapshot::new(&merged.model.hash)
            .parent(base_hash)
            .created_by(&self.config.created_by)
            .description(merged.record.description.clone());
        self.store.save_snapshot(&snapshot, &merged.model).await?;
        Ok(merged)
    }

    /// Current snapshot and how far behind each environment is.
    pub async fn status(&self) -> MigrateResult<EngineStatus> {
        let history = self.store.load_history().await?;
        let mut deployed: Vec<(String, String)> = self
            .store
            .environments()
            .await?
            .into_iter()
            .map(|state| (state.environment, state.current_snapshot_hash))
            .collect();
        // The default environment is listed even before its first deploy.
        let default = &self.config.default_environment;
        if !deployed.iter().any(|(name, _)| name == default) {
            deployed.push((default.clone(), Model::empty().hash));
        }

        let mut environments = Vec::new();
        for (environment, current_snapshot_hash) in deployed {
            let pending = match &history.current {
                Some(target) => self.route(&current_snapshot_hash, target).await?.len(),
                None => 0,
            };
            environments.push(EnvironmentStatus {
                environment,
                current_snapshot_hash,
                pending,
            });
        }
        Ok(EngineStatus {
            current: history.current,
            versions: history.versions.len(),
            environments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentConfig;
    use async_trait::async_trait;
    use keel_schema::{EntityDefinition, EntityField, FieldType};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        committed: Vec<String>,
        pending: Vec<String>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl SchemaConnection for Recorder {
        async fn begin(&mut self) -> MigrateResult<()> {
            Ok(())
        }

        async fn execute(&mut self, statement: &str) -> MigrateResult<()> {
            if self.fail_on.as_deref().is_some_and(|needle| statement.contains(needle)) {
                return Err(MigrationError::database(format!("cannot run {}", statement)));
            }
            self.pending.push(statement.to_string());
            Ok(())
        }

        async fn commit(&mut self) -> MigrateResult<()> {
            self.committed.append(&mut self.pending);
            Ok(())
        }

        async fn rollback(&mut self) -> MigrateResult<()> {
            self.pending.clear();
            Ok(())
        }
    }

    fn users() -> EntitySet {
        let mut set = EntitySet::new();
        set.insert(
            "User".into(),
            EntityDefinition::new("users")
                .field("id", EntityField::new(FieldType::Uuid).primary().generated())
                .field("email", EntityField::new(FieldType::String).required().unique()),
        );
        set
    }

    fn users_with_name() -> EntitySet {
        let mut set = users();
        set["User"]
            .fields
            .insert("name".into(), EntityField::new(FieldType::String));
        set
    }

    async fn engine(config: MigrationConfig) -> (tempfile::TempDir, MigrationEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = MigrationEngine::new(config.store_dir(dir.path().join(".keel")));
        engine.initialize().await.unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_create_snapshot_is_idempotent() {
        let (_dir, engine) = engine(MigrationConfig::new().created_by("tests")).await;

        let first = engine.create_snapshot(&users(), "users").await.unwrap();
        let SnapshotOutcome::Created(snapshot) = &first else {
            panic!("expected a new snapshot");
        };
        assert_eq!(snapshot.parent, None);
        assert_eq!(snapshot.created_by, "tests");

        let again = engine.create_snapshot(&users(), "users again").await.unwrap();
        assert_eq!(again, SnapshotOutcome::Unchanged(first.hash().to_string()));

        let second = engine.create_snapshot(&users_with_name(), "name").await.unwrap();
        let SnapshotOutcome::Created(snapshot) = &second else {
            panic!("expected a new snapshot");
        };
        assert_eq!(snapshot.parent.as_deref(), Some(first.hash()));

        let record = engine.store().load_migration(second.hash()).await.unwrap();
        assert_eq!(record.from_hash, first.hash());
        assert_eq!(record.steps.len(), 1);
        assert_eq!(engine.current_model().await.unwrap().hash, second.hash());
    }

    #[tokio::test]
    async fn test_plan_and_deploy() {
        let (_dir, engine) = engine(MigrationConfig::new()).await;
        engine.create_snapshot(&users(), "users").await.unwrap();
        let head = engine.create_snapshot(&users_with_name(), "name").await.unwrap();

        let plan = engine.plan("staging").await.unwrap();
        assert_eq!(plan.current, None);
        assert_eq!(plan.from_hash, Model::empty().hash);
        assert_eq!(plan.migrations.len(), 2);
        assert!(plan.summary().starts_with("2 pending migrations"));

        let mut conn = Recorder::default();
        let result = engine.deploy("staging", &mut conn).await.unwrap();
        assert_eq!(result.to_hash, head.hash());
        assert_eq!(result.applied.len(), 2);
        assert_eq!(conn.committed, plan.statements);
        assert_eq!(
            engine.store().get_current_snapshot("staging").await.unwrap().as_deref(),
            Some(head.hash())
        );

        let again = engine.deploy("staging", &mut conn).await.unwrap();
        assert_eq!(again.summary(), "No migrations applied");
    }

    #[tokio::test]
    async fn test_deploy_stops_at_failed_record() {
        let (_dir, engine) = engine(MigrationConfig::new()).await;
        let first = engine.create_snapshot(&users(), "users").await.unwrap();
        engine.create_snapshot(&users_with_name(), "name").await.unwrap();

        let mut conn = Recorder {
            fail_on: Some("ADD COLUMN".to_string()),
            ..Default::default()
        };
        let err = engine.deploy("qa", &mut conn).await.unwrap_err();
        assert!(matches!(err, MigrationError::ReplayFailed { step_index: Some(0), .. }));
        assert_eq!(
            engine.store().get_current_snapshot("qa").await.unwrap().as_deref(),
            Some(first.hash())
        );
    }

    #[tokio::test]
    async fn test_destructive_steps_need_permission() {
        let config = MigrationConfig::new().environment(
            "development",
            EnvironmentConfig {
                allow_data_loss: Some(true),
            },
        );
        let (_dir, engine) = engine(config).await;
        engine.create_snapshot(&users_with_name(), "with name").await.unwrap();
        let mut conn = Recorder::default();
        engine.deploy("production", &mut conn).await.unwrap();
        engine.deploy("development", &mut conn).await.unwrap();

        engine.create_snapshot(&users(), "drop name").await.unwrap();

        let err = engine.deploy("production", &mut conn).await.unwrap_err();
        assert!(matches!(err, MigrationError::DataLoss(ref msg) if msg.contains("DropColumn users.name")));

        let result = engine.deploy("development", &mut conn).await.unwrap();
        assert_eq!(result.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let (_dir, engine) = engine(MigrationConfig::new().dry_run(true)).await;
        engine.create_snapshot(&users(), "users").await.unwrap();

        let mut conn = Recorder::default();
        let result = engine.deploy("dev", &mut conn).await.unwrap();
        assert!(result.dry_run);
        assert!(!result.statements.is_empty());
        assert!(conn.committed.is_empty());
        assert!(engine.store().get_state("dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_last() {
        let (_dir, engine) = engine(MigrationConfig::new().allow_data_loss(true)).await;
        let first = engine.create_snapshot(&users(), "users").await.unwrap();
        engine.create_snapshot(&users_with_name(), "name").await.unwrap();

        let mut conn = Recorder::default();
        engine.deploy("dev", &mut conn).await.unwrap();
        conn.committed.clear();

        let result = engine.rollback_last("dev", &mut conn).await.unwrap();
        assert_eq!(result.to_hash, first.hash());
        assert_eq!(
            conn.committed,
            vec!["ALTER TABLE \"users\" DROP COLUMN \"name\";"]
        );

        let empty = Model::empty().hash;
        let result = engine.rollback("dev", &mut conn, &empty).await.unwrap();
        assert_eq!(result.to_hash, empty);
        assert_eq!(
            engine.store().get_current_snapshot("dev").await.unwrap(),
            Some(empty)
        );
    }

    #[tokio::test]
    async fn test_resolve_branches() {
        let (_dir, engine) = engine(MigrationConfig::new()).await;
        let base = engine.create_snapshot(&users(), "users").await.unwrap();
        let local = engine.create_snapshot(&users_with_name(), "name").await.unwrap();

        let mut remote_set = users();
        remote_set.insert(
            "Tag".into(),
            EntityDefinition::new("tags").field("id", EntityField::new(FieldType::Integer).primary()),
        );
        let remote = engine
            .create_snapshot_from(Some(base.hash()), &remote_set, "tags")
            .await
            .unwrap();

        let merged = engine.resolve(local.hash(), remote.hash()).await.unwrap();
        assert_eq!(merged.record.from_hash, base.hash());

        let stored = engine.store().load_snapshot(&merged.model.hash).await.unwrap();
        assert_eq!(stored.snapshot.parent.as_deref(), Some(base.hash()));
        assert_eq!(
            engine.store().load_history().await.unwrap().current,
            Some(merged.model.hash.clone())
        );

        let status = engine.status().await.unwrap();
        assert_eq!(status.versions, 4);
        assert_eq!(status.current, Some(merged.model.hash));
    }

    #[tokio::test]
    async fn test_status_counts_pending() {
        let (_dir, engine) = engine(MigrationConfig::new().default_environment("dev")).await;
        assert_eq!(engine.status().await.unwrap().summary(), "No snapshots");

        engine.create_snapshot(&users(), "users").await.unwrap();
        let mut conn = Recorder::default();
        engine.deploy("dev", &mut conn).await.unwrap();
        engine.create_snapshot(&users_with_name(), "name").await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(
            status.environments,
            vec![EnvironmentStatus {
                environment: "dev".to_string(),
                current_snapshot_hash: status.environments[0].current_snapshot_hash.clone(),
                pending: 1,
            }]
        );
        assert!(status.summary().ends_with("dev: 1 pending"));
    }

    #[tokio::test]
    async fn test_default_environment_fallback() {
        let (_dir, engine) = engine(MigrationConfig::new().default_environment("staging")).await;
        engine.create_snapshot(&users(), "users").await.unwrap();
        engine.create_snapshot(&users_with_name(), "name").await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.environments.len(), 1);
        assert_eq!(status.environments[0].environment, "staging");
        assert_eq!(status.environments[0].current_snapshot_hash, Model::empty().hash);
        assert_eq!(status.environments[0].pending, 2);

        let environment = engine.environment(None);
        assert_eq!(environment, "staging");
        let mut conn = Recorder::default();
        let result = engine.deploy(environment, &mut conn).await.unwrap();
        assert_eq!(result.applied.len(), 2);
        assert_eq!(engine.environment(Some("prod")), "prod");

        let status = engine.status().await.unwrap();
        assert_eq!(status.environments.len(), 1);
        assert_eq!(status.environments[0].pending, 0);
    }
}
