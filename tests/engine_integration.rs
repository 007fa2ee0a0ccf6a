//! Integration tests for the migration engine.
//!
//! Each test runs against a fresh store in a temporary directory and an
//! in-memory database.

mod common;

use common::{JsonDialect, MemoryConnection, blog, entities, users, users_with_name};
use keel::migrate::{
    EnvironmentConfig, MigrationConfig, MigrationEngine, MigrationError, SnapshotOutcome,
};
use keel::schema::build_model;
use pretty_assertions::assert_eq;

async fn engine(config: MigrationConfig) -> (tempfile::TempDir, MigrationEngine<JsonDialect>) {
    let dir = tempfile::tempdir().unwrap();
    let config = config.store_dir(dir.path().join(".keel")).lock_timeout_ms(200);
    let engine = MigrationEngine::with_dialect(config, JsonDialect);
    engine.initialize().await.expect("Failed to initialize store");
    (dir, engine)
}

/// Test that snapshotting an unchanged schema stores one snapshot
#[tokio::test]
async fn test_snapshot_idempotence() {
    let (dir, engine) = engine(MigrationConfig::new()).await;

    let first = engine.create_snapshot(&users(), "users").await.unwrap();
    let second = engine.create_snapshot(&users(), "users").await.unwrap();

    assert!(first.is_created());
    assert_eq!(second, SnapshotOutcome::Unchanged(first.hash().to_string()));

    let history = engine.store().load_history().await.unwrap();
    assert_eq!(history.versions.len(), 1);

    let stored = std::fs::read_dir(dir.path().join(".keel/versions")).unwrap().count();
    assert_eq!(stored, 1);
}

/// Test deploying a chain and checking the database against the model
#[tokio::test]
async fn test_deploy_matches_model() {
    let (_dir, engine) = engine(MigrationConfig::new()).await;
    for (set, description) in [(users(), "users"), (users_with_name(), "name"), (blog(), "posts")] {
        engine.create_snapshot(&set, description).await.unwrap();
    }

    let mut conn = MemoryConnection::new();
    let result = engine.deploy("staging", &mut conn).await.unwrap();
    assert_eq!(result.applied.len(), 3);
    assert_eq!(conn.commits, 3);

    let model = build_model(&blog()).unwrap();
    assert_eq!(result.to_hash, model.hash);
    assert_eq!(conn.introspect(), model.structure_hash().unwrap());

    let state = engine.store().get_state("staging").await.unwrap().unwrap();
    assert_eq!(state.current_snapshot_hash, model.hash);
}

/// Test that a failed deploy keeps every committed record
#[tokio::test]
async fn test_deploy_failure_keeps_progress() {
    let (_dir, engine) = engine(MigrationConfig::new()).await;
    engine.create_snapshot(&users(), "users").await.unwrap();
    let named = engine.create_snapshot(&users_with_name(), "name").await.unwrap();
    let head = engine.create_snapshot(&blog(), "posts").await.unwrap();

    let mut conn = MemoryConnection::new().failing_on("posts_authorId_fkey");
    let err = engine.deploy("qa", &mut conn).await.unwrap_err();
    assert!(matches!(err, MigrationError::ReplayFailed { .. }));
    assert_eq!(
        engine.store().get_current_snapshot("qa").await.unwrap().as_deref(),
        Some(named.hash())
    );
    assert_eq!(conn.commits, 2);

    conn.stop_failing();
    let result = engine.deploy("qa", &mut conn).await.unwrap();
    assert_eq!(result.from_hash, named.hash());
    assert_eq!(result.to_hash, head.hash());
    assert_eq!(result.applied.len(), 1);

    let plan = engine.plan_rollback("qa", named.hash()).await.unwrap();
    assert_eq!(plan.migrations.len(), 1);
    assert!(!plan.destructive_steps().is_empty());
}

/// Test the data loss guard and its per-environment override
#[tokio::test]
async fn test_data_loss_guard() {
    let config = MigrationConfig::new().environment(
        "dev",
        EnvironmentConfig {
            allow_data_loss: Some(true),
        },
    );
    let (_dir, engine) = engine(config).await;
    engine.create_snapshot(&users_with_name(), "name").await.unwrap();

    let mut prod = MemoryConnection::new();
    let mut dev = MemoryConnection::new();
    engine.deploy("prod", &mut prod).await.unwrap();
    engine.deploy("dev", &mut dev).await.unwrap();

    engine.create_snapshot(&users(), "drop name").await.unwrap();

    let err = engine.deploy("prod", &mut prod).await.unwrap_err();
    assert!(matches!(err, MigrationError::DataLoss(_)));
    assert!(prod.tables["users"].column("name").is_some());

    engine.deploy("dev", &mut dev).await.unwrap();
    assert!(dev.tables["users"].column("name").is_none());
}

/// Test merging two branches and deploying the merge
#[tokio::test]
async fn test_resolve_and_deploy_merge() {
    let (_dir, engine) = engine(MigrationConfig::new().allow_data_loss(true)).await;
    let base = engine.create_snapshot(&users(), "users").await.unwrap();
    let local = engine.create_snapshot(&users_with_name(), "name").await.unwrap();

    let mut conn = MemoryConnection::new();
    engine.deploy("dev", &mut conn).await.unwrap();

    let tags = entities(
        r#"{
            "User": {
                "table": "users",
                "fields": {
                    "id": { "type": "uuid", "primary": true },
                    "email": { "type": "string", "required": true, "unique": true }
                }
            },
            "Tag": {
                "table": "tags",
                "fields": {
                    "id": { "type": "integer", "primary": true, "generated": true },
                    "label": { "type": "string", "required": true, "unique": true }
                }
            }
        }"#,
    );
    let remote = engine
        .create_snapshot_from(Some(base.hash()), &tags, "tags")
        .await
        .unwrap();

    // The environment followed the local branch, so it has to step back to
    // the base before moving forward.
    let before = engine.plan("dev").await.unwrap();
    assert_eq!(before.from_hash, local.hash());
    assert_eq!(before.to_hash, remote.hash());
    assert_eq!(before.migrations.len(), 2);

    let merged = engine.resolve(local.hash(), remote.hash()).await.unwrap();
    assert_eq!(merged.record.from_hash, base.hash());
    assert!(merged.model.table("tags").is_some());
    assert!(merged.model.table("users").unwrap().column("name").is_some());

    let result = engine.deploy("dev", &mut conn).await.unwrap();
    assert_eq!(result.to_hash, merged.model.hash);
    assert_eq!(conn.introspect(), merged.model.structure_hash().unwrap());

    let status = engine.status().await.unwrap();
    assert_eq!(status.environments[0].pending, 0);
}

/// Test that conflicting branches are reported, not merged
#[tokio::test]
async fn test_resolve_conflict() {
    let (_dir, engine) = engine(MigrationConfig::new()).await;
    let base = engine.create_snapshot(&users(), "users").await.unwrap();
    let local = engine.create_snapshot(&users_with_name(), "name").await.unwrap();

    let mut text_name = users_with_name();
    text_name["User"].fields["name"].field_type = keel::schema::FieldType::Text;
    let remote = engine
        .create_snapshot_from(Some(base.hash()), &text_name, "text name")
        .await
        .unwrap();

    let err = engine.resolve(local.hash(), remote.hash()).await.unwrap_err();
    match err {
        MigrationError::Conflict(conflict) => {
            assert_eq!(conflict.table, "users");
            assert_eq!(conflict.column.as_deref(), Some("name"));
            assert_eq!(conflict.base_hash, base.hash());
        }
        other => panic!("unexpected error {other}"),
    }

    let history = engine.store().load_history().await.unwrap();
    assert_eq!(history.current.as_deref(), Some(remote.hash()));
}

/// Test that a held environment lock blocks a deploy
#[tokio::test]
async fn test_concurrent_deploy_is_refused() {
    let (_dir, engine) = engine(MigrationConfig::new()).await;
    engine.create_snapshot(&users(), "users").await.unwrap();

    let _held = engine.store().lock_environment("prod").await.unwrap();
    let mut conn = MemoryConnection::new();
    let err = engine.deploy("prod", &mut conn).await.unwrap_err();
    assert!(matches!(err, MigrationError::LockFailed(_)));
    assert!(err.is_recoverable());
    assert_eq!(conn.commits, 0);
}
