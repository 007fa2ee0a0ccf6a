//! Environment state.
//!
//! Each environment has one file under `environments/` naming the snapshot
//! its live schema is at. Updates are compare-and-swap under an exclusive
//! per-environment lock file and are written atomically.

use chrono::{DateTime, Utc};
use keel_schema::Model;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MigrateResult, MigrationError};
use crate::fs::{read_optional, write_atomic};
use crate::lock::FileLock;
use crate::store::SnapshotStore;

/// Where an environment's live schema is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub environment: String,
    pub current_snapshot_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// Exclusive hold on one environment.
#[derive(Debug)]
pub struct EnvironmentLock {
    environment: String,
    _lock: FileLock,
}

impl EnvironmentLock {
    /// Locked environment.
    pub fn environment(&self) -> &str {
        &self.environment
    }
}

impl SnapshotStore {
    fn state_path(&self, environment: &str) -> std::path::PathBuf {
        self.environments_dir()
            .join(format!("{}.json", encode_environment(environment)))
    }

    /// Current snapshot hash of an environment, if it has been deployed.
    pub async fn get_current_snapshot(&self, environment: &str) -> MigrateResult<Option<String>> {
        Ok(self
            .get_state(environment)
            .await?
            .map(|state| state.current_snapshot_hash))
    }

    /// Full state record of an environment.
    pub async fn get_state(&self, environment: &str) -> MigrateResult<Option<EnvironmentState>> {
        match read_optional(&self.state_path(environment)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Take the environment lock, waiting up to the configured timeout.
    pub async fn lock_environment(&self, environment: &str) -> MigrateResult<EnvironmentLock> {
        if environment.is_empty() {
            return Err(MigrationError::config("environment name must not be empty"));
        }
        let path = self
            .environments_dir()
            .join(format!("{}.lock", encode_environment(environment)));
        let lock = FileLock::acquire(path, self.lock_timeout).await?;
        Ok(EnvironmentLock {
            environment: environment.to_string(),
            _lock: lock,
        })
    }

    /// Move an environment from `expected` to `new`.
    ///
    /// `expected` is the hash the caller last read (`None` for a fresh
    /// environment). Fails with [`MigrationError::StateConflict`] if the
    /// environment moved in between, and with [`MigrationError::NotFound`] if
    /// `new` has no stored snapshot.
    pub async fn update_state(
        &self,
        environment: &str,
        expected: Option<&str>,
        new: &str,
    ) -> MigrateResult<EnvironmentState> {
        let lock = self.lock_environment(environment).await?;
        self.update_state_locked(&lock, expected, new).await
    }

    /// [`update_state`](Self::update_state) for a caller already holding the lock.
    pub async fn update_state_locked(
        &self,
        lock: &EnvironmentLock,
        expected: Option<&str>,
        new: &str,
    ) -> MigrateResult<EnvironmentState> {
        let environment = lock.environment();
        let actual = self.get_current_snapshot(environment).await?;
        if actual.as_deref() != expected {
            return Err(MigrationError::StateConflict {
                environment: environment.to_string(),
                expected: expected.map(str::to_string),
                actual,
            });
        }

        let is_empty_model = new == Model::empty().hash;
        if !is_empty_model && !self.snapshot_exists(new).await? {
            return Err(MigrationError::not_found(format!(
                "snapshot {} for environment '{}'",
                new, environment
            )));
        }

        let state = EnvironmentState {
            environment: environment.to_string(),
            current_snapshot_hash: new.to_string(),
            updated_at: Utc::now(),
        };
        let mut bytes = serde_json::to_vec_pretty(&state)?;
        bytes.push(b'\n');
        write_atomic(&self.state_path(environment), &bytes).await?;

        info!(environment = %environment, from = ?expected, to = %new, "updated environment state");
        Ok(state)
    }

    /// All environments with a recorded state, by name.
    pub async fn environments(&self) -> MigrateResult<Vec<EnvironmentState>> {
        let dir = self.environments_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(encoded) = name.strip_suffix(".json") else {
                continue;
            };
            if encoded.starts_with('.') {
                continue;
            }
            let Some(environment) = decode_environment(encoded) else {
                continue;
            };
            if let Some(state) = self.get_state(&environment).await? {
                states.push(state);
            }
        }
        states.sort_by(|a, b| a.environment.cmp(&b.environment));
        Ok(states)
    }
}

/// Encode an environment name as a file stem. Bytes other than ASCII
/// alphanumerics, `-` and `_` become `%XX`.
pub fn encode_environment(environment: &str) -> String {
    let mut out = String::with_capacity(environment.len());
    for byte in environment.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Inverse of [`encode_environment`].
pub fn decode_environment(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Snapshot;
    use keel_schema::{EntityDefinition, EntityField, EntitySet, FieldType, build_model};

    fn model() -> Model {
        let mut set = EntitySet::new();
        set.insert(
            "User".into(),
            EntityDefinition::new("users").field("id", EntityField::new(FieldType::Uuid).primary()),
        );
        build_model(&set).unwrap()
    }

    async fn store_with_snapshot() -> (tempfile::TempDir, SnapshotStore, Model) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join(".keel"));
        store.initialize().await.unwrap();
        let model = model();
        store.save_snapshot(&Snapshot::new(&model.hash), &model).await.unwrap();
        (dir, store, model)
    }

    #[tokio::test]
    async fn test_update_and_read_state() {
        let (_dir, store, model) = store_with_snapshot().await;
        assert!(store.get_current_snapshot("staging").await.unwrap().is_none());

        let state = store.update_state("staging", None, &model.hash).await.unwrap();
        assert_eq!(state.current_snapshot_hash, model.hash);
        assert_eq!(
            store.get_current_snapshot("staging").await.unwrap(),
            Some(model.hash.clone())
        );
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (_dir, store, model) = store_with_snapshot().await;
        store.update_state("production", None, &model.hash).await.unwrap();

        let err = store.update_state("production", None, &model.hash).await.unwrap_err();
        match err {
            MigrationError::StateConflict { expected, actual, .. } => {
                assert_eq!(expected, None);
                assert_eq!(actual, Some(model.hash.clone()));
            }
            other => panic!("unexpected error {other}"),
        }

        let empty = Model::empty().hash;
        store
            .update_state("production", Some(&model.hash), &empty)
            .await
            .unwrap();
        assert_eq!(store.get_current_snapshot("production").await.unwrap(), Some(empty));
    }

    #[tokio::test]
    async fn test_refuses_unknown_snapshot() {
        let (_dir, store, _model) = store_with_snapshot().await;
        let err = store.update_state("dev", None, "abcdef").await.unwrap_err();
        assert!(matches!(err, MigrationError::NotFound(_)));
        assert!(store.get_state("dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_blocks_concurrent_update() {
        let (_dir, store, model) = store_with_snapshot().await;
        let store = store.with_lock_timeout(std::time::Duration::from_millis(60));

        let held = store.lock_environment("qa").await.unwrap();
        let err = store.update_state("qa", None, &model.hash).await.unwrap_err();
        assert!(matches!(err, MigrationError::LockFailed(_)));

        store.update_state_locked(&held, None, &model.hash).await.unwrap();
    }

    #[tokio::test]
    async fn test_environment_names_are_encoded() {
        let (_dir, store, model) = store_with_snapshot().await;
        store.update_state("feature/login", None, &model.hash).await.unwrap();
        store.update_state("dev", None, &model.hash).await.unwrap();

        let names: Vec<String> = store
            .environments()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.environment)
            .collect();
        assert_eq!(names, vec!["dev", "feature/login"]);
        assert!(store.root().join("environments/feature%2Flogin.json").exists());
    }

    #[test]
    fn test_encode_round_trip() {
        for name in ["production", "a.b", "..", "ünïcode", "x%y"] {
            assert_eq!(decode_environment(&encode_environment(name)).as_deref(), Some(name));
        }
        assert_eq!(encode_environment(".."), "%2E%2E");
    }
}
