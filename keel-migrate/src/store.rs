//! Content-addressed snapshot store.
//!
//! ```text
//! .keel/
//! ├── history.json            # ordered versions and the current hash
//! ├── versions/<hash>.json    # snapshot metadata, entities and tables
//! ├── migrations/<toHash>.json
//! └── environments/<env>.json
//! ```
//!
//! Snapshots are immutable and keyed by model hash. Each snapshot has at most
//! one parent, so the migration leading into a snapshot is keyed by its
//! `toHash`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_schema::{EntityDefinition, Model, Tables, canonicalize, model_hash};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MigrateResult, MigrationError};
use crate::fs::{read_optional, write_atomic};
use crate::lock::FileLock;
use crate::record::{MigrationRecord, deserialize_migration, serialize_migration};

/// Default wait for store and environment locks.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Model hash.
    pub hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub description: String,
    /// Snapshot this one was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Snapshot {
    /// Create snapshot metadata for a model hash.
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            created_at: Utc::now(),
            created_by: String::new(),
            description: String::new(),
            parent: None,
        }
    }

    /// Set the parent snapshot.
    pub fn parent(mut self, parent: Option<String>) -> Self {
        self.parent = parent;
        self
    }

    /// Set the author.
    pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A snapshot together with the model it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_mapping: Option<String>,
    pub entities: BTreeMap<String, EntityDefinition>,
    pub tables: Tables,
}

impl StoredSnapshot {
    /// The stored model.
    pub fn model(&self) -> Model {
        Model {
            hash: self.snapshot.hash.clone(),
            type_mapping: self.type_mapping.clone(),
            entities: self.entities.clone(),
            tables: self.tables.clone(),
        }
    }
}

/// One entry of `history.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Contents of `history.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    /// Versions in creation order.
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
    /// Hash of the latest snapshot.
    #[serde(default)]
    pub current: Option<String>,
}

impl History {
    /// Find a version.
    pub fn version(&self, hash: &str) -> Option<&VersionEntry> {
        self.versions.iter().find(|v| v.hash == hash)
    }
}

/// Outcome of creating a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// A new snapshot was stored.
    Created(Snapshot),
    /// A snapshot with this hash already existed; nothing was written.
    Unchanged(String),
}

impl SnapshotOutcome {
    /// Hash of the snapshot.
    pub fn hash(&self) -> &str {
        match self {
            Self::Created(snapshot) => &snapshot.hash,
            Self::Unchanged(hash) => hash,
        }
    }

    /// Whether anything was written.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// File-backed snapshot store.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    pub(crate) lock_timeout: Duration,
}

impl SnapshotStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set the lock wait.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    fn migrations_dir(&self) -> PathBuf {
        self.root.join("migrations")
    }

    pub(crate) fn environments_dir(&self) -> PathBuf {
        self.root.join("environments")
    }

    fn history_path(&self) -> PathBuf {
        self.root.join("history.json")
    }

    fn snapshot_path(&self, hash: &str) -> MigrateResult<PathBuf> {
        Ok(self.versions_dir().join(format!("{}.json", checked_hash(hash)?)))
    }

    fn migration_path(&self, to_hash: &str) -> MigrateResult<PathBuf> {
        Ok(self.migrations_dir().join(format!("{}.json", checked_hash(to_hash)?)))
    }

    async fn lock_store(&self) -> MigrateResult<FileLock> {
        FileLock::acquire(self.root.join("store.lock"), self.lock_timeout).await
    }

    /// Create the directory layout and an empty history.
    pub async fn initialize(&self) -> MigrateResult<()> {
        for dir in [self.versions_dir(), self.migrations_dir(), self.environments_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        let _lock = self.lock_store().await?;
        if read_optional(&self.history_path()).await?.is_none() {
            self.write_history(&History::default()).await?;
        }
        debug!(root = %self.root.display(), "initialized snapshot store");
        Ok(())
    }

    /// Whether a snapshot is stored.
    pub async fn snapshot_exists(&self, hash: &str) -> MigrateResult<bool> {
        Ok(tokio::fs::try_exists(self.snapshot_path(hash)?).await?)
    }

    /// Store a snapshot and record it in the history.
    ///
    /// Returns `false` without writing anything if the hash is already stored.
    pub async fn save_snapshot(&self, snapshot: &Snapshot, model: &Model) -> MigrateResult<bool> {
        if snapshot.hash != model.hash {
            return Err(MigrationError::invalid_migration(format!(
                "snapshot hash {} does not match model hash {}",
                snapshot.hash, model.hash
            )));
        }
        if self.snapshot_exists(&snapshot.hash).await? {
            debug!(hash = %snapshot.hash, "snapshot already stored");
            return Ok(false);
        }
        if let Some(parent) = &snapshot.parent {
            if !self.snapshot_exists(parent).await? {
                return Err(MigrationError::not_found(format!(
                    "parent snapshot {} of {}",
                    parent, snapshot.hash
                )));
            }
        }

        let stored = StoredSnapshot {
            snapshot: snapshot.clone(),
            type_mapping: model.type_mapping.clone(),
            entities: model.entities.clone(),
            tables: model.tables.clone(),
        };
        let mut bytes = serde_json::to_vec_pretty(&stored)?;
        bytes.push(b'\n');
        write_atomic(&self.snapshot_path(&snapshot.hash)?, &bytes).await?;

        self.record_version(snapshot).await?;
        info!(hash = %snapshot.hash, parent = ?snapshot.parent, "stored snapshot");
        Ok(true)
    }

    /// Load a snapshot, checking that its entities still hash to its name.
    pub async fn load_snapshot(&self, hash: &str) -> MigrateResult<StoredSnapshot> {
        let path = self.snapshot_path(hash)?;
        let Some(bytes) = read_optional(&path).await? else {
            return Err(MigrationError::not_found(format!("snapshot {}", hash)));
        };
        let stored: StoredSnapshot = serde_json::from_slice(&bytes)?;

        let entities = stored
            .entities
            .iter()
            .map(|(name, entity)| (name.clone(), entity.clone()))
            .collect();
        let actual = model_hash(&canonicalize(&entities)?, stored.type_mapping.as_deref());
        if actual != hash || stored.snapshot.hash != hash {
            return Err(MigrationError::invalid_migration(format!(
                "snapshot file {} holds content hashing to {}",
                path.display(),
                actual
            )));
        }
        Ok(stored)
    }

    /// Load the model for a hash. The empty model needs no stored snapshot.
    pub async fn load_model(&self, hash: &str) -> MigrateResult<Model> {
        let empty = Model::empty();
        if hash == empty.hash && !self.snapshot_exists(hash).await? {
            return Ok(empty);
        }
        Ok(self.load_snapshot(hash).await?.model())
    }

    /// Load `history.json`.
    pub async fn load_history(&self) -> MigrateResult<History> {
        match read_optional(&self.history_path()).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(History::default()),
        }
    }

    async fn write_history(&self, history: &History) -> MigrateResult<()> {
        let mut bytes = serde_json::to_vec_pretty(history)?;
        bytes.push(b'\n');
        write_atomic(&self.history_path(), &bytes).await
    }

    /// Add a version to the history (once) and make it current.
    pub async fn record_version(&self, snapshot: &Snapshot) -> MigrateResult<()> {
        let _lock = self.lock_store().await?;
        let mut history = self.load_history().await?;
        if history.version(&snapshot.hash).is_none() {
            history.versions.push(VersionEntry {
                hash: snapshot.hash.clone(),
                created_at: snapshot.created_at,
                description: snapshot.description.clone(),
                parent: snapshot.parent.clone(),
            });
        }
        history.current = Some(snapshot.hash.clone());
        self.write_history(&history).await
    }

    /// Store the migration leading into `record.to_hash`.
    ///
    /// Saving the same record again is a no-op; a different record for the
    /// same target is rejected.
    pub async fn save_migration(&self, record: &MigrationRecord) -> MigrateResult<()> {
        record.verify_id()?;
        let path = self.migration_path(&record.to_hash)?;
        if let Some(bytes) = read_optional(&path).await? {
            let existing = deserialize_migration(&bytes)?;
            if existing.id == record.id {
                return Ok(());
            }
            return Err(MigrationError::invalid_migration(format!(
                "snapshot {} already has migration {} (from {}), refusing {} (from {})",
                record.to_hash, existing.id, existing.from_hash, record.id, record.from_hash
            )));
        }
        write_atomic(&path, &serialize_migration(record)?).await?;
        debug!(id = %record.id, from = %record.from_hash, to = %record.to_hash, "stored migration");
        Ok(())
    }

    /// Load the migration leading into `to_hash`.
    pub async fn load_migration(&self, to_hash: &str) -> MigrateResult<MigrationRecord> {
        match read_optional(&self.migration_path(to_hash)?).await? {
            Some(bytes) => deserialize_migration(&bytes),
            None => Err(MigrationError::not_found(format!("migration into snapshot {}", to_hash))),
        }
    }

    /// `hash` followed by its parent, grandparent and so on up to the root.
    pub async fn ancestors(&self, hash: &str) -> MigrateResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut next = Some(hash.to_string());

        while let Some(current) = next {
            if !seen.insert(current.clone()) {
                return Err(MigrationError::invalid_migration(format!(
                    "snapshot parents form a cycle at {}",
                    current
                )));
            }
            let stored = self.load_snapshot(&current).await?;
            next = stored.snapshot.parent;
            chain.push(current);
        }
        Ok(chain)
    }

    /// Nearest snapshot both hashes descend from.
    pub async fn common_ancestor(&self, a: &str, b: &str) -> MigrateResult<Option<String>> {
        let of_a: BTreeSet<String> = self.ancestors(a).await?.into_iter().collect();
        Ok(self
            .ancestors(b)
            .await?
            .into_iter()
            .find(|hash| of_a.contains(hash)))
    }

    /// Migrations leading from `from` to `to`, oldest first.
    ///
    /// `from` must be an ancestor of `to`, or the empty model hash to start at
    /// the root of the tree.
    pub async fn migration_chain(&self, from: &str, to: &str) -> MigrateResult<Vec<MigrationRecord>> {
        if from == to {
            return Ok(Vec::new());
        }

        let empty = Model::empty().hash;
        let ancestors = if to == empty && !self.snapshot_exists(to).await? {
            vec![to.to_string()]
        } else {
            self.ancestors(to).await?
        };

        let mut chain = Vec::new();
        let mut reached = false;
        for hash in &ancestors {
            if hash == from {
                reached = true;
                break;
            }
            let record = self.load_migration(hash).await?;
            chain.push(record);
        }

        let root_reached = from == empty && chain.last().is_some_and(|r| r.from_hash == empty);
        if !reached && !root_reached {
            return Err(MigrationError::not_found(format!(
                "{} is not an ancestor of {}",
                from, to
            )));
        }

        chain.reverse();
        for pair in chain.windows(2) {
            if pair[0].to_hash != pair[1].from_hash {
                return Err(MigrationError::HashMismatch {
                    migration: pair[1].id.clone(),
                    expected: pair[0].to_hash.clone(),
                    actual: pair[1].from_hash.clone(),
                });
            }
        }
        Ok(chain)
    }
}

/// Hashes name files, so only plain hex is accepted.
fn checked_hash(hash: &str) -> MigrateResult<&str> {
    if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MigrationError::invalid_migration(format!(
            "`{}` is not a content hash",
            hash
        )));
    }
    Ok(hash)
}
