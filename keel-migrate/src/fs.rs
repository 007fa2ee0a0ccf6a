//! File helpers for the store.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;

use crate::error::{MigrateResult, MigrationError};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a synced temp file and a rename, so readers
/// see either the old content or the new content.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> MigrateResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| MigrationError::invalid_migration(format!("{} has no parent directory", path.display())))?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MigrationError::invalid_migration(format!("{} is not a valid file name", path.display())))?;

    tokio::fs::create_dir_all(parent).await?;

    let nonce = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp = parent.join(format!(".{}.{}.{}.tmp", name, std::process::id(), nonce));

    let written = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(err.into());
    }

    sync_dir(parent).await;
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = tokio::fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

/// Read a file, mapping a missing file to `None`.
pub(crate) async fn read_optional(path: &Path) -> MigrateResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two");
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_read_optional_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("missing")).await.unwrap().is_none());
    }
}
