//! Exclusive lock files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{MigrateResult, MigrationError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A lock held by creating a file exclusively. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock, waiting at most `timeout` for a current holder.
    pub async fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> MigrateResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let owner = format!("pid={}\n", std::process::id());
                    file.write_all(owner.as_bytes()).await?;
                    debug!(path = %path.display(), "acquired lock");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(MigrationError::lock_failed(format!(
                            "{} is held by another process (waited {}ms)",
                            path.display(),
                            timeout.as_millis()
                        )));
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
