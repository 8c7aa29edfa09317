//! Creation and teardown of per-bucket directory trees.

use super::{FileStore, StorageResult};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, info};

impl FileStore {
    /// Create the service-wide files and chunk directories. Safe to repeat.
    pub async fn ensure_bucket_root(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.files_root).await?;
        fs::create_dir_all(&self.chunks_root).await?;
        Ok(())
    }

    /// Create the root directory for a single bucket.
    pub async fn ensure_bucket_dir(&self, bucket_id: &str) -> StorageResult<PathBuf> {
        let root = self.bucket_root(bucket_id)?;
        fs::create_dir_all(&root).await?;
        Ok(root)
    }

    /// Recursively remove a bucket's live files, versions and caches.
    ///
    /// A missing directory is not an error.
    pub async fn delete_bucket_dir(&self, bucket_id: &str) -> StorageResult<()> {
        let root = self.bucket_root(bucket_id)?;
        match fs::remove_dir_all(&root).await {
            Ok(()) => {
                info!(bucket = bucket_id, "removed bucket directory");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Recursively remove empty directories from `start` up to (not including) `stop`.
///
/// Stops at the first directory that is missing, not empty, or fails to delete.
pub(crate) async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(()) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}
