//! Snapshotting the live file before it is overwritten.
//!
//! Callers must archive before writing the new content for the same
//! `(bucket, path)`; nothing here enforces that order.

use super::{
    FileStore, StorageResult,
    writer::{COPY_BUFFER_SIZE, write_atomic},
};
use std::io::ErrorKind;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::debug;

impl FileStore {
    /// Copy the live file at `(bucket_id, path)` to `.versions/<path>.v<version>`.
    ///
    /// Returns `false` without creating anything when there is no live file.
    pub async fn archive(&self, bucket_id: &str, path: &str, version: i64) -> StorageResult<bool> {
        let live = self.object_path(bucket_id, path)?;
        let archived = self.version_path(bucket_id, path, version)?;

        let source = match fs::metadata(&live).await {
            Ok(meta) if meta.is_file() => match File::open(&live).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
                Err(err) => return Err(err.into()),
            },
            Ok(_) => return Ok(false),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(bucket = bucket_id, path, "nothing to archive");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = write_atomic(
            &archived,
            ReaderStream::with_capacity(source, COPY_BUFFER_SIZE),
        )
        .await?;
        debug!(
            bucket = bucket_id,
            path,
            version,
            size = outcome.size,
            "archived previous version"
        );
        Ok(true)
    }
}
