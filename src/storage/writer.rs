//! Streaming writes with an incremental SHA-256 digest.
//!
//! Bytes go to a `.tmp-<uuid>` sibling of the destination and are renamed
//! into place only after the stream ends cleanly and the file is synced, so a
//! reader never observes a half-written object.

use super::{FileStore, StorageError, StorageResult};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    path::Path,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Prefix of in-flight temp files.
pub const TEMP_PREFIX: &str = ".tmp-";
/// Read buffer used when streaming files already on disk.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Digest and length of the bytes that were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub sha256: String,
    pub size: u64,
}

impl FileStore {
    /// Stream `source` into the live object at `(bucket_id, path)`.
    ///
    /// Memory use is bounded by the largest item the stream yields. Any error
    /// from the stream or the disk aborts the write and leaves the previous
    /// live file, if any, untouched.
    pub async fn stream_write<S>(
        &self,
        bucket_id: &str,
        path: &str,
        source: S,
    ) -> StorageResult<WriteOutcome>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let dest = self.object_path(bucket_id, path)?;
        let outcome = write_atomic(&dest, source).await?;
        debug!(
            bucket = bucket_id,
            path,
            size = outcome.size,
            sha256 = %outcome.sha256,
            "wrote object"
        );
        Ok(outcome)
    }
}

/// Write `source` to `dest` through a temp file and an atomic rename.
pub(crate) async fn write_atomic<S>(dest: &Path, source: S) -> StorageResult<WriteOutcome>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let parent = dest.parent().ok_or_else(|| {
        StorageError::Io(io::Error::other("destination path missing parent directory"))
    })?;
    fs::create_dir_all(parent).await.map_err(path_conflict)?;
    let tmp_path = parent.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));

    let outcome = match copy_hashed(&tmp_path, source).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
    };

    if let Err(err) = fs::rename(&tmp_path, dest).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(dest).await?;
            fs::rename(&tmp_path, dest).await?;
        } else {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(path_conflict(err));
        }
    }

    Ok(outcome)
}

/// A file where a directory is needed, or the reverse, is a bad client path.
fn path_conflict(err: io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::AlreadyExists | ErrorKind::NotADirectory | ErrorKind::IsADirectory => {
            StorageError::InvalidPath("path conflicts with an existing file or directory".into())
        }
        _ => StorageError::Io(err),
    }
}

async fn copy_hashed<S>(tmp_path: &Path, source: S) -> io::Result<WriteOutcome>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut file = File::create(tmp_path).await?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;

    pin_mut!(source);
    while let Some(chunk) = source.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(WriteOutcome {
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}
