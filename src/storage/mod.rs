//! Storage layer for bucket-scoped file content.
//!
//! All payloads live beneath a single data directory:
//!
//! ```text
//! <data_dir>/files/<bucket_id>/<path>
//! <data_dir>/files/<bucket_id>/.versions/<path>.v<version>
//! <data_dir>/chunks/<upload_id>/chunk_<index>
//! ```
//!
//! Every path handed to this module is run through [`path::resolve`] before
//! any filesystem mutation, so a hostile path fails with
//! [`StorageError::PathTraversal`] instead of touching disk.

pub mod archive;
pub mod buckets;
pub mod chunks;
pub mod path;
pub mod writer;

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, SeekFrom, Take},
};
use tracing::debug;

/// Directory under the data dir that holds one subtree per bucket.
pub const FILES_DIR: &str = "files";
/// Directory under the data dir that holds in-progress chunked uploads.
pub const CHUNKS_DIR: &str = "chunks";
/// Per-bucket directory holding archived versions.
pub const VERSIONS_DIR: &str = ".versions";
/// Per-bucket directory reserved for derived thumbnails.
pub const THUMBS_DIR: &str = ".thumbs";

const RESERVED_TOP_LEVEL: [&str; 2] = [VERSIONS_DIR, THUMBS_DIR];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path `{0}` escapes its root directory")]
    PathTraversal(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid chunk headers: {0}")]
    InvalidChunkHeaders(String),
    #[error("upload `{0}` is no longer accepting chunks")]
    UploadClosed(String),
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("file `{path}` not found in bucket `{bucket}`")]
    FileNotFound { bucket: String, path: String },
    #[error("version {version} of `{path}` not found in bucket `{bucket}`")]
    VersionNotFound {
        bucket: String,
        path: String,
        version: i64,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Handle on the on-disk tree. Cheap to clone; holds no open files.
#[derive(Clone, Debug)]
pub struct FileStore {
    files_root: PathBuf,
    chunks_root: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            files_root: data_dir.join(FILES_DIR),
            chunks_root: data_dir.join(CHUNKS_DIR),
        }
    }

    pub fn files_root(&self) -> &Path {
        &self.files_root
    }

    pub fn chunks_root(&self) -> &Path {
        &self.chunks_root
    }

    /// Root directory of a bucket. The id must be exactly one path segment.
    pub fn bucket_root(&self, bucket_id: &str) -> StorageResult<PathBuf> {
        single_segment(&self.files_root, bucket_id)
    }

    /// Absolute path of the live object at `path` inside `bucket_id`.
    pub fn object_path(&self, bucket_id: &str, path: &str) -> StorageResult<PathBuf> {
        let bucket_root = self.bucket_root(bucket_id)?;
        let logical = path::normalize(path)?;
        if let Some(first) = logical.split('/').next() {
            if RESERVED_TOP_LEVEL.contains(&first) {
                return Err(StorageError::InvalidPath(format!(
                    "`{first}` is a reserved directory"
                )));
            }
        }
        path::resolve(&bucket_root, &logical)
    }

    /// Absolute path of the archived copy of `path` at `version`.
    pub fn version_path(&self, bucket_id: &str, path: &str, version: i64) -> StorageResult<PathBuf> {
        let versions_root = self.bucket_root(bucket_id)?.join(VERSIONS_DIR);
        let logical = path::normalize(path)?;
        path::resolve(&versions_root, &format!("{logical}.v{version}"))
    }

    /// Temp directory for a chunked upload. The id must be one path segment.
    pub fn chunk_dir(&self, upload_id: &str) -> StorageResult<PathBuf> {
        single_segment(&self.chunks_root, upload_id)
    }

    /// Open the live object for reading.
    pub async fn open_object(&self, bucket_id: &str, path: &str) -> StorageResult<File> {
        let file_path = self.object_path(bucket_id, path)?;
        File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::FileNotFound {
                    bucket: bucket_id.to_string(),
                    path: path.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })
    }

    /// Open an archived version for reading.
    pub async fn open_version(&self, bucket_id: &str, path: &str, version: i64) -> StorageResult<File> {
        let file_path = self.version_path(bucket_id, path, version)?;
        File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::VersionNotFound {
                    bucket: bucket_id.to_string(),
                    path: path.to_string(),
                    version,
                }
            } else {
                StorageError::Io(err)
            }
        })
    }

    /// Remove the live object, then prune directories it leaves empty.
    ///
    /// Returns `false` when there was nothing to remove. Archived versions
    /// are kept until the whole bucket is deleted.
    pub async fn delete_object(&self, bucket_id: &str, path: &str) -> StorageResult<bool> {
        let file_path = self.object_path(bucket_id, path)?;
        let removed = match fs::remove_file(&file_path).await {
            Ok(()) => {
                debug!("removed physical file {}", file_path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
                false
            }
            Err(err) => return Err(StorageError::Io(err)),
        };

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket_id)?;
            buckets::prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(removed)
    }
}

/// Restrict an open handle to `length` bytes starting at `offset`.
pub async fn read_range(mut file: File, offset: u64, length: u64) -> StorageResult<Take<File>> {
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file.take(length))
}

fn single_segment(root: &Path, id: &str) -> StorageResult<PathBuf> {
    let resolved = path::resolve(root, id)?;
    if resolved.parent() != Some(root) {
        return Err(StorageError::PathTraversal(id.to_string()));
    }
    Ok(resolved)
}
