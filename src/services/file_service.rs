//! src/services/file_service.rs
//!
//! FileService: bucket and file operations backed by SQLite for metadata and
//! the [`FileStore`] tree for payloads. Metadata is written only after the
//! bytes are durable on disk; an upload that fails leaves the previous record
//! and the previous live file in place.

use crate::{
    models::{
        bucket::Bucket,
        file::{FileRecord, FileVersion},
    },
    storage::{
        FileStore, StorageError, StorageResult,
        chunks::{ChunkAssembler, ChunkOutcome, ChunkUpload, VersionCatalog},
        path,
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use sqlx::SqlitePool;
use std::{io, sync::Arc, time::Duration};
use tokio::fs::File;
use tracing::{info, warn};
use uuid::Uuid;

/// Progress of a chunked upload after one chunk was accepted.
#[derive(Debug)]
pub enum ChunkProgress {
    Pending { received: u32, total: u32 },
    Complete(FileRecord),
}

/// What a cleanup pass removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_buckets: usize,
    pub stale_uploads: usize,
}

const FILE_COLUMNS: &str = "id, bucket_id, path, size, mime_type, sha256, version, uploaded_at";

#[derive(Clone)]
pub struct FileService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// On-disk tree for live files, versions and chunk temp space.
    pub store: FileStore,

    /// Registry of in-progress chunked uploads.
    pub chunks: ChunkAssembler,
}

impl FileService {
    pub fn new(db: Arc<SqlitePool>, store: FileStore) -> Self {
        let chunks = ChunkAssembler::new(store.clone());
        Self { db, store, chunks }
    }

    /// Create a bucket record and its directory.
    pub async fn create_bucket(
        &self,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<Bucket> {
        let bucket = Bucket {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            expires_at,
        };
        self.store.ensure_bucket_dir(&bucket.id).await?;

        sqlx::query("INSERT INTO buckets (id, name, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(&bucket.id)
            .bind(&bucket.name)
            .bind(bucket.created_at)
            .bind(bucket.expires_at)
            .execute(&*self.db)
            .await?;

        info!(bucket = %bucket.id, name, "created bucket");
        Ok(bucket)
    }

    /// Fetch bucket metadata. Returns BucketNotFound if missing.
    pub async fn fetch_bucket(&self, bucket_id: &str) -> StorageResult<Bucket> {
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, created_at, expires_at FROM buckets WHERE id = ?",
        )
        .bind(bucket_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::BucketNotFound(bucket_id.to_string()))
    }

    /// All buckets, newest first.
    pub async fn list_buckets(&self) -> StorageResult<Vec<Bucket>> {
        let buckets = sqlx::query_as::<_, Bucket>(
            "SELECT id, name, created_at, expires_at FROM buckets ORDER BY created_at DESC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(buckets)
    }

    /// Rename a bucket and/or change its expiry. `None` leaves a field as is;
    /// `Some(None)` for `expires_at` makes the bucket permanent.
    pub async fn update_bucket(
        &self,
        bucket_id: &str,
        name: Option<&str>,
        expires_at: Option<Option<DateTime<Utc>>>,
    ) -> StorageResult<Bucket> {
        let mut bucket = self.fetch_bucket(bucket_id).await?;
        if let Some(name) = name {
            bucket.name = name.to_string();
        }
        if let Some(expires_at) = expires_at {
            bucket.expires_at = expires_at;
        }

        sqlx::query("UPDATE buckets SET name = ?, expires_at = ? WHERE id = ?")
            .bind(&bucket.name)
            .bind(bucket.expires_at)
            .bind(&bucket.id)
            .execute(&*self.db)
            .await?;

        info!(bucket = %bucket.id, name = %bucket.name, "updated bucket");
        Ok(bucket)
    }

    /// Delete a bucket's metadata, directory tree and pending chunk sessions.
    pub async fn delete_bucket(&self, bucket_id: &str) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM file_versions WHERE file_id IN (SELECT id FROM files WHERE bucket_id = ?)",
        )
        .bind(bucket_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM files WHERE bucket_id = ?")
            .bind(bucket_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::BucketNotFound(bucket_id.to_string()));
        }
        tx.commit().await?;

        self.store.delete_bucket_dir(bucket_id).await?;
        let discarded = self.chunks.discard_bucket(bucket_id).await;
        info!(bucket = bucket_id, discarded_uploads = discarded, "deleted bucket");
        Ok(())
    }

    /// All live files in a bucket, ordered by path.
    pub async fn list_files(&self, bucket_id: &str) -> StorageResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE bucket_id = ? ORDER BY path ASC"
        ))
        .bind(bucket_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(files)
    }

    /// Fetch a file record by normalized path, if present.
    async fn find_file(&self, bucket_id: &str, path: &str) -> StorageResult<Option<FileRecord>> {
        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE bucket_id = ? AND path = ?"
        ))
        .bind(bucket_id)
        .bind(path)
        .fetch_optional(&*self.db)
        .await?;
        Ok(file)
    }

    /// Fetch a file record. Returns FileNotFound if missing.
    pub async fn fetch_file(&self, bucket_id: &str, path: &str) -> StorageResult<FileRecord> {
        let logical = path::normalize(path)?;
        self.find_file(bucket_id, &logical)
            .await?
            .ok_or_else(|| StorageError::FileNotFound {
                bucket: bucket_id.to_string(),
                path: logical,
            })
    }

    /// Stream-upload a file, archiving the current version first.
    pub async fn upload_file<S>(
        &self,
        bucket_id: &str,
        path: &str,
        source: S,
    ) -> StorageResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        self.fetch_bucket(bucket_id).await?;
        let logical = path::normalize(path)?;
        // Validate before archiving so a bad path never touches disk.
        self.store.object_path(bucket_id, &logical)?;

        let existing = self.find_file(bucket_id, &logical).await?;
        if let Some(prev) = &existing {
            self.store.archive(bucket_id, &logical, prev.version).await?;
        }

        let outcome = self.store.stream_write(bucket_id, &logical, source).await?;
        self.record_write(bucket_id, &logical, outcome.size, &outcome.sha256, existing.as_ref())
            .await
    }

    /// Accept one chunk of a chunked upload and record the file on completion.
    pub async fn accept_chunk<S>(&self, upload: ChunkUpload, body: S) -> StorageResult<ChunkProgress>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        self.fetch_bucket(&upload.bucket_id).await?;
        let bucket_id = upload.bucket_id.clone();

        match self.chunks.accept_chunk(self, upload, body).await? {
            ChunkOutcome::Pending { received, total } => {
                Ok(ChunkProgress::Pending { received, total })
            }
            ChunkOutcome::Complete(assembled) => {
                let existing = self.find_file(&bucket_id, &assembled.path).await?;
                let record = self
                    .record_write(
                        &bucket_id,
                        &assembled.path,
                        assembled.size,
                        &assembled.sha256,
                        existing.as_ref(),
                    )
                    .await?;
                Ok(ChunkProgress::Complete(record))
            }
        }
    }

    /// Upsert the live record and, for overwrites, log the superseded version.
    async fn record_write(
        &self,
        bucket_id: &str,
        path: &str,
        size: u64,
        sha256: &str,
        existing: Option<&FileRecord>,
    ) -> StorageResult<FileRecord> {
        let now = Utc::now();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let mut tx = self.db.begin().await?;
        if let Some(prev) = existing {
            sqlx::query(
                "INSERT INTO file_versions (file_id, version, size, sha256, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(prev.id)
            .bind(prev.version)
            .bind(prev.size)
            .bind(&prev.sha256)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "INSERT INTO files (bucket_id, path, size, mime_type, sha256, version, uploaded_at)
             VALUES (?, ?, ?, ?, ?, 1, ?)
             ON CONFLICT(bucket_id, path) DO UPDATE SET
                size = excluded.size,
                mime_type = excluded.mime_type,
                sha256 = excluded.sha256,
                version = files.version + 1,
                uploaded_at = excluded.uploaded_at
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(bucket_id)
        .bind(path)
        .bind(size as i64)
        .bind(&mime_type)
        .bind(sha256)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            bucket = bucket_id,
            path,
            version = record.version,
            size,
            "recorded file"
        );
        Ok(record)
    }

    /// Remove a file's payload and metadata. Archived versions stay on disk
    /// until the bucket is deleted.
    pub async fn delete_file(&self, bucket_id: &str, path: &str) -> StorageResult<FileRecord> {
        let file = self.fetch_file(bucket_id, path).await?;
        self.store.delete_object(bucket_id, &file.path).await?;

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM file_versions WHERE file_id = ?")
            .bind(file.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(file)
    }

    /// The live record and its archived versions, newest first.
    pub async fn list_versions(
        &self,
        bucket_id: &str,
        path: &str,
    ) -> StorageResult<(FileRecord, Vec<FileVersion>)> {
        let file = self.fetch_file(bucket_id, path).await?;
        let versions = sqlx::query_as::<_, FileVersion>(
            "SELECT id, file_id, version, size, sha256, created_at
             FROM file_versions WHERE file_id = ? ORDER BY version DESC",
        )
        .bind(file.id)
        .fetch_all(&*self.db)
        .await?;
        Ok((file, versions))
    }

    /// Metadata and an open handle for the live content.
    pub async fn open_file(&self, bucket_id: &str, path: &str) -> StorageResult<(FileRecord, File)> {
        let file = self.fetch_file(bucket_id, path).await?;
        let handle = self.store.open_object(bucket_id, &file.path).await?;
        Ok((file, handle))
    }

    /// Metadata and an open handle for an archived version.
    pub async fn open_version(
        &self,
        bucket_id: &str,
        path: &str,
        version: i64,
    ) -> StorageResult<(FileVersion, File)> {
        let (file, versions) = self.list_versions(bucket_id, path).await?;
        let entry = versions
            .into_iter()
            .find(|v| v.version == version)
            .ok_or_else(|| StorageError::VersionNotFound {
                bucket: bucket_id.to_string(),
                path: file.path.clone(),
                version,
            })?;
        let handle = self.store.open_version(bucket_id, &file.path, version).await?;
        Ok((entry, handle))
    }

    /// Delete expired buckets and sweep chunk sessions idle for `chunk_ttl`.
    pub async fn run_cleanup(&self, chunk_ttl: Duration) -> StorageResult<CleanupReport> {
        let now = Utc::now();
        let candidates = sqlx::query_as::<_, Bucket>(
            "SELECT id, name, created_at, expires_at FROM buckets WHERE expires_at IS NOT NULL",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut report = CleanupReport::default();
        for bucket in candidates.into_iter().filter(|b| b.is_expired(now)) {
            match self.delete_bucket(&bucket.id).await {
                Ok(()) => report.expired_buckets += 1,
                Err(err) => warn!(bucket = %bucket.id, error = %err, "failed to delete expired bucket"),
            }
        }
        report.stale_uploads = self.chunks.sweep_stale(chunk_ttl).await?;

        if report.expired_buckets > 0 {
            info!("Cleanup: deleted {} expired bucket(s)", report.expired_buckets);
        }
        Ok(report)
    }
}

impl VersionCatalog for FileService {
    async fn current_version(&self, bucket_id: &str, path: &str) -> StorageResult<Option<i64>> {
        Ok(self.find_file(bucket_id, path).await?.map(|file| file.version))
    }
}
