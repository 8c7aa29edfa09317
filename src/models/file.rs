//! Represents stored files and their archived versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The live version of a file within a bucket.
///
/// Only metadata lives here; bytes are on disk at `files/<bucket_id>/<path>`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    pub id: i64,

    /// Owning bucket.
    pub bucket_id: String,

    /// Normalized logical path (`/`-separated, no `.` or `..` segments).
    pub path: String,

    /// Size in bytes of the live content.
    pub size: i64,

    /// MIME type guessed from the path extension.
    pub mime_type: String,

    /// Hex SHA-256 of the live content.
    pub sha256: String,

    /// Starts at 1 and increments on every overwrite.
    pub version: i64,

    pub uploaded_at: DateTime<Utc>,
}

/// An archived snapshot of a file taken just before it was overwritten.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileVersion {
    pub id: i64,
    pub file_id: i64,
    pub version: i64,
    pub size: i64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}
