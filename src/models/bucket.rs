//! Represents a bucket: a named container owning one directory subtree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A bucket record.
///
/// The id doubles as the bucket's directory name under the files root, so it
/// is generated server-side and never taken from user input.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Opaque identifier (simple-format UUID).
    pub id: String,

    /// Display name chosen by the creator.
    pub name: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,

    /// When the cleanup task should delete the bucket, if ever.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Bucket {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}
