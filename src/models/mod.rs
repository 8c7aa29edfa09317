//! Metadata records for buckets and files.
//!
//! These map to SQLite rows via `sqlx::FromRow` and serialize as JSON via
//! `serde`. Payload bytes never pass through them.

pub mod bucket;
pub mod file;
