//! HTTP handlers for bucket lifecycle.

use crate::{errors::AppError, services::file_service::FileService};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

/// Request body for `POST /api/buckets`.
#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    pub name: String,
    /// `"<n>h"`, `"<n>d"`, `"<n>w"`, `"<n>m"` or `"never"`.
    pub expires_in: Option<String>,
}

/// Request body for `PATCH /api/buckets/{bucket}`. Absent fields are left alone.
#[derive(Debug, Deserialize)]
pub struct UpdateBucketReq {
    pub name: Option<String>,
    pub expires_in: Option<String>,
}

/// POST `/api/buckets` — create bucket.
pub async fn create_bucket(
    State(service): State<FileService>,
    Json(payload): Json<CreateBucketReq>,
) -> Result<impl IntoResponse, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::bad_request("name is required"));
    }
    let expires_at = match payload.expires_in.as_deref() {
        None => None,
        Some(raw) => expiry(raw)?,
    };

    let bucket = service.create_bucket(&payload.name, expires_at).await?;
    Ok((StatusCode::CREATED, Json(json!({ "bucket": bucket }))))
}

/// GET `/api/buckets` — every bucket, newest first.
pub async fn list_buckets(
    State(service): State<FileService>,
) -> Result<impl IntoResponse, AppError> {
    let buckets = service.list_buckets().await?;
    Ok(Json(json!({ "buckets": buckets })))
}

/// PATCH `/api/buckets/{bucket}` — rename and/or change expiry.
pub async fn update_bucket(
    State(service): State<FileService>,
    Path(bucket): Path<String>,
    Json(payload): Json<UpdateBucketReq>,
) -> Result<impl IntoResponse, AppError> {
    let name = match payload.name.as_deref().map(str::trim) {
        Some("") => return Err(AppError::bad_request("name must not be empty")),
        other => other,
    };
    let expires_at = payload.expires_in.as_deref().map(expiry).transpose()?;

    let updated = service.update_bucket(&bucket, name, expires_at).await?;
    Ok(Json(json!({ "bucket": updated })))
}

/// GET `/api/buckets/{bucket}` — bucket metadata and its files.
pub async fn get_bucket(
    State(service): State<FileService>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = service.fetch_bucket(&bucket).await?;
    let files = service.list_files(&bucket).await?;
    Ok(Json(json!({ "bucket": record, "files": files })))
}

/// DELETE `/api/buckets/{bucket}` — delete bucket and everything in it.
pub async fn delete_bucket(
    State(service): State<FileService>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `None` for a bucket that never expires.
fn expiry(raw: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    match raw {
        "" | "never" => Ok(None),
        _ => parse_expires_in(raw, Utc::now())
            .map(Some)
            .ok_or_else(|| AppError::bad_request(format!("invalid expires_in `{}`", raw))),
    }
}

/// Parse a relative expiry such as `"12h"` or `"2w"`. Months are 30 days.
fn parse_expires_in(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let unit = raw.chars().last()?;
    let value: i64 = raw[..raw.len() - unit.len_utf8()].parse().ok()?;
    let hours = match unit {
        'h' => value,
        'd' => value.checked_mul(24)?,
        'w' => value.checked_mul(24 * 7)?,
        'm' => value.checked_mul(24 * 30)?,
        _ => return None,
    };
    if hours <= 0 {
        return None;
    }
    now.checked_add_signed(Duration::try_hours(hours)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relative_expiry() {
        let now = Utc::now();
        assert_eq!(parse_expires_in("12h", now), Some(now + Duration::hours(12)));
        assert_eq!(parse_expires_in("2d", now), Some(now + Duration::days(2)));
        assert_eq!(parse_expires_in("1w", now), Some(now + Duration::weeks(1)));
        assert_eq!(parse_expires_in("1m", now), Some(now + Duration::days(30)));
        for bad in ["", "h", "10", "3y", "-1d", "0h", "1.5d"] {
            assert_eq!(parse_expires_in(bad, now), None, "{bad}");
        }
    }
}
