//! HTTP handlers for file content: direct uploads, chunked uploads,
//! downloads, deletes and version listings.
//!
//! Request bodies are streamed straight into `FileService`; nothing here
//! buffers a whole payload.

use crate::{
    errors::AppError,
    models::file::FileRecord,
    services::file_service::{ChunkProgress, FileService},
    storage::{self, StorageError, chunks::ChunkUpload},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::io;
use tokio_util::io::ReaderStream;

pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
pub const TOTAL_CHUNKS_HEADER: &str = "x-total-chunks";
pub const UPLOAD_ID_HEADER: &str = "x-upload-id";
pub const FILENAME_HEADER: &str = "x-filename";

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub version: Option<i64>,
}

fn body_stream(body: Body) -> impl Stream<Item = io::Result<bytes::Bytes>> {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
}

fn file_json(file: &FileRecord) -> serde_json::Value {
    json!({
        "path": file.path,
        "size": file.size,
        "mimeType": file.mime_type,
        "sha256": file.sha256,
        "version": file.version,
    })
}

/// PUT `/api/buckets/{bucket}/files/{*path}` — upload raw body as a file.
pub async fn upload_file(
    State(service): State<FileService>,
    Path((bucket, path)): Path<(String, String)>,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let file = service
        .upload_file(&bucket, &path, body_stream(body))
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "file": file_json(&file) }))))
}

/// POST `/api/buckets/{bucket}/upload/chunk` — one piece of a chunked upload.
pub async fn upload_chunk(
    State(service): State<FileService>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let upload = ChunkUpload {
        upload_id: header_str(&headers, UPLOAD_ID_HEADER)?.to_string(),
        index: header_num(&headers, CHUNK_INDEX_HEADER)?,
        total_chunks: header_num(&headers, TOTAL_CHUNKS_HEADER)?,
        filename: header_str(&headers, FILENAME_HEADER)?.to_string(),
        bucket_id: bucket,
    };

    let response = match service.accept_chunk(upload, body_stream(body)).await? {
        ChunkProgress::Pending { received, total } => Json(json!({
            "complete": false,
            "received": received,
            "total": total,
        }))
        .into_response(),
        ChunkProgress::Complete(file) => (
            StatusCode::CREATED,
            Json(json!({ "complete": true, "file": file_json(&file) })),
        )
            .into_response(),
    };
    Ok(response)
}

/// GET `/api/buckets/{bucket}/files/{*path}` — stream the live file, or an
/// archived one with `?version=N`.
///
/// Honors a single `Range: bytes=…` request with 206, answers 416 for a
/// range past the end, and 304 when `If-None-Match` matches the digest.
pub async fn download_file(
    State(service): State<FileService>,
    Path((bucket, path)): Path<(String, String)>,
    Query(q): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (file, sha256, size, handle) = match q.version {
        Some(version) => {
            let (entry, handle) = service.open_version(&bucket, &path, version).await?;
            let current = service.fetch_file(&bucket, &path).await?;
            (current, entry.sha256, entry.size, handle)
        }
        None => {
            let (file, handle) = service.open_file(&bucket, &path).await?;
            let (sha256, size) = (file.sha256.clone(), file.size);
            (file, sha256, size, handle)
        }
    };
    let size = u64::try_from(size).unwrap_or_default();
    let etag = format!("\"{}\"", sha256);

    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag))
    {
        return Ok(with_object_headers(
            Response::new(Body::empty()),
            StatusCode::NOT_MODIFIED,
            &file.mime_type,
            &etag,
        ));
    }

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(raw) => match parse_range(raw, size) {
            Ok(range) => range,
            Err(()) => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                response.headers_mut().insert(
                    header::CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes */{}", size))
                        .map_err(|err| AppError::internal(err.to_string()))?,
                );
                return Ok(response);
            }
        },
        None => None,
    };

    let response = match range {
        Some((start, end)) => {
            let length = end - start + 1;
            let reader = storage::read_range(handle, start, length).await?;
            let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, size))
                    .map_err(|err| AppError::internal(err.to_string()))?,
            );
            with_object_headers(response, StatusCode::PARTIAL_CONTENT, &file.mime_type, &etag)
        }
        None => {
            let mut response = Response::new(Body::from_stream(ReaderStream::new(handle)));
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            with_object_headers(response, StatusCode::OK, &file.mime_type, &etag)
        }
    };
    Ok(response)
}

fn with_object_headers(mut response: Response, status: StatusCode, mime_type: &str, etag: &str) -> Response {
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, value);
    }
    response
}

/// Parse a `Range` header into inclusive `(start, end)` offsets.
///
/// `Ok(None)` means serve the whole body (not a byte range, or several
/// ranges); `Err(())` means the range cannot be satisfied.
fn parse_range(raw: &str, size: u64) -> Result<Option<(u64, u64)>, ()> {
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return Ok(None);
    };
    if size == 0 {
        return Err(());
    }

    match (start.trim(), end.trim()) {
        ("", suffix) => {
            let suffix: u64 = suffix.parse().map_err(|_| ())?;
            if suffix == 0 {
                return Err(());
            }
            Ok(Some((size.saturating_sub(suffix), size - 1)))
        }
        (start, end) => {
            let start: u64 = start.parse().map_err(|_| ())?;
            let end = match end {
                "" => size - 1,
                end => end.parse::<u64>().map_err(|_| ())?.min(size - 1),
            };
            if start >= size || start > end {
                return Err(());
            }
            Ok(Some((start, end)))
        }
    }
}

/// DELETE `/api/buckets/{bucket}/files/{*path}` — remove a file.
pub async fn delete_file(
    State(service): State<FileService>,
    Path((bucket, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let file = service.delete_file(&bucket, &path).await?;
    Ok(Json(json!({ "deleted": true, "path": file.path })))
}

/// GET `/api/buckets/{bucket}/versions/{*path}` — current version and history.
pub async fn list_versions(
    State(service): State<FileService>,
    Path((bucket, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let (file, versions) = service.list_versions(&bucket, &path).await?;
    Ok(Json(json!({ "current": file.version, "versions": versions })))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, StorageError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StorageError::InvalidChunkHeaders(format!("missing `{}` header", name)))
}

fn header_num(headers: &HeaderMap, name: &str) -> Result<u32, StorageError> {
    let raw = header_str(headers, name)?;
    raw.parse::<u32>().map_err(|_| {
        StorageError::InvalidChunkHeaders(format!("`{}` header `{}` is not a valid count", name, raw))
    })
}
