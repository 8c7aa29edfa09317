//! Defines routes for bucket and file operations.
//!
//! ## Structure
//! - **Bucket-level endpoints**
//!   - `POST   /api/buckets` — create bucket
//!   - `GET    /api/buckets` — list buckets
//!   - `GET    /api/buckets/{bucket}` — bucket metadata and file list
//!   - `PATCH  /api/buckets/{bucket}` — rename or change expiry
//!   - `DELETE /api/buckets/{bucket}` — delete bucket and its directory tree
//!
//! - **File-level endpoints**
//!   - `PUT    /api/buckets/{bucket}/files/{*path}` — upload raw body
//!   - `GET    /api/buckets/{bucket}/files/{*path}` — download (`?version=N` for
//!     archives, `Range` for partial content)
//!   - `DELETE /api/buckets/{bucket}/files/{*path}` — delete file
//!   - `GET    /api/buckets/{bucket}/versions/{*path}` — version history
//!   - `POST   /api/buckets/{bucket}/upload/chunk` — chunked upload, driven by
//!     `X-Chunk-Index`, `X-Total-Chunks`, `X-Upload-Id` and `X-Filename`
//!
//! The wildcard `*path` allows nested paths like `assets/2025/img.png`.

use crate::{
    handlers::{
        bucket_handlers::{create_bucket, delete_bucket, get_bucket, list_buckets, update_bucket},
        file_handlers::{delete_file, download_file, list_versions, upload_chunk, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. Handlers share `FileService` as state.
///
/// Upload bodies are streamed to disk, so the default body limit is lifted.
pub fn routes() -> Router<FileService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/buckets", post(create_bucket).get(list_buckets))
        .route(
            "/api/buckets/{bucket}",
            get(get_bucket).patch(update_bucket).delete(delete_bucket),
        )
        .route("/api/buckets/{bucket}/upload/chunk", post(upload_chunk))
        .route(
            "/api/buckets/{bucket}/files/{*path}",
            put(upload_file).get(download_file).delete(delete_file),
        )
        .route("/api/buckets/{bucket}/versions/{*path}", get(list_versions))
        .layer(DefaultBodyLimit::disable())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, storage::FileStore};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tower::ServiceExt;

    async fn app() -> (TempDir, FileService, Router) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        store.ensure_bucket_root().await.unwrap();
        let service = FileService::new(Arc::new(db::memory_pool().await), store);
        let router = routes().with_state(service.clone());
        (dir, service, router)
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn chunk_request(bucket: &str, index: &str, total: &str, body: &'static [u8]) -> Request<Body> {
        Request::post(format!("/api/buckets/{bucket}/upload/chunk"))
            .header("X-Chunk-Index", index)
            .header("X-Total-Chunks", total)
            .header("X-Upload-Id", "upload-1")
            .header("X-Filename", "notes/big.txt")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn chunked_upload_over_http() {
        let (_dir, service, router) = app().await;
        let bucket = service.create_bucket("http", None).await.unwrap();

        let response = router
            .clone()
            .oneshot(chunk_request(&bucket.id, "1", "2", b" world"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["complete"], false);
        assert_eq!(body["received"], 1);
        assert_eq!(body["total"], 2);

        let response = router
            .clone()
            .oneshot(chunk_request(&bucket.id, "0", "2", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["complete"], true);
        assert_eq!(body["file"]["size"], 11);
        assert_eq!(
            body["file"]["sha256"],
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let response = router
            .oneshot(
                Request::get(format!("/api/buckets/{}/files/notes/big.txt", bucket.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn bad_chunk_headers_are_client_errors() {
        let (_dir, service, router) = app().await;
        let bucket = service.create_bucket("http", None).await.unwrap();

        for (index, total) in [("2", "2"), ("0", "0"), ("-1", "2"), ("x", "2")] {
            let response = router
                .clone()
                .oneshot(chunk_request(&bucket.id, index, total, b"data"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{index}/{total}");
        }

        let missing = Request::post(format!("/api/buckets/{}/upload/chunk", bucket.id))
            .header("X-Chunk-Index", "0")
            .header("X-Total-Chunks", "1")
            .body(Body::from("data"))
            .unwrap();
        let response = router.oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!service.store.chunks_root().join("upload-1").exists());
    }

    #[tokio::test]
    async fn versions_are_listed_and_downloadable() {
        let (_dir, service, router) = app().await;
        let bucket = service.create_bucket("http", None).await.unwrap();
        let url = format!("/api/buckets/{}/files/a.txt", bucket.id);

        for content in ["v1", "v2"] {
            let response = router
                .clone()
                .oneshot(Request::put(&url).body(Body::from(content)).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/api/buckets/{}/versions/a.txt", bucket.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["current"], 2);
        assert_eq!(body["versions"][0]["version"], 1);

        let response = router
            .clone()
            .oneshot(
                Request::get(format!("{url}?version=1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"v1");

        let response = router
            .oneshot(
                Request::get(format!("{url}?version=7"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chunks_for_closed_uploads_conflict() {
        let (_dir, service, router) = app().await;
        let bucket = service.create_bucket("http", None).await.unwrap();

        for (index, body) in [("0", &b"hello"[..]), ("1", &b" world"[..])] {
            let response = router
                .clone()
                .oneshot(chunk_request(&bucket.id, index, "2", body))
                .await
                .unwrap();
            assert!(response.status().is_success());
        }

        let response = router
            .clone()
            .oneshot(chunk_request(&bucket.id, "0", "2", b"stale"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["status"], 409);

        let (_, mut live) = service.open_file(&bucket.id, "notes/big.txt").await.unwrap();
        let mut content = Vec::new();
        live.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello world");

        // The finished upload id stays closed whichever bucket it names.
        let other = service.create_bucket("other", None).await.unwrap();
        let response = router
            .clone()
            .oneshot(chunk_request(&other.id, "0", "2", b"part"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn buckets_are_listed_and_patched() {
        let (_dir, service, router) = app().await;
        let bucket = service.create_bucket("before", None).await.unwrap();

        let response = router
            .clone()
            .oneshot(Request::get("/api/buckets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["buckets"][0]["id"], bucket.id.as_str());

        let patch = |body: &'static str| {
            Request::patch(format!("/api/buckets/{}", bucket.id))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let response = router
            .clone()
            .oneshot(patch(r#"{"name":"after","expires_in":"2d"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["bucket"]["name"], "after");
        assert!(body["bucket"]["expires_at"].is_string());

        let response = router
            .clone()
            .oneshot(patch(r#"{"expires_in":"never"}"#))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["bucket"]["name"], "after");
        assert!(body["bucket"]["expires_at"].is_null());

        let response = router
            .clone()
            .oneshot(patch(r#"{"expires_in":"soon"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(
                Request::patch("/api/buckets/missing")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn range_requests_return_partial_content() {
        let (_dir, service, router) = app().await;
        let bucket = service.create_bucket("http", None).await.unwrap();
        let url = format!("/api/buckets/{}/files/digits.txt", bucket.id);
        router
            .clone()
            .oneshot(Request::put(&url).body(Body::from("0123456789")).unwrap())
            .await
            .unwrap();

        let ranged = |range: &str| {
            Request::get(&url)
                .header("range", range)
                .body(Body::empty())
                .unwrap()
        };

        let response = router.clone().oneshot(ranged("bytes=2-5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()["content-range"], "bytes 2-5/10");
        assert_eq!(response.headers()["content-length"], "4");
        assert_eq!(response.headers()["accept-ranges"], "bytes");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"2345");

        let response = router.clone().oneshot(ranged("bytes=-3")).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"789");

        let response = router.clone().oneshot(ranged("bytes=10-")).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()["content-range"], "bytes */10");

        let response = router
            .clone()
            .oneshot(Request::get(&url).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["accept-ranges"], "bytes");
        let etag = response.headers()["etag"].clone();

        let response = router
            .oneshot(
                Request::get(&url)
                    .header("if-none-match", etag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn unknown_bucket_is_not_found() {
        let (_dir, _service, router) = app().await;
        let response = router
            .oneshot(
                Request::put("/api/buckets/nope/files/a.txt")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
