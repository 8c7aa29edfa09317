//! Liveness and readiness endpoints.

use crate::services::file_service::FileService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

const DISK_PROBE_CONTENT: &[u8] = b"readyz";

/// `GET /healthz`: the process is up.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`: 200 when the metadata database answers and the files root
/// accepts a write/read/delete round trip, 503 otherwise.
pub async fn readyz(State(service): State<FileService>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    checks.insert("sqlite", check_sqlite(&service).await);
    checks.insert("disk", check_disk(service.store.files_root()).await);

    let ready = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        active_uploads: service.chunks.active_sessions().await,
        checks,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_sqlite(service: &FileService) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(1) => CheckStatus::passed(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    }
}

async fn check_disk(files_root: &Path) -> CheckStatus {
    let marker = files_root.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&marker, DISK_PROBE_CONTENT).await {
        return CheckStatus::failed(format!("write failed: {}", e));
    }
    let read_back = fs::read(&marker).await;
    let removed = fs::remove_file(&marker).await;

    match (read_back, removed) {
        (Ok(bytes), _) if bytes != DISK_PROBE_CONTENT => {
            CheckStatus::failed("read back different bytes".to_string())
        }
        (Ok(_), Ok(())) => CheckStatus::passed(),
        // Readable but left behind: still serving, worth surfacing.
        (Ok(_), Err(e)) => CheckStatus {
            ok: true,
            error: Some(format!("marker not removed: {}", e)),
        },
        (Err(e), _) => CheckStatus::failed(format!("read failed: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    active_uploads: usize,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn passed() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
