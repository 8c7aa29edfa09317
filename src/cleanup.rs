//! Periodic removal of expired buckets and abandoned chunked uploads.

use crate::services::file_service::FileService;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

/// Run `FileService::run_cleanup` every `every`, starting immediately.
pub fn spawn_cleanup_loop(service: FileService, every: Duration, chunk_ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match service.run_cleanup(chunk_ttl).await {
                Ok(report) => debug!(
                    expired_buckets = report.expired_buckets,
                    stale_uploads = report.stale_uploads,
                    "cleanup pass finished"
                ),
                Err(err) => warn!("cleanup pass failed: {}", err),
            }
        }
    })
}
