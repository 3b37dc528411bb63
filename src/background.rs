//! 过期分片与暂存文件清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::CHUNK_SWEEP_INTERVAL_SECS;
use crate::coordinator::UploadCoordinator;
use crate::upload::{UploadConfig, cleanup_staging};

/// 启动后台任务（过期上传清理与暂存目录清理）。
pub fn spawn_background_tasks(
    coordinator: Arc<UploadCoordinator>,
    upload: Arc<UploadConfig>,
    ttl: Duration,
) {
    if ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CHUNK_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = coordinator.sweep_stale().await {
                warn!(error = %err, "stale upload sweep failed");
            }
            if let Err(err) = cleanup_staging(&upload.staging_dir, ttl).await {
                warn!(error = %err, "staging cleanup failed");
            }
        }
    });
}
