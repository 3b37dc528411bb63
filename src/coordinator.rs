//! 分片上传编排：校验、落盘、记录进度，并在上传完整时触发合并。

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::chunk_store::{ChunkStore, ChunkStoreError, UploadKey, UploadManifest};
use crate::locking::LockManager;
use crate::merge::{MergeError, merge_upload};
use crate::storage::Storage;
use crate::tracker::{Arrival, Registration, TrackerError, UploadPhase, UploadTracker};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 0 disables the limit.
    pub max_chunks: u32,
    pub lock_wait: Duration,
    /// Unfinished uploads older than this are swept; zero disables sweeping.
    pub chunk_ttl: Duration,
}

/// One inbound chunk, already extracted from the transport.
pub struct ChunkRequest<R> {
    pub key: UploadKey,
    pub filename: String,
    pub index: u32,
    pub total_chunks: u32,
    pub payload: R,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk stored, more chunks are expected.
    Accepted {
        index: u32,
        total_chunks: u32,
        received: u32,
    },
    /// Chunk stored while another request is already merging the upload.
    Merging { index: u32, total_chunks: u32 },
    /// This chunk completed the upload and the artifact is in place.
    Complete {
        artifact: String,
        path: PathBuf,
        bytes: u64,
    },
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Storage(String),
    #[error("merge failed: {reason}")]
    Merge {
        reason: String,
        missing_index: Option<u32>,
    },
    #[error("upload {0} is busy")]
    Busy(String),
    #[error("upload {0} not found")]
    NotFound(String),
}

impl From<TrackerError> for UploadError {
    fn from(err: TrackerError) -> Self {
        UploadError::Validation(err.to_string())
    }
}

impl From<ChunkStoreError> for UploadError {
    fn from(err: ChunkStoreError) -> Self {
        match err {
            ChunkStoreError::InvalidKey(_) | ChunkStoreError::ChunkTooLarge { .. } => {
                UploadError::Validation(err.to_string())
            }
            _ => UploadError::Storage(err.to_string()),
        }
    }
}

impl From<MergeError> for UploadError {
    fn from(err: MergeError) -> Self {
        UploadError::Merge {
            reason: err.reason,
            missing_index: err.missing_index,
        }
    }
}

/// Drives every chunk request through store, tracker and merge.
///
/// Locks are per upload key: chunk writes share the key's read lock, merge and
/// abort take its write lock. Different uploads never wait on each other.
#[derive(Debug)]
pub struct UploadCoordinator {
    store: ChunkStore,
    storage: Storage,
    tracker: UploadTracker,
    locks: LockManager,
    config: CoordinatorConfig,
}

impl UploadCoordinator {
    pub fn new(store: ChunkStore, storage: Storage, config: CoordinatorConfig) -> Self {
        Self {
            store,
            storage,
            tracker: UploadTracker::new(),
            locks: LockManager::new(),
            config,
        }
    }

    /// 创建分片目录与产物目录。
    pub async fn ensure_roots(&self) -> std::io::Result<()> {
        self.store.ensure_root().await?;
        self.storage.ensure_root().await
    }

    /// 处理一个分片请求。
    pub async fn accept_chunk<R>(&self, request: ChunkRequest<R>) -> Result<ChunkOutcome, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let ChunkRequest {
            key,
            filename,
            index,
            total_chunks,
            payload,
        } = request;
        let filename = filename.trim().to_string();
        self.validate(&filename, index, total_chunks)?;
        let final_path = self
            .storage
            .artifact_path(&filename)
            .await
            .map_err(|err| UploadError::Validation(format!("filename {filename:?}: {err}")))?;

        let stored = {
            let _guard = self
                .locks
                .read_with_timeout(key.as_str(), self.config.lock_wait)
                .await
                .map_err(|_| UploadError::Busy(key.to_string()))?;

            self.ensure_tracked(&key).await?;
            let registration = self.tracker.register(&key, &filename, total_chunks).await?;
            match self
                .store_chunk(&key, &filename, index, total_chunks, registration, payload)
                .await
            {
                Ok(bytes) => {
                    debug!(upload_key = %key, chunk_index = index, bytes, "chunk accepted");
                    Ok(self.tracker.record_arrival(&key, index, total_chunks).await?)
                }
                Err(err) => Err((err, self.tracker.release(&key).await)),
            }
        };
        let arrival = match stored {
            Ok(arrival) => arrival,
            Err((err, abandoned)) => {
                if abandoned {
                    self.discard_empty_upload(&key).await;
                }
                return Err(err);
            }
        };

        match arrival {
            Arrival::Progress {
                received,
                total_chunks,
            } => Ok(ChunkOutcome::Accepted {
                index,
                total_chunks,
                received,
            }),
            Arrival::AlreadyMerging { total_chunks } => Ok(ChunkOutcome::Merging {
                index,
                total_chunks,
            }),
            Arrival::Completed {
                filename,
                total_chunks,
            } => self.complete(&key, filename, total_chunks, final_path).await,
        }
    }

    fn validate(&self, filename: &str, index: u32, total_chunks: u32) -> Result<(), UploadError> {
        if filename.is_empty() {
            return Err(UploadError::Validation("filename is required".into()));
        }
        if total_chunks == 0 {
            return Err(UploadError::Validation("totalChunks must be positive".into()));
        }
        if index >= total_chunks {
            return Err(UploadError::Validation(format!(
                "chunk index {index} is outside 0..{total_chunks}"
            )));
        }
        if self.config.max_chunks > 0 && total_chunks > self.config.max_chunks {
            return Err(UploadError::Validation(format!(
                "totalChunks exceeds limit of {}",
                self.config.max_chunks
            )));
        }
        Ok(())
    }

    /// 新上传先写清单，再写入分片内容。
    async fn store_chunk<R>(
        &self,
        key: &UploadKey,
        filename: &str,
        index: u32,
        total_chunks: u32,
        registration: Registration,
        payload: R,
    ) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if registration == Registration::New {
            let manifest = UploadManifest::new(filename, total_chunks);
            self.store.write_manifest(key, &manifest).await?;
            info!(upload_key = %key, filename, total_chunks, "upload started");
        }
        self.store.put(key, index, payload).await.map_err(|err| {
            warn!(upload_key = %key, chunk_index = index, error = %err, "chunk save failed");
            UploadError::from(err)
        })
    }

    /// 删除没有收到任何分片就失败的上传留下的目录与清单。
    async fn discard_empty_upload(&self, key: &UploadKey) {
        let Ok(_guard) = self
            .locks
            .write_with_timeout(key.as_str(), self.config.lock_wait)
            .await
        else {
            debug!(upload_key = %key, "upload busy, leaving empty upload to the sweep");
            return;
        };
        // Re-registered by another request meanwhile.
        if self.tracker.contains(key).await {
            return;
        }
        match self.store.purge(key).await {
            Ok(()) => debug!(upload_key = %key, "discarded upload without chunks"),
            Err(err) => warn!(upload_key = %key, error = %err, "failed to discard empty upload"),
        }
    }

    /// 进程重启后从分片存储重建跟踪状态；没有任何分片的清单不会固定分片总数。
    async fn ensure_tracked(&self, key: &UploadKey) -> Result<(), UploadError> {
        if self.tracker.contains(key).await {
            return Ok(());
        }
        if let Some(snapshot) = self.store.snapshot(key).await? {
            if snapshot.indices.is_empty() {
                debug!(upload_key = %key, "stored upload has no chunks, not resuming");
                return Ok(());
            }
            info!(
                upload_key = %key,
                total_chunks = snapshot.manifest.total_chunks,
                received = snapshot.indices.len(),
                "resumed upload from disk"
            );
            self.tracker.seed(key, snapshot).await;
        }
        Ok(())
    }

    async fn complete(
        &self,
        key: &UploadKey,
        filename: String,
        total_chunks: u32,
        final_path: PathBuf,
    ) -> Result<ChunkOutcome, UploadError> {
        let _guard = match self
            .locks
            .write_with_timeout(key.as_str(), self.config.lock_wait)
            .await
        {
            Ok(guard) => guard,
            Err(_) => {
                self.tracker.merge_failed(key, None).await;
                return Err(UploadError::Busy(key.to_string()));
            }
        };
        if self.tracker.phase(key).await != Some(UploadPhase::Merging) {
            return Err(UploadError::NotFound(key.to_string()));
        }

        match merge_upload(&self.store, key, total_chunks, &final_path).await {
            Ok(merged) => {
                self.tracker.forget(key).await;
                info!(
                    upload_key = %key,
                    filename,
                    bytes = merged.bytes,
                    purged = merged.purged,
                    "upload complete"
                );
                Ok(ChunkOutcome::Complete {
                    artifact: filename,
                    path: merged.path,
                    bytes: merged.bytes,
                })
            }
            Err(err) => {
                warn!(
                    upload_key = %key,
                    missing_index = ?err.missing_index,
                    error = %err,
                    "merge failed, chunks kept for retry"
                );
                self.tracker.merge_failed(key, err.missing_index).await;
                Err(err.into())
            }
        }
    }

    /// 中止上传并删除其全部分片。
    pub async fn abort(&self, key: &UploadKey) -> Result<(), UploadError> {
        let _guard = self
            .locks
            .write_with_timeout(key.as_str(), self.config.lock_wait)
            .await
            .map_err(|_| UploadError::Busy(key.to_string()))?;

        let tracked = self.tracker.progress(key).await;
        let stored = tokio::fs::try_exists(self.store.upload_dir(key))
            .await
            .map_err(ChunkStoreError::from)?;
        if tracked.is_none() && !stored {
            return Err(UploadError::NotFound(key.to_string()));
        }
        self.store.purge(key).await?;
        self.tracker.forget(key).await;
        match tracked {
            Some(progress) => info!(
                upload_key = %key,
                filename = %progress.filename,
                received = progress.received,
                total_chunks = progress.total_chunks,
                phase = ?progress.phase,
                "upload aborted"
            ),
            None => info!(upload_key = %key, "upload aborted"),
        }
        Ok(())
    }

    /// 清理长时间未完成的上传，返回被清理的上传键。
    pub async fn sweep_stale(&self) -> std::io::Result<Vec<UploadKey>> {
        let mut removed = Vec::new();
        for key in self.store.stale_uploads(self.config.chunk_ttl).await? {
            let Some(_guard) = self.locks.try_write(key.as_str()).await else {
                debug!(upload_key = %key, "stale upload is busy, skipping");
                continue;
            };
            if self.tracker.phase(&key).await == Some(UploadPhase::Merging) {
                continue;
            }
            match self.store.purge(&key).await {
                Ok(()) => {
                    self.tracker.forget(&key).await;
                    info!(upload_key = %key, "removed stale upload chunks");
                    removed.push(key);
                }
                Err(err) => {
                    warn!(upload_key = %key, error = %err, "failed to remove stale upload chunks");
                }
            }
        }
        let pruned = self.locks.prune_idle().await;
        debug!(removed = removed.len(), pruned_locks = pruned, "stale upload sweep done");
        Ok(removed)
    }
}
