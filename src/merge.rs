//! 按序号流式合并分片并原子生成最终文件。

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::chunk_store::{ChunkStore, ChunkStoreError, UploadKey};

#[derive(Debug, Error)]
#[error("{reason}")]
pub struct MergeError {
    pub reason: String,
    pub missing_index: Option<u32>,
}

impl MergeError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            missing_index: None,
        }
    }
}

impl From<ChunkStoreError> for MergeError {
    fn from(err: ChunkStoreError) -> Self {
        let missing_index = match err {
            ChunkStoreError::MissingChunk(index) => Some(index),
            _ => None,
        };
        Self {
            reason: err.to_string(),
            missing_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    /// False when the chunk set could not be removed after the merge.
    pub purged: bool,
}

/// 合并一个已完整的上传。
///
/// Chunks are copied one at a time in index order into a temp file beside
/// `final_path`, which only appears once every chunk has been written and
/// synced. On failure the temp file is removed and the chunk set is left in
/// place so the merge can be retried.
pub async fn merge_upload(
    store: &ChunkStore,
    key: &UploadKey,
    total_chunks: u32,
    final_path: &Path,
) -> Result<MergedArtifact, MergeError> {
    let mut chunks = store.ordered_chunks(key, total_chunks).await?;

    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| MergeError::new(format!("create artifact directory: {err}")))?;
    }
    let mut atomic = AtomicFile::new(final_path)
        .await
        .map_err(|err| MergeError::new(format!("create artifact: {err}")))?;

    let write_result: Result<u64, MergeError> = async {
        let mut total_written: u64 = 0;
        while let Some(next) = chunks.next_chunk().await {
            let (index, mut chunk) = next?;
            let copied = tokio::io::copy(&mut chunk, atomic.file_mut())
                .await
                .map_err(|err| MergeError::new(format!("append chunk {index}: {err}")))?;
            total_written += copied;
        }
        Ok(total_written)
    }
    .await;
    let bytes = match write_result {
        Ok(value) => value,
        Err(err) => {
            atomic.cleanup().await;
            warn!(upload_key = %key, error = %err, "merge aborted");
            return Err(err);
        }
    };
    atomic
        .finalize()
        .await
        .map_err(|err| MergeError::new(format!("finalize artifact: {err}")))?;

    info!(upload_key = %key, path = ?final_path, bytes, "upload merged");

    let purged = match store.purge(key).await {
        Ok(()) => true,
        Err(err) => {
            warn!(upload_key = %key, error = %err, "failed to purge merged chunks");
            false
        }
    };

    Ok(MergedArtifact {
        path: final_path.to_path_buf(),
        bytes,
        purged,
    })
}
