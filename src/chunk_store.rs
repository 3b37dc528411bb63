//! 分片持久化：每个上传一个目录，每个分片一个文件。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

const MANIFEST_FILE: &str = "manifest.json";
const CHUNK_PREFIX: &str = "chunk-";
const COPY_BUFFER_SIZE: usize = 64 * 1024;
const MAX_KEY_LEN: usize = 128;

/// Identity of one logical multi-chunk upload.
///
/// Restricted to a single safe path segment so it can name the chunk directory
/// directly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadKey(String);

impl UploadKey {
    pub fn parse(value: &str) -> Result<Self, ChunkStoreError> {
        let value = value.trim();
        let valid = !value.is_empty()
            && value.len() <= MAX_KEY_LEN
            && !value.starts_with('.')
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(ChunkStoreError::InvalidKey(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    /// 由旧客户端只提供的文件名推导上传键。
    pub fn from_filename(filename: &str) -> Result<Self, ChunkStoreError> {
        let sanitized: String = filename
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let sanitized = sanitized.trim_start_matches('.');
        Self::parse(&sanitized.chars().take(MAX_KEY_LEN).collect::<String>())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("invalid upload key: {0:?}")]
    InvalidKey(String),
    #[error("chunk exceeds {limit} bytes")]
    ChunkTooLarge { limit: u64 },
    #[error("chunk {0} is missing")]
    MissingChunk(u32),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Upload metadata persisted next to the chunks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    pub filename: String,
    pub total_chunks: u32,
    pub created_at: i64,
}

impl UploadManifest {
    pub fn new(filename: &str, total_chunks: u32) -> Self {
        Self {
            filename: filename.to_string(),
            total_chunks,
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// What the store knows about one upload, used to rebuild tracker state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSnapshot {
    pub manifest: UploadManifest,
    pub indices: BTreeSet<u32>,
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
    max_chunk_size: u64,
}

impl ChunkStore {
    /// `max_chunk_size == 0` disables the per-chunk limit.
    pub fn new(root: PathBuf, max_chunk_size: u64) -> Self {
        Self {
            root,
            max_chunk_size,
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn upload_dir(&self, key: &UploadKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn chunk_path(&self, key: &UploadKey, index: u32) -> PathBuf {
        self.upload_dir(key).join(format!("{CHUNK_PREFIX}{index}"))
    }

    /// 保存分片内容，重复提交同一分片会原子覆盖旧内容。
    pub async fn put<R>(
        &self,
        key: &UploadKey,
        index: u32,
        mut reader: R,
    ) -> Result<u64, ChunkStoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let dir = self.upload_dir(key);
        fs::create_dir_all(&dir).await?;

        let temp_path = dir.join(format!(
            ".{CHUNK_PREFIX}{index}.{}-{}.tmp",
            Utc::now().timestamp_millis(),
            Uuid::new_v4()
        ));
        let mut file = File::create(&temp_path).await?;
        let written = match self.copy_limited(&mut reader, &mut file).await {
            Ok(written) => written,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };
        drop(file);

        if let Err(err) = fs::rename(&temp_path, self.chunk_path(key, index)).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        debug!(upload_key = %key, chunk_index = index, bytes = written, "chunk stored");
        Ok(written)
    }

    async fn copy_limited<R>(&self, reader: &mut R, file: &mut File) -> Result<u64, ChunkStoreError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            total += read as u64;
            if self.max_chunk_size > 0 && total > self.max_chunk_size {
                return Err(ChunkStoreError::ChunkTooLarge {
                    limit: self.max_chunk_size,
                });
            }
            file.write_all(&buffer[..read]).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(total)
    }

    pub async fn exists(&self, key: &UploadKey, index: u32) -> Result<bool, ChunkStoreError> {
        match fs::metadata(self.chunk_path(key, index)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// 按序号返回全部分片；任一序号缺失时立即以该序号报错。
    pub async fn ordered_chunks(
        &self,
        key: &UploadKey,
        total_chunks: u32,
    ) -> Result<OrderedChunks, ChunkStoreError> {
        for index in 0..total_chunks {
            if !self.exists(key, index).await? {
                return Err(ChunkStoreError::MissingChunk(index));
            }
        }
        Ok(OrderedChunks {
            dir: self.upload_dir(key),
            next: 0,
            total: total_chunks,
        })
    }

    /// 删除整个上传的分片目录，目录不存在视为成功。
    pub async fn purge(&self, key: &UploadKey) -> Result<(), ChunkStoreError> {
        match fs::remove_dir_all(self.upload_dir(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write_manifest(
        &self,
        key: &UploadKey,
        manifest: &UploadManifest,
    ) -> Result<(), ChunkStoreError> {
        let dir = self.upload_dir(key);
        fs::create_dir_all(&dir).await?;
        let content = serde_json::to_vec(manifest)?;
        let temp_path = dir.join(format!(".{MANIFEST_FILE}.{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, content).await?;
        if let Err(err) = fs::rename(&temp_path, dir.join(MANIFEST_FILE)).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// 读取清单与已落盘的分片序号；清单不存在或无法解析时返回 None。
    pub async fn snapshot(&self, key: &UploadKey) -> Result<Option<UploadSnapshot>, ChunkStoreError> {
        let dir = self.upload_dir(key);
        let manifest_bytes = match fs::read(dir.join(MANIFEST_FILE)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let manifest: UploadManifest = match serde_json::from_slice(&manifest_bytes) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(upload_key = %key, error = %err, "ignoring unreadable manifest");
                return Ok(None);
            }
        };

        let mut indices = BTreeSet::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(index) = name
                .to_str()
                .and_then(|name| name.strip_prefix(CHUNK_PREFIX))
                .and_then(|index| index.parse::<u32>().ok())
            else {
                continue;
            };
            if index < manifest.total_chunks {
                indices.insert(index);
            }
        }

        Ok(Some(UploadSnapshot { manifest, indices }))
    }

    /// 列出超过 `ttl` 未更新的上传，`ttl` 为零时不返回任何上传。
    pub async fn stale_uploads(&self, ttl: Duration) -> io::Result<Vec<UploadKey>> {
        let mut stale = Vec::new();
        if ttl.is_zero() || fs::metadata(&self.root).await.is_err() {
            return Ok(stale);
        }

        let now = SystemTime::now();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(|name| UploadKey::parse(name).ok())
            else {
                warn!(path = ?entry.path(), "unexpected entry in chunk root");
                continue;
            };
            let age = match metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
            {
                Some(value) => value,
                None => continue,
            };
            if age >= ttl {
                stale.push(key);
            }
        }

        stale.sort();
        Ok(stale)
    }
}

/// Chunk files of one upload, opened lazily in index order.
#[derive(Debug)]
pub struct OrderedChunks {
    dir: PathBuf,
    next: u32,
    total: u32,
}

impl OrderedChunks {
    /// 打开下一个分片；全部读完后返回 None。
    pub async fn next_chunk(&mut self) -> Option<Result<(u32, File), ChunkStoreError>> {
        if self.next >= self.total {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(open_chunk(&self.dir, index).await)
    }
}

async fn open_chunk(dir: &Path, index: u32) -> Result<(u32, File), ChunkStoreError> {
    match File::open(dir.join(format!("{CHUNK_PREFIX}{index}"))).await {
        Ok(file) => Ok((index, file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(ChunkStoreError::MissingChunk(index))
        }
        Err(err) => Err(err.into()),
    }
}
