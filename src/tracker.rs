//! 上传进度跟踪：记录每个上传的分片总数与已到达的分片序号。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::chunk_store::{UploadKey, UploadSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPhase {
    Receiving,
    Merging,
}

#[derive(Debug)]
struct UploadEntry {
    filename: String,
    total_chunks: u32,
    received: BTreeSet<u32>,
    phase: UploadPhase,
    /// Registered chunk writes that have neither arrived nor been released.
    pending: u32,
}

impl UploadEntry {
    fn new(filename: &str, total_chunks: u32) -> Self {
        Self {
            filename: filename.to_string(),
            total_chunks,
            received: BTreeSet::new(),
            phase: UploadPhase::Receiving,
            pending: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    New,
    Existing,
}

/// Result of recording one chunk arrival.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arrival {
    /// Still waiting for more chunks.
    Progress { received: u32, total_chunks: u32 },
    /// This arrival completed the upload; the caller owns the merge.
    Completed { filename: String, total_chunks: u32 },
    /// Another caller already owns the merge.
    AlreadyMerging { total_chunks: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub filename: String,
    pub total_chunks: u32,
    pub received: u32,
    pub phase: UploadPhase,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("totalChunks {given} does not match recorded value {recorded}")]
    TotalChunksMismatch { recorded: u32, given: u32 },
    #[error("filename {given:?} does not match recorded value {recorded:?}")]
    FilenameMismatch { recorded: String, given: String },
    #[error("chunk index {index} is outside 0..{total_chunks}")]
    IndexOutOfRange { index: u32, total_chunks: u32 },
    #[error("upload {0} is not registered")]
    NotRegistered(String),
}

/// In-memory view of every upload that is still receiving or merging.
///
/// The chunk store stays the source of truth; entries can be rebuilt from it
/// with [`UploadTracker::seed`]. Each upload's state sits behind its own mutex
/// so completion is decided by exactly one caller.
#[derive(Debug, Default)]
pub struct UploadTracker {
    entries: Mutex<HashMap<UploadKey, Arc<Mutex<UploadEntry>>>>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &UploadKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// 用分片存储中的快照重建状态；已有条目时不做任何修改。
    pub async fn seed(&self, key: &UploadKey, snapshot: UploadSnapshot) {
        let mut entries = self.entries.lock().await;
        entries.entry(key.clone()).or_insert_with(|| {
            let mut entry =
                UploadEntry::new(&snapshot.manifest.filename, snapshot.manifest.total_chunks);
            entry.received = snapshot.indices;
            Arc::new(Mutex::new(entry))
        });
    }

    /// 首次调用确定分片总数与文件名，之后的调用必须与之一致。
    ///
    /// A successful registration counts as one pending write until it is
    /// matched by [`record_arrival`](Self::record_arrival) or
    /// [`release`](Self::release).
    pub async fn register(
        &self,
        key: &UploadKey,
        filename: &str,
        total_chunks: u32,
    ) -> Result<Registration, TrackerError> {
        let mut entries = self.entries.lock().await;
        let entry = match entries.get(key) {
            Some(entry) => entry.clone(),
            None => {
                let mut entry = UploadEntry::new(filename, total_chunks);
                entry.pending = 1;
                entries.insert(key.clone(), Arc::new(Mutex::new(entry)));
                return Ok(Registration::New);
            }
        };

        let mut entry = entry.lock().await;
        if entry.total_chunks != total_chunks {
            return Err(TrackerError::TotalChunksMismatch {
                recorded: entry.total_chunks,
                given: total_chunks,
            });
        }
        if entry.filename != filename {
            return Err(TrackerError::FilenameMismatch {
                recorded: entry.filename.clone(),
                given: filename.to_string(),
            });
        }
        entry.pending += 1;
        Ok(Registration::Existing)
    }

    /// 记录分片到达；按不同序号的数量判断是否完整，而不是看最后一个序号。
    pub async fn record_arrival(
        &self,
        key: &UploadKey,
        index: u32,
        total_chunks: u32,
    ) -> Result<Arrival, TrackerError> {
        let entry = self.entry(key).await?;
        let mut entry = entry.lock().await;
        if entry.total_chunks != total_chunks {
            return Err(TrackerError::TotalChunksMismatch {
                recorded: entry.total_chunks,
                given: total_chunks,
            });
        }
        if index >= entry.total_chunks {
            return Err(TrackerError::IndexOutOfRange {
                index,
                total_chunks: entry.total_chunks,
            });
        }

        entry.pending = entry.pending.saturating_sub(1);
        entry.received.insert(index);
        if entry.phase == UploadPhase::Merging {
            return Ok(Arrival::AlreadyMerging {
                total_chunks: entry.total_chunks,
            });
        }
        if entry.is_complete() {
            entry.phase = UploadPhase::Merging;
            return Ok(Arrival::Completed {
                filename: entry.filename.clone(),
                total_chunks: entry.total_chunks,
            });
        }
        Ok(Arrival::Progress {
            received: entry.received.len() as u32,
            total_chunks: entry.total_chunks,
        })
    }

    /// 合并失败后回到接收状态；已确认缺失的分片从记录中移除。
    pub async fn merge_failed(&self, key: &UploadKey, missing_index: Option<u32>) {
        let Ok(entry) = self.entry(key).await else {
            return;
        };
        let mut entry = entry.lock().await;
        entry.phase = UploadPhase::Receiving;
        if let Some(index) = missing_index {
            entry.received.remove(&index);
        }
    }

    pub async fn forget(&self, key: &UploadKey) {
        self.entries.lock().await.remove(key);
    }

    /// 分片写入失败后释放登记；没有已到达分片且没有其他写入时撤销整个上传。
    ///
    /// Returns true when the upload was dropped, so its on-disk state holds no
    /// received chunk.
    pub async fn release(&self, key: &UploadKey) -> bool {
        let mut entries = self.entries.lock().await;
        let abandoned = match entries.get(key) {
            Some(entry) => {
                let mut entry = entry.lock().await;
                entry.pending = entry.pending.saturating_sub(1);
                entry.pending == 0
                    && entry.received.is_empty()
                    && entry.phase == UploadPhase::Receiving
            }
            None => false,
        };
        if abandoned {
            entries.remove(key);
        }
        abandoned
    }

    pub async fn phase(&self, key: &UploadKey) -> Option<UploadPhase> {
        let entry = self.entry(key).await.ok()?;
        let entry = entry.lock().await;
        Some(entry.phase)
    }

    pub async fn progress(&self, key: &UploadKey) -> Option<Progress> {
        let entry = self.entry(key).await.ok()?;
        let entry = entry.lock().await;
        Some(Progress {
            filename: entry.filename.clone(),
            total_chunks: entry.total_chunks,
            received: entry.received.len() as u32,
            phase: entry.phase,
        })
    }

    async fn entry(&self, key: &UploadKey) -> Result<Arc<Mutex<UploadEntry>>, TrackerError> {
        self.entries
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| TrackerError::NotRegistered(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::UploadManifest;
    use futures_util::future::join_all;

    fn key(value: &str) -> UploadKey {
        UploadKey::parse(value).expect("valid key")
    }

    #[tokio::test]
    async fn completion_counts_distinct_indices() {
        let tracker = UploadTracker::new();
        let upload = key("u1");
        tracker.register(&upload, "f.bin", 3).await.expect("register");

        let last_index_first = tracker.record_arrival(&upload, 2, 3).await.expect("record");
        assert_eq!(
            last_index_first,
            Arrival::Progress {
                received: 1,
                total_chunks: 3
            }
        );
        let duplicate = tracker.record_arrival(&upload, 2, 3).await.expect("record");
        assert_eq!(
            duplicate,
            Arrival::Progress {
                received: 1,
                total_chunks: 3
            }
        );
        tracker.record_arrival(&upload, 0, 3).await.expect("record");
        let done = tracker.record_arrival(&upload, 1, 3).await.expect("record");
        assert_eq!(
            done,
            Arrival::Completed {
                filename: "f.bin".into(),
                total_chunks: 3
            }
        );
        assert_eq!(tracker.phase(&upload).await, Some(UploadPhase::Merging));
    }

    #[tokio::test]
    async fn register_rejects_mismatched_total_and_keeps_first() {
        let tracker = UploadTracker::new();
        let upload = key("u1");
        assert_eq!(
            tracker.register(&upload, "f.bin", 3).await,
            Ok(Registration::New)
        );
        assert_eq!(
            tracker.register(&upload, "f.bin", 4).await,
            Err(TrackerError::TotalChunksMismatch {
                recorded: 3,
                given: 4
            })
        );
        assert!(matches!(
            tracker.register(&upload, "other.bin", 3).await,
            Err(TrackerError::FilenameMismatch { .. })
        ));
        assert_eq!(
            tracker.register(&upload, "f.bin", 3).await,
            Ok(Registration::Existing)
        );
        let progress = tracker.progress(&upload).await.expect("progress");
        assert_eq!(progress.total_chunks, 3);
    }

    #[tokio::test]
    async fn concurrent_final_arrivals_complete_once() {
        let tracker = Arc::new(UploadTracker::new());
        let upload = key("u1");
        tracker.register(&upload, "f.bin", 64).await.expect("register");

        let tasks = (0..64u32).map(|index| {
            let tracker = tracker.clone();
            let upload = upload.clone();
            tokio::spawn(async move { tracker.record_arrival(&upload, index, 64).await })
        });
        let completed = join_all(tasks)
            .await
            .into_iter()
            .map(|result| result.expect("join").expect("record"))
            .filter(|arrival| matches!(arrival, Arrival::Completed { .. }))
            .count();

        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn merging_upload_reports_already_merging_until_failure() {
        let tracker = UploadTracker::new();
        let upload = key("u1");
        tracker.register(&upload, "f.bin", 2).await.expect("register");
        tracker.record_arrival(&upload, 0, 2).await.expect("record");
        tracker.record_arrival(&upload, 1, 2).await.expect("record");

        let again = tracker.record_arrival(&upload, 1, 2).await.expect("record");
        assert_eq!(again, Arrival::AlreadyMerging { total_chunks: 2 });

        tracker.merge_failed(&upload, Some(0)).await;
        let progress = tracker.progress(&upload).await.expect("progress");
        assert_eq!(progress.phase, UploadPhase::Receiving);
        assert_eq!(progress.received, 1);

        let retry = tracker.record_arrival(&upload, 0, 2).await.expect("record");
        assert!(matches!(retry, Arrival::Completed { .. }));
    }

    #[tokio::test]
    async fn seed_restores_state_without_overwriting() {
        let tracker = UploadTracker::new();
        let upload = key("u1");
        let snapshot = UploadSnapshot {
            manifest: UploadManifest::new("f.bin", 3),
            indices: BTreeSet::from([0, 1]),
        };
        tracker.seed(&upload, snapshot.clone()).await;
        assert_eq!(
            tracker.register(&upload, "f.bin", 3).await,
            Ok(Registration::Existing)
        );
        tracker.record_arrival(&upload, 2, 3).await.expect("record");

        tracker.seed(&upload, snapshot).await;
        assert_eq!(tracker.phase(&upload).await, Some(UploadPhase::Merging));
    }

    #[tokio::test]
    async fn record_arrival_requires_registration_and_range() {
        let tracker = UploadTracker::new();
        let upload = key("u1");
        assert!(matches!(
            tracker.record_arrival(&upload, 0, 1).await,
            Err(TrackerError::NotRegistered(_))
        ));

        tracker.register(&upload, "f.bin", 2).await.expect("register");
        assert_eq!(
            tracker.record_arrival(&upload, 2, 2).await,
            Err(TrackerError::IndexOutOfRange {
                index: 2,
                total_chunks: 2
            })
        );

        assert!(tracker.release(&upload).await);
        assert!(!tracker.contains(&upload).await);
    }

    #[tokio::test]
    async fn release_keeps_upload_while_other_writes_are_pending() {
        let tracker = UploadTracker::new();
        let upload = key("u1");
        assert_eq!(
            tracker.register(&upload, "f.bin", 3).await,
            Ok(Registration::New)
        );
        assert_eq!(
            tracker.register(&upload, "f.bin", 3).await,
            Ok(Registration::Existing)
        );

        assert!(!tracker.release(&upload).await);
        assert!(tracker.contains(&upload).await);

        tracker.record_arrival(&upload, 1, 3).await.expect("record");
        tracker.register(&upload, "f.bin", 3).await.expect("register");
        assert!(!tracker.release(&upload).await);
        assert_eq!(tracker.progress(&upload).await.map(|p| p.received), Some(1));
    }

    #[tokio::test]
    async fn released_first_write_frees_the_total() {
        let tracker = UploadTracker::new();
        let upload = key("u1");
        tracker.register(&upload, "f.bin", 3).await.expect("register");
        assert!(tracker.release(&upload).await);

        assert_eq!(
            tracker.register(&upload, "f.bin", 4).await,
            Ok(Registration::New)
        );
        assert_eq!(tracker.progress(&upload).await.map(|p| p.total_chunks), Some(4));
    }
}
