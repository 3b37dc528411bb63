//! 按上传键划分的读写锁：分片写入共享，合并与清理独占。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time;

/// Manages asynchronous read/write locks keyed by upload key.
///
/// Chunk writes for one upload hold the read side and run in parallel; a merge
/// or purge holds the write side and excludes every writer of that upload.
/// Locks of different uploads never interact.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

/// Lock acquisition did not finish within the allowed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout;

impl LockManager {
    /// 创建新的锁管理器实例。
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在超时时间内获取共享锁。
    pub async fn read_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockReadGuard<()>, LockTimeout> {
        let lock = self.lock_for(key).await;
        time::timeout(timeout, lock.read_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// 在超时时间内获取独占锁。
    pub async fn write_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockWriteGuard<()>, LockTimeout> {
        let lock = self.lock_for(key).await;
        time::timeout(timeout, lock.write_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// 立即尝试获取独占锁，已被占用时返回 None。
    pub async fn try_write(&self, key: &str) -> Option<OwnedRwLockWriteGuard<()>> {
        self.lock_for(key).await.try_write_owned().ok()
    }

    /// 移除当前没有任何持有者的锁条目，返回移除数量。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    async fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn readers_share_the_same_key() {
        let manager = LockManager::new();
        let first = manager.read_with_timeout("a", WAIT).await;
        let second = manager.read_with_timeout("a", WAIT).await;
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn writer_excludes_readers_of_same_key_only() {
        let manager = LockManager::new();
        let _writer = manager
            .write_with_timeout("a", WAIT)
            .await
            .expect("writer");

        assert_eq!(
            manager.read_with_timeout("a", WAIT).await.err(),
            Some(LockTimeout)
        );
        assert!(manager.try_write("a").await.is_none());
        assert!(manager.read_with_timeout("b", WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn prune_idle_keeps_held_locks() {
        let manager = LockManager::new();
        let held = manager.read_with_timeout("held", WAIT).await.expect("held");
        drop(manager.read_with_timeout("idle", WAIT).await.expect("idle"));

        assert_eq!(manager.prune_idle().await, 1);
        drop(held);
        assert_eq!(manager.prune_idle().await, 1);
    }
}
