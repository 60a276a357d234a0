use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::StoreError;

/// Document-wide mutual exclusion with a bounded wait.
#[async_trait]
pub trait DocumentLock: Send + Sync {
    /// `Ok(None)` when the lock is still held elsewhere after `wait`.
    async fn try_acquire(&self, wait: Duration) -> Result<Option<LockGuard>, StoreError>;
}

/// Held lock. Released on drop, so every exit path gives it back.
#[derive(Debug)]
pub struct LockGuard {
    inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    File { file: File, path: PathBuf },
    Memory(OwnedMutexGuard<()>),
}

impl LockGuard {
    pub fn release(self) {
        drop(self);
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.inner {
            GuardInner::File { path, .. } => Some(path),
            GuardInner::Memory(_) => None,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let GuardInner::File { file, .. } = &self.inner {
            let _ = FileExt::unlock(file);
        }
    }
}

/// Advisory exclusive lock on a lock file next to the workbook.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    poll_every: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_every: Duration::from_millis(50),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentLock for FileLock {
    async fn try_acquire(&self, wait: Duration) -> Result<Option<LockGuard>, StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.path)
                .with_context(|| format!("opening lock file {}", self.path.display()))?;

            if FileExt::try_lock_exclusive(&file).is_ok() {
                return Ok(Some(LockGuard {
                    inner: GuardInner::File {
                        file,
                        path: self.path.clone(),
                    },
                }));
            }

            let elapsed = start.elapsed();
            if elapsed >= wait {
                debug!(path = %self.path.display(), ?elapsed, "document lock still held");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_every.min(wait - elapsed)).await;
        }
    }
}

/// In-process lock for embedders and tests that share one store instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    mutex: Arc<Mutex<()>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentLock for MemoryLock {
    async fn try_acquire(&self, wait: Duration) -> Result<Option<LockGuard>, StoreError> {
        match tokio::time::timeout(wait, Arc::clone(&self.mutex).lock_owned()).await {
            Ok(guard) => Ok(Some(LockGuard {
                inner: GuardInner::Memory(guard),
            })),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_lock_is_exclusive_until_released() {
        let dir = tempdir().expect("tempdir");
        let lock = FileLock::new(dir.path().join("locks").join(".palq.lock"));

        let held = lock
            .try_acquire(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("first acquire");
        assert!(held.path().is_some());

        let contended = lock.try_acquire(Duration::from_millis(120)).await.unwrap();
        assert!(contended.is_none());

        held.release();
        let again = lock.try_acquire(Duration::from_millis(100)).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn memory_lock_times_out_while_held() {
        let lock = MemoryLock::new();
        let shared = lock.clone();

        let held = lock.try_acquire(Duration::from_millis(10)).await.unwrap();
        assert!(held.is_some());
        assert!(shared
            .try_acquire(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        drop(held);
        assert!(shared
            .try_acquire(Duration::from_millis(20))
            .await
            .unwrap()
            .is_some());
    }
}
