//! Namespaced blob storage: one opaque JSON string per namespace.

use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::StoreError;

/// Async get/set of whole blobs keyed by namespace. Absence is `Ok(None)`, not an error.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, namespace: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, namespace: &str, blob: String) -> Result<(), StoreError>;
    async fn remove(&self, namespace: &str) -> Result<(), StoreError>;
}

/// Stores each namespace as `<dir>/<namespace>.json`.
///
/// Writes land in a temp file that is renamed over the target while holding an exclusive
/// lock on `<dir>/.lock`, so another process sharing the directory never sees a torn file.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{}.json", namespace))
    }
}

fn write_locked(dir: &Path, path: &Path, blob: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(dir.join(".lock"))?;
    lock.lock_exclusive()?;
    let tmp = path.with_extension("json.tmp");
    let result = std::fs::write(&tmp, blob).and_then(|_| std::fs::rename(&tmp, path));
    let _ = lock.unlock();
    result
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, namespace: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(namespace);
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn set(&self, namespace: &str, blob: String) -> Result<(), StoreError> {
        let dir = self.dir.clone();
        let path = self.path_for(namespace);
        tokio::task::spawn_blocking(move || write_locked(&dir, &path, &blob))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        Ok(())
    }

    async fn remove(&self, namespace: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(namespace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// In-process backend for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `get` fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `set`/`remove` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw blob currently stored under `namespace`.
    pub fn raw(&self, namespace: &str) -> Option<String> {
        self.blobs
            .lock()
            .ok()
            .and_then(|g| g.get(namespace).cloned())
    }

    fn blobs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.blobs
            .lock()
            .map_err(|_| StoreError::Unavailable("memory backend poisoned".to_string()))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, namespace: &str) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(self.blobs()?.get(namespace).cloned())
    }

    async fn set(&self, namespace: &str, blob: String) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.blobs()?.insert(namespace.to_string(), blob);
        Ok(())
    }

    async fn remove(&self, namespace: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        self.blobs()?.remove(namespace);
        Ok(())
    }
}
