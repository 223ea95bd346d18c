/// Local key/value cache and the serialized storage queue in front of it
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Result, SyncError};

/// Committed tile values.
pub const PLANNER_DATA_KEY: &str = "hangarPlannerData";
/// Undo/redo stacks.
pub const HISTORY_KEY: &str = "hangarHistory";
/// Persisted role toggles.
pub const SYNC_SETTINGS_KEY: &str = "hangarSyncSettings";

/// Provisional client-side cache. Never a source of truth.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value, bypassing the queue.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: impl Into<String>) {
        self.entries.lock().insert(key.to_string(), value.into());
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.put(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SyncError::Storage(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl LocalStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Storage(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Storage(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePriority {
    Normal,
    /// Jumps ahead of every queued normal operation.
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOpKind {
    Save(String),
    Load,
    Remove,
}

/// A queued storage request and the channel its result goes back on.
#[derive(Debug)]
pub struct PendingStorageOperation {
    pub kind: StorageOpKind,
    pub key: String,
    pub enqueued_at: Instant,
    reply: oneshot::Sender<Result<Option<String>>>,
}

/// Serializes all access to a [`LocalStore`]: one operation in flight, FIFO
/// within a priority, high priority first, and a short pause between
/// operations.
pub struct StorageQueue {
    high: mpsc::UnboundedSender<PendingStorageOperation>,
    normal: mpsc::UnboundedSender<PendingStorageOperation>,
    pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl StorageQueue {
    pub fn start(store: Arc<dyn LocalStore>, pause: Duration) -> Self {
        let (high_tx, mut high_rx) = mpsc::unbounded_channel::<PendingStorageOperation>();
        let (normal_tx, mut normal_rx) = mpsc::unbounded_channel::<PendingStorageOperation>();
        let pending = Arc::new(AtomicUsize::new(0));
        let in_queue = Arc::clone(&pending);

        let worker = tokio::spawn(async move {
            loop {
                let op = tokio::select! {
                    biased;
                    Some(op) = high_rx.recv() => op,
                    Some(op) = normal_rx.recv() => op,
                    else => break,
                };

                let result = match &op.kind {
                    StorageOpKind::Save(payload) => {
                        store.set(&op.key, payload.clone()).await.map(|_| None)
                    }
                    StorageOpKind::Load => store.get(&op.key).await,
                    StorageOpKind::Remove => store.remove(&op.key).await.map(|_| None),
                };
                debug!(
                    "storage op on {} finished after {:?}",
                    op.key,
                    op.enqueued_at.elapsed()
                );
                in_queue.fetch_sub(1, Ordering::SeqCst);
                // The caller may have gone away; the operation still happened.
                let _ = op.reply.send(result);

                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        });

        Self {
            high: high_tx,
            normal: normal_tx,
            pending,
            worker,
        }
    }

    /// Operations queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn submit(
        &self,
        kind: StorageOpKind,
        key: &str,
        priority: StoragePriority,
    ) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        let op = PendingStorageOperation {
            kind,
            key: key.to_string(),
            enqueued_at: Instant::now(),
            reply,
        };
        let lane = match priority {
            StoragePriority::High => &self.high,
            StoragePriority::Normal => &self.normal,
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if lane.send(op).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(SyncError::Storage("storage queue stopped".to_string()));
        }
        rx.await
            .map_err(|_| SyncError::Storage("storage queue dropped the operation".to_string()))?
    }

    pub async fn save<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        priority: StoragePriority,
    ) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.submit(StorageOpKind::Save(payload), key, priority).await?;
        Ok(())
    }

    pub async fn load_raw(&self, key: &str, priority: StoragePriority) -> Result<Option<String>> {
        self.submit(StorageOpKind::Load, key, priority).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.submit(StorageOpKind::Remove, key, StoragePriority::High)
            .await?;
        Ok(())
    }

    /// Load and decode. A corrupt entry is removed and reported as absent so
    /// the caller falls back to defaults.
    pub async fn load_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.load_raw(key, StoragePriority::High).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let err = SyncError::InvalidPersistedJson {
                    key: key.to_string(),
                    reason: e.to_string(),
                };
                warn!("{}; removing entry", err);
                self.remove(key).await?;
                Ok(None)
            }
        }
    }
}

impl Drop for StorageQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
