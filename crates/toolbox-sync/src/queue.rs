//! Durable FIFO queue of pending mutations.
//!
//! The queue file is plain JSON, rewritten atomically (write to a temp
//! file, fsync, rename) on every change so a torn write can never corrupt
//! the queue. Worker instances are disposable; the file is the state.

use std::path::{Path, PathBuf};
use std::{fs, io::Write};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{now_millis, MutationOp, PendingMutation, SyncError};
use toolbox_data::Collection;

/// On-disk shape of the queue.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    /// Next mutation id to assign.
    next_id: u64,
    /// Pending mutations, oldest first.
    items: Vec<PendingMutation>,
}

/// A durable, ordered queue of deferred writes.
pub struct SyncQueue {
    path: PathBuf,
    inner: RwLock<QueueFile>,
}

impl SyncQueue {
    /// Open the queue at `path`, reading any existing contents.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let file = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let file: QueueFile = serde_json::from_str(&contents)?;
            info!(path = %path.display(), pending = file.items.len(), "Loaded sync queue");
            file
        } else {
            QueueFile {
                next_id: 1,
                items: Vec::new(),
            }
        };

        Ok(Self {
            path,
            inner: RwLock::new(file),
        })
    }

    /// Append a mutation. Assigns its id and persists before returning.
    pub async fn enqueue(
        &self,
        collection: Collection,
        op: MutationOp,
    ) -> Result<PendingMutation, SyncError> {
        let mut inner = self.inner.write().await;

        let mutation = PendingMutation {
            id: inner.next_id,
            collection,
            op,
            queued_at: now_millis(),
        };
        inner.next_id += 1;
        inner.items.push(mutation.clone());

        persist(&self.path, &inner)?;
        debug!(id = mutation.id, %collection, "Queued mutation");

        Ok(mutation)
    }

    /// The oldest pending mutation, if any.
    pub async fn front(&self) -> Option<PendingMutation> {
        self.inner.read().await.items.first().cloned()
    }

    /// Remove a replayed mutation by id and persist.
    ///
    /// Returns whether the id was present. Called only after the replay of
    /// that mutation succeeded.
    pub async fn ack(&self, id: u64) -> Result<bool, SyncError> {
        let mut inner = self.inner.write().await;

        let before = inner.items.len();
        inner.items.retain(|m| m.id != id);
        let removed = inner.items.len() != before;

        if removed {
            persist(&self.path, &inner)?;
            debug!(id, remaining = inner.items.len(), "Acked mutation");
        }

        Ok(removed)
    }

    /// Number of pending mutations.
    pub async fn len(&self) -> usize {
        self.inner.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.items.is_empty()
    }

    /// Snapshot of the pending mutations, oldest first.
    pub async fn items(&self) -> Vec<PendingMutation> {
        self.inner.read().await.items.clone()
    }
}

/// Atomically rewrite the queue file.
fn persist(path: &Path, file: &QueueFile) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(file)?;

    let temp_path = path.with_extension("tmp");
    let mut temp = fs::File::create(&temp_path)?;
    temp.write_all(json.as_bytes())?;
    temp.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}
