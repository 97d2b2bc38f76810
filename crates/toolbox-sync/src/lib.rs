//! # Toolbox Sync
//!
//! Connectivity tracking and deferred background sync for the toolbox app
//! shell.
//!
//! ## Architecture
//!
//! ```text
//! ConnectivityMonitor ── online ──→ SyncRegistry ("sync-completions")
//!                                        │ sync event fires
//! QueueingStore ── offline write ──→ SyncQueue (durable FIFO)
//!                                        │
//!                                   ReplayEngine ──→ DataStore
//! ```
//!
//! Writes that fail while offline land in a durable FIFO queue; when the
//! platform fires the registered sync tag, the replay engine drains the
//! queue in order against the data facade, removing each item only after
//! its replay succeeds.

use std::sync::Arc;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use toolbox_data::{Collection, Record};

pub mod connectivity;
pub mod offline;
pub mod queue;
pub mod replay;

pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityState, OFFLINE_BANNER};
pub use offline::QueueingStore;
pub use queue::SyncQueue;
pub use replay::{ReplayEngine, ReplayOutcome};

/// The tag under which deferred completion sync is registered.
pub const SYNC_COMPLETIONS_TAG: &str = "sync-completions";

// ==================== Errors ====================

/// Errors that can occur in the sync subsystem.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ==================== Pending mutations ====================

/// A deferred write, exactly as it will be replayed against the facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MutationOp {
    /// Full-record store.
    Save { record: Record },
    /// Field merge into an existing record.
    Update { id: String, patch: JsonValue },
    /// Record removal.
    Delete { id: String },
}

/// One queued unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Monotonic id, assigned at enqueue time and stable across reloads.
    pub id: u64,
    pub collection: Collection,
    pub op: MutationOp,
    /// When the mutation was queued (ms since epoch).
    pub queued_at: u64,
}

// ==================== SyncRegistry ====================

/// Registered deferred-work tags.
///
/// Registration is idempotent: at most one pending registration per tag is
/// meaningful, so re-registering an already pending tag is a no-op.
#[derive(Debug, Clone, Default)]
pub struct SyncRegistry {
    tags: Arc<RwLock<HashSet<String>>>,
}

impl SyncRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tag. Returns whether it was newly registered.
    pub async fn register(&self, tag: &str) -> bool {
        let newly = self.tags.write().await.insert(tag.to_string());
        debug!(tag, newly, "Sync tag registered");
        newly
    }

    /// Mark a tag as fulfilled. Returns whether it was pending.
    pub async fn resolve(&self, tag: &str) -> bool {
        self.tags.write().await.remove(tag)
    }

    /// Whether a tag is currently pending.
    pub async fn is_registered(&self, tag: &str) -> bool {
        self.tags.read().await.contains(tag)
    }

    /// All pending tags.
    pub async fn pending(&self) -> Vec<String> {
        self.tags.read().await.iter().cloned().collect()
    }
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
