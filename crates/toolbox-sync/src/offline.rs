//! Offline write capture.
//!
//! [`QueueingStore`] wraps the real data facade: reads pass straight
//! through, and a write that fails with a connectivity-shaped error is
//! parked in the durable queue instead of surfacing. The caller sees the
//! write as accepted; the replay engine delivers it later.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{MutationOp, SyncQueue, SyncError};
use toolbox_data::{
    AuthCallback, ChangeCallback, Collection, DataError, DataStore, Record, Subscription,
};

/// A facade wrapper that turns offline write failures into queued work.
pub struct QueueingStore {
    inner: Arc<dyn DataStore>,
    queue: Arc<SyncQueue>,
}

impl QueueingStore {
    /// Wrap `inner`, parking offline writes in `queue`.
    pub fn new(inner: Arc<dyn DataStore>, queue: Arc<SyncQueue>) -> Self {
        Self { inner, queue }
    }

    /// The queue offline writes land in.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    async fn park(
        &self,
        collection: Collection,
        op: MutationOp,
        cause: &DataError,
    ) -> Result<(), DataError> {
        warn!(%collection, error = %cause, "Write failed offline; queueing for sync");
        self.queue
            .enqueue(collection, op)
            .await
            .map_err(queue_failure)?;
        Ok(())
    }
}

/// A queue persistence failure while parking a write.
///
/// At this point the write failed both remotely and locally; surface the
/// local failure, since the caller's data would otherwise be lost silently.
fn queue_failure(err: SyncError) -> DataError {
    DataError::Remote(format!("failed to queue offline write: {err}"))
}

#[async_trait]
impl DataStore for QueueingStore {
    async fn list(&self, collection: Collection) -> Result<Vec<Record>, DataError> {
        self.inner.list(collection).await
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, DataError> {
        self.inner.get(collection, id).await
    }

    async fn save(&self, collection: Collection, record: Record) -> Result<Record, DataError> {
        match self.inner.save(collection, record.clone()).await {
            Ok(saved) => Ok(saved),
            Err(e) if e.is_transient() => {
                self.park(collection, MutationOp::Save { record: record.clone() }, &e)
                    .await?;
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: JsonValue,
    ) -> Result<JsonValue, DataError> {
        match self.inner.update(collection, id, patch.clone()).await {
            Ok(applied) => Ok(applied),
            Err(e) if e.is_transient() => {
                self.park(
                    collection,
                    MutationOp::Update {
                        id: id.to_string(),
                        patch: patch.clone(),
                    },
                    &e,
                )
                .await?;
                Ok(patch)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), DataError> {
        match self.inner.delete(collection, id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                self.park(collection, MutationOp::Delete { id: id.to_string() }, &e)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn subscribe(
        &self,
        collection: Collection,
        callback: ChangeCallback,
    ) -> Result<Subscription, DataError> {
        self.inner.subscribe(collection, callback).await
    }

    async fn login(&self, username: &str, password: &str) -> Result<Option<Record>, DataError> {
        self.inner.login(username, password).await
    }

    async fn logout(&self) -> Result<(), DataError> {
        self.inner.logout().await
    }

    async fn current_user(&self) -> Result<Option<Record>, DataError> {
        self.inner.current_user().await
    }

    async fn on_auth_change(&self, callback: AuthCallback) -> Result<Subscription, DataError> {
        self.inner.on_auth_change(callback).await
    }
}
