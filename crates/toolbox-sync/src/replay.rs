//! Queue replay.
//!
//! When the platform fires the registered sync tag, the replay engine
//! drains the pending-mutation queue in FIFO order against the data
//! facade. An item is removed only after its replay succeeds; the first
//! failure halts the drain and re-registers the tag, so delivery is
//! at-least-once and in-order, with later retries picking up where the
//! halt happened.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{PendingMutation, MutationOp, SyncError, SyncQueue, SyncRegistry, SYNC_COMPLETIONS_TAG};
use toolbox_common::RetryConfig;
use toolbox_data::{DataError, DataStore};

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Every pending mutation was delivered.
    Drained { replayed: usize },
    /// A mutation failed; the rest stay queued and the tag is re-registered.
    Halted { replayed: usize, remaining: usize },
}

/// Drains the sync queue against the data facade.
pub struct ReplayEngine {
    queue: Arc<SyncQueue>,
    store: Arc<dyn DataStore>,
    registry: SyncRegistry,
    retry: RetryConfig,
    /// Consecutive halted drains; paces re-registration. A scheduling hint
    /// only — the queue itself is the durable state.
    consecutive_failures: AtomicU32,
}

impl ReplayEngine {
    /// Create an engine with the default re-registration backoff.
    pub fn new(queue: Arc<SyncQueue>, store: Arc<dyn DataStore>, registry: SyncRegistry) -> Self {
        Self {
            queue,
            store,
            registry,
            retry: RetryConfig::default(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Override the re-registration backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Entry point for a fired sync event.
    ///
    /// Firing consumes the registration; a halted drain re-registers.
    /// Unknown tags are ignored.
    pub async fn handle_sync(&self, tag: &str) -> Result<ReplayOutcome, SyncError> {
        if tag != SYNC_COMPLETIONS_TAG {
            debug!(tag, "Ignoring unknown sync tag");
            return Ok(ReplayOutcome::Drained { replayed: 0 });
        }

        self.registry.resolve(tag).await;
        self.replay().await
    }

    /// Drain the queue in order, acking each item after it lands.
    pub async fn replay(&self) -> Result<ReplayOutcome, SyncError> {
        let mut replayed = 0;

        while let Some(mutation) = self.queue.front().await {
            match self.apply(&mutation).await {
                Ok(()) => {
                    self.queue.ack(mutation.id).await?;
                    replayed += 1;
                }
                Err(e) => {
                    let remaining = self.queue.len().await;
                    warn!(
                        id = mutation.id,
                        collection = %mutation.collection,
                        error = %e,
                        replayed,
                        remaining,
                        "Replay halted"
                    );
                    self.schedule_retry().await;
                    return Ok(ReplayOutcome::Halted { replayed, remaining });
                }
            }
        }

        self.consecutive_failures.store(0, Ordering::Relaxed);
        if replayed > 0 {
            info!(replayed, "Sync queue drained");
        }
        Ok(ReplayOutcome::Drained { replayed })
    }

    async fn apply(&self, mutation: &PendingMutation) -> Result<(), DataError> {
        match &mutation.op {
            MutationOp::Save { record } => {
                self.store.save(mutation.collection, record.clone()).await?;
            }
            MutationOp::Update { id, patch } => {
                self.store
                    .update(mutation.collection, id, patch.clone())
                    .await?;
            }
            MutationOp::Delete { id } => {
                self.store.delete(mutation.collection, id).await?;
            }
        }
        Ok(())
    }

    /// Re-register the tag so the platform schedules another attempt,
    /// backing off as consecutive drains keep failing.
    async fn schedule_retry(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.retry.delay_for_attempt(failures + 1);

        if delay.is_zero() {
            self.registry.register(SYNC_COMPLETIONS_TAG).await;
            return;
        }

        debug!(?delay, failures, "Re-registering sync tag after backoff");
        let registry = self.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.register(SYNC_COMPLETIONS_TAG).await;
        });
    }
}
