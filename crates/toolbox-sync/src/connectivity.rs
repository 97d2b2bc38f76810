//! Connectivity monitoring.
//!
//! A binary state machine driven solely by platform online/offline events.
//! Going offline raises the banner; coming back online clears it and
//! registers the deferred-completions sync tag so queued work runs when
//! the platform next schedules the worker.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::{SyncRegistry, SYNC_COMPLETIONS_TAG};

/// Banner text shown while offline.
pub const OFFLINE_BANNER: &str = "Offline Mode - Changes will sync when online";

/// Process-wide connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityState {
    #[default]
    Online,
    Offline,
}

/// Emitted on every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Back online; the indicator should clear.
    Online,
    /// Gone offline; the indicator should show `banner`.
    Offline { banner: String },
}

/// Tracks online/offline transitions and schedules deferred sync.
pub struct ConnectivityMonitor {
    state: Arc<RwLock<ConnectivityState>>,
    registry: SyncRegistry,
    event_tx: mpsc::UnboundedSender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting online.
    pub fn new(registry: SyncRegistry) -> (Self, mpsc::UnboundedReceiver<ConnectivityEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(RwLock::new(ConnectivityState::Online)),
                registry,
                event_tx,
            },
            event_rx,
        )
    }

    /// Current state.
    pub async fn state(&self) -> ConnectivityState {
        *self.state.read().await
    }

    pub async fn is_offline(&self) -> bool {
        self.state().await == ConnectivityState::Offline
    }

    /// Banner text to display, if any.
    pub async fn indicator(&self) -> Option<&'static str> {
        match self.state().await {
            ConnectivityState::Offline => Some(OFFLINE_BANNER),
            ConnectivityState::Online => None,
        }
    }

    /// Platform reported the network is gone.
    pub async fn went_offline(&self) {
        let mut state = self.state.write().await;
        if *state == ConnectivityState::Offline {
            return;
        }
        *state = ConnectivityState::Offline;
        drop(state);

        warn!("Gone offline");
        let _ = self.event_tx.send(ConnectivityEvent::Offline {
            banner: OFFLINE_BANNER.to_string(),
        });
    }

    /// Platform reported the network is back.
    ///
    /// Registers the deferred-completions tag fire-and-forget; a failed
    /// registration is logged, never surfaced.
    pub async fn went_online(&self) {
        let mut state = self.state.write().await;
        if *state == ConnectivityState::Online {
            return;
        }
        *state = ConnectivityState::Online;
        drop(state);

        info!("Back online");
        let _ = self.event_tx.send(ConnectivityEvent::Online);

        self.registry.register(SYNC_COMPLETIONS_TAG).await;
    }
}
