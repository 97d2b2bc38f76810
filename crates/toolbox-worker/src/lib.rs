//! # Toolbox Worker
//!
//! The installable app shell worker of the toolbox app.
//!
//! ## Responsibilities
//!
//! - **Lifecycle**: install (pre-populate the versioned asset cache from a
//!   fixed manifest, atomically), activate (delete stale generations, claim
//!   consumers)
//! - **Fetch interception**: cache-first, network fallback, offline
//!   fallback page
//! - **Push**: payload → user-visible notification; click focuses or opens
//!   the app
//! - **Sync dispatch**: fired sync tags run the deferred-mutation replay
//!
//! ## Architecture
//!
//! ```text
//! ShellWorker (one per instance, torn down between events)
//!     ├── CacheStorage        durable asset generations
//!     ├── Arc<dyn Fetch>      network seam
//!     ├── Consumers           controlled pages
//!     └── ReplayEngine        deferred sync drain
//! ```
//!
//! A worker instance holds no durable state of its own: everything that
//! must survive lives in the cache storage or the sync queue, and every
//! handler receives its context through the instance rather than globals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use toolbox_cache::{CacheKey, CacheStorage, CacheVersion, CachedResponse};
use toolbox_net::{Fetch, NetError, Request, Response};
use toolbox_sync::{ReplayEngine, ReplayOutcome};

// ==================== Errors ====================

/// Errors that can occur in the app shell worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Manifest entry {url} not cacheable: {reason}")]
    ManifestEntry { url: String, reason: String },

    #[error("Fetch failed with no offline fallback: {0}")]
    FetchFailed(String),

    #[error("Invalid state: {0}")]
    StateError(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Sync error: {0}")]
    Sync(#[from] toolbox_sync::SyncError),
}

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Pre-populating the asset cache.
    #[default]
    Installing,
    /// Installed; waiting to take over (skipped immediately here).
    Waiting,
    /// Cleaning stale generations and claiming consumers.
    Activating,
    /// Serving fetches.
    Active,
    /// Install failed; a prior version keeps serving.
    Redundant,
}

// ==================== Config ====================

/// Deploy-time inputs of one worker build.
///
/// The cache version is an explicit value compared against the enumerated
/// generations, never discovered by string-matching at runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The generation this build serves.
    pub version: CacheVersion,
    /// Origin whose responses may enter the cache at runtime.
    pub origin: Url,
    /// Asset URLs pre-fetched at install time.
    pub manifest: Vec<Url>,
    /// Served when the network fails and the request is not cached.
    pub offline_fallback: Url,
    /// Opened or focused when a notification is clicked.
    pub app_url: Url,
}

impl WorkerConfig {
    /// Create a config; the app URL doubles as the offline fallback until
    /// overridden.
    pub fn new(version: CacheVersion, origin: Url, app_url: Url) -> Self {
        Self {
            version,
            origin,
            manifest: Vec::new(),
            offline_fallback: app_url.clone(),
            app_url,
        }
    }

    /// Set the install manifest.
    pub fn with_manifest(mut self, manifest: Vec<Url>) -> Self {
        self.manifest = manifest;
        self
    }

    /// Set the offline fallback resource.
    pub fn with_offline_fallback(mut self, url: Url) -> Self {
        self.offline_fallback = url;
        self
    }
}

// ==================== Events ====================

/// Emitted by the worker for observers (devtools, shell UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Lifecycle transition.
    StateChange { worker: WorkerId, state: WorkerState },
    /// Stale generations removed during activation.
    CachesCleaned { removed: Vec<String> },
    /// Consumers claimed after activation.
    ConsumersClaimed { count: usize },
    /// A push was turned into a notification.
    NotificationShown { tag: String },
}

// ==================== Notifications ====================

/// Title of every notification the shell shows.
pub const NOTIFICATION_TITLE: &str = "Toolbox Management";

/// Body used when a push arrives without a payload.
pub const DEFAULT_PUSH_BODY: &str = "Je hebt nieuwe toolboxen toegewezen gekregen";

/// Stable tag so repeated pushes coalesce into one notification.
pub const NOTIFICATION_TAG: &str = "toolbox-notification";

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub tag: String,
    /// Opened or focused on click.
    pub target: Url,
}

// ==================== Consumers ====================

/// A page controlled by (or controllable by) the worker.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: String,
    pub url: Url,
    pub focused: bool,
    pub controlled: bool,
}

/// Registry of open consumers.
#[derive(Debug, Default)]
pub struct Consumers {
    consumers: HashMap<String, Consumer>,
}

impl Consumers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing page (not yet controlled).
    pub fn add(&mut self, id: impl Into<String>, url: Url) {
        let id = id.into();
        self.consumers.insert(
            id.clone(),
            Consumer {
                id,
                url,
                focused: false,
                controlled: false,
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> Option<Consumer> {
        self.consumers.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Consumer> {
        self.consumers.get(id)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Take control of every open consumer without a reload.
    pub fn claim(&mut self) -> usize {
        for consumer in self.consumers.values_mut() {
            consumer.controlled = true;
        }
        self.consumers.len()
    }

    /// First consumer showing `url`.
    pub fn find_at(&self, url: &Url) -> Option<&Consumer> {
        self.consumers.values().find(|c| &c.url == url)
    }

    /// Focus a consumer.
    pub fn focus(&mut self, id: &str) -> Result<(), WorkerError> {
        if !self.consumers.contains_key(id) {
            return Err(WorkerError::ConsumerNotFound(id.to_string()));
        }
        for consumer in self.consumers.values_mut() {
            consumer.focused = consumer.id == id;
        }
        Ok(())
    }

    /// Open a new focused window at `url`.
    pub fn open_window(&mut self, url: Url) -> Consumer {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = format!("consumer-{}", COUNTER.fetch_add(1, Ordering::Relaxed));

        for consumer in self.consumers.values_mut() {
            consumer.focused = false;
        }

        let consumer = Consumer {
            id: id.clone(),
            url,
            focused: true,
            controlled: true,
        };
        self.consumers.insert(id, consumer.clone());
        consumer
    }
}

// ==================== Served responses ====================

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
    /// Exact hit in the current generation.
    Cache,
    /// Fetched from the network (cached asynchronously if it qualifies).
    Network,
    /// The designated offline placeholder.
    OfflineFallback,
}

/// What the interceptor hands back for a fetch event.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ServeSource,
}

impl ServedResponse {
    fn from_cache(entry: CachedResponse, source: ServeSource) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
            source,
        }
    }

    fn from_network(response: Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.into_body(),
            source: ServeSource::Network,
        }
    }
}

// ==================== ShellWorker ====================

/// One worker instance.
///
/// Instances are disposable; the host may tear one down after any event.
/// Handlers park their extended work in the instance so the host can wait
/// for it (see [`wait_until_idle`](Self::wait_until_idle)).
pub struct ShellWorker {
    id: WorkerId,
    config: WorkerConfig,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetch>,
    replay: Arc<ReplayEngine>,
    state: RwLock<WorkerState>,
    consumers: Arc<RwLock<Consumers>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ShellWorker {
    /// Create a worker instance over shared storage and transport.
    pub fn new(
        config: WorkerConfig,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetch>,
        replay: Arc<ReplayEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                id: WorkerId::new(),
                config,
                caches,
                fetcher,
                replay,
                state: RwLock::new(WorkerState::Installing),
                consumers: Arc::new(RwLock::new(Consumers::new())),
                pending: Mutex::new(Vec::new()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Consumer registry shared with the host.
    pub fn consumers(&self) -> Arc<RwLock<Consumers>> {
        Arc::clone(&self.consumers)
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
        let _ = self.event_tx.send(WorkerEvent::StateChange {
            worker: self.id,
            state,
        });
    }

    /// Await all fire-and-forget work parked by earlier handlers.
    ///
    /// Models the host keeping the instance alive until an event's async
    /// chain completes.
    pub async fn wait_until_idle(&self) {
        let handles: Vec<_> = self.pending.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ==================== Install ====================

    /// Pre-populate the versioned cache from the manifest.
    ///
    /// Atomic: every manifest URL is fetched and validated before any entry
    /// becomes visible. On failure the partial generation is deleted, the
    /// instance goes redundant, and whatever version was serving keeps
    /// serving; the platform retries on the next deploy or reload.
    ///
    /// Completing install requests immediate activation — this worker
    /// skips the waiting period rather than idling until every consumer
    /// closes.
    pub async fn handle_install(&self) -> Result<(), WorkerError> {
        info!(worker = self.id.raw(), version = %self.config.version, "Installing");
        self.set_state(WorkerState::Installing).await;
        self.caches.open(&self.config.version).await;

        match self.fetch_manifest().await {
            Ok(entries) => {
                let count = entries.len();
                self.caches.put_all(&self.config.version, entries).await;
                info!(version = %self.config.version, assets = count, "App shell cached");

                self.set_state(WorkerState::Waiting).await;
                debug!(worker = self.id.raw(), "Skipping waiting period");
                Ok(())
            }
            Err(e) => {
                warn!(version = %self.config.version, error = %e, "Install aborted");
                self.caches.delete(self.config.version.as_str()).await;
                self.set_state(WorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn fetch_manifest(&self) -> Result<Vec<(CacheKey, CachedResponse)>, WorkerError> {
        let mut entries = Vec::with_capacity(self.config.manifest.len());

        for url in &self.config.manifest {
            let response = self
                .fetcher
                .fetch(Request::get(url.clone()))
                .await
                .map_err(|e| WorkerError::ManifestEntry {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

            if !response.ok() {
                return Err(WorkerError::ManifestEntry {
                    url: url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }

            let key = CacheKey::get(url);
            let entry =
                CachedResponse::new(response.status, response.headers.clone(), response.into_body());
            entries.push((key, entry));
        }

        Ok(entries)
    }

    // ==================== Activate ====================

    /// Make this generation the only one, then claim all consumers.
    ///
    /// Cleanup completes before claiming; from the moment this returns,
    /// every open consumer is served by this worker without a reload.
    pub async fn handle_activate(&self) -> Result<(), WorkerError> {
        let state = self.state().await;
        if state == WorkerState::Redundant {
            return Err(WorkerError::StateError(
                "redundant worker cannot activate".to_string(),
            ));
        }

        info!(worker = self.id.raw(), version = %self.config.version, "Activating");
        self.set_state(WorkerState::Activating).await;

        let removed = self.caches.delete_all_except(&self.config.version).await;
        let _ = self
            .event_tx
            .send(WorkerEvent::CachesCleaned { removed });

        let count = self.consumers.write().await.claim();
        let _ = self.event_tx.send(WorkerEvent::ConsumersClaimed { count });

        self.set_state(WorkerState::Active).await;
        Ok(())
    }

    // ==================== Fetch ====================

    /// Serve one intercepted request: cache first, then network, then the
    /// offline fallback.
    ///
    /// A qualifying network response (HTTP 200, same origin) is stored as a
    /// copy without delaying the caller; the store is fire-and-forget and a
    /// failure there never surfaces. Concurrent identical requests each run
    /// the full policy — the overwrite is idempotent.
    pub async fn handle_fetch(&self, request: Request) -> Result<ServedResponse, WorkerError> {
        let key = CacheKey::new(&request.method, &request.url);

        if let Some(entry) = self.caches.match_request(&self.config.version, &key).await {
            debug!(url = %request.url, "Cache hit");
            return Ok(ServedResponse::from_cache(entry, ServeSource::Cache));
        }

        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                if self.qualifies_for_cache(&response) {
                    // Two continuations from one response: one copy to the
                    // caller, one to storage.
                    let entry = CachedResponse::new(
                        response.status,
                        response.headers.clone(),
                        response.body().clone(),
                    );
                    let caches = self.caches.clone();
                    let version = self.config.version.clone();
                    let handle = tokio::spawn(async move {
                        caches.put(&version, key, entry).await;
                    });
                    self.pending.lock().await.push(handle);
                }
                Ok(ServedResponse::from_network(response))
            }
            Err(e) => self.serve_offline_fallback(&request, e).await,
        }
    }

    /// Only same-origin HTTP 200 responses enter the runtime cache.
    fn qualifies_for_cache(&self, response: &Response) -> bool {
        response.status == StatusCode::OK && same_origin(&self.config.origin, &response.url)
    }

    async fn serve_offline_fallback(
        &self,
        request: &Request,
        cause: NetError,
    ) -> Result<ServedResponse, WorkerError> {
        warn!(url = %request.url, error = %cause, "Network fetch failed; trying offline fallback");

        let fallback_key = CacheKey::get(&self.config.offline_fallback);
        match self
            .caches
            .match_request(&self.config.version, &fallback_key)
            .await
        {
            Some(entry) => Ok(ServedResponse::from_cache(
                entry,
                ServeSource::OfflineFallback,
            )),
            None => Err(WorkerError::FetchFailed(cause.to_string())),
        }
    }

    // ==================== Push & notifications ====================

    /// Turn a push payload into the notification to show.
    pub fn handle_push(&self, payload: Option<&str>) -> Notification {
        let body = payload.unwrap_or(DEFAULT_PUSH_BODY).to_string();
        let notification = Notification {
            title: NOTIFICATION_TITLE.to_string(),
            body,
            tag: NOTIFICATION_TAG.to_string(),
            target: self.config.app_url.clone(),
        };

        info!(tag = %notification.tag, "Showing notification");
        let _ = self.event_tx.send(WorkerEvent::NotificationShown {
            tag: notification.tag.clone(),
        });

        notification
    }

    /// Focus an open consumer at the app URL, or open a new one.
    ///
    /// Returns the id of the consumer now in front.
    pub async fn handle_notification_click(&self) -> Result<String, WorkerError> {
        let mut consumers = self.consumers.write().await;

        if let Some(existing) = consumers.find_at(&self.config.app_url) {
            let id = existing.id.clone();
            consumers.focus(&id)?;
            debug!(consumer = %id, "Focused existing consumer");
            return Ok(id);
        }

        let consumer = consumers.open_window(self.config.app_url.clone());
        debug!(consumer = %consumer.id, "Opened new consumer");
        Ok(consumer.id)
    }

    // ==================== Sync ====================

    /// A registered sync tag fired; run the deferred replay.
    pub async fn handle_sync(&self, tag: &str) -> Result<ReplayOutcome, WorkerError> {
        debug!(worker = self.id.raw(), tag, "Sync event");
        Ok(self.replay.handle_sync(tag).await?)
    }
}

/// Scheme, host and port all match.
fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

// ==================== InstallPrompt ====================

/// Deferred install-prompt state for the page shell.
///
/// The platform announces promptability once; the shell stashes it here
/// (per instance, not in a global) until the user asks to install.
#[derive(Debug, Default)]
pub struct InstallPrompt {
    deferred: Option<String>,
    installed: bool,
}

impl InstallPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform announced the app can be installed.
    pub fn on_prompt_available(&mut self, prompt_id: impl Into<String>) {
        if !self.installed {
            self.deferred = Some(prompt_id.into());
        }
    }

    /// Whether an install button should be visible.
    pub fn can_prompt(&self) -> bool {
        self.deferred.is_some()
    }

    /// User asked to install; consumes the stashed prompt.
    pub fn take_prompt(&mut self) -> Option<String> {
        self.deferred.take()
    }

    /// Platform reported the app was installed.
    pub fn on_app_installed(&mut self) {
        self.installed = true;
        self.deferred = None;
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    use toolbox_data::MemoryStore;
    use toolbox_sync::{SyncQueue, SyncRegistry};

    // ==================== Scripted fetcher ====================

    /// Network double: URL → response script, with a call counter and a
    /// set of URLs that fail at the network level.
    struct ScriptedFetcher {
        responses: std::sync::RwLock<HashMap<String, (StatusCode, Bytes)>>,
        dead: std::sync::RwLock<std::collections::HashSet<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                responses: std::sync::RwLock::new(HashMap::new()),
                dead: std::sync::RwLock::new(std::collections::HashSet::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn serve(&self, url: &str, status: u16, body: &'static [u8]) {
            self.responses.write().unwrap().insert(
                url.to_string(),
                (
                    StatusCode::from_u16(status).unwrap(),
                    Bytes::from_static(body),
                ),
            );
        }

        fn kill(&self, url: &str) {
            self.dead.write().unwrap().insert(url.to_string());
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for ScriptedFetcher {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let url = request.url.to_string();

            if self.dead.read().unwrap().contains(&url) {
                return Err(NetError::Unreachable("scripted outage".to_string()));
            }

            let (status, body) = self
                .responses
                .read()
                .unwrap()
                .get(&url)
                .cloned()
                .unwrap_or((StatusCode::NOT_FOUND, Bytes::new()));

            Ok(Response::new(
                request.id,
                request.url,
                status,
                HeaderMap::new(),
                body,
            ))
        }
    }

    // ==================== Fixture ====================

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    struct Fixture {
        caches: CacheStorage,
        fetcher: Arc<ScriptedFetcher>,
        replay: Arc<ReplayEngine>,
        _queue_dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let queue_dir = TempDir::new().unwrap();
            let queue = Arc::new(SyncQueue::load(queue_dir.path().join("queue.json")).unwrap());
            let replay = Arc::new(ReplayEngine::new(
                queue,
                Arc::new(MemoryStore::new()),
                SyncRegistry::new(),
            ));

            Self {
                caches: CacheStorage::new(),
                fetcher: Arc::new(ScriptedFetcher::new()),
                replay,
                _queue_dir: queue_dir,
            }
        }

        fn worker(&self, version: &str, manifest: &[&str]) -> ShellWorker {
            let config = WorkerConfig::new(
                CacheVersion::new(version).unwrap(),
                url("https://app.example"),
                url("https://app.example/toolbox-app.html"),
            )
            .with_manifest(manifest.iter().map(|u| url(u)).collect())
            .with_offline_fallback(url("https://app.example/toolbox-app.html"));

            let (worker, _rx) = ShellWorker::new(
                config,
                self.caches.clone(),
                self.fetcher.clone(),
                Arc::clone(&self.replay),
            );
            worker
        }
    }

    const SHELL: &str = "https://app.example/toolbox-app.html";
    const APP_JS: &str = "https://app.example/app.js";
    const STYLES: &str = "https://app.example/styles.css";

    // ==================== Lifecycle ====================

    #[tokio::test]
    async fn test_install_populates_manifest_and_waits() {
        let fx = Fixture::new();
        fx.fetcher.serve(SHELL, 200, b"<html>shell</html>");
        fx.fetcher.serve(APP_JS, 200, b"console.log('app')");

        let worker = fx.worker("v1", &[SHELL, APP_JS]);
        worker.handle_install().await.unwrap();

        assert_eq!(worker.state().await, WorkerState::Waiting);
        assert_eq!(
            fx.caches
                .entry_count(&CacheVersion::new("v1").unwrap())
                .await,
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_install_is_atomic_on_failure() {
        let fx = Fixture::new();
        fx.fetcher.serve(SHELL, 200, b"<html>shell</html>");
        // APP_JS not scripted: 404s.

        let worker = fx.worker("v2", &[SHELL, APP_JS]);
        let err = worker.handle_install().await.unwrap_err();

        assert!(matches!(err, WorkerError::ManifestEntry { .. }));
        assert_eq!(worker.state().await, WorkerState::Redundant);
        // No half-populated generation left behind.
        assert!(!fx.caches.has(&CacheVersion::new("v2").unwrap()).await);
        // A redundant instance refuses to activate.
        assert!(worker.handle_activate().await.is_err());
    }

    #[tokio::test]
    async fn test_install_failure_keeps_prior_version_serving() {
        let fx = Fixture::new();
        fx.fetcher.serve(SHELL, 200, b"v1 shell");

        let v1 = fx.worker("v1", &[SHELL]);
        v1.handle_install().await.unwrap();
        v1.handle_activate().await.unwrap();

        fx.fetcher.kill(APP_JS);
        let v2 = fx.worker("v2", &[SHELL, APP_JS]);
        assert!(v2.handle_install().await.is_err());

        // v1 is untouched and still the only generation.
        assert_eq!(fx.caches.keys().await, vec!["v1".to_string()]);
        let served = v1.handle_fetch(Request::get(url(SHELL))).await.unwrap();
        assert_eq!(served.source, ServeSource::Cache);
        assert_eq!(served.body.as_ref(), b"v1 shell");
    }

    #[tokio::test]
    async fn test_activate_leaves_exactly_one_generation() {
        let fx = Fixture::new();
        fx.fetcher.serve(SHELL, 200, b"shell");

        // Seed stale generations from older deploys.
        for stale in ["v0", "v1"] {
            fx.caches
                .open(&CacheVersion::new(stale).unwrap())
                .await;
        }

        let worker = fx.worker("v2", &[SHELL]);
        worker.handle_install().await.unwrap();
        worker.handle_activate().await.unwrap();

        assert_eq!(worker.state().await, WorkerState::Active);
        assert_eq!(fx.caches.keys().await, vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn test_version_rollover_scenario() {
        let fx = Fixture::new();
        fx.fetcher.serve(SHELL, 200, b"shell v1");
        fx.fetcher.serve(APP_JS, 200, b"app v1");

        let v1 = fx.worker("toolbox-shell-v1", &[SHELL, APP_JS]);
        v1.handle_install().await.unwrap();
        v1.handle_activate().await.unwrap();
        assert_eq!(fx.caches.keys().await, vec!["toolbox-shell-v1".to_string()]);

        // New deploy: updated assets plus one more.
        fx.fetcher.serve(SHELL, 200, b"shell v2");
        fx.fetcher.serve(APP_JS, 200, b"app v2");
        fx.fetcher.serve(STYLES, 200, b"styles v2");

        let v2 = fx.worker("toolbox-shell-v2", &[SHELL, APP_JS, STYLES]);
        v2.handle_install().await.unwrap();

        // Both generations exist until v2 activates; v1 still serves its copy.
        let mut names = fx.caches.keys().await;
        names.sort();
        assert_eq!(
            names,
            vec![
                "toolbox-shell-v1".to_string(),
                "toolbox-shell-v2".to_string()
            ]
        );
        let served = v1.handle_fetch(Request::get(url(SHELL))).await.unwrap();
        assert_eq!(served.body.as_ref(), b"shell v1");

        v2.handle_activate().await.unwrap();
        assert_eq!(fx.caches.keys().await, vec!["toolbox-shell-v2".to_string()]);

        // Requests now return the v2 copy.
        let served = v2.handle_fetch(Request::get(url(SHELL))).await.unwrap();
        assert_eq!(served.source, ServeSource::Cache);
        assert_eq!(served.body.as_ref(), b"shell v2");
    }

    // ==================== Fetch policy ====================

    #[tokio::test]
    async fn test_cached_request_makes_zero_network_calls() {
        let fx = Fixture::new();
        fx.fetcher.serve(SHELL, 200, b"shell");

        let worker = fx.worker("v1", &[SHELL]);
        worker.handle_install().await.unwrap();
        worker.handle_activate().await.unwrap();

        let before = fx.fetcher.calls();
        let served = worker.handle_fetch(Request::get(url(SHELL))).await.unwrap();

        assert_eq!(served.source, ServeSource::Cache);
        assert_eq!(fx.fetcher.calls(), before);
    }

    #[tokio::test]
    async fn test_miss_warms_cache_idempotently() {
        let fx = Fixture::new();
        fx.fetcher.serve(APP_JS, 200, b"fresh body");

        let worker = fx.worker("v1", &[]);
        worker.handle_install().await.unwrap();
        worker.handle_activate().await.unwrap();

        let first = worker.handle_fetch(Request::get(url(APP_JS))).await.unwrap();
        assert_eq!(first.source, ServeSource::Network);
        worker.wait_until_idle().await;

        let calls_after_first = fx.fetcher.calls();
        let second = worker.handle_fetch(Request::get(url(APP_JS))).await.unwrap();

        assert_eq!(second.source, ServeSource::Cache);
        assert_eq!(fx.fetcher.calls(), calls_after_first);
        // The cached bytes are the originally fetched bytes.
        assert_eq!(second.body, first.body);
    }

    #[tokio::test]
    async fn test_non_200_not_cached() {
        let fx = Fixture::new();
        fx.fetcher.serve(APP_JS, 500, b"boom");

        let worker = fx.worker("v1", &[]);
        worker.handle_install().await.unwrap();
        worker.handle_activate().await.unwrap();

        let served = worker.handle_fetch(Request::get(url(APP_JS))).await.unwrap();
        worker.wait_until_idle().await;

        // Returned unmodified, never stored.
        assert_eq!(served.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(served.source, ServeSource::Network);
        assert_eq!(
            fx.caches
                .entry_count(&CacheVersion::new("v1").unwrap())
                .await,
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_cross_origin_not_cached() {
        let fx = Fixture::new();
        let cdn = "https://cdn.example/react.min.js";
        fx.fetcher.serve(cdn, 200, b"react");

        let worker = fx.worker("v1", &[]);
        worker.handle_install().await.unwrap();
        worker.handle_activate().await.unwrap();

        let served = worker.handle_fetch(Request::get(url(cdn))).await.unwrap();
        worker.wait_until_idle().await;

        assert_eq!(served.source, ServeSource::Network);
        assert_eq!(served.body.as_ref(), b"react");
        assert_eq!(
            fx.caches
                .entry_count(&CacheVersion::new("v1").unwrap())
                .await,
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_network_failure_serves_offline_fallback() {
        let fx = Fixture::new();
        fx.fetcher.serve(SHELL, 200, b"<html>offline-capable shell</html>");

        let worker = fx.worker("v1", &[SHELL]);
        worker.handle_install().await.unwrap();
        worker.handle_activate().await.unwrap();

        fx.fetcher.kill(APP_JS);
        let served = worker.handle_fetch(Request::get(url(APP_JS))).await.unwrap();

        assert_eq!(served.source, ServeSource::OfflineFallback);
        assert_eq!(served.body.as_ref(), b"<html>offline-capable shell</html>");
    }

    #[tokio::test]
    async fn test_network_failure_without_fallback_propagates() {
        let fx = Fixture::new();

        // Empty manifest: the fallback resource was never cached.
        let worker = fx.worker("v1", &[]);
        worker.handle_install().await.unwrap();
        worker.handle_activate().await.unwrap();

        fx.fetcher.kill(APP_JS);
        let err = worker.handle_fetch(Request::get(url(APP_JS))).await.unwrap_err();
        assert!(matches!(err, WorkerError::FetchFailed(_)));
    }

    // ==================== Consumers & notifications ====================

    #[tokio::test]
    async fn test_activate_claims_open_consumers() {
        let fx = Fixture::new();
        let worker = fx.worker("v1", &[]);

        {
            let consumers = worker.consumers();
            let mut consumers = consumers.write().await;
            consumers.add("tab-1", url(SHELL));
            consumers.add("tab-2", url("https://app.example/settings"));
        }

        worker.handle_install().await.unwrap();
        worker.handle_activate().await.unwrap();

        let consumers = worker.consumers();
        let consumers = consumers.read().await;
        assert!(consumers.get("tab-1").unwrap().controlled);
        assert!(consumers.get("tab-2").unwrap().controlled);
    }

    #[tokio::test]
    async fn test_push_builds_notification() {
        let fx = Fixture::new();
        let worker = fx.worker("v1", &[]);

        let with_payload = worker.handle_push(Some("Nieuwe toolbox: Werken op hoogte"));
        assert_eq!(with_payload.title, NOTIFICATION_TITLE);
        assert_eq!(with_payload.body, "Nieuwe toolbox: Werken op hoogte");
        assert_eq!(with_payload.tag, NOTIFICATION_TAG);
        assert_eq!(with_payload.target, url(SHELL));

        let without_payload = worker.handle_push(None);
        assert_eq!(without_payload.body, DEFAULT_PUSH_BODY);
    }

    #[tokio::test]
    async fn test_notification_click_focuses_existing_consumer() {
        let fx = Fixture::new();
        let worker = fx.worker("v1", &[]);

        {
            let consumers = worker.consumers();
            consumers.write().await.add("tab-1", url(SHELL));
        }

        let focused = worker.handle_notification_click().await.unwrap();
        assert_eq!(focused, "tab-1");

        let consumers = worker.consumers();
        assert!(consumers.read().await.get("tab-1").unwrap().focused);
    }

    #[tokio::test]
    async fn test_notification_click_opens_window_when_none_open() {
        let fx = Fixture::new();
        let worker = fx.worker("v1", &[]);

        let opened = worker.handle_notification_click().await.unwrap();

        let consumers = worker.consumers();
        let consumers = consumers.read().await;
        let consumer = consumers.get(&opened).unwrap();
        assert_eq!(consumer.url, url(SHELL));
        assert!(consumer.focused);
    }

    // ==================== Sync dispatch ====================

    #[tokio::test]
    async fn test_sync_event_runs_replay() {
        let fx = Fixture::new();
        let worker = fx.worker("v1", &[]);

        let outcome = worker
            .handle_sync(toolbox_sync::SYNC_COMPLETIONS_TAG)
            .await
            .unwrap();
        assert_eq!(outcome, ReplayOutcome::Drained { replayed: 0 });
    }

    // ==================== Install prompt ====================

    #[test]
    fn test_install_prompt_lifecycle() {
        let mut prompt = InstallPrompt::new();
        assert!(!prompt.can_prompt());

        prompt.on_prompt_available("prompt-1");
        assert!(prompt.can_prompt());

        assert_eq!(prompt.take_prompt().as_deref(), Some("prompt-1"));
        assert!(!prompt.can_prompt());

        prompt.on_app_installed();
        prompt.on_prompt_available("prompt-2");
        assert!(!prompt.can_prompt());
        assert!(prompt.is_installed());
    }

    // ==================== Helpers ====================

    #[test]
    fn test_same_origin() {
        let origin = url("https://app.example");
        assert!(same_origin(&origin, &url("https://app.example/path?q=1")));
        assert!(same_origin(&origin, &url("https://app.example:443/x")));
        assert!(!same_origin(&origin, &url("http://app.example/")));
        assert!(!same_origin(&origin, &url("https://cdn.example/")));
        assert!(!same_origin(&origin, &url("https://app.example:8443/")));
    }
}
