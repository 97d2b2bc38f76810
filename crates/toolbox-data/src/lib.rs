//! # Toolbox Data
//!
//! The data-access facade of the toolbox app: per-collection CRUD, change
//! subscriptions that deliver the full current collection, and auth.
//!
//! ## Architecture
//!
//! ```text
//! DataStore (trait)
//!     ├── MemoryStore   in-process tables, synchronous notify
//!     └── HttpStore     hosted realtime-db REST dialect, polling notify
//!
//! companies/<tenant>
//!     ├── users / employees / toolboxes / completions / invitations
//!     └── emailConfig / jobTypes
//! ```
//!
//! Implementations are swappable behind `Arc<dyn DataStore>`; the sync
//! subsystem replays queued offline writes against the same trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in the data facade.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Record has no id field")]
    MissingId,

    #[error("Not found: {collection}/{id}")]
    NotFound { collection: Collection, id: String },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote rejected request: {0}")]
    Remote(String),
}

impl DataError {
    /// Whether this failure is connectivity-shaped — the kind a deferred
    /// write queue should absorb rather than surface.
    pub fn is_transient(&self) -> bool {
        match self {
            DataError::Unreachable(_) => true,
            DataError::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

// ==================== Collections ====================

/// The entity collections of the toolbox app, all under one tenant path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Users,
    Employees,
    Toolboxes,
    Completions,
    Invitations,
    EmailConfig,
    JobTypes,
}

impl Collection {
    /// Every collection, in a stable order.
    pub const ALL: [Collection; 7] = [
        Collection::Users,
        Collection::Employees,
        Collection::Toolboxes,
        Collection::Completions,
        Collection::Invitations,
        Collection::EmailConfig,
        Collection::JobTypes,
    ];

    /// The collection's path segment under the tenant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Employees => "employees",
            Collection::Toolboxes => "toolboxes",
            Collection::Completions => "completions",
            Collection::Invitations => "invitations",
            Collection::EmailConfig => "emailConfig",
            Collection::JobTypes => "jobTypes",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== Records ====================

/// A facade row: a plain JSON object carrying a string `id`.
pub type Record = JsonValue;

/// Extract the `id` field of a record.
pub fn record_id(record: &Record) -> Option<&str> {
    record.get("id").and_then(JsonValue::as_str)
}

// ==================== Subscriptions ====================

/// Callback invoked with the full current collection on every change.
pub type ChangeCallback = Arc<dyn Fn(Vec<Record>) + Send + Sync>;

/// Callback invoked with the current user on every auth transition.
pub type AuthCallback = Arc<dyn Fn(Option<Record>) + Send + Sync>;

/// A cancellable subscription.
///
/// Detaching is explicit; dropping the handle without detaching leaves the
/// subscription live for the store's lifetime.
pub struct Subscription {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Wrap a detach operation.
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Mutex::new(Some(Box::new(detach))),
        }
    }

    /// Stop delivering callbacks. Idempotent.
    pub fn detach(&self) {
        if let Ok(mut guard) = self.detach.lock() {
            if let Some(detach) = guard.take() {
                detach();
            }
        }
    }

    /// Whether [`detach`](Self::detach) has already run.
    pub fn is_detached(&self) -> bool {
        self.detach.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

/// A set of callbacks keyed by watcher id.
struct WatcherSet<T> {
    next_id: AtomicU64,
    watchers: Arc<Mutex<HashMap<u64, Arc<dyn Fn(T) + Send + Sync>>>>,
}

impl<T: Clone + 'static> WatcherSet<T> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn add(&self, callback: Arc<dyn Fn(T) + Send + Sync>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.insert(id, callback);
        }

        let watchers = Arc::clone(&self.watchers);
        Subscription::new(move || {
            if let Ok(mut watchers) = watchers.lock() {
                watchers.remove(&id);
            }
        })
    }

    /// Invoke every watcher with a clone of `value`.
    ///
    /// Callbacks run outside the lock so they may re-enter the store.
    fn notify(&self, value: &T) {
        let callbacks: Vec<_> = match self.watchers.lock() {
            Ok(watchers) => watchers.values().cloned().collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(value.clone());
        }
    }
}

// ==================== DataStore trait ====================

/// The facade every consumer (UI, sync replay) programs against.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// All records of a collection.
    async fn list(&self, collection: Collection) -> Result<Vec<Record>, DataError>;

    /// One record by id.
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, DataError>;

    /// Store a full record under its `id`. Overwrites.
    async fn save(&self, collection: Collection, record: Record) -> Result<Record, DataError>;

    /// Merge `patch` into an existing record.
    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: JsonValue,
    ) -> Result<JsonValue, DataError>;

    /// Remove a record.
    async fn delete(&self, collection: Collection, id: &str) -> Result<(), DataError>;

    /// Invoke `callback` with the full collection now and on every change.
    async fn subscribe(
        &self,
        collection: Collection,
        callback: ChangeCallback,
    ) -> Result<Subscription, DataError>;

    /// Authenticate and return the matching user record.
    async fn login(&self, username: &str, password: &str) -> Result<Option<Record>, DataError>;

    /// End the session.
    async fn logout(&self) -> Result<(), DataError>;

    /// The currently authenticated user, if any.
    async fn current_user(&self) -> Result<Option<Record>, DataError>;

    /// Invoke `callback` on every auth transition.
    async fn on_auth_change(&self, callback: AuthCallback) -> Result<Subscription, DataError>;
}

// ==================== MemoryStore ====================

/// In-process implementation: tables behind an `RwLock`, synchronous
/// notification on every mutation.
///
/// Credentials live on the user record itself (a `password` field); this
/// store backs tests and fully offline operation.
pub struct MemoryStore {
    tables: RwLock<HashMap<Collection, HashMap<String, Record>>>,
    watchers: HashMap<Collection, WatcherSet<Vec<Record>>>,
    current_user: RwLock<Option<Record>>,
    auth_watchers: WatcherSet<Option<Record>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let mut tables = HashMap::new();
        let mut watchers = HashMap::new();
        for collection in Collection::ALL {
            tables.insert(collection, HashMap::new());
            watchers.insert(collection, WatcherSet::new());
        }

        Self {
            tables: RwLock::new(tables),
            watchers,
            current_user: RwLock::new(None),
            auth_watchers: WatcherSet::new(),
        }
    }

    async fn snapshot(&self, collection: Collection) -> Vec<Record> {
        self.tables
            .read()
            .await
            .get(&collection)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn notify(&self, collection: Collection) {
        let snapshot = self.snapshot(collection).await;
        if let Some(set) = self.watchers.get(&collection) {
            set.notify(&snapshot);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn list(&self, collection: Collection) -> Result<Vec<Record>, DataError> {
        Ok(self.snapshot(collection).await)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, DataError> {
        Ok(self
            .tables
            .read()
            .await
            .get(&collection)
            .and_then(|table| table.get(id))
            .cloned())
    }

    async fn save(&self, collection: Collection, record: Record) -> Result<Record, DataError> {
        let id = record_id(&record).ok_or(DataError::MissingId)?.to_string();

        {
            let mut tables = self.tables.write().await;
            tables.entry(collection).or_default().insert(id, record.clone());
        }
        trace!(%collection, "Saved record");
        self.notify(collection).await;

        Ok(record)
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: JsonValue,
    ) -> Result<JsonValue, DataError> {
        {
            let mut tables = self.tables.write().await;
            let table = tables.entry(collection).or_default();
            let record = table.get_mut(id).ok_or_else(|| DataError::NotFound {
                collection,
                id: id.to_string(),
            })?;

            if let (Some(target), Some(fields)) = (record.as_object_mut(), patch.as_object()) {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        self.notify(collection).await;

        Ok(patch)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), DataError> {
        {
            let mut tables = self.tables.write().await;
            tables.entry(collection).or_default().remove(id);
        }
        self.notify(collection).await;

        Ok(())
    }

    async fn subscribe(
        &self,
        collection: Collection,
        callback: ChangeCallback,
    ) -> Result<Subscription, DataError> {
        // Deliver the current state immediately, then on every change.
        callback(self.snapshot(collection).await);

        let set = self
            .watchers
            .get(&collection)
            .ok_or(DataError::NotFound {
                collection,
                id: String::new(),
            })?;
        Ok(set.add(callback))
    }

    async fn login(&self, username: &str, password: &str) -> Result<Option<Record>, DataError> {
        let users = self.snapshot(Collection::Users).await;
        let user = users.into_iter().find(|u| {
            u.get("username").and_then(JsonValue::as_str) == Some(username)
                && u.get("password").and_then(JsonValue::as_str) == Some(password)
        });

        match user {
            Some(user) => {
                info!(username, "Login succeeded");
                *self.current_user.write().await = Some(user.clone());
                self.auth_watchers.notify(&Some(user.clone()));
                Ok(Some(user))
            }
            None => Err(DataError::AuthFailed(username.to_string())),
        }
    }

    async fn logout(&self) -> Result<(), DataError> {
        *self.current_user.write().await = None;
        self.auth_watchers.notify(&None);
        Ok(())
    }

    async fn current_user(&self) -> Result<Option<Record>, DataError> {
        Ok(self.current_user.read().await.clone())
    }

    async fn on_auth_change(&self, callback: AuthCallback) -> Result<Subscription, DataError> {
        Ok(self.auth_watchers.add(callback))
    }
}

// ==================== HttpStore ====================

/// Configuration for the hosted realtime database.
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Database root, e.g. `https://toolbox-management-default-rtdb.europe-west1.firebasedatabase.app`.
    pub base_url: Url,
    /// Fixed tenant path, e.g. `companies/containers-maes`.
    pub tenant: String,
    /// Password-auth endpoint; `None` disables login.
    pub auth_url: Option<Url>,
    /// Request timeout.
    pub timeout: Duration,
    /// Interval between subscription polls.
    pub poll_interval: Duration,
}

impl HttpStoreConfig {
    /// Config for a database root with the default tenant.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            tenant: "companies/containers-maes".to_string(),
            auth_url: None,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
        }
    }

    /// Override the tenant path.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    /// Enable password auth against `auth_url`.
    pub fn with_auth(mut self, auth_url: Url) -> Self {
        self.auth_url = Some(auth_url);
        self
    }

    /// Override the subscription poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "idToken")]
    id_token: String,
}

/// Remote implementation speaking the realtime database's REST dialect:
/// `GET <tenant>/<collection>.json`, `PUT`/`PATCH`/`DELETE`
/// `<tenant>/<collection>/<id>.json`. Collection values arrive as an
/// id-keyed object (or null when empty).
pub struct HttpStore {
    config: HttpStoreConfig,
    client: reqwest::Client,
    token: Arc<RwLock<Option<String>>>,
    current_user: Arc<RwLock<Option<Record>>>,
    auth_watchers: WatcherSet<Option<Record>>,
}

impl HttpStore {
    /// Create a store for the given database.
    pub fn new(config: HttpStoreConfig) -> Result<Self, DataError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            config,
            client,
            token: Arc::new(RwLock::new(None)),
            current_user: Arc::new(RwLock::new(None)),
            auth_watchers: WatcherSet::new(),
        })
    }

    fn node_url(&self, path: &str) -> Result<Url, DataError> {
        let joined = format!(
            "{}/{}/{}.json",
            self.config.base_url.as_str().trim_end_matches('/'),
            self.config.tenant,
            path
        );
        Url::parse(&joined).map_err(|e| DataError::InvalidUrl(e.to_string()))
    }

    async fn authed(&self, url: Url) -> Url {
        let mut url = url;
        if let Some(token) = self.token.read().await.as_ref() {
            url.query_pairs_mut().append_pair("auth", token);
        }
        url
    }

    fn classify(err: reqwest::Error) -> DataError {
        if err.is_connect() || err.is_timeout() {
            DataError::Unreachable(err.to_string())
        } else {
            DataError::Http(err)
        }
    }

    async fn read_node(&self, path: &str) -> Result<JsonValue, DataError> {
        let url = self.authed(self.node_url(path)?).await;
        let response = self.client.get(url).send().await.map_err(Self::classify)?;

        if !response.status().is_success() {
            return Err(DataError::Remote(format!(
                "GET {} -> {}",
                path,
                response.status()
            )));
        }
        Ok(response.json().await.map_err(Self::classify)?)
    }

    /// Flatten a realtime-db collection node into records.
    fn collection_values(node: JsonValue) -> Vec<Record> {
        match node {
            JsonValue::Null => Vec::new(),
            JsonValue::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
            // Sparse integer-keyed nodes come back as arrays with null holes.
            JsonValue::Array(items) => items.into_iter().filter(|v| !v.is_null()).collect(),
            other => vec![other],
        }
    }
}

#[async_trait]
impl DataStore for HttpStore {
    async fn list(&self, collection: Collection) -> Result<Vec<Record>, DataError> {
        let node = self.read_node(collection.as_str()).await?;
        Ok(Self::collection_values(node))
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, DataError> {
        let node = self
            .read_node(&format!("{}/{}", collection.as_str(), id))
            .await?;
        Ok(match node {
            JsonValue::Null => None,
            value => Some(value),
        })
    }

    async fn save(&self, collection: Collection, record: Record) -> Result<Record, DataError> {
        let id = record_id(&record).ok_or(DataError::MissingId)?.to_string();
        let url = self
            .authed(self.node_url(&format!("{}/{}", collection.as_str(), id))?)
            .await;

        let response = self
            .client
            .put(url)
            .json(&record)
            .send()
            .await
            .map_err(Self::classify)?;

        if !response.status().is_success() {
            return Err(DataError::Remote(format!(
                "PUT {}/{} -> {}",
                collection,
                id,
                response.status()
            )));
        }
        debug!(%collection, id = %id, "Saved record");
        Ok(record)
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: JsonValue,
    ) -> Result<JsonValue, DataError> {
        let url = self
            .authed(self.node_url(&format!("{}/{}", collection.as_str(), id))?)
            .await;

        let response = self
            .client
            .patch(url)
            .json(&patch)
            .send()
            .await
            .map_err(Self::classify)?;

        if !response.status().is_success() {
            return Err(DataError::Remote(format!(
                "PATCH {}/{} -> {}",
                collection,
                id,
                response.status()
            )));
        }
        Ok(patch)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<(), DataError> {
        let url = self
            .authed(self.node_url(&format!("{}/{}", collection.as_str(), id))?)
            .await;

        let response = self.client.delete(url).send().await.map_err(Self::classify)?;

        if !response.status().is_success() {
            return Err(DataError::Remote(format!(
                "DELETE {}/{} -> {}",
                collection,
                id,
                response.status()
            )));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: Collection,
        callback: ChangeCallback,
    ) -> Result<Subscription, DataError> {
        // Polling stand-in for a server push channel: deliver on the first
        // successful poll, then on every observed change.
        let client = self.client.clone();
        let url = self.authed(self.node_url(collection.as_str())?).await;
        let interval = self.config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut last: Option<JsonValue> = None;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let node: JsonValue = match client.get(url.clone()).send().await {
                    Ok(response) if response.status().is_success() => {
                        match response.json().await {
                            Ok(node) => node,
                            Err(e) => {
                                trace!(%collection, error = %e, "Subscription poll decode failed");
                                continue;
                            }
                        }
                    }
                    Ok(response) => {
                        trace!(%collection, status = %response.status(), "Subscription poll rejected");
                        continue;
                    }
                    Err(e) => {
                        trace!(%collection, error = %e, "Subscription poll failed");
                        continue;
                    }
                };

                if last.as_ref() != Some(&node) {
                    last = Some(node.clone());
                    callback(HttpStore::collection_values(node));
                }
            }
        });

        Ok(Subscription::new(move || handle.abort()))
    }

    async fn login(&self, username: &str, password: &str) -> Result<Option<Record>, DataError> {
        let auth_url = self
            .config
            .auth_url
            .clone()
            .ok_or_else(|| DataError::AuthFailed("no auth endpoint configured".to_string()))?;

        // Usernames map onto a fixed mail domain for the auth backend.
        let email = format!("{username}@toolbox.local");
        let body = serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        });

        let response = self
            .client
            .post(auth_url)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify)?;

        if !response.status().is_success() {
            warn!(username, status = %response.status(), "Login rejected");
            return Err(DataError::AuthFailed(username.to_string()));
        }

        let auth: AuthResponse = response.json().await.map_err(Self::classify)?;
        *self.token.write().await = Some(auth.id_token);

        let users = self.list(Collection::Users).await?;
        let user = users
            .into_iter()
            .find(|u| u.get("username").and_then(JsonValue::as_str) == Some(username));

        info!(username, found = user.is_some(), "Login succeeded");
        *self.current_user.write().await = user.clone();
        self.auth_watchers.notify(&user);

        Ok(user)
    }

    async fn logout(&self) -> Result<(), DataError> {
        *self.token.write().await = None;
        *self.current_user.write().await = None;
        self.auth_watchers.notify(&None);
        Ok(())
    }

    async fn current_user(&self) -> Result<Option<Record>, DataError> {
        Ok(self.current_user.read().await.clone())
    }

    async fn on_auth_change(&self, callback: AuthCallback) -> Result<Subscription, DataError> {
        Ok(self.auth_watchers.add(callback))
    }
}
