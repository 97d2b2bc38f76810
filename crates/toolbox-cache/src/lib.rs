//! # Toolbox Cache
//!
//! Versioned request→response cache storage for the toolbox app shell.
//!
//! ## Model
//!
//! ```text
//! CacheStorage
//!     ├── AssetCache "toolbox-shell-v1"   (stale)
//!     └── AssetCache "toolbox-shell-v2"   (current)
//!             └── CacheKey (method + URL) → CachedResponse
//! ```
//!
//! Entries are idempotent overwrites keyed by request identity; individual
//! entries are never versioned — a whole cache is one generation, and
//! activation deletes every generation except the current one.

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in cache storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid cache version: {0}")]
    InvalidVersion(String),
}

// ==================== Version ====================

/// Name of one generation of cached assets.
///
/// Supplied at deploy time; exactly one version is current at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheVersion(String);

impl CacheVersion {
    /// Create a version name. Empty names are rejected.
    pub fn new(name: impl Into<String>) -> Result<Self, CacheError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CacheError::InvalidVersion(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ==================== Key ====================

/// Request identity: method + URL. No partial or prefix matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    /// Build a key from request parts.
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.as_str().to_string(),
        }
    }

    /// Build a GET key for a URL.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

// ==================== Entry ====================

/// A stored response.
///
/// The body is a cheap-to-clone [`Bytes`]; callers store a copy and keep a
/// copy, mirroring the duplicate-before-first-use contract of
/// single-consume response bodies.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// When the entry was written (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    /// Create an entry from response parts.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            cached_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== AssetCache ====================

/// One generation of cached assets.
#[derive(Debug, Default)]
pub struct AssetCache {
    entries: HashMap<CacheKey, CachedResponse>,
}

impl AssetCache {
    fn new() -> Self {
        Self::default()
    }

    /// Exact-match lookup.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CachedResponse> {
        self.entries.get(key)
    }

    /// Store or overwrite the entry for `key`. Last write wins.
    pub fn put(&mut self, key: CacheKey, response: CachedResponse) {
        self.entries.insert(key, response);
    }

    /// All keys in this generation.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== CacheStorage ====================

/// All cache generations, shared across worker instances.
///
/// The storage is the only shared mutable resource in the shell; it is
/// never locked beyond the inner `RwLock`, and writes are idempotent
/// overwrites, so concurrent writers for the same key leave a
/// last-write-wins result.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    caches: Arc<RwLock<HashMap<String, AssetCache>>>,
}

impl CacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a generation, creating it if absent. Idempotent.
    pub async fn open(&self, version: &CacheVersion) {
        let mut caches = self.caches.write().await;
        if !caches.contains_key(version.as_str()) {
            debug!(version = %version, "Creating cache generation");
            caches.insert(version.as_str().to_string(), AssetCache::new());
        }
    }

    /// Check if a generation exists.
    pub async fn has(&self, version: &CacheVersion) -> bool {
        self.caches.read().await.contains_key(version.as_str())
    }

    /// Delete a generation. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    /// Names of all generations.
    pub async fn keys(&self) -> Vec<String> {
        self.caches.read().await.keys().cloned().collect()
    }

    /// Exact-match lookup inside one generation.
    ///
    /// Returns a clone of the stored response; the stored copy stays put.
    pub async fn match_request(
        &self,
        version: &CacheVersion,
        key: &CacheKey,
    ) -> Option<CachedResponse> {
        self.caches
            .read()
            .await
            .get(version.as_str())
            .and_then(|cache| cache.match_request(key))
            .cloned()
    }

    /// Store or overwrite one entry. Creates the generation if absent.
    pub async fn put(&self, version: &CacheVersion, key: CacheKey, response: CachedResponse) {
        let mut caches = self.caches.write().await;
        caches
            .entry(version.as_str().to_string())
            .or_insert_with(AssetCache::new)
            .put(key, response);
    }

    /// Store a batch of entries in one shot.
    ///
    /// Install pre-population uses this so either every manifest entry
    /// becomes visible or none does: callers fetch and validate everything
    /// first, then commit the batch.
    pub async fn put_all(
        &self,
        version: &CacheVersion,
        entries: Vec<(CacheKey, CachedResponse)>,
    ) {
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(version.as_str().to_string())
            .or_insert_with(AssetCache::new);
        for (key, response) in entries {
            cache.put(key, response);
        }
    }

    /// Number of entries in a generation, if it exists.
    pub async fn entry_count(&self, version: &CacheVersion) -> Option<usize> {
        self.caches
            .read()
            .await
            .get(version.as_str())
            .map(|cache| cache.len())
    }

    /// Delete every generation whose name is not `current`.
    ///
    /// Used only during activation. Returns the names that were removed.
    pub async fn delete_all_except(&self, current: &CacheVersion) -> Vec<String> {
        let mut caches = self.caches.write().await;
        let stale: Vec<String> = caches
            .keys()
            .filter(|name| name.as_str() != current.as_str())
            .cloned()
            .collect();

        for name in &stale {
            info!(stale = %name, current = %current, "Deleting stale cache generation");
            caches.remove(name);
        }

        stale
    }
}
