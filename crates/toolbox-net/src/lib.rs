//! # Toolbox Net
//!
//! HTTP networking for the toolbox app shell.
//!
//! ## Design Goals
//!
//! 1. **Async fetch**: Non-blocking network requests
//! 2. **Swappable transport**: the [`Fetch`] trait is the only seam the
//!    shell worker sees, so tests and alternative transports plug in behind
//!    `Arc<dyn Fetch>`
//! 3. **Whole-body responses**: the shell caches complete responses, so
//!    bodies are collected into [`Bytes`] before they cross the seam

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl NetError {
    /// Whether this failure is the transient kind (connectivity, timeout)
    /// rather than a malformed request.
    pub fn is_transient(&self) -> bool {
        match self {
            NetError::Timeout(_) | NetError::Unreachable(_) => true,
            NetError::HttpError(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

// ==================== Request ====================

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

// ==================== Response ====================

/// HTTP response with a fully collected body.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    /// Final URL after redirects.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Build a response from parts.
    pub fn new(request_id: RequestId, url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            request_id,
            url,
            status,
            headers,
            body,
        }
    }

    /// Check if the response was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Borrow the body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the body bytes.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

// ==================== Fetch seam ====================

/// The network seam: everything the shell worker knows about the transport.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Issue the request and collect the full response.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

// ==================== HttpFetcher ====================

/// Configuration for the HTTP fetcher.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default request timeout.
    pub timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "ToolboxShell/1.0".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// [`Fetch`] implementation backed by `reqwest`.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: FetcherConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        trace!(id = request.id.raw(), url = %request.url, method = %request.method, "Fetching");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(url = %request.url, "Request timed out");
                return Err(NetError::Timeout(
                    request.timeout.unwrap_or(Duration::from_secs(30)),
                ));
            }
            Err(e) if e.is_connect() => {
                debug!(url = %request.url, "Network unreachable");
                return Err(NetError::Unreachable(e.to_string()));
            }
            Err(e) => return Err(NetError::HttpError(e)),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let url = Url::parse(response.url().as_str())
            .map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        let body = response.bytes().await?;

        debug!(id = request.id.raw(), %url, status = status.as_u16(), bytes = body.len(), "Fetched");

        Ok(Response::new(request.id, url, status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/app.html").unwrap();
        let request = Request::get(url.clone())
            .header(
                http::header::ACCEPT,
                HeaderValue::from_static("text/html"),
            )
            .timeout(Duration::from_secs(5));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn test_request_ids_unique() {
        let url = Url::parse("https://example.com/").unwrap();
        let a = Request::get(url.clone());
        let b = Request::get(url);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_response_json() {
        let url = Url::parse("https://example.com/data.json").unwrap();
        let response = Response::new(
            RequestId::new(),
            url,
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"{\"count\": 3}"),
        );

        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["count"], 3);
    }

    #[tokio::test]
    async fn test_http_fetcher_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shell.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>shell</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(FetcherConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/shell.html", server.uri())).unwrap();

        let response = fetcher.fetch(Request::get(url)).await.unwrap();
        assert!(response.ok());
        assert_eq!(response.text().unwrap(), "<html>shell</html>");
    }

    #[tokio::test]
    async fn test_http_fetcher_status_passthrough() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(FetcherConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();

        // Non-2xx is a response, not an error.
        let response = fetcher.fetch(Request::get(url)).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_http_fetcher_unreachable() {
        let fetcher = HttpFetcher::new(FetcherConfig::default()).unwrap();
        // Nothing listens here.
        let url = Url::parse("http://127.0.0.1:9/down").unwrap();

        let err = fetcher.fetch(Request::get(url)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
