//! # swcache Store
//!
//! Named, versioned caches of GET request → response pairs.
//!
//! ## Architecture
//!
//! ```text
//! CacheStore (trait, injected into the agent)
//!     ├── MemoryCacheStorage   (process-local)
//!     └── SqliteCacheStorage   (durable across restarts)
//!
//! cache name ("photoshoot-cache-v2")
//!     └── URL → CacheEntry
//! ```
//!
//! Cache names are listed in creation order, and [`CacheStore::match_any`]
//! searches them in that order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swcache_net::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use swcache_net::{Request, Response};
use thiserror::Error;
use url::Url;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCacheStorage;
pub use sqlite::SqliteCacheStorage;

// ==================== Errors ====================

/// Errors raised by cache storage backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),

    #[error("Invalid cached response for {url}: {reason}")]
    Corrupt { url: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Storage lock poisoned")]
    Poisoned,
}

// ==================== Entries ====================

/// The key a request is stored under: its URL without fragment.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (fragment stripped).
    pub url: String,

    /// Request method. Always `GET`.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in wire order. Values are raw bytes and may hold
    /// obs-text.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for storage under `request`.
    pub fn from_response(request: &Request, response: &Response) -> Result<Self, StoreError> {
        if request.method != Method::GET {
            return Err(StoreError::UnsupportedMethod(request.method.to_string()));
        }

        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Ok(Self {
            url: cache_key(&request.url),
            method: Method::GET.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: swcache_common::now_millis(),
        })
    }

    /// Rebuild a cache-served [`Response`].
    pub fn to_response(&self) -> Result<Response, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            url: self.url.clone(),
            reason,
        };

        let url = Url::parse(&self.url).map_err(|e| corrupt(e.to_string()))?;
        let status = StatusCode::from_u16(self.status).map_err(|e| corrupt(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| corrupt(e.to_string()))?;
            let value = HeaderValue::from_bytes(value).map_err(|e| corrupt(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response::new(url, status, headers, self.body.clone()).cached())
    }

    pub(crate) fn check_method(&self) -> Result<(), StoreError> {
        if self.method != Method::GET.as_str() {
            return Err(StoreError::UnsupportedMethod(self.method.clone()));
        }
        Ok(())
    }
}

// ==================== Store ====================

/// Cache storage (the `caches` global), injected into the agent.
///
/// Implementations serialize access internally; concurrent `put`s to one key
/// resolve last-write-wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), StoreError>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool, StoreError>;

    /// All cache names, oldest first.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// Look up a URL in one cache. A missing cache is a miss.
    async fn match_request(&self, name: &str, url: &Url) -> Result<Option<CacheEntry>, StoreError>;

    /// Look up a URL across all caches, oldest first.
    async fn match_any(&self, url: &Url) -> Result<Option<CacheEntry>, StoreError>;

    /// Store one entry, creating the cache if absent.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StoreError>;

    /// Store entries all-or-nothing, creating the cache if absent.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError>;

    /// URLs stored in a cache.
    async fn urls(&self, name: &str) -> Result<Vec<String>, StoreError>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use swcache_net::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};

    #[test]
    fn test_cache_key_strips_fragment() {
        let url = Url::parse("https://example.com/page?x=1#section").unwrap();
        assert_eq!(cache_key(&url), "https://example.com/page?x=1");
    }

    #[test]
    fn test_entry_from_response_keeps_error_status() {
        let url = Url::parse("https://example.com/user/7").unwrap();
        let request = Request::get(url.clone());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let response = Response::new(url, StatusCode::NOT_FOUND, headers, "missing");

        let entry = CacheEntry::from_response(&request, &response).unwrap();
        assert_eq!(entry.status, 404);
        assert_eq!(entry.body, b"missing");
        assert_eq!(
            entry.headers,
            vec![("content-type".to_string(), b"text/html".to_vec())]
        );
        assert!(entry.cached_at > 0);

        let restored = entry.to_response().unwrap();
        assert_eq!(restored.status, StatusCode::NOT_FOUND);
        assert!(restored.from_cache);
        assert_eq!(restored.text().unwrap(), "missing");
    }

    #[test]
    fn test_entry_keeps_non_utf8_header_bytes() {
        let url = Url::parse("https://example.com/static/report.pdf").unwrap();
        let request = Request::get(url.clone());
        let disposition = b"attachment; filename=\"r\xe9sum\xe9.pdf\"";
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_bytes(disposition).unwrap(),
        );
        let response = Response::new(url, StatusCode::OK, headers.clone(), "pdf");

        let entry = CacheEntry::from_response(&request, &response).unwrap();
        assert_eq!(entry.headers[0].1, disposition.to_vec());

        let restored = entry.to_response().unwrap();
        assert_eq!(restored.headers, headers);
    }

    #[test]
    fn test_entry_rejects_post() {
        let url = Url::parse("https://example.com/create_user").unwrap();
        let request = Request::new(Method::POST, url.clone());
        let response = Response::new(url, StatusCode::OK, HeaderMap::new(), "ok");

        assert!(matches!(
            CacheEntry::from_response(&request, &response),
            Err(StoreError::UnsupportedMethod(m)) if m == "POST"
        ));
    }

    #[test]
    fn test_corrupt_entry_is_reported() {
        let mut entry = test_support::entry("not a url", "x");
        assert!(matches!(entry.to_response(), Err(StoreError::Corrupt { .. })));

        entry.url = "https://example.com/".to_string();
        entry.status = 42;
        assert!(matches!(entry.to_response(), Err(StoreError::Corrupt { .. })));
    }
}
