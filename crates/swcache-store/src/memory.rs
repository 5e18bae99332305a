//! Process-local cache storage.

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::{cache_key, CacheEntry, CacheStore, StoreError};

/// A cache instance.
#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Names in creation order.
    order: Vec<String>,
    caches: HashMap<String, Cache>,
}

impl Inner {
    fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches.entry(name.to_string()).or_default()
    }
}

/// In-memory [`CacheStore`]. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    inner: RwLock<Inner>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        self.inner.write().await.open(name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.caches.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().await.order.clone())
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        inner.order.retain(|n| n != name);
        Ok(inner.caches.remove(name).is_some())
    }

    async fn match_request(&self, name: &str, url: &Url) -> Result<Option<CacheEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .caches
            .get(name)
            .and_then(|cache| cache.entries.get(&cache_key(url)))
            .cloned())
    }

    async fn match_any(&self, url: &Url) -> Result<Option<CacheEntry>, StoreError> {
        let key = cache_key(url);
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|name| inner.caches.get(name))
            .find_map(|cache| cache.entries.get(&key))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StoreError> {
        entry.check_method()?;
        trace!(cache = name, url = %entry.url, "put");
        self.inner
            .write()
            .await
            .open(name)
            .entries
            .insert(entry.url.clone(), entry);
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        // Validate everything before touching the map.
        for entry in &entries {
            entry.check_method()?;
        }
        let mut inner = self.inner.write().await;
        let cache = inner.open(name);
        for entry in entries {
            cache.entries.insert(entry.url.clone(), entry);
        }
        Ok(())
    }

    async fn urls(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut urls: Vec<String> = inner
            .caches
            .get(name)
            .map(|cache| cache.entries.keys().cloned().collect())
            .unwrap_or_default();
        urls.sort();
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entry, url};

    #[tokio::test]
    async fn test_open_has_delete() {
        let storage = MemoryCacheStorage::new();

        assert!(!storage.has("v1").await.unwrap());

        storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await.unwrap());

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_in_creation_order() {
        let storage = MemoryCacheStorage::new();
        storage.open("v2").await.unwrap();
        storage.open("v1").await.unwrap();
        storage.open("v2").await.unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["v2", "v1"]);
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let storage = MemoryCacheStorage::new();
        storage
            .put("v1", entry("https://example.com/style.css", "css"))
            .await
            .unwrap();

        let hit = storage
            .match_request("v1", &url("https://example.com/style.css#top"))
            .await
            .unwrap();
        assert_eq!(hit.unwrap().body, b"css");

        assert!(storage
            .match_request("v1", &url("https://example.com/other.css"))
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .match_request("missing", &url("https://example.com/style.css"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let storage = MemoryCacheStorage::new();
        storage.put("v1", entry("https://example.com/", "old")).await.unwrap();
        storage.put("v1", entry("https://example.com/", "new")).await.unwrap();

        let hit = storage.match_request("v1", &url("https://example.com/")).await.unwrap();
        assert_eq!(hit.unwrap().body, b"new");
        assert_eq!(storage.urls("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_match_any_prefers_oldest_cache() {
        let storage = MemoryCacheStorage::new();
        storage.put("v1", entry("https://example.com/", "one")).await.unwrap();
        storage.put("v2", entry("https://example.com/", "two")).await.unwrap();
        storage.put("v2", entry("https://example.com/b", "b")).await.unwrap();

        let hit = storage.match_any(&url("https://example.com/")).await.unwrap();
        assert_eq!(hit.unwrap().body, b"one");

        let hit = storage.match_any(&url("https://example.com/b")).await.unwrap();
        assert_eq!(hit.unwrap().body, b"b");
    }

    #[tokio::test]
    async fn test_put_all_rejects_non_get_atomically() {
        let storage = MemoryCacheStorage::new();
        let mut bad = entry("https://example.com/b", "b");
        bad.method = "POST".to_string();

        let result = storage
            .put_all("v1", vec![entry("https://example.com/a", "a"), bad])
            .await;

        assert!(matches!(result, Err(StoreError::UnsupportedMethod(_))));
        assert!(storage.urls("v1").await.unwrap().is_empty());
        assert!(!storage.has("v1").await.unwrap());
    }
}
