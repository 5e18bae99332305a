//! SQLite-backed cache storage, durable across process restarts.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use url::Url;

use crate::{cache_key, CacheEntry, CacheStore, StoreError};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS caches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS entries (
        cache_id INTEGER NOT NULL REFERENCES caches(id) ON DELETE CASCADE,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        status INTEGER NOT NULL,
        headers TEXT NOT NULL,
        body BLOB NOT NULL,
        cached_at INTEGER NOT NULL,
        PRIMARY KEY (cache_id, url)
    );
";

/// [`CacheStore`] persisted in a SQLite database.
///
/// The connection is shared behind a mutex and driven from the blocking pool.
#[derive(Clone)]
pub struct SqliteCacheStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStorage {
    /// Open (creating if needed) the database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        info!("Opening cache storage at {:?}", db_path.as_ref());
        Self::init(Connection::open(db_path)?)
    }

    /// A private, non-persistent database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *conn)
        })
        .await?
    }
}

fn ensure_cache(conn: &Connection, name: &str) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?1, ?2)",
        params![name, swcache_common::now_millis() as i64],
    )?;
    let id = conn.query_row(
        "SELECT id FROM caches WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn insert_entry(conn: &Connection, cache_id: i64, entry: &CacheEntry) -> Result<(), StoreError> {
    let headers = serde_json::to_string(&entry.headers)?;
    conn.execute(
        "INSERT OR REPLACE INTO entries (cache_id, url, method, status, headers, body, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            cache_id,
            entry.url,
            entry.method,
            entry.status as i64,
            headers,
            entry.body,
            entry.cached_at as i64
        ],
    )?;
    Ok(())
}

struct RawEntry {
    url: String,
    method: String,
    status: i64,
    headers: String,
    body: Vec<u8>,
    cached_at: i64,
}

impl RawEntry {
    const COLUMNS: &'static str = "e.url, e.method, e.status, e.headers, e.body, e.cached_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            url: row.get(0)?,
            method: row.get(1)?,
            status: row.get(2)?,
            headers: row.get(3)?,
            body: row.get(4)?,
            cached_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<CacheEntry, StoreError> {
        let status = u16::try_from(self.status).map_err(|e| StoreError::Corrupt {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        Ok(CacheEntry {
            headers: serde_json::from_str(&self.headers)?,
            url: self.url,
            method: self.method,
            status,
            body: self.body,
            cached_at: self.cached_at.max(0) as u64,
        })
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStorage {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| ensure_cache(conn, &name).map(|_| ()))
            .await
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT id FROM caches WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY id")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM caches WHERE name = ?1", params![name])?;
            debug!(cache = %name, removed, "delete cache");
            Ok(removed > 0)
        })
        .await
    }

    async fn match_request(&self, name: &str, url: &Url) -> Result<Option<CacheEntry>, StoreError> {
        let name = name.to_string();
        let key = cache_key(url);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM entries e JOIN caches c ON c.id = e.cache_id
                 WHERE c.name = ?1 AND e.url = ?2",
                RawEntry::COLUMNS
            );
            conn.query_row(&sql, params![name, key], RawEntry::from_row)
                .optional()?
                .map(RawEntry::decode)
                .transpose()
        })
        .await
    }

    async fn match_any(&self, url: &Url) -> Result<Option<CacheEntry>, StoreError> {
        let key = cache_key(url);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM entries e JOIN caches c ON c.id = e.cache_id
                 WHERE e.url = ?1 ORDER BY c.id LIMIT 1",
                RawEntry::COLUMNS
            );
            conn.query_row(&sql, params![key], RawEntry::from_row)
                .optional()?
                .map(RawEntry::decode)
                .transpose()
        })
        .await
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StoreError> {
        entry.check_method()?;
        let name = name.to_string();
        self.with_conn(move |conn| {
            let cache_id = ensure_cache(conn, &name)?;
            insert_entry(conn, cache_id, &entry)
        })
        .await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        for entry in &entries {
            entry.check_method()?;
        }
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let cache_id = ensure_cache(&tx, &name)?;
            for entry in &entries {
                insert_entry(&tx, cache_id, entry)?;
            }
            tx.commit()?;
            debug!(cache = %name, count = entries.len(), "bulk put committed");
            Ok(())
        })
        .await
    }

    async fn urls(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.url FROM entries e JOIN caches c ON c.id = e.cache_id
                 WHERE c.name = ?1 ORDER BY e.url",
            )?;
            let urls = stmt
                .query_map(params![name], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(urls)
        })
        .await
    }
}
