//! # swcache Agent
//!
//! An offline-capable asset caching agent for a web client.
//!
//! ## Features
//!
//! - **Install**: precache a fixed asset manifest, all-or-nothing
//! - **Activate**: prune stale cache versions, claim open clients
//! - **Fetch**: network-first for GET, falling back to the cache and then to
//!   the offline page
//!
//! ## Architecture
//!
//! ```text
//! CacheAgent
//!     ├── install()      ──► Network ──► CacheStore::put_all
//!     ├── activate()     ──► CacheStore::keys / delete, Clients::claim
//!     └── handle_fetch() ──► Network ──┬─► response (+ background put)
//!                                      └─► CacheStore::match_any ─► offline page
//! ```

use std::sync::Arc;

use swcache_net::{LoaderConfig, ResourceLoader};
use swcache_store::SqliteCacheStorage;
use tokio::sync::mpsc;
use tracing::debug;

pub mod agent;
pub mod clients;
pub mod config;
pub mod error;

pub use agent::{AgentEvent, AgentState, CacheAgent, FetchOutcome};
pub use clients::{Client, Clients};
pub use config::{AgentConfig, LogSettings, CACHE_NAME, OFFLINE_URL, STATIC_ASSETS};
pub use error::{AgentError, AgentResult};

/// Wire up a production agent: logging, SQLite storage, live network.
///
/// A global subscriber installed earlier by the host is kept.
pub fn bootstrap(
    config: &AgentConfig,
) -> AgentResult<(CacheAgent, mpsc::UnboundedReceiver<AgentEvent>)> {
    if let Err(e) = swcache_common::init_logging(config.log_config()) {
        debug!(error = %e, "keeping existing subscriber");
    }

    if let Some(dir) = config.database_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store = SqliteCacheStorage::open(&config.database_path)?;
    let network = ResourceLoader::new(LoaderConfig::default())?;

    CacheAgent::new(config, Arc::new(store), Arc::new(network))
}
