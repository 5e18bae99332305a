//! The caching agent and its three lifecycle handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use swcache_net::{Network, Request, Response};
use swcache_store::{CacheEntry, CacheStore};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::clients::Clients;
use crate::config::{AgentConfig, ResolvedUrls};
use crate::error::{AgentError, AgentResult};

// ==================== State ====================

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentState {
    /// Constructed, install not yet run.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Manifest precached.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed; this version will never activate.
    Redundant,
}

/// Agent events for the hosting runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// State changed.
    StateChange { version: String, state: AgentState },
    /// A client is now served by `version`.
    ControllerChange { client_id: String, version: String },
}

/// Result of the fetch handler.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The agent does not handle this request; the host should send it as-is.
    Declined(Request),
    /// The agent produced a response.
    Responded(Response),
}

// ==================== Agent ====================

/// Offline caching agent.
///
/// The store and network are injected; nothing here is ambient.
pub struct CacheAgent {
    cache_name: String,
    urls: ResolvedUrls,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    clients: Arc<RwLock<Clients>>,
    state: RwLock<AgentState>,
    skip_waiting: AtomicBool,
    /// Background cache writes not yet awaited.
    pending: Mutex<Vec<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
}

impl CacheAgent {
    /// Create an agent for `config`.
    pub fn new(
        config: &AgentConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
    ) -> AgentResult<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                cache_name: config.cache_name.clone(),
                urls: config.resolve()?,
                store,
                network,
                clients: Arc::new(RwLock::new(Clients::new())),
                state: RwLock::new(AgentState::Parsed),
                skip_waiting: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                event_tx,
            },
            event_rx,
        ))
    }

    /// Current cache version.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn origin(&self) -> &Url {
        &self.urls.origin
    }

    /// Absolute manifest URLs, in precache order.
    pub fn manifest(&self) -> &[Url] {
        &self.urls.manifest
    }

    pub fn offline_url(&self) -> &Url {
        &self.urls.offline
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Whether install asked to bypass the waiting stage.
    pub fn skips_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::Acquire)
    }

    /// Shared clients registry.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    async fn set_state(&self, state: AgentState) {
        *self.state.write().await = state;
        debug!(version = %self.cache_name, ?state, "state change");
        let _ = self.event_tx.send(AgentEvent::StateChange {
            version: self.cache_name.clone(),
            state,
        });
    }

    async fn transition(&self, from: AgentState, to: AgentState) -> AgentResult<()> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(AgentError::state(format!(
                "expected {from:?}, agent is {:?}",
                *state
            )));
        }
        *state = to;
        drop(state);

        debug!(version = %self.cache_name, state = ?to, "state change");
        let _ = self.event_tx.send(AgentEvent::StateChange {
            version: self.cache_name.clone(),
            state: to,
        });
        Ok(())
    }

    // ==================== Install ====================

    /// Precache the manifest into the current version.
    ///
    /// All-or-nothing: any asset failing at the network layer or answering
    /// with a non-2xx status aborts the install, writes nothing and leaves the
    /// agent [`AgentState::Redundant`]. On success the agent skips waiting.
    pub async fn install(&self) -> AgentResult<()> {
        self.transition(AgentState::Parsed, AgentState::Installing)
            .await?;
        info!(version = %self.cache_name, assets = self.urls.manifest.len(), "installing");

        if let Err(e) = self.precache().await {
            warn!(version = %self.cache_name, error = %e, "install failed");
            self.set_state(AgentState::Redundant).await;
            return Err(e);
        }

        self.skip_waiting.store(true, Ordering::Release);
        self.set_state(AgentState::Installed).await;
        info!(version = %self.cache_name, "installed");
        Ok(())
    }

    async fn precache(&self) -> AgentResult<()> {
        self.store.open(&self.cache_name).await?;

        let entries =
            try_join_all(self.urls.manifest.iter().map(|url| self.fetch_asset(url))).await?;

        self.store.put_all(&self.cache_name, entries).await?;
        Ok(())
    }

    async fn fetch_asset(&self, url: &Url) -> AgentResult<CacheEntry> {
        let request = Request::get(url.clone());
        let response = self
            .network
            .fetch(request.clone())
            .await
            .map_err(|e| AgentError::install(url, e))?;

        if !response.ok() {
            return Err(AgentError::install(
                url,
                format!("bad status {}", response.status),
            ));
        }

        trace!(url = %url, bytes = response.body().len(), "asset fetched");
        Ok(CacheEntry::from_response(&request, &response)?)
    }

    // ==================== Activate ====================

    /// Prune every other cache version, then claim open clients.
    ///
    /// Deletions run concurrently and their failures are ignored. The claim
    /// completes before this returns.
    pub async fn activate(&self) -> AgentResult<()> {
        self.transition(AgentState::Installed, AgentState::Activating)
            .await?;

        let names = match self.store.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(version = %self.cache_name, error = %e, "listing caches failed");
                self.set_state(AgentState::Installed).await;
                return Err(e.into());
            }
        };

        let stale: Vec<String> = names
            .into_iter()
            .filter(|name| name != &self.cache_name)
            .collect();

        join_all(stale.iter().map(|name| async move {
            match self.store.delete(name).await {
                Ok(_) => debug!(cache = %name, "pruned stale cache"),
                Err(e) => debug!(cache = %name, error = %e, "pruning failed, ignored"),
            }
        }))
        .await;

        let claimed = self
            .clients
            .write()
            .await
            .claim(&self.urls.origin, &self.cache_name);
        for client_id in &claimed {
            let _ = self.event_tx.send(AgentEvent::ControllerChange {
                client_id: client_id.clone(),
                version: self.cache_name.clone(),
            });
        }

        self.set_state(AgentState::Activated).await;
        info!(
            version = %self.cache_name,
            pruned = stale.len(),
            claimed = claimed.len(),
            "activated"
        );
        Ok(())
    }

    // ==================== Fetch ====================

    /// Handle an intercepted request.
    ///
    /// Non-GET requests are declined without touching the store. GET requests
    /// go network-first: any network response (whatever its status) is
    /// returned, and same-origin ones are copied into the cache in the
    /// background. On network failure the cached response is used, then the
    /// cached offline page; with neither, [`AgentError::Offline`].
    pub async fn handle_fetch(&self, request: Request) -> AgentResult<FetchOutcome> {
        if !request.is_get() {
            trace!(url = %request.url, method = %request.method, "declined");
            return Ok(FetchOutcome::Declined(request));
        }

        match self.network.fetch(request.clone()).await {
            Ok(response) => {
                if request.is_same_origin(&self.urls.origin) {
                    self.cache_in_background(request, response.clone());
                }
                Ok(FetchOutcome::Responded(response))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "network failed, falling back to cache");
                self.cache_fallback(&request).await.map(FetchOutcome::Responded)
            }
        }
    }

    /// [`handle_fetch`](Self::handle_fetch), sending declined requests
    /// straight to the network.
    pub async fn fetch(&self, request: Request) -> AgentResult<Response> {
        match self.handle_fetch(request).await? {
            FetchOutcome::Responded(response) => Ok(response),
            FetchOutcome::Declined(request) => Ok(self.network.fetch(request).await?),
        }
    }

    fn cache_in_background(&self, request: Request, response: Response) {
        let store = Arc::clone(&self.store);
        let cache_name = self.cache_name.clone();

        let handle = tokio::spawn(async move {
            let result = match CacheEntry::from_response(&request, &response) {
                Ok(entry) => store.put(&cache_name, entry).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => trace!(url = %request.url, status = %response.status, "cached"),
                Err(e) => warn!(url = %request.url, error = %e, "background cache write failed"),
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    async fn cache_fallback(&self, request: &Request) -> AgentResult<Response> {
        if let Some(entry) = self.store.match_any(&request.url).await? {
            debug!(url = %request.url, "served from cache");
            return Ok(entry.to_response()?);
        }

        if let Some(entry) = self.store.match_any(&self.urls.offline).await? {
            debug!(url = %request.url, "served offline page");
            return Ok(entry.to_response()?);
        }

        warn!(url = %request.url, "offline with nothing cached");
        Err(AgentError::Offline {
            url: request.url.to_string(),
        })
    }

    /// Wait for every background cache write issued so far.
    pub async fn settle(&self) {
        loop {
            let handles = {
                let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                std::mem::take(&mut *pending)
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "background cache write panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swcache_net::NetError;
    use swcache_store::MemoryCacheStorage;

    struct Unreachable;

    #[async_trait::async_trait]
    impl Network for Unreachable {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            Err(NetError::RequestFailed(format!("unreachable: {}", request.url)))
        }
    }

    fn agent() -> (CacheAgent, mpsc::UnboundedReceiver<AgentEvent>) {
        CacheAgent::new(
            &AgentConfig::default(),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(Unreachable),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_agent_is_parsed() {
        let (agent, _rx) = agent();
        assert_eq!(agent.state().await, AgentState::Parsed);
        assert!(!agent.skips_waiting());
        assert_eq!(agent.manifest().len(), 6);
        assert_eq!(agent.offline_url().path(), "/offline.html");
    }

    #[tokio::test]
    async fn test_activate_before_install_is_rejected() {
        let (agent, _rx) = agent();
        assert!(matches!(agent.activate().await, Err(AgentError::State(_))));
        assert_eq!(agent.state().await, AgentState::Parsed);
    }

    #[tokio::test]
    async fn test_install_offline_goes_redundant() {
        let (agent, mut rx) = agent();

        let err = agent.install().await.unwrap_err();
        assert!(matches!(err, AgentError::InstallFailed { .. }));
        assert_eq!(agent.state().await, AgentState::Redundant);
        assert!(!agent.skips_waiting());

        assert_eq!(
            rx.recv().await,
            Some(AgentEvent::StateChange {
                version: "photoshoot-cache-v2".to_string(),
                state: AgentState::Installing,
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(AgentEvent::StateChange {
                version: "photoshoot-cache-v2".to_string(),
                state: AgentState::Redundant,
            })
        );
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let (agent, _rx) = agent();
        let _ = agent.install().await;
        assert!(matches!(agent.install().await, Err(AgentError::State(_))));
    }

    #[tokio::test]
    async fn test_settle_with_nothing_pending() {
        let (agent, _rx) = agent();
        agent.settle().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = AgentConfig {
            cache_name: String::new(),
            ..AgentConfig::default()
        };
        let result = CacheAgent::new(
            &config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(Unreachable),
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
