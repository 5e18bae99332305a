//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use swcache_common::{LogConfig, LogFormat};
use tracing::Level;
use url::Url;

use crate::error::{AgentError, AgentResult};

/// Current cache version.
pub const CACHE_NAME: &str = "photoshoot-cache-v2";

/// Page served when a request fails and nothing better is cached.
pub const OFFLINE_URL: &str = "/offline.html";

/// Assets precached at install time.
pub const STATIC_ASSETS: [&str; 6] = [
    "/",
    "/offline.html",
    "/static/css/style.css",
    "/static/js/main.js",
    "/static/icons/icon-192.png",
    "/static/icons/icon-512.png",
];

/// Origin of the hosting pages.
pub const DEFAULT_ORIGIN: &str = "http://localhost:5000/";

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Cache version; every other cache is pruned on activation
    pub cache_name: String,

    /// Origin of controlled pages; only same-origin responses are cached
    pub origin: String,

    /// Offline fallback path, must be one of `static_assets`
    pub offline_url: String,

    /// Paths precached at install time, resolved against `origin`
    pub static_assets: Vec<String>,

    /// SQLite database backing the cache storage
    pub database_path: PathBuf,

    /// Logging settings
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// One of trace, debug, info, warn, error
    pub level: String,

    /// One of pretty, compact, json
    pub format: String,

    /// Optional `EnvFilter` directive string
    pub filter: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cache_name: CACHE_NAME.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            offline_url: OFFLINE_URL.to_string(),
            static_assets: STATIC_ASSETS.iter().map(|s| s.to_string()).collect(),
            database_path: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("swcache")
                .join("caches.sqlite3"),
            log: LogSettings::default(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            filter: None,
        }
    }
}

impl AgentConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> AgentResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config can drive an agent.
    pub fn validate(&self) -> AgentResult<()> {
        if self.cache_name.is_empty() {
            return Err(AgentError::config("cache_name must not be empty"));
        }
        if !self.static_assets.iter().any(|a| a == &self.offline_url) {
            return Err(AgentError::config(format!(
                "offline_url {} is not precached",
                self.offline_url
            )));
        }
        self.resolve()?;
        Ok(())
    }

    /// Resolve the origin, manifest and offline page to absolute URLs.
    pub(crate) fn resolve(&self) -> AgentResult<ResolvedUrls> {
        let origin = Url::parse(&self.origin)?;
        if !origin.origin().is_tuple() {
            return Err(AgentError::config(format!(
                "origin {} has no host",
                self.origin
            )));
        }

        let manifest = self
            .static_assets
            .iter()
            .map(|asset| origin.join(asset))
            .collect::<Result<Vec<_>, _>>()?;
        let offline = origin.join(&self.offline_url)?;

        Ok(ResolvedUrls {
            origin,
            manifest,
            offline,
        })
    }

    /// Logging configuration derived from `log`.
    pub fn log_config(&self) -> LogConfig {
        let level = self.log.level.parse::<Level>().unwrap_or(Level::INFO);
        let format = self.log.format.parse::<LogFormat>().unwrap_or_default();

        let mut config = if format == LogFormat::Json {
            LogConfig::production()
        } else if level == Level::DEBUG || level == Level::TRACE {
            LogConfig::debug()
        } else {
            LogConfig::default()
        };
        config.level = level;
        config = config.with_format(format);
        if let Some(ref filter) = self.log.filter {
            config = config.with_filter(filter.clone());
        }
        config
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedUrls {
    pub origin: Url,
    pub manifest: Vec<Url>,
    pub offline: Url,
}
