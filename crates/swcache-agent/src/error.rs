//! Error types for the caching agent

use swcache_net::NetError;
use swcache_store::StoreError;
use thiserror::Error;

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Main error type for the caching agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// A manifest asset could not be fetched; the install is aborted.
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    /// Network down, nothing cached for the request and no offline page.
    #[error("Offline with no cached response for {url}")]
    Offline { url: String },

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub(crate) fn install(url: &url::Url, reason: impl ToString) -> Self {
        Self::InstallFailed {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
