// Source module - access to the ECS management API
//
// The core only sees the `MetricSource` capability: authenticate, and fetch one
// request with a token. Three outcomes matter to the caller: data, auth
// expired (one reconnect-and-retry), and any other failure.
//
// - `client`  - reqwest implementation against a real ECS endpoint
// - `session` - per-connection token state with serialized refresh
// - `adapter` - authenticated fetch with the single-retry policy

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::ConnectionSettings;

pub mod adapter;
pub mod client;
pub mod session;

pub use adapter::fetch;
pub use session::Session;

/// One request against the management API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    /// Path relative to the endpoint root, e.g. `/object/capacity.json`
    pub path: String,

    /// Query string parameters
    pub query: Vec<(String, String)>,
}

impl SourceRequest {
    pub fn new(path: impl Into<String>) -> Self {
        SourceRequest {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

/// Result of a single request as seen by the core
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Successful response with its parsed body
    Data(Value),

    /// The token is no longer valid; a fresh `connect()` is required
    AuthExpired,

    /// Any other failure (non-success status, transport error)
    Failed(String),

    /// Successful status whose body could not be parsed
    Malformed(String),
}

/// Capability every metric source must provide
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Exchanges credentials for a token; `None` when rejected or unreachable
    async fn authenticate(&self) -> Option<String>;

    /// Issues one authenticated request
    async fn fetch(&self, request: &SourceRequest, token: &str) -> FetchOutcome;
}

/// A configured endpoint together with its transport and session
///
/// Shared by every poller that targets the endpoint. Only the session's token
/// ever changes after construction.
pub struct Connection {
    settings: ConnectionSettings,
    source: Arc<dyn MetricSource>,
    session: Session,
}

impl Connection {
    pub fn new(settings: ConnectionSettings, source: Arc<dyn MetricSource>) -> Self {
        Connection {
            settings,
            source,
            session: Session::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.settings.host
    }

    /// Zone identity written as the `VDC` tag; falls back to the host
    pub fn zone(&self) -> &str {
        self.settings.vdc.as_deref().unwrap_or(&self.settings.host)
    }

    pub fn source(&self) -> &dyn MetricSource {
        self.source.as_ref()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
