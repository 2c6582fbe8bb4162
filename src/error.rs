//! Error taxonomy for the runtime, per spec §7.
//!
//! Typed enums are used everywhere below `main`; `anyhow::Error` is
//! reserved for the process-bootstrap boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server mode requires a non-empty `app` name")]
    MissingAppName,
    #[error("client mode requires a non-empty `calls` map")]
    MissingCalls,
    #[error("invalid regex route {path:?}: {source}")]
    InvalidRegexRoute {
        path: String,
        #[source]
        source: regex::Error,
    },
    #[error("regex route {0:?} has zero capture groups; register it as a static route instead")]
    RegexRouteWithoutCaptures(String),
    #[error("duplicate route for path {0:?}")]
    DuplicateRoute(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory transport error: {0}")]
    Transport(String),
    #[error("directory connection closed")]
    Closed,
    #[error("malformed pub/sub payload {0:?}")]
    MalformedPayload(String),
}

#[derive(Debug, Error, Clone)]
pub enum CallError {
    #[error("no live node for app {0:?}")]
    NoNode(String),
    #[error("all candidate nodes failed for app {0:?}")]
    AllNodesFailed(String),
    #[error("transport error calling {addr}: {message}")]
    Transport { addr: String, message: String },
    #[error("upstream {addr} returned status {status}")]
    UpstreamStatus { addr: String, status: u16 },
    #[error("unknown app {0:?}")]
    UnknownApp(String),
}

impl CallError {
    /// Failures that should count against the node and are eligible for
    /// a retry against a different candidate (spec §4.E "Failure predicate").
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            CallError::Transport { .. } | CallError::UpstreamStatus { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no route matched {0:?}")]
    NotFound(String),
    #[error("forbidden: auth level {required} required")]
    Forbidden { required: u32 },
    #[error("upgrade to websocket failed: {0}")]
    UpgradeFailed(String),
    #[error(transparent)]
    Call(#[from] CallError),
}
