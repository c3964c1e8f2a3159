//! Error handling for the pool node coordinator
//!
//! Error types covering node RPC calls, block announcements, the shared
//! template store and configuration, with retry classification.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the pool node coordinator
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite template store errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Error object returned by the node's JSON-RPC server
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Node communication errors that carry no RPC error object
    #[error("Node error: {message}")]
    Node { message: String },

    /// Every attempt of a bounded mining-state query failed
    #[error("Node unavailable after {attempts} attempts")]
    NodeUnavailable { attempts: usize },

    /// Template store errors
    #[error("Template store error: {message}")]
    Store { message: String },

    /// Block announcement subscription errors
    #[error("Subscription error: {message}")]
    Subscription { message: String },

    /// A retry loop hit its ceiling
    #[error("Gave up on {operation} after {elapsed:?}")]
    GaveUp { operation: String, elapsed: Duration },

    /// Invalid state errors
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an RPC error
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create a node error
    pub fn node(message: impl Into<String>) -> Self {
        Self::Node {
            message: message.into(),
        }
    }

    /// Create a template store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a subscription error
    pub fn subscription(message: impl Into<String>) -> Self {
        Self::Subscription {
            message: message.into(),
        }
    }

    /// Create a gave-up error
    pub fn gave_up(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::GaveUp {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            // -28: node is still warming up (loading block index, verifying blocks)
            // -10: node is in initial block download
            Error::Rpc { code, .. } => matches!(code, -28 | -10 | -9),
            Error::Node { .. } => true,
            Error::NodeUnavailable { .. } => true,
            Error::Io(_) => true,
            Error::Subscription { .. } => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Sqlite(_) => "sqlite",
            Error::Config { .. } => "config",
            Error::Rpc { .. } => "rpc",
            Error::Node { .. } => "node",
            Error::NodeUnavailable { .. } => "node_unavailable",
            Error::Store { .. } => "store",
            Error::Subscription { .. } => "subscription",
            Error::GaveUp { .. } => "gave_up",
            Error::InvalidState { .. } => "invalid_state",
        }
    }
}
