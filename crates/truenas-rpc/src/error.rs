//! Error types for the truenas-rpc crate.
//!
//! [`Error`] is what callers of the [`Client`](crate::Client) see. Failures of the
//! underlying socket are carried as [`TransportError`](crate::transport::TransportError)
//! inside [`Error::Transport`]; malformed inbound messages never surface here because
//! the dispatch loop drops them.

use std::time::Duration;

use serde_json::Value;

use crate::jobs::JobId;
use crate::protocol::RpcError;
use crate::transport::TransportError;

/// Unified error type for client operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected response")]
    UnexpectedResponse,

    #[error("unexpected response format for job")]
    UnexpectedJobFormat,

    #[error("Job {id} failed: {message}")]
    JobFailed { id: JobId, message: String },

    #[error("Login rejected by server")]
    LoginRejected,

    #[error("Either username/password or API key must be provided")]
    MissingCredentials,

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    #[cfg(test)]
    pub(crate) fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// True for failures of the connection itself rather than of a single call.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Transport(_) | Self::ConnectionClosed
        )
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        let message = e.display_message();
        Self::Rpc {
            code: e.code.unwrap_or_default(),
            message,
            data: e.data,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
