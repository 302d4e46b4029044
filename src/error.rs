//! Error types for mcplex

use crate::session::SessionErrorKind;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Transport error for server {server}: {message}")]
    Transport { server: String, message: String },

    #[error("RPC error {code} from server {server}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("Authorization required for server {0}")]
    AuthRequired(String),

    #[error("Authorization failed for server {server}: {reason}")]
    AuthFailed { server: String, reason: String },

    #[error("Session error ({kind}) for server {server}: {message}")]
    Session {
        server: String,
        kind: SessionErrorKind,
        message: String,
    },

    #[error("Timeout after {0}ms: {1}")]
    Timeout(u64, String),

    #[error("Tool call failed on server {server}: {message}")]
    Tool { server: String, message: String },

    #[error("Manager is shutting down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a transport-level failure with the server it belongs to.
    pub fn transport(server: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transport {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn auth_failed(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::AuthFailed {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// True for the authorization-trigger signature: a message containing
    /// `401` (including the wrapped `Non-200 status code (401)` rendering) or
    /// a JSON-RPC error code of 401 or 403.
    pub fn is_auth_error(&self) -> bool {
        match self {
            Error::Rpc { code, .. } if *code == 401 || *code == 403 => true,
            Error::AuthRequired(_) | Error::AuthFailed { .. } => true,
            other => {
                let text = other.to_string();
                text.contains("401") || text.contains("Non-200 status code (401)")
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Timeout(..) | Error::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_detection() {
        let err = Error::transport("gh", "Non-200 status code (401)");
        assert!(err.is_auth_error());

        let err = Error::Rpc {
            server: "gh".into(),
            code: 403,
            message: "forbidden".into(),
        };
        assert!(err.is_auth_error());

        let err = Error::transport("gh", "connection refused");
        assert!(!err.is_auth_error());
    }
}
