//! Transport layer implementations
//!
//! Every transport presents the same contract: `open()` (idempotent),
//! `send()` (fire-and-forget JSON-RPC frame), `close()` (graceful), plus a
//! lifecycle event stream the connection consumes.
//!
//! Supported variants:
//! - STDIO (child process, newline-delimited JSON)
//! - SSE (HTTP event stream in, HTTP POST out)
//! - WebSocket (full-duplex)
//! - Streamable HTTP (chunked HTTP with session header)

use crate::config::{McpServerConfig, TransportConfig, TransportKind};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod sse;
pub mod stdio;
pub mod streamable_http;
pub mod websocket;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(std::io::Error),

    #[error("No {0} available")]
    MissingPipe(&'static str),

    #[error("Transport not open")]
    NotOpen,

    #[error("Transport closed")]
    Closed,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("HTTP {status} {reason}: {body}")]
    HttpStatus {
        status: u16,
        reason: String,
        body: String,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timeout")]
    Timeout,
}

impl TransportError {
    pub fn http_status(status: reqwest::StatusCode, body: String) -> Self {
        TransportError::HttpStatus {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            body,
        }
    }
}

/// Lifecycle events a transport reports to its connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Opened,
    Message(Value),
    Closed,
    Errored(String),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Uniform message-stream contract shared by all transport variants.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish the underlying channel. Idempotent.
    async fn open(&self) -> Result<(), TransportError>;

    /// Send one JSON-RPC frame. Responses arrive on the event stream.
    async fn send(&self, frame: Value) -> Result<(), TransportError>;

    /// Graceful shutdown of the underlying channel.
    async fn close(&self) -> Result<(), TransportError>;

    /// Session id the remote assigned during initialization, when the
    /// variant supports sessions.
    fn assigned_session_id(&self) -> Option<String> {
        None
    }
}

/// Inputs a transport needs beyond its static configuration.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Bearer token included on transports that carry headers.
    pub auth_token: Option<String>,
    /// Prior streamable-http session id offered up front so the server may
    /// resume; the server decides.
    pub session_id: Option<String>,
}

/// Construct the transport variant selected by the descriptor, returning the
/// handle and the receiving end of its event stream.
pub fn build_transport(
    config: &McpServerConfig,
    opts: TransportOptions,
) -> Result<(Arc<dyn Transport>, TransportEventReceiver), TransportError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let transport: Arc<dyn Transport> = match config.effective_kind() {
        TransportKind::Stdio => {
            let TransportConfig::Stdio { command, args, env } = &config.transport else {
                return Err(TransportError::InvalidEndpoint(
                    "stdio transport requires a command".into(),
                ));
            };
            Arc::new(stdio::StdioTransport::new(
                config.name.clone(),
                command.clone(),
                args.clone(),
                env.clone(),
                events_tx,
            ))
        },
        TransportKind::Sse => {
            let url = require_url(config)?;
            Arc::new(sse::SseTransport::new(
                config.name.clone(),
                url,
                config.headers().cloned().unwrap_or_default(),
                opts.auth_token,
                events_tx,
            )?)
        },
        TransportKind::Websocket => {
            let url = require_url(config)?;
            Arc::new(websocket::WebSocketTransport::new(
                config.name.clone(),
                url,
                config.headers().cloned().unwrap_or_default(),
                opts.auth_token,
                events_tx,
            ))
        },
        TransportKind::StreamableHttp => {
            let url = require_url(config)?;
            Arc::new(streamable_http::StreamableHttpTransport::new(
                config.name.clone(),
                url,
                config.headers().cloned().unwrap_or_default(),
                opts.auth_token,
                opts.session_id,
                events_tx,
            ))
        },
    };

    Ok((transport, events_rx))
}

fn require_url(config: &McpServerConfig) -> Result<String, TransportError> {
    config
        .url()
        .map(String::from)
        .ok_or_else(|| TransportError::InvalidEndpoint("transport requires a url".into()))
}

/// True when a frame looks like a JSON-RPC message worth delivering.
pub(crate) fn is_jsonrpc_frame(value: &Value) -> bool {
    value.is_object()
        && (value.get("jsonrpc").is_some()
            || value.get("method").is_some()
            || value.get("result").is_some()
            || value.get("error").is_some())
}
