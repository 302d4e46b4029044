//! Streamable HTTP transport
//!
//! A chunked HTTP connection to a single endpoint. Each outbound frame is an
//! HTTP POST; responses come back as JSON or as SSE-framed chunks on the POST
//! body. During the initialization exchange the server may assign an opaque
//! session id via the `Mcp-Session-Id` header; subsequent requests echo it.
//! When constructed with a prior session id, that id is offered from the
//! first request so the server may resume; the server decides.

use super::sse::parse_sse_block;
use super::{is_jsonrpc_frame, Transport, TransportError, TransportEvent, TransportEventSender};
use crate::config::TransportKind;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct StreamableHttpTransport {
    server: String,
    endpoint: String,
    headers: HashMap<String, String>,
    auth_token: Option<String>,
    client: Client,
    events: TransportEventSender,
    session_id: RwLock<Option<String>>,
    opened: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(
        server: String,
        endpoint: String,
        headers: HashMap<String, String>,
        auth_token: Option<String>,
        prior_session_id: Option<String>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            server,
            endpoint,
            headers,
            auth_token,
            client: Client::new(),
            events,
            session_id: RwLock::new(prior_session_id),
            opened: AtomicBool::new(false),
        }
    }

    fn extract_session_id(&self, response: &reqwest::Response) {
        if let Some(header) = response.headers().get("mcp-session-id") {
            if let Ok(session_str) = header.to_str() {
                let mut slot = self.session_id.write();
                if slot.as_deref() != Some(session_str) {
                    debug!(
                        "Server {} assigned session id: {}",
                        self.server, session_str
                    );
                    *slot = Some(session_str.to_string());
                }
            }
        }
    }

    fn emit_body_frames(&self, content_type: &str, body: &str) {
        if content_type.contains("text/event-stream") {
            let normalized = body.replace('\r', "");
            for block in normalized.split("\n\n") {
                if let Some(frame) = parse_sse_block(block) {
                    if let Ok(value) = serde_json::from_str::<Value>(&frame.data) {
                        if is_jsonrpc_frame(&value) {
                            let _ = self.events.send(TransportEvent::Message(value));
                        }
                    }
                }
            }
        } else {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                return;
            }
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                if is_jsonrpc_frame(&value) {
                    let _ = self.events.send(TransportEvent::Message(value));
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn open(&self) -> Result<(), TransportError> {
        // The channel is per-request; the first POST performs the handshake.
        if !self.opened.swap(true, Ordering::SeqCst) {
            info!("Opened streamable HTTP channel to server {}", self.server);
            let _ = self.events.send(TransportEvent::Opened);
        }
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), TransportError> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(session_id) = self.session_id.read().clone() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.json(&frame).send().await?;

        self.extract_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = TransportError::http_status(status, body);
            // Surface on the event stream too so session-error classification
            // can drive recovery.
            let _ = self.events.send(TransportEvent::Errored(err.to_string()));
            return Err(err);
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response.text().await.unwrap_or_default();
        self.emit_body_frames(&content_type, &body);

        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.opened.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
        Ok(())
    }

    fn assigned_session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }
}
