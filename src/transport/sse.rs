//! SSE (Server-Sent Events) transport
//!
//! The inbound half is a long-lived HTTP request streaming `event:`/`data:`
//! frames; outbound messages go by separate HTTP POST to the message endpoint
//! the server announces in its `endpoint` event. The bearer token, when held,
//! rides on both directions.

use super::{is_jsonrpc_frame, Transport, TransportError, TransportEvent, TransportEventSender};
use crate::config::TransportKind;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// How long `send` waits for the server's endpoint announcement before
/// falling back to the base URL.
const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Parse a complete SSE block (the text between blank-line separators).
pub(crate) fn parse_sse_block(block: &str) -> Option<SseFrame> {
    let mut event = "message".to_string();
    let mut data_lines = Vec::new();

    for line in block.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("event:") {
            event = value.trim().to_string();
        } else if let Some(value) = trimmed.strip_prefix("data:") {
            data_lines.push(value.trim().to_string());
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        data: data_lines.join(""),
    })
}

pub struct SseTransport {
    server: String,
    base_url: Url,
    headers: HashMap<String, String>,
    auth_token: Option<String>,
    client: Client,
    events: TransportEventSender,
    post_endpoint: watch::Sender<Option<String>>,
    post_endpoint_rx: watch::Receiver<Option<String>>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(
        server: String,
        url: String,
        headers: HashMap<String, String>,
        auth_token: Option<String>,
        events: TransportEventSender,
    ) -> Result<Self, TransportError> {
        let base_url =
            Url::parse(&url).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        let client = Client::builder()
            .build()
            .map_err(TransportError::Http)?;
        let (tx, rx) = watch::channel(None);

        Ok(Self {
            server,
            base_url,
            headers,
            auth_token,
            client,
            events,
            post_endpoint: tx,
            post_endpoint_rx: rx,
            stream_task: Mutex::new(None),
        })
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &self.auth_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder
    }

    async fn post_target(&self) -> String {
        if let Some(endpoint) = self.post_endpoint_rx.borrow().clone() {
            return endpoint;
        }

        let mut rx = self.post_endpoint_rx.clone();
        let waited = tokio::time::timeout(ENDPOINT_WAIT, async {
            loop {
                if let Some(endpoint) = rx.borrow_and_update().clone() {
                    return endpoint;
                }
                if rx.changed().await.is_err() {
                    return String::new();
                }
            }
        })
        .await;

        match waited {
            Ok(endpoint) if !endpoint.is_empty() => endpoint,
            _ => {
                warn!(
                    "No endpoint event from server {} yet, posting to base URL",
                    self.server
                );
                self.base_url.to_string()
            },
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut task = self.stream_task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let request = self
            .apply_headers(self.client.get(self.base_url.clone()))
            .header("Accept", "text/event-stream");

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::http_status(status, body));
        }

        let events = self.events.clone();
        let server = self.server.clone();
        let base_url = self.base_url.clone();
        let endpoint_tx = self.post_endpoint.clone();

        let handle = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk).replace('\r', ""));

                        while let Some(pos) = buffer.find("\n\n") {
                            let block: String = buffer.drain(..pos + 2).collect();
                            let Some(frame) = parse_sse_block(&block) else {
                                continue;
                            };

                            match frame.event.as_str() {
                                "endpoint" => match base_url.join(frame.data.trim()) {
                                    Ok(endpoint) => {
                                        debug!(
                                            "Server {} announced message endpoint: {}",
                                            server, endpoint
                                        );
                                        let _ = endpoint_tx.send(Some(endpoint.to_string()));
                                    },
                                    Err(e) => {
                                        warn!(
                                            "Server {} sent unparseable endpoint {:?}: {}",
                                            server, frame.data, e
                                        );
                                    },
                                },
                                _ => match serde_json::from_str::<Value>(&frame.data) {
                                    Ok(value) if is_jsonrpc_frame(&value) => {
                                        let _ = events.send(TransportEvent::Message(value));
                                    },
                                    _ => {
                                        debug!(
                                            "Skipping non-JSON-RPC SSE data from {}: {}",
                                            server,
                                            frame.data.chars().take(50).collect::<String>()
                                        );
                                    },
                                },
                            }
                        }
                    },
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Errored(e.to_string()));
                        break;
                    },
                    None => break,
                }
            }

            let _ = events.send(TransportEvent::Closed);
        });

        *task = Some(handle);
        info!("Opened SSE stream to server {}", self.server);
        let _ = self.events.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), TransportError> {
        if self.stream_task.lock().await.is_none() {
            return Err(TransportError::NotOpen);
        }

        let target = self.post_target().await;
        let request = self
            .apply_headers(self.client.post(&target))
            .header("Content-Type", "application/json")
            .json(&frame);

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let err = TransportError::http_status(status, body);
            let _ = self.events.send(TransportEvent::Errored(err.to_string()));
            return Err(err);
        }

        // Some servers answer the POST with the response frame instead of
        // pushing it on the stream.
        if let Ok(body) = response.text().await {
            let trimmed = body.trim();
            if !trimmed.is_empty() {
                if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                    if is_jsonrpc_frame(&value) {
                        let _ = self.events.send(TransportEvent::Message(value));
                    }
                }
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(handle) = self.stream_task.lock().await.take() {
            handle.abort();
            let _ = self.events.send(TransportEvent::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_frames() {
        let frame = parse_sse_block("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n").unwrap();
        assert_eq!(frame.event, "message");
        assert_eq!(frame.data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn defaults_event_to_message() {
        let frame = parse_sse_block("data: {\"id\":1}\n").unwrap();
        assert_eq!(frame.event, "message");
    }

    #[test]
    fn joins_multiline_data() {
        let frame = parse_sse_block("data: {\"a\":\ndata: 1}\n").unwrap();
        assert_eq!(frame.data, "{\"a\":1}");
    }

    #[test]
    fn parses_endpoint_event() {
        let frame = parse_sse_block("event: endpoint\ndata: /messages?sessionId=42\n").unwrap();
        assert_eq!(frame.event, "endpoint");
        assert_eq!(frame.data, "/messages?sessionId=42");
    }

    #[test]
    fn ignores_comments_and_empty_blocks() {
        assert!(parse_sse_block(": keepalive\n").is_none());
        assert!(parse_sse_block("").is_none());
    }
}
