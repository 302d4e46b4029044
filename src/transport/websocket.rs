//! WebSocket transport
//!
//! Full-duplex message channel for `ws://` and `wss://` servers. JSON-RPC
//! frames travel as text messages.

use super::{is_jsonrpc_frame, Transport, TransportError, TransportEvent, TransportEventSender};
use crate::config::TransportKind;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

pub struct WebSocketTransport {
    server: String,
    url: String,
    headers: HashMap<String, String>,
    auth_token: Option<String>,
    events: TransportEventSender,
    sink: Mutex<Option<WsSink>>,
}

impl WebSocketTransport {
    pub fn new(
        server: String,
        url: String,
        headers: HashMap<String, String>,
        auth_token: Option<String>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            server,
            url,
            headers,
            auth_token,
            events,
            sink: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut sink_slot = self.sink.lock().await;
        if sink_slot.is_some() {
            return Ok(());
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        let (sink, mut stream) = ws.split();
        *sink_slot = Some(sink);

        let events = self.events.clone();
        let server = self.server.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) if is_jsonrpc_frame(&value) => {
                            let _ = events.send(TransportEvent::Message(value));
                        },
                        _ => {
                            debug!(
                                "Skipping non-JSON-RPC websocket frame from {}: {}",
                                server,
                                text.chars().take(50).collect::<String>()
                            );
                        },
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {},
                    Err(e) => {
                        let _ = events.send(TransportEvent::Errored(e.to_string()));
                        break;
                    },
                }
            }
            let _ = events.send(TransportEvent::Closed);
        });

        info!("Opened WebSocket to server {}", self.server);
        let _ = self.events.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(TransportError::NotOpen)?;

        sink.send(WsMessage::Text(frame.to_string()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
            debug!("Closed WebSocket to server {}", self.server);
        }
        Ok(())
    }
}
