//! JSON-RPC client over a transport
//!
//! Correlates responses to requests by id, dispatches server-pushed
//! notifications, answers server-initiated pings, and guards against idle
//! ping replies pinning an otherwise dead connection.

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent, TransportEventReceiver};
use crate::types::{InitializeResult, ToolDefinition, PROTOCOL_VERSION};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Window within which repeated empty-result replies are refused.
const EMPTY_REPLY_WINDOW: Duration = Duration::from_secs(300);

/// Events the connection consumes from its client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Notification { method: String, params: Option<Value> },
    TransportError(String),
    TransportClosed,
}

type PendingSender = oneshot::Sender<Result<Value>>;

pub struct RpcClient {
    server: String,
    transport: Arc<dyn Transport>,
    pending: Arc<DashMap<i64, PendingSender>>,
    next_id: AtomicI64,
    last_empty_reply: parking_lot::Mutex<Option<Instant>>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Wire a client onto an opened transport. The returned receiver carries
    /// notifications and transport lifecycle events for the connection.
    pub fn start(
        server: String,
        transport: Arc<dyn Transport>,
        mut transport_events: TransportEventReceiver,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (client_events_tx, client_events_rx) = mpsc::unbounded_channel();

        let client = Arc::new(Self {
            server,
            transport,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicI64::new(1),
            last_empty_reply: parking_lot::Mutex::new(None),
            pump: parking_lot::Mutex::new(None),
        });

        let pump_client = client.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                match event {
                    TransportEvent::Opened => {},
                    TransportEvent::Message(frame) => {
                        pump_client.dispatch_frame(frame, &client_events_tx).await;
                    },
                    TransportEvent::Errored(message) => {
                        pump_client.fail_all_pending(&message);
                        let _ = client_events_tx.send(ClientEvent::TransportError(message));
                    },
                    TransportEvent::Closed => {
                        pump_client.fail_all_pending("connection closed");
                        let _ = client_events_tx.send(ClientEvent::TransportClosed);
                        break;
                    },
                }
            }
        });
        *client.pump.lock() = Some(handle);

        (client, client_events_rx)
    }

    async fn dispatch_frame(&self, frame: Value, events: &mpsc::UnboundedSender<ClientEvent>) {
        let id = frame.get("id").cloned().filter(|v| !v.is_null());
        let method = frame.get("method").and_then(|m| m.as_str()).map(String::from);

        match (id, method) {
            // Server-initiated request.
            (Some(id), Some(method)) => {
                if method == "ping" {
                    self.reply_empty(id).await;
                } else {
                    debug!(
                        "Rejecting unsupported server request {} from {}",
                        method, self.server
                    );
                    let reply = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": "Method not found"}
                    });
                    if let Err(e) = self.transport.send(reply).await {
                        debug!("Failed to reject server request: {}", e);
                    }
                }
            },
            // Response to one of our requests.
            (Some(id), None) => {
                let Some(id) = id.as_i64() else {
                    debug!("Discarding response with non-numeric id from {}", self.server);
                    return;
                };
                if let Some((_, sender)) = self.pending.remove(&id) {
                    let outcome = match frame.get("error") {
                        Some(err) if !err.is_null() => {
                            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(-32000);
                            let message = err
                                .get("message")
                                .and_then(|m| m.as_str())
                                .unwrap_or("unknown error")
                                .to_string();
                            Err(Error::Rpc {
                                server: self.server.clone(),
                                code,
                                message,
                            })
                        },
                        _ => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    let _ = sender.send(outcome);
                } else {
                    debug!("Discarding response for unknown id {} from {}", id, self.server);
                }
            },
            // Notification.
            (None, Some(method)) => {
                let _ = events.send(ClientEvent::Notification {
                    method,
                    params: frame.get("params").cloned(),
                });
            },
            (None, None) => {
                debug!("Discarding frame without id or method from {}", self.server);
            },
        }
    }

    /// Reply to a server ping with an empty result, unless an empty reply
    /// already went out within the window. Idle ping traffic must not keep a
    /// connection looking alive.
    async fn reply_empty(&self, id: Value) {
        if !self.allow_empty_reply() {
            warn!("Empty result (suppressed ping reply to {})", self.server);
            return;
        }
        let reply = json!({"jsonrpc": "2.0", "id": id, "result": {}});
        if let Err(e) = self.transport.send(reply).await {
            debug!("Failed to answer ping from {}: {}", self.server, e);
        }
    }

    fn allow_empty_reply(&self) -> bool {
        let mut last = self.last_empty_reply.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < EMPTY_REPLY_WINDOW => false,
            _ => {
                *last = Some(now);
                true
            },
        }
    }

    fn fail_all_pending(&self, message: &str) {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, sender)) = self.pending.remove(&id) {
                let _ = sender.send(Err(Error::transport(&self.server, message)));
            }
        }
    }

    /// Issue one request and await its correlated response.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let outcome = tokio::time::timeout(timeout, async {
            if let Err(e) = self.transport.send(frame).await {
                self.pending.remove(&id);
                return Err(Error::transport(&self.server, e.to_string()));
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::transport(&self.server, "connection closed")),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout(
                    timeout.as_millis() as u64,
                    format!("{} request to {}", method, self.server),
                ))
            },
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.transport
            .send(frame)
            .await
            .map_err(|e| Error::transport(&self.server, e.to_string()))
    }

    /// Perform the MCP initialization exchange.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "roots": {"listChanged": true}
            },
            "clientInfo": {
                "name": "mcplex",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self.request("initialize", params, timeout).await?;
        let parsed = InitializeResult::from_value(&result);

        if let Some(version) = &parsed.protocol_version {
            if version != PROTOCOL_VERSION {
                warn!(
                    "Server {} using different protocol version: {}",
                    self.server, version
                );
            }
        }

        self.notify("notifications/initialized", json!({})).await?;
        Ok(parsed)
    }

    /// Active liveness probe.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.request("ping", json!({}), timeout).await.map(|_| ())
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDefinition>> {
        let result = self.request("tools/list", json!({}), timeout).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools).map_err(Error::Json)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        self.request(
            "tools/call",
            json!({"name": name, "arguments": arguments}),
            timeout,
        )
        .await
    }

    pub async fn list_resources(&self, timeout: Duration) -> Result<Vec<Value>> {
        let result = self.request("resources/list", json!({}), timeout).await?;
        let resources = result.get("resources").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(resources).map_err(Error::Json)
    }

    pub async fn read_resource(&self, uri: &str, timeout: Duration) -> Result<Value> {
        self.request("resources/read", json!({"uri": uri}), timeout).await
    }

    pub async fn list_prompts(&self, timeout: Duration) -> Result<Vec<Value>> {
        let result = self.request("prompts/list", json!({}), timeout).await?;
        let prompts = result.get("prompts").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(prompts).map_err(Error::Json)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let mut params = json!({"name": name});
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        self.request("prompts/get", params, timeout).await
    }

    /// Tear down: stop the pump, fail pending callers, close the transport.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.fail_all_pending("connection closed");
        if let Err(e) = self.transport.close().await {
            debug!("Error closing transport for {}: {}", self.server, e);
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use async_trait::async_trait;
    use crate::transport::TransportError;
    use std::sync::Mutex as StdMutex;

    /// Transport that records sent frames and lets tests inject events.
    struct LoopbackTransport {
        sent: StdMutex<Vec<Value>>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }

        async fn open(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, frame: Value) -> std::result::Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn start_client() -> (
        Arc<RpcClient>,
        mpsc::UnboundedSender<TransportEvent>,
        mpsc::UnboundedReceiver<ClientEvent>,
        Arc<LoopbackTransport>,
    ) {
        let transport = Arc::new(LoopbackTransport {
            sent: StdMutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, events) = RpcClient::start("test".into(), transport.clone(), rx);
        (client, tx, events, transport)
    }

    #[tokio::test]
    async fn correlates_response_by_id() {
        let (client, tx, _events, _transport) = start_client();

        let request = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request("tools/list", json!({}), Duration::from_secs(1))
                    .await
            }
        });

        // Give the request a moment to register its pending entry.
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(TransportEvent::Message(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"tools": []}
        })))
        .unwrap();

        let result = request.await.unwrap().unwrap();
        assert_eq!(result, json!({"tools": []}));
    }

    #[tokio::test]
    async fn surfaces_rpc_errors() {
        let (client, tx, _events, _transport) = start_client();

        let request = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request("tools/call", json!({}), Duration::from_secs(1))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(TransportEvent::Message(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": 401, "message": "Unauthorized"}
        })))
        .unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn delivers_notifications() {
        let (_client, tx, mut events, _transport) = start_client();

        tx.send(TransportEvent::Message(json!({
            "jsonrpc": "2.0",
            "method": "notifications/resources/list_changed"
        })))
        .unwrap();

        match events.recv().await.unwrap() {
            ClientEvent::Notification { method, .. } => {
                assert_eq!(method, "notifications/resources/list_changed");
            },
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn answers_ping_once_per_window() {
        let (_client, tx, _events, transport) = start_client();

        for id in [10, 11] {
            tx.send(TransportEvent::Message(json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "ping"
            })))
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Second reply is suppressed inside the five-minute window.
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["id"], json!(10));
        assert_eq!(sent[0]["result"], json!({}));
    }

    #[tokio::test]
    async fn transport_close_fails_pending() {
        let (client, tx, _events, _transport) = start_client();

        let request = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request("tools/list", json!({}), Duration::from_secs(5))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(TransportEvent::Closed).unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
