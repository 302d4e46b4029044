//! One connection to one MCP server for one scope
//!
//! Wraps a transport and a JSON-RPC client, and owns the
//! connect/reconnect/recover state machine. Lifecycle events are emitted on a
//! broadcast channel; the authorization coordinator posts its outcome back
//! into the connection rather than being called re-entrantly.

use crate::client::{ClientEvent, RpcClient};
use crate::config::{McpServerConfig, TransportKind};
use crate::error::{Error, Result};
use crate::session::{classify_session_error, SessionErrorKind, SessionInfo, SessionTracker};
use crate::transport::{build_transport, TransportOptions};
use crate::types::{AuthTokens, CallToolOptions, Principal, ServerCapabilities, ToolDefinition};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BASE_DELAY_MS: u64 = 1000;
const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const SESSION_RECOVERY_DELAY: Duration = Duration::from_millis(1000);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle events observable by the pool and the embedding application.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        server: String,
        state: ConnectionState,
    },
    OAuthRequired {
        server: String,
        principal: Principal,
        server_url: Option<String>,
        error: String,
    },
    OAuthHandled {
        server: String,
    },
    OAuthFailed {
        server: String,
        reason: String,
    },
    SessionCreated {
        server: String,
        session_id: String,
    },
    SessionTerminated {
        server: String,
        session_id: String,
    },
    SessionError {
        server: String,
        kind: SessionErrorKind,
        message: String,
    },
    ResourcesChanged {
        server: String,
    },
    Errored {
        server: String,
        message: String,
    },
}

/// Exponential backoff for reconnect attempts: 1s, 2s, 4s, ... capped at 30s.
pub(crate) fn reconnect_backoff(attempt: u32) -> Duration {
    let ms = RECONNECT_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(RECONNECT_MAX_DELAY_MS))
}

pub struct McpConnection {
    id: Uuid,
    server_name: String,
    config: McpServerConfig,
    principal: Principal,
    thread_id: Option<String>,
    init_timeout: Duration,
    oauth_timeout: Duration,
    call_timeout: Duration,

    state: parking_lot::RwLock<ConnectionState>,
    reconnect_attempts: AtomicU32,
    reconnect_active: AtomicBool,
    initializing: AtomicBool,
    oauth_pending: AtomicBool,
    stop_reconnecting: AtomicBool,

    auth_tokens: parking_lot::RwLock<Option<AuthTokens>>,
    session: SessionTracker,
    client: AsyncRwLock<Option<Arc<RpcClient>>>,
    pump_task: parking_lot::Mutex<Option<JoinHandle<()>>>,

    capabilities: parking_lot::RwLock<Option<ServerCapabilities>>,
    instructions: parking_lot::RwLock<Option<String>>,
    tools_cache: parking_lot::RwLock<Option<Vec<ToolDefinition>>>,

    events: broadcast::Sender<ConnectionEvent>,
    oauth_gate: AsyncMutex<Option<oneshot::Sender<std::result::Result<AuthTokens, String>>>>,
    connect_lock: AsyncMutex<()>,

    http: reqwest::Client,
}

impl McpConnection {
    pub fn new(
        config: McpServerConfig,
        principal: Principal,
        thread_id: Option<String>,
        init_timeout_override: Option<Duration>,
        tokens: Option<AuthTokens>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let init_timeout = init_timeout_override.unwrap_or_else(|| config.init_timeout());
        let oauth_timeout = config.oauth_timeout();
        let call_timeout = config.call_timeout();

        let id = Uuid::new_v4();
        debug!("Created connection {} for server {}", id, config.name);

        Arc::new(Self {
            id,
            server_name: config.name.clone(),
            config,
            principal,
            thread_id,
            init_timeout,
            oauth_timeout,
            call_timeout,
            state: parking_lot::RwLock::new(ConnectionState::Disconnected),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_active: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            oauth_pending: AtomicBool::new(false),
            stop_reconnecting: AtomicBool::new(false),
            auth_tokens: parking_lot::RwLock::new(tokens),
            session: SessionTracker::new(),
            client: AsyncRwLock::new(None),
            pump_task: parking_lot::Mutex::new(None),
            capabilities: parking_lot::RwLock::new(None),
            instructions: parking_lot::RwLock::new(None),
            tools_cache: parking_lot::RwLock::new(None),
            events,
            oauth_gate: AsyncMutex::new(None),
            connect_lock: AsyncMutex::new(()),
            http: reqwest::Client::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities.read().clone()
    }

    pub fn instructions(&self) -> Option<String> {
        self.instructions.read().clone()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session.get()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Inject updated tokens for use on the next (re)connect.
    pub fn set_auth_tokens(&self, tokens: AuthTokens) {
        *self.auth_tokens.write() = Some(tokens);
    }

    pub fn auth_tokens(&self) -> Option<AuthTokens> {
        self.auth_tokens.read().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.write();
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            debug!("Connection {} -> {}", self.server_name, next);
            let _ = self.events.send(ConnectionEvent::StateChanged {
                server: self.server_name.clone(),
                state: next,
            });
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn is_streamable_http(&self) -> bool {
        self.config.effective_kind() == TransportKind::StreamableHttp
    }

    /// Drive the connection to `connected`, or fail. Idempotent when already
    /// connected; concurrent callers serialize on the same in-flight attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.state() == ConnectionState::Connected && self.client.read().await.is_some() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected && self.client.read().await.is_some() {
            return Ok(());
        }

        self.stop_reconnecting.store(false, Ordering::SeqCst);
        self.initializing.store(true, Ordering::SeqCst);
        let result = self.connect_inner().await;
        self.initializing.store(false, Ordering::SeqCst);

        if result.is_err() {
            self.set_state(ConnectionState::Error);
        }
        result
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_auth_error() => {
                info!(
                    "Server {} requires authorization for {}",
                    self.server_name, self.principal
                );
                self.oauth_pending.store(true, Ordering::SeqCst);
                let outcome = self.await_oauth(e.to_string()).await;
                self.oauth_pending.store(false, Ordering::SeqCst);

                match outcome {
                    Ok(_tokens) => {
                        // Resume the original attempt, once.
                        self.set_state(ConnectionState::Connecting);
                        self.establish().await.map_err(|retry_err| {
                            if retry_err.is_auth_error() {
                                Error::auth_failed(&self.server_name, retry_err.to_string())
                            } else {
                                retry_err
                            }
                        })
                    },
                    Err(reason) => Err(Error::auth_failed(&self.server_name, reason)),
                }
            },
            Err(e) => Err(e),
        }
    }

    /// One transport + handshake attempt.
    async fn establish(self: &Arc<Self>) -> Result<()> {
        self.teardown_client().await;

        let opts = TransportOptions {
            auth_token: self.auth_tokens.read().as_ref().map(|t| t.access_token.clone()),
            session_id: if self.is_streamable_http() {
                self.session.session_id()
            } else {
                None
            },
        };

        let (transport, transport_events) = build_transport(&self.config, opts)
            .map_err(|e| Error::transport(&self.server_name, e.to_string()))?;
        transport
            .open()
            .await
            .map_err(|e| Error::transport(&self.server_name, e.to_string()))?;

        let (client, client_events) =
            RpcClient::start(self.server_name.clone(), transport, transport_events);

        match client.initialize(self.init_timeout).await {
            Ok(init) => {
                *self.client.write().await = Some(client.clone());
                self.spawn_event_pump(client_events);

                *self.capabilities.write() = Some(init.capabilities);
                if self.instructions.read().is_none() {
                    *self.instructions.write() = init.instructions;
                }

                if self.is_streamable_http() {
                    if let Some(session_id) = client.transport().assigned_session_id() {
                        let prior = self.session.session_id();
                        if prior.as_deref() != Some(session_id.as_str())
                            && self.session.adopt(&self.server_name, &session_id)
                        {
                            self.emit(ConnectionEvent::SessionCreated {
                                server: self.server_name.clone(),
                                session_id,
                            });
                        }
                    }
                }

                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                info!(
                    "Connected to server {} as {}",
                    self.server_name, self.principal
                );
                Ok(())
            },
            Err(e) => {
                client.shutdown().await;
                Err(e)
            },
        }
    }

    /// Block until the coordinator posts the outcome of the authorization
    /// flow, bounded by the oauth timeout.
    async fn await_oauth(&self, error: String) -> std::result::Result<AuthTokens, String> {
        let (tx, rx) = oneshot::channel();
        *self.oauth_gate.lock().await = Some(tx);

        self.emit(ConnectionEvent::OAuthRequired {
            server: self.server_name.clone(),
            principal: self.principal.clone(),
            server_url: self.config.url().map(String::from),
            error,
        });

        match tokio::time::timeout(self.oauth_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err("authorization channel closed".to_string()),
            Err(_) => {
                *self.oauth_gate.lock().await = None;
                Err(format!(
                    "authorization timed out after {}ms",
                    self.oauth_timeout.as_millis()
                ))
            },
        }
    }

    /// Called by the authorization coordinator when tokens arrived.
    pub async fn post_oauth_handled(&self, tokens: AuthTokens) {
        self.set_auth_tokens(tokens.clone());
        if let Some(gate) = self.oauth_gate.lock().await.take() {
            let _ = gate.send(Ok(tokens));
        }
        self.emit(ConnectionEvent::OAuthHandled {
            server: self.server_name.clone(),
        });
    }

    /// Called by the authorization coordinator when the flow failed.
    pub async fn post_oauth_failed(&self, reason: String) {
        if let Some(gate) = self.oauth_gate.lock().await.take() {
            let _ = gate.send(Err(reason.clone()));
        }
        self.emit(ConnectionEvent::OAuthFailed {
            server: self.server_name.clone(),
            reason,
        });
    }

    fn spawn_event_pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<ClientEvent>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(conn) = weak.upgrade() else { break };
                match event {
                    ClientEvent::Notification { method, .. } => {
                        if method == "notifications/resources/list_changed" {
                            conn.emit(ConnectionEvent::ResourcesChanged {
                                server: conn.server_name.clone(),
                            });
                        } else {
                            debug!(
                                "Unhandled notification {} from {}",
                                method, conn.server_name
                            );
                        }
                    },
                    ClientEvent::TransportError(message) => {
                        conn.handle_transport_failure(&message);
                    },
                    ClientEvent::TransportClosed => {
                        if !conn.close_was_deliberate() {
                            conn.handle_transport_failure("connection closed unexpectedly");
                        }
                        break;
                    },
                }
            }
        });

        if let Some(previous) = self.pump_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn close_was_deliberate(&self) -> bool {
        self.stop_reconnecting.load(Ordering::SeqCst)
            || self.state() == ConnectionState::Disconnected
            || self.initializing.load(Ordering::SeqCst)
    }

    /// Classify a transport failure and route it: recoverable session errors
    /// get transparent recovery, everything else enters the error state and
    /// triggers the reconnect loop.
    fn handle_transport_failure(self: &Arc<Self>, message: &str) {
        if self.close_was_deliberate() {
            return;
        }

        if self.is_streamable_http() && self.session.get().is_some() {
            if let Some(kind) = classify_session_error(message) {
                self.emit(ConnectionEvent::SessionError {
                    server: self.server_name.clone(),
                    kind,
                    message: message.to_string(),
                });

                if kind.is_recoverable() {
                    if !self.reconnect_active.load(Ordering::SeqCst)
                        && !self.initializing.load(Ordering::SeqCst)
                        && !self.oauth_pending.load(Ordering::SeqCst)
                    {
                        self.spawn_session_recovery();
                    }
                    // Recovery is first-class; no generic error transition.
                    return;
                }

                // Invalid: surface, and make sure the bad id is not offered
                // on the next connect.
                self.session.clear();
            }
        }

        self.set_state(ConnectionState::Error);
        self.emit(ConnectionEvent::Errored {
            server: self.server_name.clone(),
            message: message.to_string(),
        });

        if !self.reconnect_active.load(Ordering::SeqCst)
            && !self.initializing.load(Ordering::SeqCst)
            && !self.oauth_pending.load(Ordering::SeqCst)
        {
            self.spawn_reconnect_loop();
        }
    }

    /// Drop the dead session, wait briefly, then reconnect for a fresh one.
    fn spawn_session_recovery(self: &Arc<Self>) {
        if self.reconnect_active.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self.clone();
        tokio::spawn(async move {
            let old = conn.session.clear();
            info!(
                "Recovering session for server {} (was {:?})",
                conn.server_name,
                old.map(|s| s.session_id)
            );
            conn.teardown_client().await;
            tokio::time::sleep(SESSION_RECOVERY_DELAY).await;

            let result = conn.connect().await;
            conn.reconnect_active.store(false, Ordering::SeqCst);

            if let Err(e) = result {
                warn!(
                    "Session recovery for server {} failed: {}",
                    conn.server_name, e
                );
                conn.spawn_reconnect_loop();
            }
        });
    }

    /// Up to three reconnect attempts with exponential backoff. Only one
    /// loop may run per connection at a time.
    fn spawn_reconnect_loop(self: &Arc<Self>) {
        if self.reconnect_active.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            while attempt < MAX_RECONNECT_ATTEMPTS {
                if conn.stop_reconnecting.load(Ordering::SeqCst) {
                    break;
                }

                conn.set_state(ConnectionState::Reconnecting);
                tokio::time::sleep(reconnect_backoff(attempt)).await;

                if conn.stop_reconnecting.load(Ordering::SeqCst) {
                    break;
                }

                attempt += 1;
                conn.reconnect_attempts.store(attempt, Ordering::SeqCst);

                match conn.connect().await {
                    Ok(()) => {
                        info!(
                            "Reconnected to server {} after {} attempt(s)",
                            conn.server_name, attempt
                        );
                        break;
                    },
                    Err(e) => {
                        warn!(
                            "Reconnect attempt {}/{} for server {} failed: {}",
                            attempt, MAX_RECONNECT_ATTEMPTS, conn.server_name, e
                        );
                    },
                }
            }
            conn.reconnect_active.store(false, Ordering::SeqCst);
        });
    }

    /// Graceful shutdown. On streamable-http with a live session the explicit
    /// termination request goes out first. Safe to call in any state.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_reconnecting.store(true, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;

        if self.is_streamable_http() {
            if let Some(info) = self.session.get() {
                if !info.terminated {
                    let token = self
                        .auth_tokens
                        .read()
                        .as_ref()
                        .map(|t| t.access_token.clone());
                    if let Some(base_url) = self.config.url() {
                        self.session
                            .terminate(&self.http, &self.server_name, base_url, token.as_deref())
                            .await;
                    }
                    self.emit(ConnectionEvent::SessionTerminated {
                        server: self.server_name.clone(),
                        session_id: info.session_id,
                    });
                }
            }
        }

        self.teardown_client().await;
        self.session.clear();
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn teardown_client(&self) {
        if let Some(handle) = self.pump_task.lock().take() {
            handle.abort();
        }
        if let Some(client) = self.client.write().await.take() {
            client.shutdown().await;
        }
    }

    /// Active liveness probe: true iff the state is `connected` and a ping
    /// round-trip succeeds.
    pub async fn is_connected(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let Some(client) = self.client.read().await.clone() else {
            return false;
        };
        client.ping(PING_TIMEOUT).await.is_ok()
    }

    async fn current_client(&self) -> Result<Arc<RpcClient>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::transport(&self.server_name, "not connected"))
    }

    /// Best-effort tool discovery: failures are logged and yield an empty
    /// list.
    pub async fn list_tools(&self) -> Vec<ToolDefinition> {
        let client = match self.current_client().await {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot list tools on {}: {}", self.server_name, e);
                return Vec::new();
            },
        };

        match client.list_tools(self.call_timeout).await {
            Ok(tools) => {
                *self.tools_cache.write() = Some(tools.clone());
                tools
            },
            Err(e) => {
                warn!("Failed to list tools on {}: {}", self.server_name, e);
                Vec::new()
            },
        }
    }

    pub fn cached_tools(&self) -> Option<Vec<ToolDefinition>> {
        self.tools_cache.read().clone()
    }

    pub async fn list_resources(&self) -> Vec<Value> {
        let client = match self.current_client().await {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot list resources on {}: {}", self.server_name, e);
                return Vec::new();
            },
        };
        match client.list_resources(self.call_timeout).await {
            Ok(resources) => resources,
            Err(e) => {
                warn!("Failed to list resources on {}: {}", self.server_name, e);
                Vec::new()
            },
        }
    }

    pub async fn list_prompts(&self) -> Vec<Value> {
        let client = match self.current_client().await {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot list prompts on {}: {}", self.server_name, e);
                return Vec::new();
            },
        };
        match client.list_prompts(self.call_timeout).await {
            Ok(prompts) => prompts,
            Err(e) => {
                warn!("Failed to list prompts on {}: {}", self.server_name, e);
                Vec::new()
            },
        }
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        let client = self.current_client().await?;
        client.read_resource(uri, self.call_timeout).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let client = self.current_client().await?;
        client.get_prompt(name, arguments, self.call_timeout).await
    }

    /// Execute a tool call. Requires the `connected` state; a connection in
    /// `error` is never used for calls.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        opts: Option<CallToolOptions>,
    ) -> Result<Value> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::transport(
                &self.server_name,
                format!("cannot call tool {} while {}", tool_name, self.state()),
            ));
        }

        let client = self.current_client().await?;
        let timeout = opts
            .and_then(|o| o.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.call_timeout);

        match client.call_tool(tool_name, arguments, timeout).await {
            Ok(result) => Ok(result),
            Err(Error::Rpc { code, message, .. }) => Err(Error::Tool {
                server: self.server_name.clone(),
                message: format!("{} (code {})", message, code),
            }),
            Err(other) => Err(other),
        }
    }
}

impl Drop for McpConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_is_capped() {
        assert_eq!(reconnect_backoff(0), Duration::from_millis(1000));
        assert_eq!(reconnect_backoff(1), Duration::from_millis(2000));
        assert_eq!(reconnect_backoff(2), Duration::from_millis(4000));
        assert_eq!(reconnect_backoff(5), Duration::from_millis(30_000));
        assert_eq!(reconnect_backoff(30), Duration::from_millis(30_000));
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
