//! Pool manager
//!
//! The top-level facade. Holds the process-scope and thread-scope connection
//! maps, tracks last activity per thread and per user, runs idle reclamation,
//! dispatches tool calls to the correct scope, and cascades shutdown.
//!
//! Process-scope connections are established at startup and live for the
//! process lifetime; thread-scope connections are created lazily on the
//! first tool call that carries a thread id and are reclaimed when their
//! thread or owning user goes idle.

use crate::config::{McpServerConfig, ServerInstructions};
use crate::connection::{ConnectionEvent, McpConnection};
use crate::error::{Error, Result};
use crate::flow::FlowManager;
use crate::oauth::{OAuthCoordinator, OAuthStartHook};
use crate::tokens::TokenStore;
use crate::types::{CallToolOptions, McpUser, Principal, ToolDefinition, TOOL_DELIMITER};
use dashmap::DashMap;
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Idle window after which a thread's connections are reclaimed.
pub const THREAD_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Idle window after which a user's threads are reclaimed. Coarser safety
/// net under the generous per-thread window.
pub const USER_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const INIT_MAX_ATTEMPTS: u32 = 3;
const INIT_RETRY_DELAY_MS: u64 = 2000;

#[derive(Clone)]
pub struct PoolOptions {
    pub thread_idle_timeout: Duration,
    pub user_idle_timeout: Duration,
    /// Handshake timeout applied to pool-created connections.
    pub init_timeout: Duration,
    /// Hook invoked with the authorization URL when a flow starts.
    pub on_oauth_start: Option<OAuthStartHook>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            thread_idle_timeout: THREAD_IDLE_TIMEOUT,
            user_idle_timeout: USER_IDLE_TIMEOUT,
            init_timeout: Duration::from_millis(crate::config::POOL_INIT_TIMEOUT_MS),
            on_oauth_start: None,
        }
    }
}

/// Tool entry projected for a downstream provider manifest.
#[derive(Debug, Clone)]
pub struct ManifestTool {
    /// Namespaced name: `<tool><delimiter><server>`.
    pub name: String,
    pub server: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub icon_path: Option<String>,
}

pub struct McpManager {
    mcp_configs: DashMap<String, McpServerConfig>,
    process_connections: DashMap<String, Arc<McpConnection>>,
    thread_connections: DashMap<String, HashMap<String, Arc<McpConnection>>>,
    thread_last_activity: DashMap<String, Instant>,
    user_last_activity: DashMap<String, Instant>,
    user_threads: DashMap<String, HashSet<String>>,
    server_instructions: DashMap<String, String>,
    /// Serializes acquisition per thread so concurrent callers get the same
    /// connection instance.
    thread_locks: DashMap<String, Arc<Mutex<()>>>,
    oauth: Arc<OAuthCoordinator>,
    options: PoolOptions,
    shutting_down: AtomicBool,
}

impl McpManager {
    /// Create the manager and establish process-scope connections for every
    /// configured server. Individual server failures are logged; the manager
    /// still comes up with the servers that worked.
    pub async fn initialize(
        servers: Vec<McpServerConfig>,
        flow_manager: Arc<dyn FlowManager>,
        token_store: Arc<dyn TokenStore>,
        options: PoolOptions,
    ) -> Result<Arc<Self>> {
        let oauth = Arc::new(OAuthCoordinator::new(
            flow_manager,
            token_store,
            options.on_oauth_start.clone(),
        ));

        let manager = Arc::new(Self {
            mcp_configs: DashMap::new(),
            process_connections: DashMap::new(),
            thread_connections: DashMap::new(),
            thread_last_activity: DashMap::new(),
            user_last_activity: DashMap::new(),
            user_threads: DashMap::new(),
            server_instructions: DashMap::new(),
            thread_locks: DashMap::new(),
            oauth,
            options,
            shutting_down: AtomicBool::new(false),
        });

        for config in servers {
            let name = config.name.clone();
            manager.mcp_configs.insert(name.clone(), config.clone());

            match manager.create_process_connection(&config).await {
                Ok(connection) => {
                    manager.resolve_server_instructions(&config, &connection);
                    manager.process_connections.insert(name.clone(), connection);
                    info!("Process-scope connection established for server {}", name);
                },
                Err(e) => {
                    error!(
                        "Failed to establish process-scope connection for server {}: {}",
                        name, e
                    );
                },
            }
        }

        Ok(manager)
    }

    async fn create_process_connection(
        self: &Arc<Self>,
        config: &McpServerConfig,
    ) -> Result<Arc<McpConnection>> {
        let tokens = match self
            .oauth
            .load_tokens(&Principal::System, &config.name, config.oauth.as_ref())
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(
                    "Token load for server {} failed: {}; connecting without tokens",
                    config.name, e
                );
                None
            },
        };

        let connection = McpConnection::new(
            config.clone(),
            Principal::System,
            None,
            Some(self.options.init_timeout),
            tokens,
        );
        self.wire_oauth(&connection);
        self.initialize_server(&connection).await?;
        Ok(connection)
    }

    fn resolve_server_instructions(&self, config: &McpServerConfig, conn: &Arc<McpConnection>) {
        match &config.server_instructions {
            ServerInstructions::Enabled(true) => {
                if let Some(instructions) = conn.instructions() {
                    self.server_instructions.insert(config.name.clone(), instructions);
                }
            },
            ServerInstructions::Text(text) => {
                self.server_instructions.insert(config.name.clone(), text.clone());
            },
            ServerInstructions::Enabled(false) => {},
        }
    }

    /// Route a connection's `oauth-required` events to the coordinator. The
    /// coordinator posts `oauth-handled` / `oauth-failed` back into the
    /// connection; the connection drives its own state machine.
    fn wire_oauth(&self, connection: &Arc<McpConnection>) {
        let mut events = connection.events();
        let weak = Arc::downgrade(connection);
        let oauth = self.oauth.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::OAuthRequired { .. }) => {
                        let Some(conn) = weak.upgrade() else { break };
                        let oauth_config = conn.config().oauth.clone();
                        let oauth = oauth.clone();
                        tokio::spawn(async move {
                            oauth.handle_oauth_required(conn, oauth_config).await;
                        });
                    },
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("OAuth event listener lagged by {} events", skipped);
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Connect with retries: up to three attempts, 2s·n between them.
    /// Authorization failures short-circuit; the connection already drove
    /// the coordinator round-trip itself.
    pub async fn initialize_server(&self, connection: &Arc<McpConnection>) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match connection.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_auth_error() => return Err(e),
                Err(e) if attempt < INIT_MAX_ATTEMPTS => {
                    warn!(
                        "Initialization attempt {}/{} for server {} failed: {}",
                        attempt,
                        INIT_MAX_ATTEMPTS,
                        connection.server_name(),
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(
                        INIT_RETRY_DELAY_MS * attempt as u64,
                    ))
                    .await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn touch(&self, user_id: Option<&str>, thread_id: Option<&str>) {
        let now = Instant::now();
        if let Some(thread_id) = thread_id {
            self.thread_last_activity.insert(thread_id.to_string(), now);
        }
        if let Some(user_id) = user_id {
            self.user_last_activity.insert(user_id.to_string(), now);
        }
    }

    fn thread_age(&self, thread_id: &str) -> Duration {
        self.thread_last_activity
            .get(thread_id)
            .map(|stamp| Instant::now().duration_since(*stamp.value()))
            .unwrap_or(Duration::MAX)
    }

    /// Acquire (or create) the thread-scope connection for (user, thread,
    /// server). Stale or unhealthy entries are torn down on the way.
    pub async fn get_thread_connection(
        self: &Arc<Self>,
        user: &McpUser,
        thread_id: &str,
        server: &str,
        custom_user_vars: Option<&HashMap<String, String>>,
    ) -> Result<Arc<McpConnection>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        if user.id.is_empty() {
            return Err(Error::Config("user id is required".into()));
        }
        if thread_id.is_empty() {
            return Err(Error::Config("thread id is required".into()));
        }

        let lock = self
            .thread_locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let existing = self
            .thread_connections
            .get(thread_id)
            .and_then(|servers| servers.get(server).cloned());

        if let Some(connection) = existing {
            if self.thread_age(thread_id) <= self.options.thread_idle_timeout {
                if connection.is_connected().await {
                    self.touch(Some(&user.id), Some(thread_id));
                    return Ok(connection);
                }
                debug!(
                    "Thread {} connection to {} unhealthy, replacing",
                    thread_id, server
                );
                self.remove_thread_connection(thread_id, server).await;
            } else {
                debug!("Thread {} idle past limit, tearing down", thread_id);
                self.disconnect_thread_connections(thread_id).await;
            }
        }

        let config = self
            .mcp_configs
            .get(server)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ServerNotFound(server.to_string()))?;

        let empty_vars = HashMap::new();
        let resolved = config.resolve_for_user(user, custom_user_vars.unwrap_or(&empty_vars));
        let principal = Principal::user(&user.id);

        let tokens = match self
            .oauth
            .load_tokens(&principal, server, resolved.oauth.as_ref())
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(
                    "Token load for {} on server {} failed: {}; connecting without tokens",
                    principal, server, e
                );
                None
            },
        };

        let connection = McpConnection::new(
            resolved,
            principal,
            Some(thread_id.to_string()),
            Some(self.options.init_timeout),
            tokens,
        );
        self.wire_oauth(&connection);

        match self.initialize_server(&connection).await {
            Ok(()) => {
                self.thread_connections
                    .entry(thread_id.to_string())
                    .or_default()
                    .insert(server.to_string(), connection.clone());
                self.user_threads
                    .entry(user.id.clone())
                    .or_default()
                    .insert(thread_id.to_string());
                self.touch(Some(&user.id), Some(thread_id));
                Ok(connection)
            },
            Err(e) => {
                if let Err(disconnect_err) = connection.disconnect().await {
                    debug!(
                        "Cleanup disconnect for {} failed: {}",
                        server, disconnect_err
                    );
                }
                Err(e)
            },
        }
    }

    /// The process-scope connection for a server, reconnecting it first when
    /// the health probe fails.
    pub async fn get_process_connection(&self, server: &str) -> Result<Arc<McpConnection>> {
        let connection = self
            .process_connections
            .get(server)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ServerNotFound(server.to_string()))?;

        if !connection.is_connected().await {
            info!(
                "Process-scope connection to {} unhealthy, reconnecting",
                server
            );
            self.initialize_server(&connection).await?;
        }

        Ok(connection)
    }

    /// Dispatch a tool call to the right scope: user+thread selects (or
    /// creates) a thread-scope connection; anything else uses process scope.
    #[allow(clippy::too_many_arguments)]
    pub async fn call_tool(
        self: &Arc<Self>,
        user: Option<&McpUser>,
        thread_id: Option<&str>,
        server: &str,
        tool: &str,
        arguments: Value,
        opts: Option<CallToolOptions>,
        custom_user_vars: Option<&HashMap<String, String>>,
    ) -> Result<Value> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        self.run_reclamation(user.map(|u| u.id.as_str()));

        let connection = match (user, thread_id) {
            (Some(user), Some(thread_id)) => {
                self.get_thread_connection(user, thread_id, server, custom_user_vars)
                    .await?
            },
            // A user without a thread falls back to the shared
            // process-scope connection.
            _ => self.get_process_connection(server).await?,
        };

        let result = connection.call(tool, arguments, opts).await?;

        match (user, thread_id) {
            (Some(user), Some(thread_id)) => self.touch(Some(&user.id), Some(thread_id)),
            (Some(user), None) => self.touch(Some(&user.id), None),
            _ => {},
        }

        Ok(result)
    }

    /// Fire-and-forget reclamation pass: stale threads first, then idle
    /// users other than the currently active one.
    pub fn run_reclamation(self: &Arc<Self>, active_user: Option<&str>) {
        let now = Instant::now();

        let stale_threads: Vec<String> = self
            .thread_last_activity
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > self.options.thread_idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for thread_id in stale_threads {
            debug!("Reclaiming idle thread {}", thread_id);
            let manager = self.clone();
            tokio::spawn(async move {
                manager.disconnect_thread_connections(&thread_id).await;
            });
        }

        let stale_users: Vec<String> = self
            .user_last_activity
            .iter()
            .filter(|entry| {
                Some(entry.key().as_str()) != active_user
                    && now.duration_since(*entry.value()) > self.options.user_idle_timeout
            })
            .map(|entry| entry.key().clone())
            .collect();

        for user_id in stale_users {
            debug!("Reclaiming idle user {}", user_id);
            let manager = self.clone();
            tokio::spawn(async move {
                manager.disconnect_user_threads(&user_id).await;
            });
        }
    }

    fn forget_thread(&self, thread_id: &str) {
        self.thread_last_activity.remove(thread_id);
        self.thread_locks.remove(thread_id);
        self.user_threads.retain(|_, threads| {
            threads.remove(thread_id);
            !threads.is_empty()
        });
    }

    async fn remove_thread_connection(&self, thread_id: &str, server: &str) {
        let connection = self
            .thread_connections
            .get_mut(thread_id)
            .and_then(|mut servers| servers.remove(server));

        let now_empty = self
            .thread_connections
            .get(thread_id)
            .map(|servers| servers.is_empty())
            .unwrap_or(false);
        if now_empty {
            self.thread_connections.remove(thread_id);
            self.forget_thread(thread_id);
        }

        if let Some(connection) = connection {
            if let Err(e) = connection.disconnect().await {
                warn!(
                    "Disconnect of thread {} connection to {} failed: {}",
                    thread_id, server, e
                );
            }
        }
    }

    /// Tear down every connection a thread owns and drop it from all
    /// indexes. Errors are logged, never propagated.
    pub async fn disconnect_thread_connections(&self, thread_id: &str) {
        let connections = self
            .thread_connections
            .remove(thread_id)
            .map(|(_, servers)| servers)
            .unwrap_or_default();
        self.forget_thread(thread_id);

        let teardowns: Vec<_> = connections
            .into_iter()
            .map(|(server, connection)| {
                let thread_id = thread_id.to_string();
                async move {
                    if let Err(e) = connection.disconnect().await {
                        warn!(
                            "Disconnect of thread {} connection to {} failed: {}",
                            thread_id, server, e
                        );
                    }
                }
            })
            .collect();
        join_all(teardowns).await;
    }

    /// Tear down every thread owned by a user.
    pub async fn disconnect_user_threads(&self, user_id: &str) {
        let threads: Vec<String> = self
            .user_threads
            .remove(user_id)
            .map(|(_, threads)| threads.into_iter().collect())
            .unwrap_or_default();

        for thread_id in threads {
            self.disconnect_thread_connections(&thread_id).await;
        }
        self.user_last_activity.remove(user_id);
    }

    /// Cascading shutdown: all thread scopes per user, all activity indexes,
    /// then every process-scope connection. Concurrent; exceptions are
    /// logged and swallowed. Idempotent.
    pub async fn disconnect_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let users: Vec<String> = self.user_threads.iter().map(|e| e.key().clone()).collect();
        for user_id in users {
            self.disconnect_user_threads(&user_id).await;
        }

        // Sweep any threads left without an owning user entry.
        let threads: Vec<String> = self
            .thread_connections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for thread_id in threads {
            self.disconnect_thread_connections(&thread_id).await;
        }

        self.thread_last_activity.clear();
        self.user_last_activity.clear();
        self.thread_locks.clear();

        let process: Vec<(String, Arc<McpConnection>)> = self
            .process_connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let teardowns: Vec<_> = process
            .into_iter()
            .map(|(server, connection)| async move {
                if let Err(e) = connection.disconnect().await {
                    warn!("Disconnect of process connection to {} failed: {}", server, e);
                }
            })
            .collect();
        join_all(teardowns).await;

        info!("All MCP connections disconnected");
    }

    /// Project every healthy server's tools into a flat, namespaced map.
    /// Individual server failures are logged and skipped.
    pub async fn map_available_tools(&self, verify_health: bool) -> HashMap<String, ToolDefinition> {
        let mut out = HashMap::new();

        let connections: Vec<(String, Arc<McpConnection>)> = self
            .process_connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (server, connection) in connections {
            if verify_health && !connection.is_connected().await {
                if let Err(e) = self.initialize_server(&connection).await {
                    warn!("Skipping tools from unreachable server {}: {}", server, e);
                    continue;
                }
            }

            for tool in connection.list_tools().await {
                let namespaced = format!("{}{}{}", tool.name, TOOL_DELIMITER, server);
                out.insert(namespaced, tool);
            }
        }

        out
    }

    /// Manifest projection of every server's tools, with icons. Tolerates
    /// individual server failures.
    pub async fn load_manifest_tools(&self, verify_health: bool) -> Vec<ManifestTool> {
        let mut manifest = Vec::new();

        let connections: Vec<(String, Arc<McpConnection>)> = self
            .process_connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (server, connection) in connections {
            if verify_health && !connection.is_connected().await {
                if let Err(e) = self.initialize_server(&connection).await {
                    warn!("Skipping manifest for unreachable server {}: {}", server, e);
                    continue;
                }
            }

            let icon_path = self
                .mcp_configs
                .get(&server)
                .and_then(|config| config.icon_path.clone());

            for tool in connection.list_tools().await {
                manifest.push(ManifestTool {
                    name: format!("{}{}{}", tool.name, TOOL_DELIMITER, server),
                    server: server.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    icon_path: icon_path.clone(),
                });
            }
        }

        manifest
    }

    pub fn server_instructions(&self, server: &str) -> Option<String> {
        self.server_instructions.get(server).map(|e| e.value().clone())
    }

    pub fn registered_servers(&self) -> Vec<String> {
        self.mcp_configs.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_raw_config(&self, server: &str) -> Option<McpServerConfig> {
        self.mcp_configs.get(server).map(|e| e.value().clone())
    }

    pub fn process_connection(&self, server: &str) -> Option<Arc<McpConnection>> {
        self.process_connections.get(server).map(|e| e.value().clone())
    }

    pub fn thread_connection(&self, thread_id: &str, server: &str) -> Option<Arc<McpConnection>> {
        self.thread_connections
            .get(thread_id)
            .and_then(|servers| servers.get(server).cloned())
    }

    pub fn has_thread_connection(&self, thread_id: &str, server: &str) -> bool {
        self.thread_connection(thread_id, server).is_some()
    }

    pub fn thread_ids(&self) -> Vec<String> {
        self.thread_connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn threads_of_user(&self, user_id: &str) -> Vec<String> {
        self.user_threads
            .get(user_id)
            .map(|threads| threads.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn thread_activity(&self, thread_id: &str) -> Option<Instant> {
        self.thread_last_activity.get(thread_id).map(|e| *e.value())
    }

    pub fn user_activity(&self, user_id: &str) -> Option<Instant> {
        self.user_last_activity.get(user_id).map(|e| *e.value())
    }

    pub fn oauth(&self) -> &Arc<OAuthCoordinator> {
        &self.oauth
    }
}

static INSTANCE: Lazy<parking_lot::RwLock<Option<Arc<McpManager>>>> =
    Lazy::new(|| parking_lot::RwLock::new(None));

/// Initialize the process-wide manager. Server connections are expensive and
/// shared, so one manager per process is enforced here rather than by a
/// language feature.
pub async fn initialize_mcp(
    servers: Vec<McpServerConfig>,
    flow_manager: Arc<dyn FlowManager>,
    token_store: Arc<dyn TokenStore>,
    options: PoolOptions,
) -> Result<Arc<McpManager>> {
    if INSTANCE.read().is_some() {
        return Err(Error::Config(
            "MCP manager already initialized; one manager per process".into(),
        ));
    }

    let manager = McpManager::initialize(servers, flow_manager, token_store, options).await?;

    let mut slot = INSTANCE.write();
    if slot.is_some() {
        return Err(Error::Config(
            "MCP manager already initialized; one manager per process".into(),
        ));
    }
    *slot = Some(manager.clone());
    Ok(manager)
}

/// The process-wide manager, if initialized. Every lookup also kicks off a
/// reclamation pass.
pub fn get_instance() -> Option<Arc<McpManager>> {
    let manager = INSTANCE.read().clone();
    if let Some(manager) = &manager {
        manager.run_reclamation(None);
    }
    manager
}

/// Tear down the process-wide manager.
pub async fn destroy_instance() -> Result<()> {
    let manager = INSTANCE.write().take();
    if let Some(manager) = manager {
        manager.disconnect_all().await;
    }
    Ok(())
}
