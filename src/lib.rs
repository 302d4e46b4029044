//! mcplex
//!
//! A pooled, multi-scope connection manager for Model Context Protocol
//! servers. Applications list and call tools; the manager hides the
//! transport, the server lifecycle, the credential lifecycle, and the pool
//! lifecycle. This library is embedded: call [`initialize_mcp`] at startup
//! and [`destroy_instance`] at shutdown, or hold an explicit
//! [`McpManager`] handle.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod oauth;
pub mod pool;
pub mod session;
pub mod tokens;
pub mod transport;
pub mod types;

pub use config::{McpConfig, McpServerConfig, OAuthConfig, TransportConfig, TransportKind};
pub use connection::{ConnectionEvent, ConnectionState, McpConnection};
pub use error::{Error, Result};
pub use flow::{FlowManager, InMemoryFlowManager, FLOW_KIND_OAUTH, FLOW_KIND_TOKENS};
pub use oauth::{OAuthCoordinator, OAuthHandler};
pub use pool::{
    destroy_instance, get_instance, initialize_mcp, ManifestTool, McpManager, PoolOptions,
};
pub use session::{SessionErrorKind, SessionInfo};
pub use tokens::{InMemoryTokenStore, TokenStore};
pub use types::{AuthTokens, CallToolOptions, McpUser, Principal, ToolDefinition, TOOL_DELIMITER};
