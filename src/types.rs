//! Common protocol types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// MCP protocol version spoken by this client.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Delimiter used when projecting a server's tools into a flat namespace,
/// e.g. `add_mcp_calc` for tool `add` on server `calc`.
pub const TOOL_DELIMITER: &str = "_mcp_";

/// MCP JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params: Some(params),
        }
    }

    /// A request without an id is a notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// MCP JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// MCP error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server capabilities returned during MCP initialization.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

impl ServerCapabilities {
    pub fn supports_tools(&self) -> bool {
        self.tools.is_some()
    }

    pub fn supports_resources(&self) -> bool {
        self.resources.is_some()
    }

    pub fn supports_prompts(&self) -> bool {
        self.prompts.is_some()
    }
}

/// Parsed result of the `initialize` handshake.
#[derive(Debug, Clone, Default)]
pub struct InitializeResult {
    pub protocol_version: Option<String>,
    pub capabilities: ServerCapabilities,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub instructions: Option<String>,
}

impl InitializeResult {
    pub fn from_value(value: &Value) -> Self {
        let capabilities = value
            .get("capabilities")
            .and_then(|c| serde_json::from_value(c.clone()).ok())
            .unwrap_or_default();

        let server_info = value.get("serverInfo");

        Self {
            protocol_version: value
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .map(String::from),
            capabilities,
            server_name: server_info
                .and_then(|s| s.get("name"))
                .and_then(|n| n.as_str())
                .map(String::from),
            server_version: server_info
                .and_then(|s| s.get("version"))
                .and_then(|v| v.as_str())
                .map(String::from),
            instructions: value
                .get("instructions")
                .and_then(|i| i.as_str())
                .map(String::from),
        }
    }
}

/// A tool advertised by a server via `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Authorization tokens for a (principal, server) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Registered client info bound to these tokens, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Value>,
}

impl AuthTokens {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            client_info: None,
        }
    }

    /// Whether the access token is expired (or will be within `skew_secs`).
    pub fn is_expired(&self, skew_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now() + chrono::Duration::seconds(skew_secs),
            None => false,
        }
    }
}

/// Who a connection acts on behalf of: a user, or the process itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    System,
    User(String),
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Principal::User(id.into())
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Principal::System)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::System => write!(f, "system"),
            Principal::User(id) => write!(f, "{}", id),
        }
    }
}

/// Minimal identity the pool needs to scope connections and substitute
/// per-user variables.
#[derive(Debug, Clone)]
pub struct McpUser {
    pub id: String,
    pub email: Option<String>,
}

impl McpUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }
}

/// Per-call overrides for `tools/call`.
#[derive(Debug, Clone, Default)]
pub struct CallToolOptions {
    pub timeout_ms: Option<u64>,
}
