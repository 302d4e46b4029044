//! Configuration for the connection manager
//!
//! Handles loading and validation of the server table plus per-user variable
//! substitution applied when thread-scope connections are created.

use crate::error::{Error, Result};
use crate::types::McpUser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration document: the server table.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// One registered MCP server (the Server Descriptor). Immutable once
/// registered with the pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpServerConfig {
    pub name: String,

    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Handshake timeout in milliseconds. Defaults to 120s when the
    /// connection is driven directly, 30s when driven by the pool.
    pub init_timeout_ms: Option<u64>,

    /// Per-call timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    pub icon_path: Option<String>,

    /// Whether to surface server-supplied instructions: `true` adopts what
    /// the server returns on initialize, a string overrides it.
    #[serde(default)]
    pub server_instructions: ServerInstructions,

    /// Per-user variables the caller may supply values for; placeholders of
    /// the form `{{VAR}}` are substituted into env, args, url and headers.
    #[serde(default)]
    pub custom_user_vars: HashMap<String, CustomUserVar>,

    pub oauth: Option<OAuthConfig>,
}

/// Transport-specific options, discriminated by `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum TransportConfig {
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    #[serde(rename = "sse")]
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    #[serde(rename = "websocket")]
    Websocket {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    #[serde(rename = "streamable-http")]
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Resolved transport family after applying the selection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    Websocket,
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Websocket => "websocket",
            TransportKind::StreamableHttp => "streamable-http",
        };
        write!(f, "{}", s)
    }
}

/// Server-instructions policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ServerInstructions {
    Enabled(bool),
    Text(String),
}

impl Default for ServerInstructions {
    fn default() -> Self {
        ServerInstructions::Enabled(false)
    }
}

/// Declared per-user variable; values are supplied by the caller at
/// connection time.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CustomUserVar {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// OAuth configuration for servers requiring interactive authorization.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OAuthConfig {
    pub issuer_url: String,
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 120_000;
pub const POOL_INIT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_OAUTH_TIMEOUT_MS: u64 = 60_000;

impl McpServerConfig {
    /// Selection rule: a command means stdio; a `ws://`/`wss://` URL means
    /// websocket regardless of the declared kind; a declared streamable-http
    /// stays streamable-http; everything else is SSE.
    pub fn effective_kind(&self) -> TransportKind {
        match &self.transport {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::StreamableHttp { url, .. }
            | TransportConfig::Websocket { url, .. }
            | TransportConfig::Sse { url, .. } => {
                if url.starts_with("ws://") || url.starts_with("wss://") {
                    TransportKind::Websocket
                } else if matches!(self.transport, TransportConfig::StreamableHttp { .. }) {
                    TransportKind::StreamableHttp
                } else {
                    TransportKind::Sse
                }
            },
        }
    }

    /// The remote endpoint, when the transport has one.
    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            TransportConfig::Stdio { .. } => None,
            TransportConfig::Sse { url, .. }
            | TransportConfig::Websocket { url, .. }
            | TransportConfig::StreamableHttp { url, .. } => Some(url),
        }
    }

    pub fn headers(&self) -> Option<&HashMap<String, String>> {
        match &self.transport {
            TransportConfig::Stdio { .. } => None,
            TransportConfig::Sse { headers, .. }
            | TransportConfig::Websocket { headers, .. }
            | TransportConfig::StreamableHttp { headers, .. } => Some(headers),
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms.unwrap_or(DEFAULT_INIT_TIMEOUT_MS))
    }

    /// Timeout for the authorization wait phase: the configured init timeout,
    /// or 60s when none is set.
    pub fn oauth_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms.unwrap_or(DEFAULT_OAUTH_TIMEOUT_MS))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS))
    }

    /// Clone this descriptor with `{{USER_ID}}`, `{{USER_EMAIL}}` and any
    /// declared custom variables substituted into env values, args, the URL
    /// and header values.
    pub fn resolve_for_user(
        &self,
        user: &McpUser,
        custom_values: &HashMap<String, String>,
    ) -> McpServerConfig {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("USER_ID".to_string(), user.id.clone());
        if let Some(email) = &user.email {
            vars.insert("USER_EMAIL".to_string(), email.clone());
        }
        for (key, value) in custom_values {
            // Only declared variables are honored.
            if self.custom_user_vars.contains_key(key) {
                vars.insert(key.clone(), value.clone());
            }
        }

        let mut resolved = self.clone();
        resolved.transport = match resolved.transport {
            TransportConfig::Stdio { command, args, env } => TransportConfig::Stdio {
                command: substitute(&command, &vars),
                args: args.iter().map(|a| substitute(a, &vars)).collect(),
                env: env
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute(v, &vars)))
                    .collect(),
            },
            TransportConfig::Sse { url, headers } => TransportConfig::Sse {
                url: substitute(&url, &vars),
                headers: substitute_map(&headers, &vars),
            },
            TransportConfig::Websocket { url, headers } => TransportConfig::Websocket {
                url: substitute(&url, &vars),
                headers: substitute_map(&headers, &vars),
            },
            TransportConfig::StreamableHttp { url, headers } => TransportConfig::StreamableHttp {
                url: substitute(&url, &vars),
                headers: substitute_map(&headers, &vars),
            },
        };
        resolved
    }
}

fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = input.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

fn substitute_map(
    map: &HashMap<String, String>,
    vars: &HashMap<String, String>,
) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute(v, vars)))
        .collect()
}

impl McpConfig {
    /// Load configuration from a YAML or TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("yaml");

        let config: McpConfig = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))?,
            "toml" => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?,
            _ => {
                return Err(Error::Config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Discover and load configuration from standard locations.
    pub fn discover_and_load() -> Result<Self> {
        let mut search_paths = vec![PathBuf::from("mcplex.yaml"), PathBuf::from("mcplex.toml")];

        if let Some(home) = dirs::home_dir() {
            search_paths.push(home.join(".mcplex/config.yaml"));
        }

        search_paths.push(PathBuf::from("/etc/mcplex/config.yaml"));

        for path in search_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(Error::Config("server name must not be empty".into()));
            }
            if !seen.insert(server.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
            match &server.transport {
                TransportConfig::Stdio { command, .. } if command.is_empty() => {
                    return Err(Error::Config(format!(
                        "server {}: stdio command must not be empty",
                        server.name
                    )));
                },
                TransportConfig::Sse { url, .. }
                | TransportConfig::Websocket { url, .. }
                | TransportConfig::StreamableHttp { url, .. } => {
                    url::Url::parse(url).map_err(|e| {
                        Error::Config(format!("server {}: invalid url: {}", server.name, e))
                    })?;
                },
                _ => {},
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_server(name: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.to_string(),
            transport: TransportConfig::Stdio {
                command: "./calc".to_string(),
                args: vec![],
                env: HashMap::new(),
            },
            init_timeout_ms: None,
            timeout_ms: None,
            icon_path: None,
            server_instructions: ServerInstructions::default(),
            custom_user_vars: HashMap::new(),
            oauth: None,
        }
    }

    #[test]
    fn selection_rule() {
        let server = stdio_server("calc");
        assert_eq!(server.effective_kind(), TransportKind::Stdio);

        let mut server = stdio_server("ws");
        server.transport = TransportConfig::Sse {
            url: "wss://example.com/mcp".to_string(),
            headers: HashMap::new(),
        };
        assert_eq!(server.effective_kind(), TransportKind::Websocket);

        let mut server = stdio_server("shttp");
        server.transport = TransportConfig::StreamableHttp {
            url: "https://example.com/mcp".to_string(),
            headers: HashMap::new(),
        };
        assert_eq!(server.effective_kind(), TransportKind::StreamableHttp);

        let mut server = stdio_server("sse");
        server.transport = TransportConfig::Sse {
            url: "https://example.com/sse".to_string(),
            headers: HashMap::new(),
        };
        assert_eq!(server.effective_kind(), TransportKind::Sse);
    }

    #[test]
    fn parses_yaml_with_defaults() {
        let yaml = r#"
servers:
  - name: calc
    type: stdio
    command: ./calc
  - name: gh
    type: streamable-http
    url: https://gh.example.com/mcp
    init_timeout_ms: 15000
    timeout_ms: 5000
    oauth:
      issuer_url: https://auth.example.com
      scopes: [repo]
"#;
        let config: McpConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.servers.len(), 2);
        config.validate().unwrap();

        let calc = &config.servers[0];
        assert_eq!(calc.init_timeout(), Duration::from_millis(120_000));
        assert_eq!(calc.call_timeout(), Duration::from_millis(30_000));
        assert_eq!(calc.oauth_timeout(), Duration::from_millis(60_000));

        let gh = &config.servers[1];
        assert_eq!(gh.init_timeout(), Duration::from_millis(15_000));
        assert_eq!(gh.call_timeout(), Duration::from_millis(5_000));
        assert_eq!(gh.oauth_timeout(), Duration::from_millis(15_000));
        assert!(gh.oauth.is_some());
    }

    #[test]
    fn user_variable_substitution() {
        let mut server = stdio_server("jira");
        server.custom_user_vars.insert(
            "JIRA_TOKEN".to_string(),
            CustomUserVar {
                title: Some("Jira token".into()),
                description: None,
            },
        );
        server.transport = TransportConfig::Sse {
            url: "https://jira.example.com/{{USER_ID}}/sse".to_string(),
            headers: HashMap::from([
                ("Authorization".to_string(), "Bearer {{JIRA_TOKEN}}".to_string()),
                ("X-Email".to_string(), "{{USER_EMAIL}}".to_string()),
            ]),
        };

        let user = McpUser {
            id: "u1".to_string(),
            email: Some("u1@example.com".to_string()),
        };
        let values = HashMap::from([
            ("JIRA_TOKEN".to_string(), "tok123".to_string()),
            ("UNDECLARED".to_string(), "ignored".to_string()),
        ]);

        let resolved = server.resolve_for_user(&user, &values);
        assert_eq!(
            resolved.url().unwrap(),
            "https://jira.example.com/u1/sse"
        );
        let headers = resolved.headers().unwrap();
        assert_eq!(headers["Authorization"], "Bearer tok123");
        assert_eq!(headers["X-Email"], "u1@example.com");
    }

    #[test]
    fn rejects_duplicate_names() {
        let config = McpConfig {
            servers: vec![stdio_server("calc"), stdio_server("calc")],
        };
        assert!(config.validate().is_err());
    }
}
