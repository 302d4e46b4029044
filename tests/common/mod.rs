//! Shared test helpers: a scriptable MCP server backed by wiremock.
//!
//! The responder implements enough of the protocol for the manager to drive
//! real connect / list / call / disconnect cycles over streamable HTTP:
//! session ids are issued per initialize, requests echo ids, and failure
//! modes can be armed per test.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use mcplex::config::{McpServerConfig, ServerInstructions, TransportConfig};

#[derive(Clone, Default)]
pub struct McpResponderState {
    /// Monotonic session counter; initialize N issues `SESS<N>`.
    pub sessions_issued: Arc<AtomicUsize>,
    /// When set, requests without an Authorization header get 401.
    pub require_auth: Arc<AtomicBool>,
    /// When set, the next tools/list request gets a 404 (then auto-clears).
    pub fail_next_tools_list: Arc<AtomicBool>,
    /// Session ids observed on DELETE /session requests.
    pub deleted_sessions: Arc<Mutex<Vec<String>>>,
    /// Session header observed on the most recent POST.
    pub last_session_header: Arc<Mutex<Option<String>>>,
    /// Authorization headers observed on successful initializes.
    pub initialize_auth_headers: Arc<Mutex<Vec<Option<String>>>>,
}

#[derive(Clone, Default)]
pub struct McpResponder {
    pub state: McpResponderState,
}

impl McpResponder {
    fn header(request: &Request, name: &str) -> Option<String> {
        request
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(String::from)
    }

    fn rpc_result(id: Value, result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }))
    }
}

impl Respond for McpResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let method = request.method.to_string().to_uppercase();

        if method == "DELETE" && request.url.path().ends_with("/session") {
            if let Some(session) = Self::header(request, "mcp-session-id") {
                self.state.deleted_sessions.lock().unwrap().push(session);
            }
            return ResponseTemplate::new(200);
        }

        if method != "POST" {
            return ResponseTemplate::new(404).set_body_string("Not Found");
        }

        let auth = Self::header(request, "authorization");
        if self.state.require_auth.load(Ordering::SeqCst) && auth.is_none() {
            return ResponseTemplate::new(401).set_body_string("Unauthorized");
        }

        *self.state.last_session_header.lock().unwrap() =
            Self::header(request, "mcp-session-id");

        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400).set_body_string("Bad Request");
        };

        let rpc_method = body.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let id = body.get("id").cloned().unwrap_or(Value::Null);

        match rpc_method {
            "initialize" => {
                let n = self.state.sessions_issued.fetch_add(1, Ordering::SeqCst) + 1;
                let session = format!("SESS{}", n);
                self.state
                    .initialize_auth_headers
                    .lock()
                    .unwrap()
                    .push(auth);
                Self::rpc_result(
                    id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock", "version": "1.0.0"},
                        "instructions": "mock server instructions"
                    }),
                )
                .insert_header("Mcp-Session-Id", session.as_str())
            },
            "notifications/initialized" => ResponseTemplate::new(202),
            "tools/list" => {
                if self.state.fail_next_tools_list.swap(false, Ordering::SeqCst) {
                    return ResponseTemplate::new(404).set_body_string("Not Found");
                }
                Self::rpc_result(
                    id,
                    json!({
                        "tools": [{
                            "name": "add",
                            "description": "Add two numbers",
                            "inputSchema": {
                                "type": "object",
                                "properties": {
                                    "a": {"type": "number"},
                                    "b": {"type": "number"}
                                }
                            }
                        }]
                    }),
                )
            },
            "tools/call" => Self::rpc_result(
                id,
                json!({"content": [{"type": "text", "text": "3"}]}),
            ),
            "ping" => Self::rpc_result(id, json!({})),
            "resources/list" => Self::rpc_result(id, json!({"resources": []})),
            "prompts/list" => Self::rpc_result(id, json!({"prompts": []})),
            _ => Self::rpc_result(id, json!({})),
        }
    }
}

/// A running mock MCP server plus its scriptable state.
pub struct MockMcpServer {
    pub server: MockServer,
    pub responder: McpResponder,
}

impl MockMcpServer {
    pub async fn start() -> Self {
        let responder = McpResponder::default();
        let server = MockServer::start().await;

        Mock::given(any())
            .respond_with(responder.clone())
            .mount(&server)
            .await;

        Self { server, responder }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/mcp", self.server.uri())
    }

    /// Streamable-http descriptor pointing at this server.
    pub fn server_config(&self, name: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.to_string(),
            transport: TransportConfig::StreamableHttp {
                url: self.endpoint(),
                headers: HashMap::new(),
            },
            init_timeout_ms: Some(10_000),
            timeout_ms: Some(5_000),
            icon_path: None,
            server_instructions: ServerInstructions::Enabled(true),
            custom_user_vars: HashMap::new(),
            oauth: None,
        }
    }

    pub fn deleted_sessions(&self) -> Vec<String> {
        self.responder.state.deleted_sessions.lock().unwrap().clone()
    }
}

/// Poll `probe` until it returns true or `timeout` elapses.
pub async fn wait_for<F>(timeout: std::time::Duration, mut probe: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}
