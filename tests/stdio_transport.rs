//! STDIO transport integration tests against a real MCP server binary.

use mcplex::config::{McpServerConfig, ServerInstructions, TransportConfig};
use mcplex::connection::{ConnectionState, McpConnection};
use mcplex::types::Principal;
use std::collections::HashMap;

fn stdio_config(command: &str, args: &[&str]) -> McpServerConfig {
    McpServerConfig {
        name: "everything".to_string(),
        transport: TransportConfig::Stdio {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
        },
        init_timeout_ms: Some(30_000),
        timeout_ms: Some(10_000),
        icon_path: None,
        server_instructions: ServerInstructions::Enabled(false),
        custom_user_vars: HashMap::new(),
        oauth: None,
    }
}

#[tokio::test]
#[ignore] // Requires npx and network access to fetch the reference server
async fn stdio_initialize_and_list_tools() {
    let config = stdio_config(
        "npx",
        &["-y", "@modelcontextprotocol/server-everything"],
    );
    let connection = McpConnection::new(config, Principal::System, None, None, None);

    connection.connect().await.expect("connect failed");
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(connection.capabilities().unwrap().supports_tools());

    let tools = connection.list_tools().await;
    assert!(!tools.is_empty(), "reference server should expose tools");

    assert!(connection.is_connected().await);
    connection.disconnect().await.expect("disconnect failed");
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}
