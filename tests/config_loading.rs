//! Configuration file loading tests.

use mcplex::config::{McpConfig, TransportConfig, TransportKind};
use std::io::Write;

#[test]
fn loads_yaml_config() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
servers:
  - name: calc
    type: stdio
    command: ./calc
    args: ["--verbose"]
    env:
      CALC_MODE: strict
  - name: docs
    type: sse
    url: https://docs.example.com/sse
    headers:
      X-Api-Key: abc123
  - name: gh
    type: streamable-http
    url: https://gh.example.com/mcp
    server_instructions: true
    oauth:
      issuer_url: https://auth.example.com
      redirect_uri: https://app.example.com/callback
      scopes: [repo, read:user]
      client_id: cid
"#
    )
    .unwrap();

    let config = McpConfig::from_file(file.path()).unwrap();
    assert_eq!(config.servers.len(), 3);

    let calc = &config.servers[0];
    assert_eq!(calc.effective_kind(), TransportKind::Stdio);
    match &calc.transport {
        TransportConfig::Stdio { command, args, env } => {
            assert_eq!(command, "./calc");
            assert_eq!(args, &["--verbose".to_string()]);
            assert_eq!(env["CALC_MODE"], "strict");
        },
        other => panic!("unexpected transport: {:?}", other),
    }

    let docs = &config.servers[1];
    assert_eq!(docs.effective_kind(), TransportKind::Sse);
    assert_eq!(docs.headers().unwrap()["X-Api-Key"], "abc123");

    let gh = &config.servers[2];
    assert_eq!(gh.effective_kind(), TransportKind::StreamableHttp);
    let oauth = gh.oauth.as_ref().unwrap();
    assert_eq!(oauth.scopes, vec!["repo", "read:user"]);
    assert_eq!(oauth.client_id.as_deref(), Some("cid"));
}

#[test]
fn loads_toml_config() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
[[servers]]
name = "calc"
type = "stdio"
command = "./calc"

[[servers]]
name = "ws"
type = "websocket"
url = "wss://ws.example.com/mcp"
"#
    )
    .unwrap();

    let config = McpConfig::from_file(file.path()).unwrap();
    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.servers[1].effective_kind(), TransportKind::Websocket);
}

#[test]
fn rejects_invalid_url() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
servers:
  - name: bad
    type: sse
    url: "not a url"
"#
    )
    .unwrap();

    let err = McpConfig::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("invalid url"));
}

#[test]
fn rejects_unknown_format() {
    let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
    write!(file, "servers = none").unwrap();

    let err = McpConfig::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("Unsupported config format"));
}
