//! Integration tests for authorization coordination: concurrent demands on
//! the same (principal, server) pair collapse onto one flow, one
//! authorization URL, and one token write.

mod common;

use async_trait::async_trait;
use common::MockMcpServer;
use mcplex::config::OAuthConfig;
use mcplex::connection::ConnectionState;
use mcplex::flow::{FlowManager, FlowStatus, InMemoryFlowManager, FLOW_KIND_OAUTH};
use mcplex::pool::{McpManager, PoolOptions};
use mcplex::tokens::{InMemoryTokenStore, TokenStore};
use mcplex::types::{AuthTokens, McpUser, Principal};
use mcplex::Result;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// Token store that records every create_token call.
struct CountingTokenStore {
    inner: InMemoryTokenStore,
    creates: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl TokenStore for CountingTokenStore {
    async fn find_token(&self, principal: &Principal, server: &str) -> Result<Option<AuthTokens>> {
        self.inner.find_token(principal, server).await
    }

    async fn create_token(
        &self,
        principal: &Principal,
        server: &str,
        tokens: AuthTokens,
    ) -> Result<()> {
        self.creates
            .lock()
            .unwrap()
            .push(format!("{}:{}", principal, server));
        self.inner.create_token(principal, server, tokens).await
    }

    async fn update_token(
        &self,
        principal: &Principal,
        server: &str,
        tokens: AuthTokens,
    ) -> Result<()> {
        self.inner.update_token(principal, server, tokens).await
    }
}

/// Background task standing in for the user: whenever a flow goes pending,
/// wait a beat (so concurrent triggers can attach) and complete it.
fn spawn_flow_completer(flows: Arc<InMemoryFlowManager>, flow_ids: Vec<&'static str>) {
    tokio::spawn(async move {
        loop {
            for flow_id in &flow_ids {
                let state = flows.get_flow_state(flow_id, FLOW_KIND_OAUTH).await;
                if state.map(|s| s.status) == Some(FlowStatus::Pending) {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    let _ = flows
                        .complete_flow(
                            flow_id,
                            FLOW_KIND_OAUTH,
                            json!({"access_token": "tok-1", "refresh_token": "ref-1"}),
                        )
                        .await;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    });
}

#[tokio::test]
async fn concurrent_auth_triggers_share_one_flow() {
    let mock = MockMcpServer::start().await;
    mock.responder.state.require_auth.store(true, Ordering::SeqCst);

    let mut config = mock.server_config("gh");
    config.oauth = Some(OAuthConfig {
        issuer_url: mock.server.uri(),
        redirect_uri: Some("http://localhost/oauth/callback".to_string()),
        scopes: vec!["repo".to_string()],
        client_id: Some("client-1".to_string()),
        client_secret: None,
    });

    let flows = Arc::new(InMemoryFlowManager::default());
    let creates = Arc::new(StdMutex::new(Vec::new()));
    let token_store = Arc::new(CountingTokenStore {
        inner: InMemoryTokenStore::new(),
        creates: creates.clone(),
    });

    let urls: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let urls_hook = urls.clone();

    spawn_flow_completer(flows.clone(), vec!["system:gh", "u1:gh"]);

    let options = PoolOptions {
        on_oauth_start: Some(Arc::new(move |url: &str| {
            urls_hook.lock().unwrap().push(url.to_string());
        })),
        ..PoolOptions::default()
    };

    // Startup itself performs one flow for the system principal.
    let manager = McpManager::initialize(
        vec![config],
        flows.clone(),
        token_store.clone(),
        options,
    )
    .await
    .expect("manager initialization failed");

    assert_eq!(
        manager.process_connection("gh").unwrap().state(),
        ConnectionState::Connected
    );
    assert_eq!(urls.lock().unwrap().len(), 1);
    assert_eq!(creates.lock().unwrap().as_slice(), ["system:gh"]);

    // Two concurrent thread-scope acquisitions for the same user both hit
    // 401 and must collapse onto a single flow.
    let user = McpUser::new("u1");
    let first = {
        let manager = manager.clone();
        let user = user.clone();
        tokio::spawn(async move {
            manager
                .get_thread_connection(&user, "t1", "gh", None)
                .await
        })
    };
    let second = {
        let manager = manager.clone();
        let user = user.clone();
        tokio::spawn(async move {
            manager
                .get_thread_connection(&user, "t2", "gh", None)
                .await
        })
    };

    let conn_a = first.await.unwrap().expect("t1 connection failed");
    let conn_b = second.await.unwrap().expect("t2 connection failed");

    assert_eq!(conn_a.state(), ConnectionState::Connected);
    assert_eq!(conn_b.state(), ConnectionState::Connected);

    // Both observed the same token outcome.
    assert_eq!(conn_a.auth_tokens().unwrap().access_token, "tok-1");
    assert_eq!(conn_b.auth_tokens().unwrap().access_token, "tok-1");

    // Exactly one URL was issued for u1 (total two including startup), and
    // exactly one token write happened per principal.
    assert_eq!(urls.lock().unwrap().len(), 2);
    assert_eq!(
        creates.lock().unwrap().as_slice(),
        ["system:gh", "u1:gh"]
    );

    // The authorization URL carries the PKCE challenge.
    let url = urls.lock().unwrap().last().unwrap().clone();
    assert!(url.contains("code_challenge="));
    assert!(url.contains("client_id=client-1"));

    // Post-flow handshakes carried the delivered token as a bearer header.
    let auth_headers = mock
        .responder
        .state
        .initialize_auth_headers
        .lock()
        .unwrap()
        .clone();
    assert!(auth_headers
        .iter()
        .any(|h| h.as_deref() == Some("Bearer tok-1")));

    // Both calls work through the authorized connections.
    let result = conn_a.call("add", json!({"a": 1, "b": 2}), None).await.unwrap();
    assert_eq!(result["content"][0]["text"], "3");

    manager.disconnect_all().await;
}

#[tokio::test]
async fn auth_failure_without_oauth_config_is_terminal() {
    let mock = MockMcpServer::start().await;
    mock.responder.state.require_auth.store(true, Ordering::SeqCst);

    // No oauth block: the 401 cannot be handled interactively.
    let config = mock.server_config("gh");

    let manager = McpManager::initialize(
        vec![config],
        Arc::new(InMemoryFlowManager::default()),
        Arc::new(InMemoryTokenStore::new()),
        PoolOptions::default(),
    )
    .await
    .expect("manager should come up even when a server fails");

    // The process-scope connection could not be established.
    assert!(manager.process_connection("gh").is_none());
    manager.disconnect_all().await;
}
