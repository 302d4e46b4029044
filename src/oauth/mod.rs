//! Authorization coordination
//!
//! Mediates interactive authorization flows for (principal, server) pairs:
//! concurrent demands on the same pair collapse onto one flow, tokens are
//! persisted once, and the outcome is posted back into the connection that
//! asked.

use crate::config::OAuthConfig;
use crate::connection::McpConnection;
use crate::error::{Error, Result};
use crate::flow::{FlowManager, FlowStatus, FLOW_KIND_OAUTH, FLOW_KIND_TOKENS};
use crate::tokens::TokenStore;
use crate::types::{AuthTokens, Principal};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub mod handler;

pub use handler::{OAuthFlowMetadata, OAuthHandler};

/// Hook the embedding application supplies to surface an authorization URL
/// to the user.
pub type OAuthStartHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Deterministic flow id for a (principal, server) pair.
pub fn flow_id(principal: &Principal, server: &str) -> String {
    format!("{}:{}", principal, server)
}

/// Access-token staleness skew applied before refreshing, in seconds.
const TOKEN_REFRESH_SKEW_SECS: i64 = 60;

pub struct OAuthCoordinator {
    flows: Arc<dyn FlowManager>,
    tokens: Arc<dyn TokenStore>,
    handler: Arc<OAuthHandler>,
    on_oauth_start: Option<OAuthStartHook>,
    /// Guards the consult-then-initiate window per flow id.
    initiation_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OAuthCoordinator {
    pub fn new(
        flows: Arc<dyn FlowManager>,
        tokens: Arc<dyn TokenStore>,
        on_oauth_start: Option<OAuthStartHook>,
    ) -> Self {
        Self {
            flows,
            tokens,
            handler: Arc::new(OAuthHandler::new()),
            on_oauth_start,
            initiation_locks: DashMap::new(),
        }
    }

    pub fn handler(&self) -> &Arc<OAuthHandler> {
        &self.handler
    }

    /// React to a connection's `oauth-required` event: run (or attach to)
    /// the flow, persist tokens on success, and post the outcome back.
    pub async fn handle_oauth_required(
        &self,
        connection: Arc<McpConnection>,
        oauth_config: Option<OAuthConfig>,
    ) {
        let server = connection.server_name().to_string();
        let principal = connection.principal().clone();

        match self.run_flow(&principal, &server, oauth_config.as_ref()).await {
            Ok((tokens, created)) => {
                if created {
                    if let Err(e) = self
                        .tokens
                        .create_token(&principal, &server, tokens.clone())
                        .await
                    {
                        error!(
                            "Failed to persist tokens for {} on server {}: {}",
                            principal, server, e
                        );
                    }
                }
                connection.post_oauth_handled(tokens).await;
            },
            Err(e) => {
                warn!(
                    "Authorization flow for {} on server {} failed: {}",
                    principal, server, e
                );
                connection.post_oauth_failed(e.to_string()).await;
            },
        }
    }

    /// Run or attach to the authorization flow. The boolean is true when
    /// this caller initiated the flow (and should persist the tokens).
    async fn run_flow(
        &self,
        principal: &Principal,
        server: &str,
        oauth_config: Option<&OAuthConfig>,
    ) -> Result<(AuthTokens, bool)> {
        let fid = flow_id(principal, server);

        // Serialize the consult-then-initiate window so exactly one
        // authorization URL is issued per pair.
        let lock = self
            .initiation_locks
            .entry(fid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        if let Some(state) = self.flows.get_flow_state(&fid, FLOW_KIND_OAUTH).await {
            if state.status == FlowStatus::Pending {
                debug!("Attaching to pending authorization flow {}", fid);
                drop(guard);
                let value = self.flows.await_flow(&fid, FLOW_KIND_OAUTH).await?;
                return Ok((parse_tokens(server, value)?, false));
            }
        }

        let config = oauth_config.ok_or_else(|| {
            Error::auth_failed(
                server,
                "server requires authorization but has no oauth configuration",
            )
        })?;

        let metadata = self.handler.initiate_oauth_flow(server, config).await?;
        let created = self
            .flows
            .begin_flow(
                &fid,
                FLOW_KIND_OAUTH,
                Some(serde_json::to_value(&metadata)?),
            )
            .await?;
        drop(guard);

        if created {
            match &self.on_oauth_start {
                Some(hook) => hook(&metadata.authorization_url),
                None => {
                    warn!(
                        "Authorization required for server {}; visit: {}",
                        server, metadata.authorization_url
                    );
                },
            }
            info!(
                "Started authorization flow {} for server {}",
                fid, server
            );
        }

        let value = self.flows.await_flow(&fid, FLOW_KIND_OAUTH).await?;
        Ok((parse_tokens(server, value)?, created))
    }

    /// Complete a pending flow with the authorization code delivered to the
    /// embedding application's callback endpoint.
    pub async fn complete_with_code(
        &self,
        principal: &Principal,
        server: &str,
        code: &str,
    ) -> Result<AuthTokens> {
        let fid = flow_id(principal, server);
        let state = self
            .flows
            .get_flow_state(&fid, FLOW_KIND_OAUTH)
            .await
            .ok_or_else(|| Error::Internal(format!("no pending authorization flow {}", fid)))?;

        let metadata: OAuthFlowMetadata = state
            .metadata
            .ok_or_else(|| Error::Internal(format!("flow {} has no metadata", fid)))
            .and_then(|m| serde_json::from_value(m).map_err(Error::Json))?;

        match self.handler.exchange_code(&metadata, code).await {
            Ok(tokens) => {
                self.flows
                    .complete_flow(&fid, FLOW_KIND_OAUTH, serde_json::to_value(&tokens)?)
                    .await?;
                Ok(tokens)
            },
            Err(e) => {
                self.flows
                    .fail_flow(&fid, FLOW_KIND_OAUTH, e.to_string())
                    .await?;
                Err(e)
            },
        }
    }

    /// Load tokens for a pair, refreshing stale ones. Concurrent loads for
    /// the same pair are serialized through a `mcp_get_tokens` flow.
    pub async fn load_tokens(
        &self,
        principal: &Principal,
        server: &str,
        oauth_config: Option<&OAuthConfig>,
    ) -> Result<Option<AuthTokens>> {
        let fid = flow_id(principal, server);

        let tokens = self.tokens.clone();
        let handler = self.handler.clone();
        let principal_owned = principal.clone();
        let server_owned = server.to_string();
        let oauth_owned = oauth_config.cloned();

        let value = self
            .flows
            .create_flow_with_handler(
                &fid,
                FLOW_KIND_TOKENS,
                Box::pin(async move {
                    let found = tokens.find_token(&principal_owned, &server_owned).await?;
                    let Some(existing) = found else {
                        return Ok(Value::Null);
                    };

                    let stale = existing.is_expired(TOKEN_REFRESH_SKEW_SECS);
                    let (Some(refresh_token), Some(config), true) = (
                        existing.refresh_token.clone(),
                        oauth_owned.as_ref(),
                        stale,
                    ) else {
                        return Ok(serde_json::to_value(&existing)?);
                    };

                    match handler
                        .refresh_oauth_tokens(&server_owned, config, &refresh_token)
                        .await
                    {
                        Ok(refreshed) => {
                            tokens
                                .update_token(&principal_owned, &server_owned, refreshed.clone())
                                .await?;
                            info!(
                                "Refreshed tokens for {} on server {}",
                                principal_owned, server_owned
                            );
                            Ok(serde_json::to_value(&refreshed)?)
                        },
                        Err(e) => {
                            warn!(
                                "Token refresh for {} on server {} failed: {}; keeping stale tokens",
                                principal_owned, server_owned, e
                            );
                            Ok(serde_json::to_value(&existing)?)
                        },
                    }
                }),
            )
            .await?;

        if value.is_null() {
            Ok(None)
        } else {
            Ok(Some(serde_json::from_value(value)?))
        }
    }
}

fn parse_tokens(server: &str, value: Value) -> Result<AuthTokens> {
    serde_json::from_value(value)
        .map_err(|e| Error::auth_failed(server, format!("flow yielded malformed tokens: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_id_is_deterministic() {
        let user = Principal::user("u1");
        assert_eq!(flow_id(&user, "gh"), "u1:gh");
        assert_eq!(flow_id(&user, "gh"), flow_id(&Principal::user("u1"), "gh"));
        assert_eq!(flow_id(&Principal::System, "gh"), "system:gh");
        assert_ne!(flow_id(&user, "gh"), flow_id(&user, "jira"));
    }
}
