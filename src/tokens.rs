//! Token store interface
//!
//! Persistence of authorization tokens is an external concern; the manager
//! only consumes this trait. An in-memory implementation is provided for
//! tests and simple embedders.

use crate::error::Result;
use crate::types::{AuthTokens, Principal};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn find_token(&self, principal: &Principal, server: &str) -> Result<Option<AuthTokens>>;

    async fn create_token(
        &self,
        principal: &Principal,
        server: &str,
        tokens: AuthTokens,
    ) -> Result<()>;

    async fn update_token(
        &self,
        principal: &Principal,
        server: &str,
        tokens: AuthTokens,
    ) -> Result<()>;
}

fn token_key(principal: &Principal, server: &str) -> String {
    format!("{}:{}", principal, server)
}

/// Process-local token store.
#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: DashMap<String, AuthTokens>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn find_token(&self, principal: &Principal, server: &str) -> Result<Option<AuthTokens>> {
        Ok(self
            .tokens
            .get(&token_key(principal, server))
            .map(|entry| entry.value().clone()))
    }

    async fn create_token(
        &self,
        principal: &Principal,
        server: &str,
        tokens: AuthTokens,
    ) -> Result<()> {
        debug!("Storing tokens for {} on server {}", principal, server);
        self.tokens.insert(token_key(principal, server), tokens);
        Ok(())
    }

    async fn update_token(
        &self,
        principal: &Principal,
        server: &str,
        tokens: AuthTokens,
    ) -> Result<()> {
        self.tokens.insert(token_key(principal, server), tokens);
        Ok(())
    }
}
