//! OAuth 2.0 flow mechanics: endpoint discovery, PKCE, token exchange
//!
//! The coordinator delegates URL construction and token exchange here; only
//! flow bookkeeping and persistence live elsewhere.

use crate::config::OAuthConfig;
use crate::error::{Error, Result};
use crate::types::AuthTokens;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Everything a pending authorization flow needs to be completed later:
/// rides as flow metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthFlowMetadata {
    pub server: String,
    pub authorization_url: String,
    pub state: String,
    pub code_verifier: String,
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self) -> AuthTokens {
        AuthTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64)),
            client_info: self
                .scope
                .map(|scope| serde_json::json!({ "scope": scope })),
        }
    }
}

/// Discovered (or defaulted) provider endpoints.
#[derive(Debug, Clone)]
struct ProviderEndpoints {
    authorization_endpoint: String,
    token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: String,
    token_endpoint: String,
}

pub struct OAuthHandler {
    http: reqwest::Client,
}

impl Default for OAuthHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthHandler {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Discover endpoints via `.well-known/openid-configuration`, falling
    /// back to conventional paths on the issuer when discovery fails.
    async fn discover(&self, issuer: &str) -> ProviderEndpoints {
        let issuer = issuer.trim_end_matches('/');
        let discovery_url = format!("{}/.well-known/openid-configuration", issuer);

        match self.http.get(&discovery_url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<DiscoveryDocument>().await {
                    Ok(doc) => {
                        return ProviderEndpoints {
                            authorization_endpoint: doc.authorization_endpoint,
                            token_endpoint: doc.token_endpoint,
                        }
                    },
                    Err(e) => warn!("Malformed discovery document from {}: {}", issuer, e),
                }
            },
            Ok(response) => {
                debug!(
                    "Discovery at {} returned {}, using conventional endpoints",
                    discovery_url,
                    response.status()
                );
            },
            Err(e) => {
                debug!(
                    "Discovery at {} failed ({}), using conventional endpoints",
                    discovery_url, e
                );
            },
        }

        ProviderEndpoints {
            authorization_endpoint: format!("{}/authorize", issuer),
            token_endpoint: format!("{}/token", issuer),
        }
    }

    /// Build the authorization URL and the metadata needed to complete the
    /// flow once the user authorizes.
    pub async fn initiate_oauth_flow(
        &self,
        server: &str,
        config: &OAuthConfig,
    ) -> Result<OAuthFlowMetadata> {
        let client_id = config.client_id.clone().ok_or_else(|| {
            Error::Config(format!(
                "server {}: oauth.client_id is required (no registered client)",
                server
            ))
        })?;
        let redirect_uri = config.redirect_uri.clone().ok_or_else(|| {
            Error::Config(format!("server {}: oauth.redirect_uri is required", server))
        })?;

        let endpoints = self.discover(&config.issuer_url).await;

        let code_verifier = generate_secure_random(32);
        let code_challenge = pkce_challenge(&code_verifier);
        let state = generate_secure_random(24);

        let mut url = Url::parse(&endpoints.authorization_endpoint)
            .map_err(|e| Error::Config(format!("server {}: bad authorization endpoint: {}", server, e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &client_id);
            query.append_pair("redirect_uri", &redirect_uri);
            if !config.scopes.is_empty() {
                query.append_pair("scope", &config.scopes.join(" "));
            }
            query.append_pair("state", &state);
            query.append_pair("code_challenge", &code_challenge);
            query.append_pair("code_challenge_method", "S256");
        }

        Ok(OAuthFlowMetadata {
            server: server.to_string(),
            authorization_url: url.to_string(),
            state,
            code_verifier,
            token_endpoint: endpoints.token_endpoint,
            client_id,
            client_secret: config.client_secret.clone(),
            redirect_uri,
            scopes: config.scopes.clone(),
        })
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        metadata: &OAuthFlowMetadata,
        code: &str,
    ) -> Result<AuthTokens> {
        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("client_id", metadata.client_id.clone()),
            ("redirect_uri", metadata.redirect_uri.clone()),
            ("code_verifier", metadata.code_verifier.clone()),
        ];
        if let Some(secret) = &metadata.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::auth_failed(
                &metadata.server,
                format!("token exchange returned {}: {}", status, body),
            ));
        }

        let tokens: TokenResponse = response.json().await?;
        Ok(tokens.into_tokens())
    }

    /// Out-of-band token refresh using the refresh token.
    pub async fn refresh_oauth_tokens(
        &self,
        server: &str,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<AuthTokens> {
        let client_id = config.client_id.clone().ok_or_else(|| {
            Error::Config(format!("server {}: oauth.client_id is required", server))
        })?;

        let endpoints = self.discover(&config.issuer_url).await;

        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", client_id),
        ];
        if let Some(secret) = &config.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&endpoints.token_endpoint)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::auth_failed(
                server,
                format!("token refresh returned {}: {}", status, body),
            ));
        }

        let mut tokens: TokenResponse = response.json().await?;
        // Providers that rotate refresh tokens return a new one; keep the
        // old one otherwise.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        Ok(tokens.into_tokens())
    }
}

/// URL-safe random string of `len` bytes of entropy.
fn generate_secure_random(len: usize) -> String {
    use rand::Rng;
    let bytes: Vec<u8> = (0..len).map(|_| rand::thread_rng().gen::<u8>()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 PKCE challenge for a verifier.
fn pkce_challenge(verifier: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_differs_from_verifier() {
        let verifier = generate_secure_random(32);
        let challenge = pkce_challenge(&verifier);
        assert!(!challenge.is_empty());
        assert_ne!(verifier, challenge);
        // Deterministic for a given verifier.
        assert_eq!(challenge, pkce_challenge(&verifier));
    }

    #[test]
    fn secure_random_is_unique() {
        assert_ne!(generate_secure_random(32), generate_secure_random(32));
        assert_eq!(generate_secure_random(32).len(), 43);
    }
}
