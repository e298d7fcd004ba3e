//! OAuth token exchange logic.
//!
//! Exchanges authorization codes for tokens and refreshes access tokens against
//! the provider token endpoint.

use super::provider::{ProviderConfig, ProviderRegistry};
use super::OAuthError;
use crate::credentials::{TokenUpsert, DEFAULT_TOKEN_TYPE};
use anyhow::Context;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Longest `expires_in` accepted from a provider (ten years)
pub const MAX_TOKEN_LIFETIME_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Tokens returned by a provider
#[derive(Clone, Debug)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    pub expires_in: Option<i64>,
    pub token_type: String,
    pub scope: Option<String>,
}

impl TokenSet {
    /// Converts into the store's upsert payload.
    pub fn into_upsert(self, provider_client_id: Option<String>) -> TokenUpsert {
        TokenUpsert {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_in: self.expires_in,
            scopes: self.scope,
            token_type: Some(self.token_type),
            provider_client_id,
        }
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// RFC 6749 error body
#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client for provider token endpoints
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    registry: Arc<ProviderRegistry>,
}

impl TokenClient {
    /// Creates a client whose requests give up after `timeout`.
    pub fn new(registry: Arc<ProviderRegistry>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, registry })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Exchange authorization code for tokens
    ///
    /// # Arguments
    /// * `service_name` - Provider the code was issued by
    /// * `code` - Authorization code from callback
    /// * `redirect_uri` - Redirect URI used in the authorization request
    /// * `code_verifier` - PKCE verifier, when the flow used one
    /// * `provider_client_id` - Dynamically registered client id
    pub async fn exchange_code(
        &self,
        service_name: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
        provider_client_id: Option<&str>,
    ) -> Result<TokenSet, OAuthError> {
        let config = self.provider(service_name)?;
        let client_id = client_id(&config, provider_client_id)?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id),
        ];
        if let Some(secret) = config.confidential_secret() {
            form.push(("client_secret", secret));
        }
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        tracing::debug!(service = service_name, "Exchanging authorization code for token");
        let tokens = self.post_token_request(&config, &form).await?;

        tracing::info!(
            service = service_name,
            has_refresh_token = tokens.refresh_token.is_some(),
            expires_in = ?tokens.expires_in,
            "Token exchange successful"
        );
        Ok(tokens)
    }

    /// Refresh an access token.
    ///
    /// When the provider does not rotate the refresh token, the one that was sent
    /// is carried over into the result.
    pub async fn refresh(
        &self,
        service_name: &str,
        refresh_token: &str,
        provider_client_id: Option<&str>,
    ) -> Result<TokenSet, OAuthError> {
        let config = self.provider(service_name)?;
        let client_id = client_id(&config, provider_client_id)?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];
        if let Some(secret) = config.confidential_secret() {
            form.push(("client_secret", secret));
        }

        tracing::debug!(service = service_name, "Refreshing access token");
        let mut tokens = self.post_token_request(&config, &form).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }

        Ok(tokens)
    }

    fn provider(&self, service_name: &str) -> Result<ProviderConfig, OAuthError> {
        self.registry
            .get_config(service_name)
            .ok_or_else(|| OAuthError::UnknownService(service_name.to_string()))
    }

    async fn post_token_request(
        &self,
        config: &ProviderConfig,
        form: &[(&str, &str)],
    ) -> Result<TokenSet, OAuthError> {
        let response = self
            .http
            .post(&config.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(service = config.service_name(), error = %e, "Token endpoint unreachable");
                OAuthError::connection(e)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(OAuthError::connection)?;

        if !status.is_success() {
            let err = provider_error(status.as_u16(), body);
            tracing::warn!(
                service = config.service_name(),
                status = status.as_u16(),
                error = %err,
                "Token endpoint returned an error"
            );
            return Err(err);
        }

        parse_token_response(&body)
    }
}

fn client_id<'a>(
    config: &'a ProviderConfig,
    provider_client_id: Option<&'a str>,
) -> Result<&'a str, OAuthError> {
    config
        .effective_client_id(provider_client_id)
        .ok_or_else(|| OAuthError::MissingClientId(config.service_name().to_string()))
}

fn provider_error(status: u16, body: String) -> OAuthError {
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(ErrorResponse {
            error: Some(error),
            error_description,
        }) => OAuthError::TokenExchange {
            error,
            description: error_description,
        },
        _ => OAuthError::TokenExchange {
            error: format!("http_{}", status),
            description: Some(body),
        },
    }
}

fn parse_token_response(body: &str) -> Result<TokenSet, OAuthError> {
    let invalid = || OAuthError::TokenExchange {
        error: "invalid_response".to_string(),
        description: None,
    };

    let response: TokenResponse = serde_json::from_str(body).map_err(|_| invalid())?;
    if response.access_token.is_empty() {
        return Err(invalid());
    }
    if let Some(seconds) = response.expires_in {
        if !(0..=MAX_TOKEN_LIFETIME_SECONDS).contains(&seconds) {
            tracing::warn!(expires_in = seconds, "Token response lifetime out of range");
            return Err(invalid());
        }
    }

    Ok(TokenSet {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        expires_in: response.expires_in,
        token_type: response
            .token_type
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
        scope: response.scope,
    })
}
