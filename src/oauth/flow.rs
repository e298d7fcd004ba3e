//! Authorization code flow orchestration.
//!
//! 1. `start` registers a client when the provider needs one and builds the
//!    authorization URL, persisting a single-use state record
//! 2. The user authorizes on the provider's site
//! 3. `handle_callback` validates the state, exchanges the code and stores the
//!    encrypted tokens for the user the state was issued to

use super::exchange::TokenClient;
use super::pkce::{self, PkcePair};
use super::provider::ProviderConfig;
use super::registration;
use super::state_store::{NewOAuthState, OAuthStateStore};
use super::OAuthError;
use crate::credentials::{Integration, IntegrationStore};
use serde::Deserialize;
use std::sync::Arc;

/// Query parameters the provider redirects back with
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Drives authorization flows for every configured provider.
#[derive(Clone)]
pub struct AuthorizationFlow {
    states: Arc<OAuthStateStore>,
    integrations: Arc<IntegrationStore>,
    client: TokenClient,
    client_name: String,
}

impl AuthorizationFlow {
    pub fn new(
        states: Arc<OAuthStateStore>,
        integrations: Arc<IntegrationStore>,
        client: TokenClient,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            states,
            integrations,
            client,
            client_name: client_name.into(),
        }
    }

    fn provider(&self, service_name: &str) -> Result<ProviderConfig, OAuthError> {
        self.client
            .registry()
            .get_config(service_name)
            .ok_or_else(|| OAuthError::UnknownService(service_name.to_string()))
    }

    /// Builds the provider authorization URL and records the flow.
    ///
    /// # Returns
    /// * `Ok((url, state))` - URL to send the browser to and the CSRF state embedded in it
    /// * `Err(UnknownService | MissingClientId)` - provider cannot be used as configured
    pub fn build_authorization_url(
        &self,
        service_name: &str,
        redirect_uri: &str,
        user_id: i64,
        provider_client_id: Option<&str>,
    ) -> Result<(String, String), OAuthError> {
        let config = self.provider(service_name)?;
        let client_id = config
            .effective_client_id(provider_client_id)
            .ok_or_else(|| OAuthError::MissingClientId(service_name.to_string()))?;

        let state = pkce::generate_state();
        let pkce = config.use_pkce.then(PkcePair::generate);
        let scope = config.scopes.join(" ");

        let mut query: Vec<(&str, &str)> = vec![
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", &scope),
            ("state", &state),
        ];
        if let Some(pair) = &pkce {
            query.push(("code_challenge", pair.challenge()));
            query.push(("code_challenge_method", pkce::CHALLENGE_METHOD));
        }
        query.extend(
            config
                .extra_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        let query = serde_urlencoded::to_string(&query)
            .map_err(|e| OAuthError::Storage(anyhow::anyhow!("Failed to encode query: {}", e)))?;

        self.states.store(
            &state,
            &NewOAuthState {
                user_id,
                service_name: service_name.to_string(),
                redirect_uri: redirect_uri.to_string(),
                code_verifier: pkce.as_ref().map(|pair| pair.verifier().to_string()),
                provider_client_id: if config.uses_dynamic_registration {
                    provider_client_id.map(str::to_string)
                } else {
                    None
                },
            },
        )?;

        tracing::debug!(service = service_name, user_id, "Authorization URL generated");

        Ok((format!("{}?{}", config.authorize_url, query), state))
    }

    /// Registers a client with a dynamic-registration provider.
    pub async fn register_client(
        &self,
        config: &ProviderConfig,
        redirect_uri: &str,
    ) -> Result<String, OAuthError> {
        let registration_url =
            config
                .registration_url
                .as_deref()
                .ok_or_else(|| OAuthError::Registration {
                    message: format!("{} has no registration endpoint", config.service_name()),
                    status: None,
                })?;

        registration::register_client(
            self.client.http(),
            registration_url,
            redirect_uri,
            &self.client_name,
        )
        .await
    }

    /// Starts a flow: registers a client first if the provider requires one.
    pub async fn start(
        &self,
        service_name: &str,
        redirect_uri: &str,
        user_id: i64,
    ) -> Result<(String, String), OAuthError> {
        let config = self.provider(service_name)?;

        let provider_client_id = if config.uses_dynamic_registration {
            Some(self.register_client(&config, redirect_uri).await?)
        } else {
            None
        };

        let started = self.build_authorization_url(
            service_name,
            redirect_uri,
            user_id,
            provider_client_id.as_deref(),
        )?;

        tracing::info!(service = service_name, user_id, "OAuth flow started");
        Ok(started)
    }

    /// Completes a flow from the provider redirect.
    ///
    /// Checks run in order: provider error, missing code, missing state, unknown
    /// or expired state, service mismatch. The stored integration belongs to the
    /// user recorded in the state, never to whoever presents the callback.
    pub async fn handle_callback(
        &self,
        service_name: &str,
        params: &CallbackParams,
    ) -> Result<Integration, OAuthError> {
        if let Some(error) = &params.error {
            tracing::warn!(service = service_name, error = %error, "Provider returned an OAuth error");
            return Err(OAuthError::ProviderDenied {
                error: error.clone(),
                description: params.error_description.clone(),
            });
        }

        let code = params.code.as_deref().ok_or(OAuthError::MissingCode)?;
        let state = params.state.as_deref().ok_or(OAuthError::MissingState)?;

        let entry = self.states.consume(state, None)?.ok_or_else(|| {
            tracing::warn!(service = service_name, "Invalid or expired OAuth state");
            OAuthError::InvalidOrExpiredState
        })?;

        if entry.service_name != service_name {
            tracing::error!(
                expected = %entry.service_name,
                actual = %service_name,
                "Service mismatch in OAuth callback"
            );
            return Err(OAuthError::ServiceMismatch {
                expected: entry.service_name,
                actual: service_name.to_string(),
            });
        }

        let tokens = self
            .client
            .exchange_code(
                service_name,
                code,
                &entry.redirect_uri,
                entry.code_verifier.as_deref(),
                entry.provider_client_id.as_deref(),
            )
            .await?;

        let integration = self.integrations.upsert(
            entry.user_id,
            service_name,
            &tokens.into_upsert(entry.provider_client_id),
        )?;

        tracing::info!(
            service = service_name,
            user_id = entry.user_id,
            "OAuth flow completed successfully"
        );

        Ok(integration)
    }
}

/// Frontend URL the callback endpoint redirects the browser to.
pub fn callback_redirect<T>(
    frontend_host: &str,
    service_name: &str,
    outcome: &Result<T, OAuthError>,
) -> String {
    let base = format!("{}/settings/integrations", frontend_host.trim_end_matches('/'));
    match outcome {
        Ok(_) => format!("{}?connected={}", base, urlencoding::encode(service_name)),
        Err(e) => format!("{}?error={}", base, urlencoding::encode(&e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvidersConfig;
    use crate::credentials::{generate_key, TokenCipher};
    use crate::oauth::ProviderRegistry;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        flow: AuthorizationFlow,
        states: Arc<OAuthStateStore>,
        integrations: Arc<IntegrationStore>,
    }

    fn harness(base_url: &str) -> Harness {
        let mut providers = ProvidersConfig::default();
        providers.google_drive.client_id = Some("abc123".to_string());
        providers.google_drive.client_secret = Some("s3cret".to_string());
        providers.google_drive.token_url = format!("{}/google/token", base_url);
        providers.dataverse.auth_url = Some(format!("{}/dv", base_url));

        let cipher = Arc::new(TokenCipher::new(&generate_key()).unwrap());
        let states = Arc::new(OAuthStateStore::new(":memory:").unwrap());
        let integrations = Arc::new(IntegrationStore::new(":memory:", cipher).unwrap());
        let client = TokenClient::new(
            Arc::new(ProviderRegistry::new(providers)),
            Duration::from_secs(5),
        )
        .unwrap();

        Harness {
            flow: AuthorizationFlow::new(states.clone(), integrations.clone(), client, "Flowlink"),
            states,
            integrations,
        }
    }

    fn query_of(url: &str) -> Vec<(String, String)> {
        let (_, query) = url.split_once('?').unwrap();
        serde_urlencoded::from_str(query).unwrap()
    }

    fn param<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_google_authorization_url() {
        let h = harness("http://localhost:1");
        let (url, state) = h
            .flow
            .build_authorization_url("google_drive", "http://x/callback", 42, None)
            .unwrap();

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        let query = query_of(&url);
        assert_eq!(param(&query, "client_id"), Some("abc123"));
        assert_eq!(param(&query, "redirect_uri"), Some("http://x/callback"));
        assert_eq!(param(&query, "response_type"), Some("code"));
        assert_eq!(
            param(&query, "scope"),
            Some("https://www.googleapis.com/auth/drive.readonly")
        );
        assert_eq!(param(&query, "state"), Some(state.as_str()));
        assert_eq!(param(&query, "access_type"), Some("offline"));
        assert_eq!(param(&query, "prompt"), Some("consent"));
        assert_eq!(param(&query, "code_challenge"), None);
        assert!(state.len() >= 32);

        let entry = h.states.get(&state).unwrap().unwrap();
        assert_eq!(entry.user_id, 42);
        assert_eq!(entry.service_name, "google_drive");
        assert!(entry.code_verifier.is_none());
        assert!(entry.provider_client_id.is_none());
    }

    #[test]
    fn test_dataverse_requires_registered_client() {
        let h = harness("http://localhost:1");
        let err = h
            .flow
            .build_authorization_url("dataverse", "http://x/callback", 1, None)
            .unwrap_err();
        assert!(matches!(err, OAuthError::MissingClientId(s) if s == "dataverse"));
        assert_eq!(h.states.count().unwrap(), 0);
    }

    #[test]
    fn test_dataverse_authorization_url_uses_pkce() {
        let h = harness("http://localhost:1");
        let (url, state) = h
            .flow
            .build_authorization_url("dataverse", "http://x/callback", 1, Some("dyn-1"))
            .unwrap();

        let query = query_of(&url);
        assert_eq!(param(&query, "client_id"), Some("dyn-1"));
        assert_eq!(param(&query, "scope"), Some("openid offline_access"));
        assert_eq!(param(&query, "code_challenge_method"), Some("S256"));

        let entry = h.states.get(&state).unwrap().unwrap();
        let verifier = entry.code_verifier.unwrap();
        assert_eq!(verifier.len(), 64);
        assert_eq!(
            param(&query, "code_challenge"),
            Some(pkce::code_challenge(&verifier).as_str())
        );
        assert_eq!(entry.provider_client_id.as_deref(), Some("dyn-1"));
    }

    #[test]
    fn test_unknown_service() {
        let h = harness("http://localhost:1");
        let err = h
            .flow
            .build_authorization_url("github", "http://x/callback", 1, None)
            .unwrap_err();
        assert!(matches!(err, OAuthError::UnknownService(_)));
    }

    #[tokio::test]
    async fn test_start_registers_dynamic_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dv/register"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"client_id": "dyn-9"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let (url, state) = h.flow.start("dataverse", "http://x/callback", 3).await.unwrap();

        assert_eq!(param(&query_of(&url), "client_id"), Some("dyn-9"));
        let entry = h.states.get(&state).unwrap().unwrap();
        assert_eq!(entry.provider_client_id.as_deref(), Some("dyn-9"));
    }

    #[tokio::test]
    async fn test_start_surfaces_registration_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let err = h.flow.start("dataverse", "http://x/callback", 3).await.unwrap_err();
        assert!(matches!(err, OAuthError::Registration { status: Some(503), .. }));
        assert_eq!(h.states.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_callback_ordered_checks() {
        let h = harness("http://localhost:1");

        let err = h
            .flow
            .handle_callback(
                "google_drive",
                &CallbackParams {
                    error: Some("access_denied".to_string()),
                    code: Some("code".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::ProviderDenied { .. }));

        let err = h
            .flow
            .handle_callback("google_drive", &CallbackParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::MissingCode));

        let err = h
            .flow
            .handle_callback(
                "google_drive",
                &CallbackParams {
                    code: Some("code".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::MissingState));

        let err = h
            .flow
            .handle_callback(
                "google_drive",
                &CallbackParams {
                    code: Some("code".to_string()),
                    state: Some("invalid_state".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::InvalidOrExpiredState));
    }

    #[tokio::test]
    async fn test_callback_service_mismatch() {
        let h = harness("http://localhost:1");
        let (_, state) = h
            .flow
            .build_authorization_url("google_drive", "http://x/callback", 1, None)
            .unwrap();

        let err = h
            .flow
            .handle_callback(
                "dataverse",
                &CallbackParams {
                    code: Some("code".to_string()),
                    state: Some(state),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OAuthError::ServiceMismatch { .. }));
        assert!(h.integrations.get(1, "dataverse").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_callback_stores_integration_for_state_owner() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dv/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "dv-at",
                "refresh_token": "dv-rt",
                "expires_in": 3600,
                "scope": "openid offline_access"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let (_, state) = h
            .flow
            .build_authorization_url("dataverse", "http://x/callback", 7, Some("dyn-1"))
            .unwrap();

        let params = CallbackParams {
            code: Some("auth-code".to_string()),
            state: Some(state.clone()),
            ..Default::default()
        };
        let integration = h.flow.handle_callback("dataverse", &params).await.unwrap();

        assert_eq!(integration.user_id, 7);
        assert_eq!(integration.provider_client_id.as_deref(), Some("dyn-1"));
        let tokens = h.integrations.decrypt_tokens(&integration).unwrap();
        assert_eq!(tokens.access_token, "dv-at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("dv-rt"));

        // State was consumed
        let err = h.flow.handle_callback("dataverse", &params).await.unwrap_err();
        assert!(matches!(err, OAuthError::InvalidOrExpiredState));
    }

    #[tokio::test]
    async fn test_callback_relays_exchange_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let (_, state) = h
            .flow
            .build_authorization_url("google_drive", "http://x/callback", 1, None)
            .unwrap();

        let err = h
            .flow
            .handle_callback(
                "google_drive",
                &CallbackParams {
                    code: Some("code".to_string()),
                    state: Some(state),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Token exchange failed: invalid_grant");
        assert!(h.integrations.get(1, "google_drive").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_callback_rejects_oversized_lifetime() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/google/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "expires_in": 9_000_000_000_000i64
            })))
            .mount(&server)
            .await;

        let h = harness(&server.uri());
        let (_, state) = h
            .flow
            .build_authorization_url("google_drive", "http://x/callback", 1, None)
            .unwrap();

        let outcome = h
            .flow
            .handle_callback(
                "google_drive",
                &CallbackParams {
                    code: Some("code".to_string()),
                    state: Some(state),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(
            callback_redirect("http://localhost:5173", "google_drive", &outcome),
            "http://localhost:5173/settings/integrations?error=Token%20exchange%20failed%3A%20invalid_response"
        );
        assert!(h.integrations.get(1, "google_drive").unwrap().is_none());
    }

    #[test]
    fn test_callback_redirect() {
        let ok: Result<(), OAuthError> = Ok(());
        assert_eq!(
            callback_redirect("http://localhost:5173/", "google_drive", &ok),
            "http://localhost:5173/settings/integrations?connected=google_drive"
        );

        let err: Result<(), OAuthError> = Err(OAuthError::InvalidOrExpiredState);
        assert_eq!(
            callback_redirect("http://localhost:5173", "google_drive", &err),
            "http://localhost:5173/settings/integrations?error=Invalid%20or%20expired%20state%20parameter"
        );
    }
}
