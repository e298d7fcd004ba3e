//! Refresh-and-retry for provider API calls rejected with 401.

use super::refresh::RefreshCoordinator;
use super::OAuthError;
use std::future::Future;

/// Responses whose HTTP status can be inspected
pub trait StatusResponse {
    fn status_code(&self) -> u16;
}

impl StatusResponse for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

const UNAUTHORIZED: u16 = 401;

impl RefreshCoordinator {
    /// Runs `request` with the stored access token, refreshing and retrying once on 401.
    ///
    /// `request` receives the plaintext access token. A refresh that fails, or a
    /// refreshed credential that cannot be read back, yields the original 401
    /// response rather than an error.
    pub async fn with_retry<R, F, Fut>(
        &self,
        user_id: i64,
        service_name: &str,
        mut request: F,
    ) -> Result<R, OAuthError>
    where
        R: StatusResponse,
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<R, OAuthError>>,
    {
        let integration = self
            .store()
            .get(user_id, service_name)?
            .ok_or_else(|| OAuthError::MissingToken(service_name.to_string()))?;
        let token = self
            .store()
            .access_token(&integration)
            .map_err(|e| OAuthError::from_cipher(service_name, e))?;

        let response = request(token).await?;
        if response.status_code() != UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!(service = service_name, user_id, "Got 401, attempting token refresh");
        if !self.refresh(user_id, service_name).await {
            tracing::warn!(service = service_name, user_id, "Refresh failed, returning 401 response");
            return Ok(response);
        }

        let Some(integration) = self.store().get(user_id, service_name)? else {
            return Ok(response);
        };
        let token = match self.store().access_token(&integration) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(service = service_name, user_id, error = %e, "Refreshed token cannot be decrypted");
                return Ok(response);
            }
        };

        tracing::info!(service = service_name, user_id, "Retrying request with refreshed token");
        request(token).await
    }

    /// Sends an authenticated request to a provider API.
    ///
    /// Returns `Ok(None)` when the user has not connected `service_name`.
    pub async fn authorized_request(
        &self,
        http: &reqwest::Client,
        user_id: i64,
        service_name: &str,
        method: reqwest::Method,
        url: &str,
    ) -> Result<Option<reqwest::Response>, OAuthError> {
        if self.store().get(user_id, service_name)?.is_none() {
            return Ok(None);
        }

        let response = self
            .with_retry(user_id, service_name, |token| {
                let request = http.request(method.clone(), url).bearer_auth(token);
                async move { request.send().await.map_err(OAuthError::connection) }
            })
            .await?;

        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvidersConfig;
    use crate::credentials::{generate_key, IntegrationStore, TokenCipher, TokenUpsert};
    use crate::oauth::{ProviderRegistry, RefreshPolicy, TokenClient};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeResponse {
        status: u16,
    }

    impl StatusResponse for FakeResponse {
        fn status_code(&self) -> u16 {
            self.status
        }
    }

    fn token_client(server: &MockServer) -> TokenClient {
        let mut providers = ProvidersConfig::default();
        providers.google_drive.client_id = Some("abc123".to_string());
        providers.google_drive.client_secret = Some("s3cret".to_string());
        providers.google_drive.token_url = format!("{}/google/token", server.uri());

        TokenClient::new(
            Arc::new(ProviderRegistry::new(providers)),
            std::time::Duration::from_secs(5),
        )
        .unwrap()
    }

    fn coordinator(server: &MockServer) -> RefreshCoordinator {
        let client = token_client(server);
        let cipher = Arc::new(TokenCipher::new(&generate_key()).unwrap());
        let store = Arc::new(IntegrationStore::new(":memory:", cipher).unwrap());
        RefreshCoordinator::new(store, client, RefreshPolicy::default())
    }

    fn connect(c: &RefreshCoordinator) {
        let upsert = TokenUpsert {
            refresh_token: Some("rt".to_string()),
            expires_in: Some(3600),
            ..TokenUpsert::new("old-at")
        };
        c.store().upsert(1, "google_drive", &upsert).unwrap();
    }

    async fn mount_token_endpoint(server: &MockServer, status: u16, expected_calls: u64) {
        let template = if status == 200 {
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"access_token": "new-at", "expires_in": 3600}))
        } else {
            ResponseTemplate::new(status).set_body_json(serde_json::json!({"error": "invalid_grant"}))
        };
        Mock::given(method("POST"))
            .and(path("/google/token"))
            .respond_with(template)
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_no_integration_is_missing_token() {
        let server = MockServer::start().await;
        let c = coordinator(&server);

        let result = c
            .with_retry(1, "google_drive", |_token| async { Ok(FakeResponse { status: 200 }) })
            .await;
        assert!(matches!(result, Err(OAuthError::MissingToken(s)) if s == "google_drive"));
    }

    #[tokio::test]
    async fn test_success_is_returned_unchanged() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 200, 0).await;
        let c = coordinator(&server);
        connect(&c);

        let mut seen = Vec::new();
        let response = c
            .with_retry(1, "google_drive", |token| {
                seen.push(token);
                async { Ok(FakeResponse { status: 404 }) }
            })
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(seen, vec!["old-at"]);
    }

    #[tokio::test]
    async fn test_401_refreshes_and_retries_once() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 200, 1).await;
        let c = coordinator(&server);
        connect(&c);

        let mut seen = Vec::new();
        let response = c
            .with_retry(1, "google_drive", |token| {
                seen.push(token);
                async { Ok(FakeResponse { status: 401 }) }
            })
            .await
            .unwrap();

        // Second 401 is returned as is
        assert_eq!(response.status, 401);
        assert_eq!(seen, vec!["old-at", "new-at"]);
    }

    #[tokio::test]
    async fn test_401_with_failed_refresh_returns_original() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 400, 1).await;
        let c = coordinator(&server);
        connect(&c);

        let mut calls = 0;
        let response = c
            .with_retry(1, "google_drive", |_token| {
                calls += 1;
                async { Ok(FakeResponse { status: 401 }) }
            })
            .await
            .unwrap();

        assert_eq!(response.status, 401);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_undecryptable_token_is_error() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("integrations.db");

        let old = IntegrationStore::new(
            &db_path,
            Arc::new(TokenCipher::new(&generate_key()).unwrap()),
        )
        .unwrap();
        old.upsert(1, "google_drive", &TokenUpsert::new("at")).unwrap();

        let store = Arc::new(
            IntegrationStore::new(
                &db_path,
                Arc::new(TokenCipher::new(&generate_key()).unwrap()),
            )
            .unwrap(),
        );
        let c = RefreshCoordinator::new(store, token_client(&server), RefreshPolicy::default());

        let result = c
            .with_retry(1, "google_drive", |_token| async { Ok(FakeResponse { status: 200 }) })
            .await;
        assert!(matches!(result, Err(OAuthError::DecryptionFailure(_))));
    }

    #[tokio::test]
    async fn test_authorized_request() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, 200, 1).await;
        Mock::given(method("GET"))
            .and(path("/drive/files"))
            .and(header("authorization", "Bearer old-at"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/files"))
            .and(header("authorization", "Bearer new-at"))
            .respond_with(ResponseTemplate::new(200).set_body_string("files"))
            .expect(1)
            .mount(&server)
            .await;

        let c = coordinator(&server);
        let http = reqwest::Client::new();
        let url = format!("{}/drive/files", server.uri());

        let none = c
            .authorized_request(&http, 1, "google_drive", reqwest::Method::GET, &url)
            .await
            .unwrap();
        assert!(none.is_none());

        connect(&c);
        let response = c
            .authorized_request(&http, 1, "google_drive", reqwest::Method::GET, &url)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "files");
    }
}
