//! RFC 7591 dynamic client registration.

use super::OAuthError;
use serde::{Deserialize, Serialize};

/// Client metadata sent to the registration endpoint
#[derive(Serialize)]
struct RegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: [&'a str; 1],
    grant_types: [&'static str; 2],
    response_types: [&'static str; 1],
    token_endpoint_auth_method: &'static str,
    application_type: &'static str,
}

#[derive(Deserialize)]
struct RegistrationResponse {
    #[serde(default)]
    client_id: Option<String>,
}

/// Registers a public native client and returns its `client_id`.
///
/// # Arguments
/// * `http` - Client used for the call (carries the timeout)
/// * `registration_url` - Provider registration endpoint
/// * `redirect_uri` - Callback URI the client is registered for
/// * `client_name` - Display name reported to the provider
///
/// # Returns
/// * `Ok(client_id)` on HTTP 200 or 201 with a `client_id`
/// * `Err(OAuthError::Registration)` otherwise, including transport failures
pub async fn register_client(
    http: &reqwest::Client,
    registration_url: &str,
    redirect_uri: &str,
    client_name: &str,
) -> Result<String, OAuthError> {
    let request = RegistrationRequest {
        client_name,
        redirect_uris: [redirect_uri],
        grant_types: ["authorization_code", "refresh_token"],
        response_types: ["code"],
        token_endpoint_auth_method: "none",
        application_type: "native",
    };

    tracing::info!(registration_url, "Registering OAuth client");

    let response = http
        .post(registration_url)
        .header("Accept", "application/json")
        .json(&request)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Connection error during client registration");
            OAuthError::Registration {
                message: "Connection error during client registration".to_string(),
                status: None,
            }
        })?;

    let status = response.status();
    if status.as_u16() != 200 && status.as_u16() != 201 {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = status.as_u16(), "Client registration rejected");
        tracing::debug!(status = status.as_u16(), body = %body, "Registration error body");
        return Err(OAuthError::Registration {
            message: format!("HTTP {}", status.as_u16()),
            status: Some(status.as_u16()),
        });
    }

    let parsed: RegistrationResponse =
        response.json().await.map_err(|_| OAuthError::Registration {
            message: "Invalid registration response".to_string(),
            status: Some(status.as_u16()),
        })?;

    match parsed.client_id.filter(|id| !id.is_empty()) {
        Some(client_id) => {
            tracing::info!("OAuth client registered");
            Ok(client_id)
        }
        None => Err(OAuthError::Registration {
            message: "No client_id in registration response".to_string(),
            status: Some(status.as_u16()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_register_client_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .and(body_partial_json(serde_json::json!({
                "client_name": "Flowlink",
                "redirect_uris": ["http://x/callback"],
                "grant_types": ["authorization_code", "refresh_token"],
                "response_types": ["code"],
                "token_endpoint_auth_method": "none",
                "application_type": "native"
            })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"client_id": "dyn-123"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client_id = register_client(
            &reqwest::Client::new(),
            &format!("{}/register", server.uri()),
            "http://x/callback",
            "Flowlink",
        )
        .await
        .unwrap();

        assert_eq!(client_id, "dyn-123");
    }

    #[tokio::test]
    async fn test_register_client_missing_client_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = register_client(&reqwest::Client::new(), &server.uri(), "http://x/cb", "Flowlink")
            .await
            .unwrap_err();

        match err {
            OAuthError::Registration { message, status } => {
                assert_eq!(message, "No client_id in registration response");
                assert_eq!(status, Some(200));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_client_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_redirect_uri"))
            .mount(&server)
            .await;

        let err = register_client(&reqwest::Client::new(), &server.uri(), "http://x/cb", "Flowlink")
            .await
            .unwrap_err();

        match err {
            OAuthError::Registration { message, status } => {
                assert_eq!(status, Some(400));
                assert_eq!(message, "HTTP 400");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_client_unreachable() {
        // Nothing listens on port 9 locally
        let err = register_client(
            &reqwest::Client::new(),
            "http://127.0.0.1:9/register",
            "http://x/cb",
            "Flowlink",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, OAuthError::Registration { status: None, .. }));
    }
}
