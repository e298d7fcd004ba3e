//! Integration management API endpoints.
//!
//! Lists a user's connected services, starts OAuth flows, receives provider
//! callbacks and disconnects services. The user is identified by the
//! `x-user-id` header set by the upstream auth layer; the callback is the one
//! unauthenticated route and takes the user from the state record instead.

use crate::auth::extract_user_id;
use crate::credentials::{IntegrationStore, PublicIntegration};
use crate::oauth::{callback_redirect, AuthorizationFlow, CallbackParams, OAuthError, ProviderRegistry};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared application state for the integrations API
#[derive(Clone)]
pub struct IntegrationsAppState {
    pub store: Arc<IntegrationStore>,
    pub flow: AuthorizationFlow,
    pub registry: Arc<ProviderRegistry>,
    /// Frontend the callback redirects back to
    pub frontend_host: String,
    /// Externally visible base URL of this API
    pub public_base_url: String,
}

/// Response for GET /api/v1/integrations
#[derive(Serialize)]
pub struct ListIntegrationsResponse {
    pub integrations: Vec<PublicIntegration>,
    pub count: usize,
}

/// Response for GET /api/v1/integrations/status
#[derive(Serialize)]
pub struct IntegrationStatusResponse {
    pub connected_services: Vec<String>,
    pub expired_services: Vec<String>,
    pub missing_services: Vec<String>,
}

/// Response for GET /api/v1/integrations/services
#[derive(Serialize)]
pub struct ServicesResponse {
    pub services: Vec<String>,
}

/// Response for POST /api/v1/integrations/oauth/start/:service
#[derive(Serialize)]
pub struct StartOAuthResponse {
    pub authorization_url: String,
    pub service: String,
    /// Also embedded in the authorization URL
    pub state: String,
}

/// Response for DELETE /api/v1/integrations/:service
#[derive(Serialize)]
pub struct DisconnectResponse {
    pub message: String,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for integration endpoints
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServiceUnavailable(String),
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<OAuthError> for AppError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::UnknownService(_) | OAuthError::MissingClientId(_) => {
                AppError::BadRequest(err.to_string())
            }
            OAuthError::Registration { .. } => AppError::ServiceUnavailable(err.to_string()),
            other => {
                error!(error = %other, "Integration request failed");
                AppError::InternalServerError("Internal server error".to_string())
            }
        }
    }
}

/// Callback URI registered with providers for `service_name`.
pub fn redirect_uri(public_base_url: &str, service_name: &str) -> String {
    format!(
        "{}/api/v1/integrations/oauth/callback/{}",
        public_base_url.trim_end_matches('/'),
        service_name
    )
}

/// Create integrations API router
pub fn create_integrations_router(state: IntegrationsAppState) -> Router {
    Router::new()
        .route("/api/v1/integrations", get(list_integrations))
        .route("/api/v1/integrations/status", get(integration_status))
        .route("/api/v1/integrations/services", get(list_services))
        .route("/api/v1/integrations/oauth/start/:service", post(start_oauth))
        .route("/api/v1/integrations/oauth/callback/:service", get(oauth_callback))
        .route("/api/v1/integrations/:service", delete(disconnect))
        .with_state(Arc::new(state))
}

fn user_id(headers: &HeaderMap) -> Result<i64, AppError> {
    extract_user_id(headers).map_err(|e| AppError::Unauthorized(e.to_string()))
}

/// GET /api/v1/integrations - List the user's integrations
async fn list_integrations(
    State(state): State<Arc<IntegrationsAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListIntegrationsResponse>, AppError> {
    let user_id = user_id(&headers)?;
    debug!(user_id, "Listing integrations");

    let integrations: Vec<PublicIntegration> = state
        .store
        .list(user_id)
        .map_err(|e| {
            error!(user_id, error = %e, "Failed to list integrations");
            AppError::InternalServerError("Failed to list integrations".to_string())
        })?
        .iter()
        .map(|integration| integration.to_public())
        .collect();

    Ok(Json(ListIntegrationsResponse {
        count: integrations.len(),
        integrations,
    }))
}

/// GET /api/v1/integrations/status - Connection state of every supported service
async fn integration_status(
    State(state): State<Arc<IntegrationsAppState>>,
    headers: HeaderMap,
) -> Result<Json<IntegrationStatusResponse>, AppError> {
    let user_id = user_id(&headers)?;

    let status = state
        .store
        .status(user_id, &state.registry.list_supported())
        .map_err(|e| {
            error!(user_id, error = %e, "Failed to compute integration status");
            AppError::InternalServerError("Failed to get integration status".to_string())
        })?;

    Ok(Json(IntegrationStatusResponse {
        connected_services: status.connected,
        expired_services: status.expired,
        missing_services: status.missing,
    }))
}

/// GET /api/v1/integrations/services - Supported service names
async fn list_services(State(state): State<Arc<IntegrationsAppState>>) -> Json<ServicesResponse> {
    Json(ServicesResponse {
        services: state.registry.list_supported(),
    })
}

/// POST /api/v1/integrations/oauth/start/:service
///
/// Returns the provider authorization URL for the frontend to navigate to.
/// Dynamic-registration providers get a fresh client registered first.
async fn start_oauth(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StartOAuthResponse>, AppError> {
    let user_id = user_id(&headers)?;
    debug!(service = %service, user_id, "OAuth start requested");

    let redirect_uri = redirect_uri(&state.public_base_url, &service);
    let (authorization_url, oauth_state) = state
        .flow
        .start(&service, &redirect_uri, user_id)
        .await
        .map_err(|e| {
            warn!(service = %service, user_id, error = %e, "Failed to start OAuth flow");
            AppError::from(e)
        })?;

    info!(service = %service, user_id, "OAuth flow initiated");

    Ok(Json(StartOAuthResponse {
        authorization_url,
        service,
        state: oauth_state,
    }))
}

/// GET /api/v1/integrations/oauth/callback/:service
///
/// Always answers with a redirect to the frontend integrations page carrying
/// either `connected` or a sanitized `error` message.
async fn oauth_callback(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(service): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Response {
    debug!(service = %service, "OAuth callback received");

    let outcome = state.flow.handle_callback(&service, &params).await;
    if let Err(e) = &outcome {
        warn!(service = %service, error = %e, "OAuth callback failed");
    }

    let location = callback_redirect(&state.frontend_host, &service, &outcome);
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// DELETE /api/v1/integrations/:service - Disconnect a service
async fn disconnect(
    State(state): State<Arc<IntegrationsAppState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let user_id = user_id(&headers)?;

    let deleted = state.store.delete(user_id, &service).map_err(|e| {
        error!(service = %service, user_id, error = %e, "Failed to delete integration");
        AppError::InternalServerError("Failed to delete integration".to_string())
    })?;

    if !deleted {
        return Err(AppError::NotFound("Integration not found".to_string()));
    }

    info!(service = %service, user_id, "Integration disconnected");

    Ok(Json(DisconnectResponse {
        message: "Integration disconnected".to_string(),
    }))
}
