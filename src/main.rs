use anyhow::{Context, Result};
use axum::http::{header, HeaderName, HeaderValue, Method};
use flowlink::api::{create_integrations_router, IntegrationsAppState};
use flowlink::auth::USER_ID_HEADER;
use flowlink::config::{load_config, FlowlinkConfig};
use flowlink::credentials::{IntegrationStore, TokenCipher};
use flowlink::oauth::{run_state_cleanup, AuthorizationFlow, OAuthStateStore, ProviderRegistry, TokenClient};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowlink=info".into()),
        )
        .init();

    info!("Flowlink starting...");

    let mut config = match std::env::var("FLOWLINK_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => FlowlinkConfig::default(),
    };
    config.apply_env();
    config.validate()?;

    info!(
        bind_addr = %config.server.bind_addr,
        database_path = %config.server.database_path,
        frontend_host = %config.server.frontend_host,
        "Configuration loaded"
    );

    let cipher = TokenCipher::shared()
        .context("FLOWLINK_TOKEN_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;

    let store = Arc::new(
        IntegrationStore::new(&config.server.database_path, cipher)
            .context("Failed to initialize integration store")?,
    );
    let states = Arc::new(
        OAuthStateStore::new(&config.server.database_path)
            .context("Failed to initialize OAuth state store")?,
    );
    info!("Stores initialized");

    let registry = Arc::new(ProviderRegistry::new(config.providers.clone()));
    for service in registry.list_supported() {
        if registry.get_config(&service).is_none() {
            warn!(service = %service, "OAuth provider not configured");
        }
    }

    let client = TokenClient::new(
        Arc::clone(&registry),
        Duration::from_secs(config.oauth.http_timeout_seconds),
    )?;
    let flow = AuthorizationFlow::new(
        Arc::clone(&states),
        Arc::clone(&store),
        client,
        config.oauth.client_name.clone(),
    );

    tokio::spawn(run_state_cleanup(
        Arc::clone(&states),
        config.oauth.state_cleanup_interval_seconds,
    ));

    let frontend_origin: HeaderValue = config
        .server
        .frontend_host
        .parse()
        .context("frontend_host is not a valid origin")?;
    let cors = CorsLayer::new()
        .allow_origin(frontend_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(USER_ID_HEADER),
        ]);

    let router = create_integrations_router(IntegrationsAppState {
        store,
        flow,
        registry,
        frontend_host: config.server.frontend_host.clone(),
        public_base_url: config.server.public_base_url.clone(),
    })
    .layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .context("Failed to bind API address")?;
    info!(bind_addr = %config.server.bind_addr, "Integrations API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("Integrations API server error")?;

    info!("Flowlink stopped");
    Ok(())
}
