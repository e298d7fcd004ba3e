use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Upper bound for the refresh lock timeout and rate limit window (one week)
pub const MAX_REFRESH_WINDOW_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Upper bound for refresh thresholds (one week)
pub const MAX_THRESHOLD_MINUTES: i64 = 7 * 24 * 60;

/// Complete Flowlink configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FlowlinkConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// HTTP server and persistence settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Frontend the OAuth callback redirects back to
    #[serde(default = "default_frontend_host")]
    pub frontend_host: String,
    /// Externally visible base URL, used to build provider redirect URIs
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// SQLite file shared by all replicas
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_frontend_host() -> String {
    "http://localhost:5173".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_database_path() -> String {
    "flowlink.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            frontend_host: default_frontend_host(),
            public_base_url: default_public_base_url(),
            database_path: default_database_path(),
        }
    }
}

/// OAuth flow settings
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// How often abandoned OAuth states are swept (seconds)
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
    /// Timeout for token and registration calls (seconds)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// Name sent when registering a client dynamically
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_state_cleanup_interval() -> u64 {
    crate::oauth::DEFAULT_CLEANUP_INTERVAL_SECONDS
}

fn default_http_timeout() -> u64 {
    30
}

fn default_client_name() -> String {
    "Flowlink".to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
            http_timeout_seconds: default_http_timeout(),
            client_name: default_client_name(),
        }
    }
}

/// Per-provider settings
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub google_drive: GoogleDriveConfig,
    #[serde(default)]
    pub dataverse: DataverseConfig,
}

/// Google Drive uses a statically registered confidential client
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleDriveConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_google_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_google_token_url")]
    pub token_url: String,
}

fn default_google_authorize_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl Default for GoogleDriveConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            authorize_url: default_google_authorize_url(),
            token_url: default_google_token_url(),
        }
    }
}

/// Dataverse registers public clients at runtime (RFC 7591)
#[derive(Debug, Clone, Deserialize)]
pub struct DataverseConfig {
    /// Base URL serving /authorize, /token and /register
    #[serde(default = "default_dataverse_auth_url")]
    pub auth_url: Option<String>,
}

fn default_dataverse_auth_url() -> Option<String> {
    Some("https://mcp.dataverse.redhat.com/auth".to_string())
}

impl Default for DataverseConfig {
    fn default() -> Self {
        Self {
            auth_url: default_dataverse_auth_url(),
        }
    }
}

/// Token refresh policy
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Minutes before expiry at which a token is refreshed proactively
    #[serde(default = "default_threshold_minutes")]
    pub default_threshold_minutes: i64,
    /// Per-service overrides of the threshold
    #[serde(default = "default_thresholds")]
    pub thresholds: HashMap<String, i64>,
    /// A refresh lock older than this is considered abandoned
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: i64,
    /// Minimum time between two refresh attempts of one integration
    #[serde(default = "default_rate_limit")]
    pub rate_limit_seconds: i64,
}

fn default_threshold_minutes() -> i64 {
    5
}

fn default_thresholds() -> HashMap<String, i64> {
    // Dataverse runs long agentic tasks and needs a wider buffer
    HashMap::from([
        ("google_drive".to_string(), 5),
        ("dataverse".to_string(), 60),
    ])
}

fn default_lock_timeout() -> i64 {
    30
}

fn default_rate_limit() -> i64 {
    60
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            default_threshold_minutes: default_threshold_minutes(),
            thresholds: default_thresholds(),
            lock_timeout_seconds: default_lock_timeout(),
            rate_limit_seconds: default_rate_limit(),
        }
    }
}

impl FlowlinkConfig {
    /// Overlays `FLOWLINK_*` environment variables on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("FLOWLINK_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = non_empty("FLOWLINK_FRONTEND_HOST") {
            self.server.frontend_host = v;
        }
        if let Some(v) = non_empty("FLOWLINK_PUBLIC_BASE_URL") {
            self.server.public_base_url = v;
        }
        if let Some(v) = non_empty("FLOWLINK_DATABASE_PATH") {
            self.server.database_path = v;
        }
        if let Some(v) = non_empty("FLOWLINK_GOOGLE_CLIENT_ID") {
            self.providers.google_drive.client_id = Some(v);
        }
        if let Some(v) = non_empty("FLOWLINK_GOOGLE_CLIENT_SECRET") {
            self.providers.google_drive.client_secret = Some(v);
        }
        if let Some(v) = non_empty("FLOWLINK_DATAVERSE_AUTH_URL") {
            self.providers.dataverse.auth_url = Some(v);
        }
    }

    /// Rejects intervals and durations the runtime cannot represent.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.oauth.state_cleanup_interval_seconds > 0,
            "oauth.state_cleanup_interval_seconds must be positive"
        );
        ensure!(
            self.oauth.http_timeout_seconds > 0,
            "oauth.http_timeout_seconds must be positive"
        );
        ensure!(
            (1..=MAX_REFRESH_WINDOW_SECONDS).contains(&self.refresh.lock_timeout_seconds),
            "refresh.lock_timeout_seconds must be between 1 and {}",
            MAX_REFRESH_WINDOW_SECONDS
        );
        ensure!(
            (0..=MAX_REFRESH_WINDOW_SECONDS).contains(&self.refresh.rate_limit_seconds),
            "refresh.rate_limit_seconds must be between 0 and {}",
            MAX_REFRESH_WINDOW_SECONDS
        );

        let thresholds = std::iter::once(("default", self.refresh.default_threshold_minutes)).chain(
            self.refresh
                .thresholds
                .iter()
                .map(|(service, minutes)| (service.as_str(), *minutes)),
        );
        for (service, minutes) in thresholds {
            ensure!(
                (0..=MAX_THRESHOLD_MINUTES).contains(&minutes),
                "refresh threshold for {} must be between 0 and {} minutes",
                service,
                MAX_THRESHOLD_MINUTES
            );
        }

        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<FlowlinkConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    let config: FlowlinkConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path))?;
    Ok(config)
}
