//! OAuth provider configurations.
//!
//! Each supported service is a [`ProviderKind`]. A kind knows how to turn the
//! loaded configuration into a [`ProviderConfig`]; adding a provider means adding
//! a variant and its builder.

use crate::config::ProvidersConfig;

/// Supported OAuth providers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    GoogleDrive,
    Dataverse,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::GoogleDrive, ProviderKind::Dataverse];

    /// Parses a service name such as `google_drive`.
    pub fn from_service_name(name: &str) -> Option<Self> {
        match name {
            "google_drive" => Some(ProviderKind::GoogleDrive),
            "dataverse" => Some(ProviderKind::Dataverse),
            _ => None,
        }
    }

    pub fn service_name(self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "google_drive",
            ProviderKind::Dataverse => "dataverse",
        }
    }
}

/// OAuth provider configuration
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Authorization endpoint the browser is sent to
    pub authorize_url: String,

    /// Token endpoint for code exchange and refresh
    pub token_url: String,

    /// RFC 7591 registration endpoint (dynamic providers only)
    pub registration_url: Option<String>,

    pub scopes: Vec<String>,

    /// Static client id; `None` for dynamically registered clients
    pub client_id: Option<String>,

    /// Sent only by confidential clients
    pub client_secret: Option<String>,

    pub use_pkce: bool,
    pub uses_dynamic_registration: bool,

    /// Public clients cannot keep a secret and rely on PKCE instead
    pub is_public_client: bool,

    /// Provider-specific authorization parameters
    pub extra_params: Vec<(String, String)>,
}

impl ProviderConfig {
    pub fn service_name(&self) -> &'static str {
        self.kind.service_name()
    }

    /// Client id to use: the registered one for dynamic providers, else the static one.
    pub fn effective_client_id<'a>(&'a self, provider_client_id: Option<&'a str>) -> Option<&'a str> {
        if self.uses_dynamic_registration {
            provider_client_id
        } else {
            self.client_id.as_deref()
        }
    }

    /// Secret to send with token requests, if this is a confidential client.
    pub fn confidential_secret(&self) -> Option<&str> {
        if self.is_public_client {
            None
        } else {
            self.client_secret.as_deref()
        }
    }
}

/// Builds provider configurations from loaded settings.
#[derive(Clone, Debug)]
pub struct ProviderRegistry {
    providers: ProvidersConfig,
}

impl ProviderRegistry {
    pub fn new(providers: ProvidersConfig) -> Self {
        Self { providers }
    }

    /// Configuration for a service.
    ///
    /// Returns `None` for unknown services and for providers whose required
    /// settings are missing.
    pub fn get_config(&self, service_name: &str) -> Option<ProviderConfig> {
        match ProviderKind::from_service_name(service_name)? {
            ProviderKind::GoogleDrive => self.google_drive(),
            ProviderKind::Dataverse => self.dataverse(),
        }
    }

    /// Every service name this build knows about, configured or not.
    pub fn list_supported(&self) -> Vec<String> {
        ProviderKind::ALL
            .iter()
            .map(|kind| kind.service_name().to_string())
            .collect()
    }

    fn google_drive(&self) -> Option<ProviderConfig> {
        let config = &self.providers.google_drive;
        let client_id = non_empty(config.client_id.as_deref())?;
        let client_secret = non_empty(config.client_secret.as_deref())?;

        Some(ProviderConfig {
            kind: ProviderKind::GoogleDrive,
            authorize_url: config.authorize_url.clone(),
            token_url: config.token_url.clone(),
            registration_url: None,
            scopes: vec!["https://www.googleapis.com/auth/drive.readonly".to_string()],
            client_id: Some(client_id.to_string()),
            client_secret: Some(client_secret.to_string()),
            use_pkce: false,
            uses_dynamic_registration: false,
            is_public_client: false,
            // Google only issues refresh tokens for offline access with consent
            extra_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        })
    }

    fn dataverse(&self) -> Option<ProviderConfig> {
        let auth_url = non_empty(self.providers.dataverse.auth_url.as_deref())?;
        let auth_url = auth_url.trim_end_matches('/');

        Some(ProviderConfig {
            kind: ProviderKind::Dataverse,
            authorize_url: format!("{}/authorize", auth_url),
            token_url: format!("{}/token", auth_url),
            registration_url: Some(format!("{}/register", auth_url)),
            // offline_access is needed to receive a refresh token
            scopes: vec!["openid".to_string(), "offline_access".to_string()],
            client_id: None,
            client_secret: None,
            use_pkce: true,
            uses_dynamic_registration: true,
            is_public_client: true,
            extra_params: Vec::new(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
