//! Error taxonomy for the OAuth integration flows.

use crate::credentials::CipherError;

/// Errors raised while authorizing, exchanging or using OAuth credentials.
///
/// Display strings are safe to show to users: they never contain state values,
/// authorization codes or tokens.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Provider name unknown or not configured
    #[error("Unknown service or missing configuration: {0}")]
    UnknownService(String),

    /// Dynamic-registration provider used before a client was registered
    #[error("No OAuth client id available for {0}")]
    MissingClientId(String),

    /// RFC 7591 registration failed
    #[error("Client registration failed: {message}")]
    Registration { message: String, status: Option<u16> },

    /// Provider redirected back with an `error` parameter
    #[error("OAuth error: {error}{}", description_suffix(.description))]
    ProviderDenied {
        error: String,
        description: Option<String>,
    },

    #[error("Missing authorization code")]
    MissingCode,

    #[error("Missing state parameter")]
    MissingState,

    #[error("Invalid or expired state parameter")]
    InvalidOrExpiredState,

    #[error("Service mismatch in callback")]
    ServiceMismatch { expected: String, actual: String },

    /// Provider rejected a code exchange or refresh
    #[error("Token exchange failed: {error}")]
    TokenExchange {
        error: String,
        description: Option<String>,
    },

    /// Provider unreachable or timed out
    #[error("Connection to OAuth provider failed: {0}")]
    Connection(String),

    /// Stored credential cannot be opened; the user has to reconnect
    #[error("Stored credentials for {0} cannot be decrypted, reconnect the service")]
    DecryptionFailure(String),

    /// A required service has no usable token
    #[error("No valid token for {0}")]
    MissingToken(String),

    #[error("Invalid tweak path: {0}")]
    InvalidTweakPath(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

fn description_suffix(description: &Option<String>) -> String {
    match description.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => format!(". {}", text),
        _ => String::new(),
    }
}

impl OAuthError {
    /// Maps a cipher failure for `service` onto the taxonomy.
    pub fn from_cipher(service: &str, err: CipherError) -> Self {
        match err {
            CipherError::Decryption => OAuthError::DecryptionFailure(service.to_string()),
            other => OAuthError::Storage(anyhow::Error::new(other)),
        }
    }

    pub(crate) fn connection(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "request timed out"
        } else if err.is_connect() {
            "could not connect"
        } else {
            "request failed"
        };
        OAuthError::Connection(kind.to_string())
    }
}
