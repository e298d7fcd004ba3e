//! Encrypted credential storage for OAuth integrations.
//!
//! One [`Integration`] row exists per user and service. Access and refresh tokens
//! are sealed with AES-256-GCM before they reach SQLite, and the row also carries
//! the bookkeeping the refresh coordinator needs (lock and last-attempt markers).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       IntegrationStore                   │
//! │  - upsert / get / list / delete          │
//! │  - status aggregation                    │
//! │  - refresh lock (conditional UPDATE)     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher                        │
//! │  - AES-256-GCM, nonce per token          │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite (shared by all replicas)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use flowlink::credentials::{IntegrationStore, TokenCipher, TokenUpsert};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cipher = TokenCipher::shared()?;
//! let store = IntegrationStore::new("flowlink.db", cipher)?;
//!
//! let mut tokens = TokenUpsert::new("ya29.access");
//! tokens.refresh_token = Some("1//refresh".to_string());
//! tokens.expires_in = Some(3600);
//! store.upsert(1, "google_drive", &tokens)?;
//!
//! if let Some(integration) = store.get(1, "google_drive")? {
//!     println!("expired: {}", integration.is_expired());
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

mod encryption;
mod storage;

pub use encryption::{generate_key, validate_key, CipherError, TokenCipher, ENCRYPTION_KEY_ENV};
pub use storage::IntegrationStore;

/// Token type recorded when the provider does not send one
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Stored OAuth credentials for one user and one service.
///
/// Tokens stay encrypted here; use [`IntegrationStore::decrypt_tokens`] to open them.
#[derive(Clone, Debug)]
pub struct Integration {
    pub id: i64,
    pub user_id: i64,
    pub service_name: String,
    pub access_token_encrypted: Vec<u8>,
    pub refresh_token_encrypted: Option<Vec<u8>>,
    /// When the access token expires. `None` means it never does.
    pub expires_at: Option<DateTime<Utc>>,
    /// Space-separated scopes granted by the provider
    pub scopes: Option<String>,
    pub token_type: String,
    /// Client id obtained through dynamic registration, needed to refresh
    pub provider_client_id: Option<String>,
    /// Set while a refresh is in flight
    pub refresh_locked_at: Option<DateTime<Utc>>,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    /// True once the access token is past its expiry.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    /// True if the access token expires within `minutes`.
    pub fn is_expiring_soon(&self, minutes: i64) -> bool {
        self.is_expiring_soon_at(minutes, Utc::now())
    }

    pub fn is_expiring_soon_at(&self, minutes: i64, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => match Duration::try_minutes(minutes)
                .and_then(|window| now.checked_add_signed(window))
            {
                Some(horizon) => expires_at < horizon,
                None => minutes > 0,
            },
            None => false,
        }
    }

    /// True if another refresh took the lock less than `timeout` ago.
    ///
    /// Older locks belong to a holder that crashed and are ignored.
    pub fn is_refresh_locked_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.refresh_locked_at {
            Some(locked_at) => now - locked_at < timeout,
            None => false,
        }
    }

    /// True if a refresh was attempted less than `window` ago, whatever its outcome.
    pub fn is_rate_limited_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_refresh_attempt {
            Some(attempted_at) => now - attempted_at < window,
            None => false,
        }
    }

    /// Token-free view for API responses.
    pub fn to_public(&self) -> PublicIntegration {
        PublicIntegration {
            service_name: self.service_name.clone(),
            expires_at: self.expires_at,
            scopes: self.scopes.clone(),
            is_connected: true,
            is_expired: self.is_expired(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Integration as exposed over the API. Never carries tokens.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PublicIntegration {
    pub service_name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
    pub is_connected: bool,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Services partitioned by connection state.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct IntegrationStatus {
    pub connected: Vec<String>,
    pub expired: Vec<String>,
    pub missing: Vec<String>,
}

/// Token values written by [`IntegrationStore::upsert`].
///
/// `refresh_token` and `provider_client_id` left as `None` keep whatever the
/// existing row holds.
#[derive(Clone, Default)]
pub struct TokenUpsert {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds from now
    pub expires_in: Option<i64>,
    pub scopes: Option<String>,
    /// Defaults to `Bearer`
    pub token_type: Option<String>,
    pub provider_client_id: Option<String>,
}

impl TokenUpsert {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            ..Self::default()
        }
    }
}

/// Plaintext tokens of an integration.
#[derive(Clone)]
pub struct DecryptedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}
