//! OAuth 2.0 integrations with external services.
//!
//! ```text
//! start ──► registration (dynamic providers) ──► authorization URL + state
//!                                                        │
//! callback ◄── provider redirect ◄── user consents ◄─────┘
//!    │
//!    └─► consume state ──► exchange code ──► IntegrationStore (encrypted)
//!
//! get_valid_token / with_retry ──► RefreshCoordinator ──► token endpoint
//! ```
//!
//! State records and refresh locks both live in the shared SQLite database, so
//! any replica can finish a flow or refresh a token another replica started.

mod error;
mod exchange;
mod flow;
mod injection;
mod pkce;
mod provider;
mod refresh;
mod registration;
mod retry;
mod state_store;

pub use error::OAuthError;
pub use exchange::{TokenClient, TokenSet};
pub use flow::{callback_redirect, AuthorizationFlow, CallbackParams};
pub use injection::parse_tweak_path;
pub use pkce::{code_challenge, generate_state, PkcePair, CHALLENGE_METHOD};
pub use provider::{ProviderConfig, ProviderKind, ProviderRegistry};
pub use refresh::{RefreshCoordinator, RefreshOutcome, RefreshPolicy};
pub use registration::register_client;
pub use retry::StatusResponse;
pub use state_store::{
    run_state_cleanup, NewOAuthState, OAuthState, OAuthStateStore,
    DEFAULT_CLEANUP_INTERVAL_SECONDS, STATE_EXPIRATION_MINUTES,
};
