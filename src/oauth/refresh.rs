//! Token refresh coordination.
//!
//! Refreshes are serialized per integration through a lock persisted in the
//! integration row, so replicas sharing the database never refresh the same
//! token twice. Attempts are rate limited whatever their outcome, and a lock
//! older than the lock timeout is treated as abandoned.

use super::exchange::TokenClient;
use crate::config::{RefreshConfig, MAX_REFRESH_WINDOW_SECONDS, MAX_THRESHOLD_MINUTES};
use crate::credentials::{Integration, IntegrationStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// When to refresh and how refreshes are throttled
#[derive(Clone, Debug)]
pub struct RefreshPolicy {
    pub default_threshold_minutes: i64,
    pub thresholds: HashMap<String, i64>,
    pub lock_timeout: Duration,
    pub rate_limit_window: Duration,
}

impl RefreshPolicy {
    /// Builds the policy, clamping values into the ranges `FlowlinkConfig::validate` accepts.
    pub fn from_config(config: &RefreshConfig) -> Self {
        let minutes = |value: i64| value.clamp(0, MAX_THRESHOLD_MINUTES);
        let seconds = |value: i64| Duration::seconds(value.clamp(0, MAX_REFRESH_WINDOW_SECONDS));

        Self {
            default_threshold_minutes: minutes(config.default_threshold_minutes),
            thresholds: config
                .thresholds
                .iter()
                .map(|(service, value)| (service.clone(), minutes(*value)))
                .collect(),
            lock_timeout: seconds(config.lock_timeout_seconds),
            rate_limit_window: seconds(config.rate_limit_seconds),
        }
    }

    /// Minutes before expiry at which `service_name` is refreshed proactively.
    pub fn threshold_minutes(&self, service_name: &str) -> i64 {
        self.thresholds
            .get(service_name)
            .copied()
            .unwrap_or(self.default_threshold_minutes)
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_config(&RefreshConfig::default())
    }
}

/// Result of a refresh attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    NotFound,
    /// Attempted too recently; no network call was made
    RateLimited,
    /// Another caller holds the lock
    InProgress,
    NoRefreshToken,
    Failed,
}

/// Keeps access tokens valid on behalf of callers.
#[derive(Clone)]
pub struct RefreshCoordinator {
    store: Arc<IntegrationStore>,
    client: TokenClient,
    policy: RefreshPolicy,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<IntegrationStore>, client: TokenClient, policy: RefreshPolicy) -> Self {
        Self {
            store,
            client,
            policy,
        }
    }

    pub fn store(&self) -> &IntegrationStore {
        &self.store
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Returns a usable access token, refreshing it first if it expires soon.
    ///
    /// A token that is merely close to expiry is still returned when the refresh
    /// fails. `None` means there is no integration, the token expired and could
    /// not be refreshed, or the stored credential cannot be decrypted.
    pub async fn get_valid_token(&self, user_id: i64, service_name: &str) -> Option<String> {
        let mut integration = self.load(user_id, service_name)?;

        let threshold = self.policy.threshold_minutes(service_name);
        if integration.is_expiring_soon(threshold) {
            tracing::info!(
                service = service_name,
                user_id,
                threshold_minutes = threshold,
                "Token expiring soon, refreshing"
            );

            if self.refresh(user_id, service_name).await {
                integration = self.load(user_id, service_name)?;
            } else if integration.is_expired() {
                tracing::warn!(
                    service = service_name,
                    user_id,
                    "Token expired and refresh failed"
                );
                return None;
            } else {
                tracing::warn!(
                    service = service_name,
                    user_id,
                    "Refresh failed, using existing token until it expires"
                );
            }
        }

        match self.store.access_token(&integration) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(
                    service = service_name,
                    user_id,
                    error = %e,
                    "Stored token cannot be decrypted, user must reconnect"
                );
                None
            }
        }
    }

    /// Refreshes the token, returning whether new tokens were stored.
    pub async fn refresh(&self, user_id: i64, service_name: &str) -> bool {
        self.refresh_outcome(user_id, service_name).await == RefreshOutcome::Refreshed
    }

    /// Refreshes the token and reports why it did or did not happen.
    pub async fn refresh_outcome(&self, user_id: i64, service_name: &str) -> RefreshOutcome {
        self.refresh_outcome_at(user_id, service_name, Utc::now())
            .await
    }

    pub(crate) async fn refresh_outcome_at(
        &self,
        user_id: i64,
        service_name: &str,
        now: DateTime<Utc>,
    ) -> RefreshOutcome {
        let integration = match self.store.get(user_id, service_name) {
            Ok(Some(integration)) => integration,
            Ok(None) => return RefreshOutcome::NotFound,
            Err(e) => {
                tracing::error!(service = service_name, user_id, error = %e, "Failed to load integration");
                return RefreshOutcome::Failed;
            }
        };

        if integration.is_rate_limited_at(now, self.policy.rate_limit_window) {
            tracing::debug!(service = service_name, user_id, "Refresh rate limited");
            return RefreshOutcome::RateLimited;
        }

        if integration.is_refresh_locked_at(now, self.policy.lock_timeout) {
            tracing::debug!(service = service_name, user_id, "Refresh already in progress");
            return RefreshOutcome::InProgress;
        }

        match self.store.try_acquire_refresh_lock(
            user_id,
            service_name,
            now,
            self.policy.lock_timeout,
            self.policy.rate_limit_window,
        ) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(service = service_name, user_id, "Lost refresh lock race");
                return RefreshOutcome::InProgress;
            }
            Err(e) => {
                tracing::error!(service = service_name, user_id, error = %e, "Failed to acquire refresh lock");
                return RefreshOutcome::Failed;
            }
        }

        let outcome = self.refresh_locked(&integration).await;

        if let Err(e) = self.store.release_refresh_lock(user_id, service_name) {
            tracing::error!(service = service_name, user_id, error = %e, "Failed to release refresh lock");
        }

        outcome
    }

    /// Runs the provider refresh while the lock is held.
    async fn refresh_locked(&self, integration: &Integration) -> RefreshOutcome {
        let service_name = integration.service_name.as_str();
        let user_id = integration.user_id;

        let Some(blob) = integration.refresh_token_encrypted.as_deref() else {
            tracing::warn!(service = service_name, user_id, "No refresh token stored");
            return RefreshOutcome::NoRefreshToken;
        };

        let refresh_token = match self.store.cipher().decrypt(blob) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(service = service_name, user_id, error = %e, "Refresh token cannot be decrypted");
                return RefreshOutcome::Failed;
            }
        };

        let tokens = match self
            .client
            .refresh(
                service_name,
                &refresh_token,
                integration.provider_client_id.as_deref(),
            )
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(service = service_name, user_id, error = %e, "Token refresh failed");
                return RefreshOutcome::Failed;
            }
        };

        let upsert = tokens.into_upsert(integration.provider_client_id.clone());
        match self.store.upsert(user_id, service_name, &upsert) {
            Ok(_) => {
                tracing::info!(service = service_name, user_id, "Token refreshed");
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                tracing::error!(service = service_name, user_id, error = %e, "Failed to store refreshed token");
                RefreshOutcome::Failed
            }
        }
    }

    fn load(&self, user_id: i64, service_name: &str) -> Option<Integration> {
        match self.store.get(user_id, service_name) {
            Ok(integration) => integration,
            Err(e) => {
                tracing::error!(service = service_name, user_id, error = %e, "Failed to load integration");
                None
            }
        }
    }
}
