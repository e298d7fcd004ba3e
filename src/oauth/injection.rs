//! Injects user credentials into flow tweaks before a flow runs.
//!
//! Each flow declares which component field receives which service token, as
//! `service -> "Component.field"`. A declared service without a usable token
//! fails the whole build so the flow never runs half-authenticated.

use super::refresh::RefreshCoordinator;
use super::OAuthError;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Splits `Component.field` on the first dot.
pub fn parse_tweak_path(path: &str) -> Result<(&str, &str), OAuthError> {
    match path.split_once('.') {
        Some((component, field)) if !component.is_empty() && !field.is_empty() => {
            Ok((component, field))
        }
        _ => Err(OAuthError::InvalidTweakPath(path.to_string())),
    }
}

impl RefreshCoordinator {
    /// Builds the tweaks object for a flow run.
    ///
    /// # Arguments
    /// * `user_id` - User the flow runs for
    /// * `token_config` - Service name to `Component.field` path
    /// * `existing_tweaks` - Tweaks to merge into; non-object values are ignored
    ///
    /// # Returns
    /// * `Ok(tweaks)` with every configured token written in
    /// * `Err(InvalidTweakPath)` for a malformed path
    /// * `Err(MissingToken)` for the first service without a valid token
    pub async fn build_flow_tweaks(
        &self,
        user_id: i64,
        token_config: &HashMap<String, String>,
        existing_tweaks: Option<Value>,
    ) -> Result<Value, OAuthError> {
        let mut targets = Vec::with_capacity(token_config.len());
        for (service, path) in token_config {
            let (component, field) = parse_tweak_path(path)?;
            targets.push((service.as_str(), component, field));
        }
        // Deterministic order for the first reported missing service
        targets.sort_unstable();

        let mut tweaks = match existing_tweaks {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        for (service, component, field) in targets {
            let token = self
                .get_valid_token(user_id, service)
                .await
                .ok_or_else(|| {
                    tracing::warn!(service, user_id, "Flow requires a service without a valid token");
                    OAuthError::MissingToken(service.to_string())
                })?;

            let entry = tweaks
                .entry(component.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(fields) = entry {
                fields.insert(field.to_string(), Value::String(token));
            }

            tracing::debug!(service, component, "Injected token into flow tweaks");
        }

        Ok(Value::Object(tweaks))
    }
}
