//! Encrypted integration storage using SQLite.
//!
//! Stores OAuth credentials per user and service. Tokens are encrypted at rest
//! with [`TokenCipher`]; the refresh lock lives in the same row so every replica
//! sharing the database sees it.

use super::{
    CipherError, DecryptedTokens, Integration, IntegrationStatus, TokenCipher, TokenUpsert,
    DEFAULT_TOKEN_TYPE,
};
use crate::db::{self, format_timestamp};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, service_name,
           access_token_encrypted, refresh_token_encrypted,
           expires_at, scopes, token_type, provider_client_id,
           refresh_locked_at, last_refresh_attempt,
           created_at, updated_at
    FROM integrations
"#;

fn expiry_after(now: DateTime<Utc>, seconds: i64) -> Result<DateTime<Utc>> {
    Duration::try_seconds(seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .with_context(|| format!("Token lifetime of {} seconds is out of range", seconds))
}

/// Encrypted integration storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE integrations (
///     id INTEGER PRIMARY KEY,
///     user_id INTEGER NOT NULL,
///     service_name TEXT NOT NULL,
///     access_token_encrypted BLOB NOT NULL,  -- nonce || ciphertext
///     refresh_token_encrypted BLOB,          -- optional
///     expires_at TEXT,                       -- RFC 3339, NULL = never expires
///     scopes TEXT,
///     token_type TEXT NOT NULL,
///     provider_client_id TEXT,               -- dynamic registration only
///     refresh_locked_at TEXT,                -- refresh in flight
///     last_refresh_attempt TEXT,             -- rate limiting
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, service_name)
/// );
/// ```
///
/// # Thread Safety
/// The connection sits behind a mutex that is only held inside these synchronous
/// methods, never across an `.await`.
pub struct IntegrationStore {
    conn: Mutex<Connection>,
    cipher: Arc<TokenCipher>,
}

impl IntegrationStore {
    /// Creates or opens an integration store.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    /// * `cipher` - Cipher used to seal tokens
    pub fn new<P: AsRef<Path>>(db_path: P, cipher: Arc<TokenCipher>) -> Result<Self> {
        let conn = db::open_connection(db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                service_name TEXT NOT NULL,
                access_token_encrypted BLOB NOT NULL,
                refresh_token_encrypted BLOB,
                expires_at TEXT,
                scopes TEXT,
                token_type TEXT NOT NULL DEFAULT 'Bearer',
                provider_client_id TEXT,
                refresh_locked_at TEXT,
                last_refresh_attempt TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, service_name)
            )
            "#,
            [],
        )
        .context("Failed to create integrations table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_integrations_user ON integrations(user_id)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Cipher used for this store's tokens.
    pub fn cipher(&self) -> &TokenCipher {
        &self.cipher
    }

    /// Retrieves the integration for a user and service.
    pub fn get(&self, user_id: i64, service_name: &str) -> Result<Option<Integration>> {
        let conn = self.conn.lock();
        fetch(&conn, user_id, service_name)
    }

    /// Lists all integrations of a user, ordered by service name.
    pub fn list(&self, user_id: i64) -> Result<Vec<Integration>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE user_id = ?1 ORDER BY service_name",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare query")?;

        let integrations = stmt
            .query_map(params![user_id], row_to_integration)
            .context("Failed to execute query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read integrations")?;

        Ok(integrations)
    }

    /// Creates or updates the integration for a user and service.
    ///
    /// Tokens are encrypted before writing. On an existing row the access token,
    /// expiry, scopes-if-given and token type are replaced; the refresh token and
    /// provider client id are only replaced when provided. Lock markers are left
    /// untouched.
    pub fn upsert(
        &self,
        user_id: i64,
        service_name: &str,
        tokens: &TokenUpsert,
    ) -> Result<Integration> {
        let access_token_encrypted = self
            .cipher
            .encrypt(&tokens.access_token)
            .context("Failed to encrypt access token")?;

        let refresh_token_encrypted = tokens
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()
            .context("Failed to encrypt refresh token")?;

        let now = Utc::now();
        let expires_at = tokens
            .expires_in
            .map(|seconds| expiry_after(now, seconds).map(format_timestamp))
            .transpose()?;
        let token_type = tokens.token_type.as_deref().unwrap_or(DEFAULT_TOKEN_TYPE);
        let now = format_timestamp(now);

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO integrations (
                user_id, service_name,
                access_token_encrypted, refresh_token_encrypted,
                expires_at, scopes, token_type, provider_client_id,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(user_id, service_name) DO UPDATE SET
                access_token_encrypted = excluded.access_token_encrypted,
                refresh_token_encrypted = COALESCE(
                    excluded.refresh_token_encrypted,
                    integrations.refresh_token_encrypted
                ),
                expires_at = excluded.expires_at,
                scopes = COALESCE(excluded.scopes, integrations.scopes),
                token_type = excluded.token_type,
                provider_client_id = COALESCE(
                    excluded.provider_client_id,
                    integrations.provider_client_id
                ),
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                service_name,
                access_token_encrypted,
                refresh_token_encrypted,
                expires_at,
                tokens.scopes,
                token_type,
                tokens.provider_client_id,
                now,
            ],
        )
        .context("Failed to store integration")?;

        fetch(&conn, user_id, service_name)?
            .context("Integration missing right after upsert")
    }

    /// Deletes the integration for a user and service.
    ///
    /// Returns `false` if there was nothing to delete.
    pub fn delete(&self, user_id: i64, service_name: &str) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .execute(
                "DELETE FROM integrations WHERE user_id = ?1 AND service_name = ?2",
                params![user_id, service_name],
            )
            .context("Failed to delete integration")?;

        Ok(rows_affected > 0)
    }

    /// Partitions `available_services` into connected, expired and missing.
    pub fn status<S: AsRef<str>>(
        &self,
        user_id: i64,
        available_services: &[S],
    ) -> Result<IntegrationStatus> {
        let by_service: HashMap<String, Integration> = self
            .list(user_id)?
            .into_iter()
            .map(|i| (i.service_name.clone(), i))
            .collect();

        let mut status = IntegrationStatus::default();
        for service in available_services {
            let service = service.as_ref();
            match by_service.get(service) {
                None => status.missing.push(service.to_string()),
                Some(i) if i.is_expired() => status.expired.push(service.to_string()),
                Some(_) => status.connected.push(service.to_string()),
            }
        }

        Ok(status)
    }

    /// Services from `required` that are not connected or have expired.
    pub fn missing<S: AsRef<str>>(&self, user_id: i64, required: &[S]) -> Result<Vec<String>> {
        let status = self.status(user_id, required)?;
        Ok(required
            .iter()
            .map(|s| s.as_ref().to_string())
            .filter(|s| !status.connected.contains(s))
            .collect())
    }

    /// Decrypts both tokens of an integration.
    pub fn decrypt_tokens(&self, integration: &Integration) -> Result<DecryptedTokens, CipherError> {
        let access_token = self.cipher.decrypt(&integration.access_token_encrypted)?;
        let refresh_token = integration
            .refresh_token_encrypted
            .as_deref()
            .map(|blob| self.cipher.decrypt(blob))
            .transpose()?;

        Ok(DecryptedTokens {
            access_token,
            refresh_token,
        })
    }

    /// Decrypts only the access token of an integration.
    pub fn access_token(&self, integration: &Integration) -> Result<String, CipherError> {
        self.cipher.decrypt(&integration.access_token_encrypted)
    }

    /// Tries to take the refresh lock for an integration.
    ///
    /// A single conditional `UPDATE` sets both `refresh_locked_at` and
    /// `last_refresh_attempt` to `now`, but only when no fresh lock is held and
    /// no attempt happened within `rate_window`. Exactly one of several racing
    /// callers (in any process) sees a changed row.
    pub fn try_acquire_refresh_lock(
        &self,
        user_id: i64,
        service_name: &str,
        now: DateTime<Utc>,
        lock_timeout: Duration,
        rate_window: Duration,
    ) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .execute(
                r#"
                UPDATE integrations
                SET refresh_locked_at = ?3, last_refresh_attempt = ?3
                WHERE user_id = ?1 AND service_name = ?2
                  AND (refresh_locked_at IS NULL OR refresh_locked_at <= ?4)
                  AND (last_refresh_attempt IS NULL OR last_refresh_attempt <= ?5)
                "#,
                params![
                    user_id,
                    service_name,
                    format_timestamp(now),
                    format_timestamp(now - lock_timeout),
                    format_timestamp(now - rate_window),
                ],
            )
            .context("Failed to acquire refresh lock")?;

        Ok(rows_affected == 1)
    }

    /// Clears the refresh lock. Harmless if the row is gone or unlocked.
    pub fn release_refresh_lock(&self, user_id: i64, service_name: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE integrations SET refresh_locked_at = NULL WHERE user_id = ?1 AND service_name = ?2",
                params![user_id, service_name],
            )
            .context("Failed to release refresh lock")?;

        Ok(())
    }

    /// Overwrites the refresh bookkeeping columns directly.
    #[cfg(test)]
    pub(crate) fn set_refresh_markers(
        &self,
        user_id: i64,
        service_name: &str,
        refresh_locked_at: Option<DateTime<Utc>>,
        last_refresh_attempt: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE integrations SET refresh_locked_at = ?3, last_refresh_attempt = ?4 WHERE user_id = ?1 AND service_name = ?2",
            params![
                user_id,
                service_name,
                refresh_locked_at.map(format_timestamp),
                last_refresh_attempt.map(format_timestamp),
            ],
        )?;
        Ok(())
    }
}

fn fetch(conn: &Connection, user_id: i64, service_name: &str) -> Result<Option<Integration>> {
    conn.query_row(
        &format!("{} WHERE user_id = ?1 AND service_name = ?2", SELECT_COLUMNS),
        params![user_id, service_name],
        row_to_integration,
    )
    .optional()
    .context("Failed to load integration")
}

fn row_to_integration(row: &Row<'_>) -> rusqlite::Result<Integration> {
    Ok(Integration {
        id: row.get(0)?,
        user_id: row.get(1)?,
        service_name: row.get(2)?,
        access_token_encrypted: row.get(3)?,
        refresh_token_encrypted: row.get(4)?,
        expires_at: db::timestamp_column(row, 5)?,
        scopes: row.get(6)?,
        token_type: row.get(7)?,
        provider_client_id: row.get(8)?,
        refresh_locked_at: db::timestamp_column(row, 9)?,
        last_refresh_attempt: db::timestamp_column(row, 10)?,
        created_at: db::required_timestamp_column(row, 11)?,
        updated_at: db::required_timestamp_column(row, 12)?,
    })
}
