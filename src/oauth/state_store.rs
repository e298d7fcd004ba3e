//! OAuth state storage for CSRF protection.
//!
//! States live in the shared SQLite database rather than process memory, so the
//! replica handling the provider callback does not have to be the one that built
//! the authorization URL.

use crate::db::{self, format_timestamp};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

/// How long an authorization flow may take before its state is rejected
pub const STATE_EXPIRATION_MINUTES: i64 = 10;

/// Default interval of the background sweep
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 300;

/// Server-side record of an authorization flow in progress
#[derive(Clone)]
pub struct OAuthState {
    pub state: String,
    pub user_id: i64,
    pub service_name: String,
    pub redirect_uri: String,
    /// PKCE verifier, sent with the code exchange
    pub code_verifier: Option<String>,
    /// Dynamically registered client the flow was started with
    pub provider_client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OAuthState {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::minutes(STATE_EXPIRATION_MINUTES)
    }
}

/// Fields written when a flow starts
#[derive(Clone)]
pub struct NewOAuthState {
    pub user_id: i64,
    pub service_name: String,
    pub redirect_uri: String,
    pub code_verifier: Option<String>,
    pub provider_client_id: Option<String>,
}

/// SQLite-backed OAuth state store
pub struct OAuthStateStore {
    conn: Mutex<Connection>,
}

impl OAuthStateStore {
    /// Creates or opens the state store in `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = db::open_connection(db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_states (
                state TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                service_name TEXT NOT NULL,
                redirect_uri TEXT NOT NULL,
                code_verifier TEXT,
                provider_client_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create oauth_states table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_oauth_states_created ON oauth_states(created_at)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Records a new flow under `state`.
    pub fn store(&self, state: &str, new_state: &NewOAuthState) -> Result<()> {
        self.store_at(state, new_state, Utc::now())
    }

    pub(crate) fn store_at(
        &self,
        state: &str,
        new_state: &NewOAuthState,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO oauth_states (
                    state, user_id, service_name, redirect_uri,
                    code_verifier, provider_client_id, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    state,
                    new_state.user_id,
                    new_state.service_name,
                    new_state.redirect_uri,
                    new_state.code_verifier,
                    new_state.provider_client_id,
                    format_timestamp(created_at),
                ],
            )
            .context("Failed to store OAuth state")?;

        Ok(())
    }

    /// Looks a state up without consuming it.
    pub fn get(&self, state: &str) -> Result<Option<OAuthState>> {
        let conn = self.conn.lock();
        fetch(&conn, state)
    }

    /// Validates and consumes a state.
    ///
    /// Returns `None` if the state is unknown, expired (the record is purged) or
    /// bound to a different user than `user_id`. A user mismatch leaves the
    /// record in place so the rightful owner can still complete the flow.
    pub fn consume(&self, state: &str, user_id: Option<i64>) -> Result<Option<OAuthState>> {
        self.consume_at(state, user_id, Utc::now())
    }

    pub(crate) fn consume_at(
        &self,
        state: &str,
        user_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthState>> {
        let conn = self.conn.lock();

        let Some(entry) = fetch(&conn, state)? else {
            return Ok(None);
        };

        if entry.is_expired_at(now) {
            delete(&conn, state)?;
            return Ok(None);
        }

        if user_id.is_some_and(|id| id != entry.user_id) {
            return Ok(None);
        }

        // Another replica may have consumed it between our read and delete
        if delete(&conn, state)? {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    /// Deletes every expired state, returning how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(Utc::now())
    }

    pub(crate) fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let threshold = now - Duration::minutes(STATE_EXPIRATION_MINUTES);
        let removed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM oauth_states WHERE created_at < ?1",
                params![format_timestamp(threshold)],
            )
            .context("Failed to clean up OAuth states")?;

        Ok(removed)
    }

    /// Number of stored states (for debugging/monitoring)
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM oauth_states", [], |row| row.get(0))
            .context("Failed to count OAuth states")?;

        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn fetch(conn: &Connection, state: &str) -> Result<Option<OAuthState>> {
    conn.query_row(
        r#"
        SELECT state, user_id, service_name, redirect_uri,
               code_verifier, provider_client_id, created_at
        FROM oauth_states
        WHERE state = ?1
        "#,
        params![state],
        row_to_state,
    )
    .optional()
    .context("Failed to load OAuth state")
}

fn delete(conn: &Connection, state: &str) -> Result<bool> {
    let rows = conn
        .execute("DELETE FROM oauth_states WHERE state = ?1", params![state])
        .context("Failed to delete OAuth state")?;
    Ok(rows > 0)
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<OAuthState> {
    Ok(OAuthState {
        state: row.get(0)?,
        user_id: row.get(1)?,
        service_name: row.get(2)?,
        redirect_uri: row.get(3)?,
        code_verifier: row.get(4)?,
        provider_client_id: row.get(5)?,
        created_at: db::required_timestamp_column(row, 6)?,
    })
}

/// Background task that periodically removes abandoned states.
///
/// Errors are logged and the loop keeps running.
pub async fn run_state_cleanup(store: Arc<OAuthStateStore>, interval_seconds: u64) {
    tracing::info!(interval_seconds, "OAuth state cleanup task started");

    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        match store.cleanup_expired() {
            Ok(0) => tracing::debug!("No expired OAuth states to clean up"),
            Ok(removed) => tracing::info!(removed, "Cleaned up expired OAuth states"),
            Err(e) => tracing::error!(error = %e, "OAuth state cleanup failed"),
        }
    }
}
