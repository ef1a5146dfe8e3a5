//! Persistent store of config entries.
//!
//! A config entry is one configured vehicle: a title and the credentials used
//! to poll it. Entries live in the `config_entries` SQLite database; the
//! schema is in `migrations/`. Pending OAuth `state` values are stored next
//! to them so a callback can only complete an authorization we started.

use chrono::NaiveDateTime;
use rocket_db_pools::Database;
use sqlx::SqliteExecutor;

use crate::abrp::{simplify_token, Credentials};

#[derive(Database)]
#[database("config_entries")]
pub struct Entries(sqlx::SqlitePool);

/// Pending OAuth states older than this are rejected.
const OAUTH_STATE_TTL: &str = "-10 minutes";

#[derive(sqlx::FromRow, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub title: String,
    pub api_key: String,
    pub user_token: String,
    pub created_at: NaiveDateTime,
}

impl ConfigEntry {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.api_key.clone(), self.user_token.clone())
    }
}

impl std::fmt::Debug for ConfigEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEntry")
            .field("entry_id", &self.entry_id)
            .field("title", &self.title)
            .field("user_token", &simplify_token(&self.user_token))
            .field("created_at", &self.created_at)
            .finish()
    }
}

pub async fn list<'e>(db: impl SqliteExecutor<'e>) -> sqlx::Result<Vec<ConfigEntry>> {
    sqlx::query_as::<_, ConfigEntry>(
        "SELECT entry_id, title, api_key, user_token, created_at FROM config_entries ORDER BY created_at",
    )
    .fetch_all(db)
    .await
}

pub async fn find_by_user_token<'e>(
    db: impl SqliteExecutor<'e>,
    user_token: &str,
) -> sqlx::Result<Option<ConfigEntry>> {
    sqlx::query_as::<_, ConfigEntry>(
        "SELECT entry_id, title, api_key, user_token, created_at FROM config_entries WHERE user_token = ?",
    )
    .bind(user_token)
    .fetch_optional(db)
    .await
}

pub async fn insert<'e>(
    db: impl SqliteExecutor<'e>,
    title: &str,
    credentials: &Credentials,
) -> sqlx::Result<ConfigEntry> {
    sqlx::query_as::<_, ConfigEntry>(
        "INSERT INTO config_entries (title, api_key, user_token) VALUES (?, ?, ?)
        RETURNING entry_id, title, api_key, user_token, created_at",
    )
    .bind(title)
    .bind(&credentials.api_key)
    .bind(&credentials.user_token)
    .fetch_one(db)
    .await
}

/// True when an insert failed because the user token is already stored.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.is_unique_violation())
}

/// Returns true if the entry existed.
pub async fn delete<'e>(db: impl SqliteExecutor<'e>, entry_id: &str) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM config_entries WHERE entry_id = ?")
        .bind(entry_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Creates a random `state` for a new OAuth authorization.
pub async fn create_oauth_state<'e>(db: impl SqliteExecutor<'e>) -> sqlx::Result<String> {
    let (state,): (String,) =
        sqlx::query_as("INSERT INTO oauth_states DEFAULT VALUES RETURNING state")
            .fetch_one(db)
            .await?;
    Ok(state)
}

/// Consumes a pending `state`. Returns false if it is unknown or expired.
pub async fn take_oauth_state<'e>(db: impl SqliteExecutor<'e>, state: &str) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "DELETE FROM oauth_states WHERE state = ? AND created_at > datetime('now', ?)",
    )
    .bind(state)
    .bind(OAUTH_STATE_TTL)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn purge_oauth_states<'e>(db: impl SqliteExecutor<'e>) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM oauth_states WHERE created_at <= datetime('now', ?)")
        .bind(OAUTH_STATE_TTL)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}
