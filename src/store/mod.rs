//! SQLite persistence for identities, onboarding sessions and SMS attempts.
//!
//! All timestamps are stored as unix epoch seconds (INTEGER columns);
//! conversion to [`chrono::DateTime`] happens at the store boundary so SQL
//! comparisons never depend on string formats.

pub mod identity;
pub mod onboarding;
pub mod usage;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;

/// Error from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A uniqueness constraint rejected the write.
    #[error("conflicting row already exists")]
    Conflict,

    /// A persisted row no longer parses into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Fold unique-index violations into [`StoreError::Conflict`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Self::Conflict;
            }
        }
        Self::Database(err)
    }
}

/// Convert a stored epoch-seconds value back to UTC.
pub(crate) fn from_epoch(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {secs} out of range")))
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS phone_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        phone_e164 TEXT NOT NULL,
        is_primary INTEGER NOT NULL DEFAULT 0,
        is_verified INTEGER NOT NULL DEFAULT 0,
        verification_method TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_phone_mappings_phone
        ON phone_mappings(phone_e164)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_phone_mappings_primary
        ON phone_mappings(user_id) WHERE is_primary = 1",
    "CREATE TABLE IF NOT EXISTS verification_codes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        phone_e164 TEXT NOT NULL,
        code TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 5,
        created_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_verification_codes_target
        ON verification_codes(user_id, phone_e164)",
    "CREATE TABLE IF NOT EXISTS onboarding_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        phone_e164 TEXT NOT NULL,
        current_step TEXT NOT NULL,
        collected_data TEXT NOT NULL DEFAULT '{}',
        last_processed_sid TEXT,
        last_reply TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_onboarding_sessions_phone
        ON onboarding_sessions(phone_e164)",
    "CREATE TABLE IF NOT EXISTS opt_outs (
        phone_e164 TEXT PRIMARY KEY,
        opted_out_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sms_attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER,
        phone_e164 TEXT NOT NULL,
        direction TEXT NOT NULL,
        body TEXT NOT NULL,
        carrier_sid TEXT,
        provider_status TEXT,
        final_status TEXT NOT NULL DEFAULT 'unknown',
        error_code TEXT,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        next_retry_at INTEGER,
        cost_cents INTEGER,
        country_code TEXT NOT NULL DEFAULT 'US',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_sms_attempts_sid
        ON sms_attempts(carrier_sid) WHERE carrier_sid IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS ix_sms_attempts_retry
        ON sms_attempts(final_status, next_retry_at)",
    "CREATE TABLE IF NOT EXISTS usage_counters (
        user_id INTEGER NOT NULL,
        year_month TEXT NOT NULL,
        sms_count_in INTEGER NOT NULL DEFAULT 0,
        sms_count_out INTEGER NOT NULL DEFAULT 0,
        cost_cents_total INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, year_month)
    )",
];

/// Connection pool plus schema management.
///
/// The stores ([`identity::IdentityStore`], [`onboarding::OnboardingStore`],
/// [`usage::UsageStore`]) share the pool by cloning it; they are the only
/// writers to their tables.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the configured database and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // A shared in-memory database only exists on one connection.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Fresh in-memory database, used by the test suites.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}
