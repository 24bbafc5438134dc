//! Onboarding sessions (TTL'd, one active per phone) and the opt-out list.

use super::{Database, StoreError, from_epoch};
use crate::phone::PhoneNumber;
use crate::types::{CarrierSid, ParseEnumError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Steps and collected data
// =============================================================================

/// Where an onboarding conversation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    Welcome,
    AwaitingConsent,
    AwaitingEmail,
    AwaitingName,
    AwaitingSignupConfirmation,
    AwaitingVerificationCode,
    Completed,
    Aborted,
}

impl OnboardingStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::AwaitingConsent => "awaiting_consent",
            Self::AwaitingEmail => "awaiting_email",
            Self::AwaitingName => "awaiting_name",
            Self::AwaitingSignupConfirmation => "awaiting_signup_confirmation",
            Self::AwaitingVerificationCode => "awaiting_verification_code",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl Display for OnboardingStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnboardingStep {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome" => Ok(Self::Welcome),
            "awaiting_consent" => Ok(Self::AwaitingConsent),
            "awaiting_email" => Ok(Self::AwaitingEmail),
            "awaiting_name" => Ok(Self::AwaitingName),
            "awaiting_signup_confirmation" => Ok(Self::AwaitingSignupConfirmation),
            "awaiting_verification_code" => Ok(Self::AwaitingVerificationCode),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            other => Err(ParseEnumError {
                kind: "onboarding step",
                value: other.to_string(),
            }),
        }
    }
}

/// Answers gathered over the conversation, serialized to JSON in the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signup_token: Option<String>,
    /// Set by the account-linked signal; the verification step needs it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

/// One phone number's onboarding conversation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingSession {
    pub id: i64,
    pub phone: PhoneNumber,
    pub step: OnboardingStep,
    pub collected: CollectedData,
    /// Carrier sid of the last inbound this session consumed.
    pub last_processed_sid: Option<CarrierSid>,
    /// Reply produced for that inbound, replayed on carrier retries.
    pub last_reply: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// =============================================================================
// Store
// =============================================================================

/// Persistence for onboarding sessions and opt-outs.
#[derive(Debug, Clone)]
pub struct OnboardingStore {
    pool: SqlitePool,
}

impl OnboardingStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// The active (unexpired) session for a phone, if any.
    pub async fn find_active(
        &self,
        phone: &PhoneNumber,
        now: DateTime<Utc>,
    ) -> Result<Option<OnboardingSession>, StoreError> {
        let row = sqlx::query(
            "SELECT id, phone_e164, current_step, collected_data, last_processed_sid,
                    last_reply, created_at, updated_at, expires_at
             FROM onboarding_sessions
             WHERE phone_e164 = ? AND expires_at > ?",
        )
        .bind(phone.as_str())
        .bind(now.timestamp())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    /// Create a fresh `welcome` session, replacing any stale row for the
    /// phone (O2: one row per phone, enforced by the unique index).
    pub async fn create(
        &self,
        phone: &PhoneNumber,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<OnboardingSession, StoreError> {
        let expires_at = now + chrono::Duration::seconds(ttl.as_secs() as i64);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM onboarding_sessions WHERE phone_e164 = ?")
            .bind(phone.as_str())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "INSERT INTO onboarding_sessions
                (phone_e164, current_step, collected_data, created_at, updated_at, expires_at)
             VALUES (?, ?, '{}', ?, ?, ?)",
        )
        .bind(phone.as_str())
        .bind(OnboardingStep::Welcome.as_str())
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(expires_at.timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(OnboardingSession {
            id: result.last_insert_rowid(),
            phone: phone.clone(),
            step: OnboardingStep::Welcome,
            collected: CollectedData::default(),
            last_processed_sid: None,
            last_reply: None,
            created_at: now,
            updated_at: now,
            expires_at,
        })
    }

    /// Persist a session's mutable fields after a transition.
    pub async fn save(
        &self,
        session: &OnboardingSession,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let collected = serde_json::to_string(&session.collected)
            .map_err(|e| StoreError::Corrupt(format!("collected data: {e}")))?;
        sqlx::query(
            "UPDATE onboarding_sessions
             SET current_step = ?, collected_data = ?, last_processed_sid = ?,
                 last_reply = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(session.step.as_str())
        .bind(collected)
        .bind(session.last_processed_sid.as_ref().map(CarrierSid::as_str))
        .bind(&session.last_reply)
        .bind(now.timestamp())
        .bind(session.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, phone: &PhoneNumber) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM onboarding_sessions WHERE phone_e164 = ?")
            .bind(phone.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Harvest expired sessions. Returns how many rows were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM onboarding_sessions WHERE expires_at <= ?")
            .bind(now.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Record (or refresh) an opt-out for a phone.
    pub async fn record_opt_out(
        &self,
        phone: &PhoneNumber,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let expires_at = now.timestamp() + ttl.as_secs() as i64;
        sqlx::query(
            "INSERT INTO opt_outs (phone_e164, opted_out_at, expires_at)
             VALUES (?, ?, ?)
             ON CONFLICT(phone_e164) DO UPDATE SET opted_out_at = excluded.opted_out_at,
                 expires_at = excluded.expires_at",
        )
        .bind(phone.as_str())
        .bind(now.timestamp())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_opted_out(
        &self,
        phone: &PhoneNumber,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM opt_outs WHERE phone_e164 = ? AND expires_at > ?")
            .bind(phone.as_str())
            .bind(now.timestamp())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn session_from_row(row: &SqliteRow) -> Result<OnboardingSession, StoreError> {
    let phone_raw: String = row.get("phone_e164");
    let phone = phone_raw
        .parse::<PhoneNumber>()
        .map_err(|e| StoreError::Corrupt(format!("phone '{phone_raw}': {e}")))?;

    let step_raw: String = row.get("current_step");
    let step = step_raw
        .parse::<OnboardingStep>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let collected_raw: String = row.get("collected_data");
    let collected: CollectedData = serde_json::from_str(&collected_raw)
        .map_err(|e| StoreError::Corrupt(format!("collected data: {e}")))?;

    Ok(OnboardingSession {
        id: row.get("id"),
        phone,
        step,
        collected,
        last_processed_sid: row
            .get::<Option<String>, _>("last_processed_sid")
            .map(CarrierSid::from),
        last_reply: row.get("last_reply"),
        created_at: from_epoch(row.get("created_at"))?,
        updated_at: from_epoch(row.get("updated_at"))?,
        expires_at: from_epoch(row.get("expires_at"))?,
    })
}
