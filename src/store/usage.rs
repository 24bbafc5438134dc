//! SMS attempt log and per-user monthly usage counters.
//!
//! Attempt rows are append-only from the outside world's perspective: they
//! are created once per logical send or inbound, mutated by status callbacks
//! and retries, and never deleted (audit trail).

use super::{Database, StoreError, from_epoch};
use crate::phone::PhoneNumber;
use crate::types::{AttemptId, CarrierSid, Direction, FinalStatus, UserId, YearMonth};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::str::FromStr;

/// One logical SMS event with its full delivery lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsAttempt {
    pub id: AttemptId,
    pub user_id: Option<UserId>,
    pub phone: PhoneNumber,
    pub direction: Direction,
    pub body: String,
    pub carrier_sid: Option<CarrierSid>,
    pub provider_status: Option<String>,
    pub final_status: FinalStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub cost_cents: Option<i64>,
    pub country_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to insert a new attempt row.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub user_id: Option<UserId>,
    pub phone: PhoneNumber,
    pub direction: Direction,
    pub body: String,
    pub carrier_sid: Option<CarrierSid>,
    pub final_status: FinalStatus,
    pub max_retries: i64,
    pub country_code: String,
}

/// Monthly usage roll-up for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounter {
    pub user_id: UserId,
    pub year_month: YearMonth,
    pub sms_count_in: i64,
    pub sms_count_out: i64,
    pub cost_cents_total: i64,
}

/// Persistence for attempts and usage counters.
#[derive(Debug, Clone)]
pub struct UsageStore {
    pool: SqlitePool,
}

impl UsageStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Insert a new attempt row. A duplicate carrier sid reports
    /// [`StoreError::Conflict`] (concurrent webhook replay).
    pub async fn insert_attempt(
        &self,
        new: &NewAttempt,
        now: DateTime<Utc>,
    ) -> Result<AttemptId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sms_attempts
                (user_id, phone_e164, direction, body, carrier_sid, final_status,
                 retry_count, max_retries, country_code, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(new.user_id.map(UserId::as_i64))
        .bind(new.phone.as_str())
        .bind(new.direction.as_str())
        .bind(&new.body)
        .bind(new.carrier_sid.as_ref().map(CarrierSid::as_str))
        .bind(new.final_status.as_str())
        .bind(new.max_retries)
        .bind(&new.country_code)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(AttemptId(result.last_insert_rowid()))
    }

    pub async fn get(&self, id: AttemptId) -> Result<Option<SmsAttempt>, StoreError> {
        let row = sqlx::query(&select_where("id = ?"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| attempt_from_row(&r)).transpose()
    }

    /// Attempt currently correlated with a carrier sid (any direction).
    pub async fn find_by_sid(&self, sid: &CarrierSid) -> Result<Option<SmsAttempt>, StoreError> {
        let row = sqlx::query(&select_where("carrier_sid = ?"))
            .bind(sid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| attempt_from_row(&r)).transpose()
    }

    /// Inbound attempt for a message sid; drives webhook deduplication.
    pub async fn find_inbound_by_sid(
        &self,
        sid: &CarrierSid,
    ) -> Result<Option<SmsAttempt>, StoreError> {
        let row = sqlx::query(&select_where("carrier_sid = ? AND direction = 'in'"))
            .bind(sid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| attempt_from_row(&r)).transpose()
    }

    /// Record the carrier's answer to a send (or resend): new sid and
    /// provider status. Leaves the retry budget untouched.
    pub async fn record_carrier_accept(
        &self,
        id: AttemptId,
        sid: &CarrierSid,
        provider_status: Option<&str>,
        final_status: FinalStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sms_attempts
             SET carrier_sid = ?, provider_status = ?, final_status = ?,
                 next_retry_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(sid.as_str())
        .bind(provider_status)
        .bind(final_status.as_str())
        .bind(now.timestamp())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Non-terminal status refresh from a callback.
    pub async fn update_provider_status(
        &self,
        id: AttemptId,
        provider_status: &str,
        final_status: FinalStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sms_attempts
             SET provider_status = ?, final_status = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(provider_status)
        .bind(final_status.as_str())
        .bind(now.timestamp())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition: fixes the final status, clears the retry
    /// schedule and records error/cost details.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize(
        &self,
        id: AttemptId,
        final_status: FinalStatus,
        provider_status: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
        cost_cents: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sms_attempts
             SET final_status = ?, provider_status = COALESCE(?, provider_status),
                 error_code = COALESCE(?, error_code),
                 error_message = COALESCE(?, error_message),
                 cost_cents = COALESCE(?, cost_cents),
                 next_retry_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(final_status.as_str())
        .bind(provider_status)
        .bind(error_code)
        .bind(error_message)
        .bind(cost_cents)
        .bind(now.timestamp())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump the retry count and park the attempt until `next_retry_at`.
    pub async fn schedule_retry(
        &self,
        id: AttemptId,
        retry_count: i64,
        next_retry_at: DateTime<Utc>,
        error_code: Option<&str>,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sms_attempts
             SET retry_count = ?, next_retry_at = ?,
                 error_code = COALESCE(?, error_code),
                 error_message = COALESCE(?, error_message),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(retry_count)
        .bind(next_retry_at.timestamp())
        .bind(error_code)
        .bind(error_message)
        .bind(now.timestamp())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Non-terminal attempts whose retry is due.
    pub async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SmsAttempt>, StoreError> {
        let rows = sqlx::query(&select_where(
            "final_status IN ('unknown', 'sent') AND next_retry_at IS NOT NULL
             AND next_retry_at <= ? ORDER BY next_retry_at ASC LIMIT ?",
        ))
        .bind(now.timestamp())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    /// Outbound attempts the carrier accepted but never advanced: no
    /// terminal status, no scheduled retry, untouched since `cutoff`.
    pub async fn stuck_attempts(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SmsAttempt>, StoreError> {
        let rows = sqlx::query(&select_where(
            "final_status = 'unknown' AND direction = 'out' AND carrier_sid IS NOT NULL
             AND next_retry_at IS NULL AND updated_at < ? ORDER BY updated_at ASC LIMIT ?",
        ))
        .bind(cutoff.timestamp())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    /// Reconciler: attempts stuck non-terminal since before `cutoff` are
    /// closed out as failed. Returns how many were reaped.
    pub async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sms_attempts
             SET final_status = 'failed', error_message = 'no terminal status within 24h',
                 next_retry_at = NULL, updated_at = ?
             WHERE final_status IN ('unknown', 'sent') AND created_at < ?",
        )
        .bind(now.timestamp())
        .bind(cutoff.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Add deltas to a user's counters for a period (upsert-increment; no
    /// read-modify-write in application code).
    pub async fn add_usage(
        &self,
        user_id: UserId,
        period: &YearMonth,
        delta_in: i64,
        delta_out: i64,
        delta_cost_cents: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO usage_counters
                (user_id, year_month, sms_count_in, sms_count_out, cost_cents_total)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, year_month) DO UPDATE SET
                 sms_count_in = sms_count_in + excluded.sms_count_in,
                 sms_count_out = sms_count_out + excluded.sms_count_out,
                 cost_cents_total = cost_cents_total + excluded.cost_cents_total",
        )
        .bind(user_id.as_i64())
        .bind(period.as_str())
        .bind(delta_in)
        .bind(delta_out)
        .bind(delta_cost_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_usage(
        &self,
        user_id: UserId,
        period: &YearMonth,
    ) -> Result<Option<UsageCounter>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, year_month, sms_count_in, sms_count_out, cost_cents_total
             FROM usage_counters WHERE user_id = ? AND year_month = ?",
        )
        .bind(user_id.as_i64())
        .bind(period.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| UsageCounter {
            user_id: UserId(r.get::<i64, _>("user_id")),
            year_month: YearMonth::from(r.get::<String, _>("year_month").as_str()),
            sms_count_in: r.get("sms_count_in"),
            sms_count_out: r.get("sms_count_out"),
            cost_cents_total: r.get("cost_cents_total"),
        }))
    }
}

const ATTEMPT_COLUMNS: &str = "id, user_id, phone_e164, direction, body, carrier_sid,
    provider_status, final_status, error_code, error_message, retry_count,
    max_retries, next_retry_at, cost_cents, country_code, created_at, updated_at";

fn select_where(predicate: &str) -> String {
    format!("SELECT {ATTEMPT_COLUMNS} FROM sms_attempts WHERE {predicate}")
}

fn attempt_from_row(row: &SqliteRow) -> Result<SmsAttempt, StoreError> {
    let phone_raw: String = row.get("phone_e164");
    let phone = phone_raw
        .parse::<PhoneNumber>()
        .map_err(|e| StoreError::Corrupt(format!("phone '{phone_raw}': {e}")))?;

    let direction = Direction::from_str(row.get::<String, _>("direction").as_str())
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let final_status = FinalStatus::from_str(row.get::<String, _>("final_status").as_str())
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    Ok(SmsAttempt {
        id: AttemptId(row.get::<i64, _>("id")),
        user_id: row.get::<Option<i64>, _>("user_id").map(UserId),
        phone,
        direction,
        body: row.get("body"),
        carrier_sid: row
            .get::<Option<String>, _>("carrier_sid")
            .map(CarrierSid::from),
        provider_status: row.get("provider_status"),
        final_status,
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        next_retry_at: row
            .get::<Option<i64>, _>("next_retry_at")
            .map(from_epoch)
            .transpose()?,
        cost_cents: row.get("cost_cents"),
        country_code: row.get("country_code"),
        created_at: from_epoch(row.get("created_at"))?,
        updated_at: from_epoch(row.get("updated_at"))?,
    })
}
