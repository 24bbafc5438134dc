//! Users, phone ⇄ user mappings and verification codes.

use super::{Database, StoreError, from_epoch};
use crate::phone::PhoneNumber;
use crate::types::{MappingId, UserId};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::OsRng;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::time::Duration;
use thiserror::Error;

/// Verification attempts allowed per issued code.
const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// An internal user, created out of band by the registration flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

/// A persisted phone ⇄ user association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneMapping {
    pub id: MappingId,
    pub user_id: UserId,
    pub phone: PhoneNumber,
    pub is_primary: bool,
    pub is_verified: bool,
    pub verification_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Routing answer for a phone number: the owning user of a verified mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedUser {
    pub user_id: UserId,
    pub verified: bool,
}

/// Error from mapping mutations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The phone number is already mapped (to any user).
    #[error("phone number is already linked to a user")]
    DuplicatePhone,

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("mapping {0} not found for that user")]
    MappingNotFound(MappingId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error from verification-code checks.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The code exists but its TTL has elapsed.
    #[error("verification code expired")]
    Expired,

    /// The code did not match. `remaining` is how many tries are left;
    /// a consumed or never-issued code reports zero.
    #[error("wrong verification code ({remaining} attempts remaining)")]
    WrongCode { remaining: i64 },

    /// The attempt budget for this code is exhausted.
    #[error("too many verification attempts")]
    TooManyAttempts,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence for users, phone mappings and verification codes.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    pool: SqlitePool,
}

impl IdentityStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Create a user. Registration itself is out of band; this exists for
    /// the account-linked flow's collaborators and the test suites.
    pub async fn create_user(&self, now: DateTime<Utc>) -> Result<User, StoreError> {
        let result = sqlx::query("INSERT INTO users (created_at, is_active) VALUES (?, 1)")
            .bind(now.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(User {
            id: UserId(result.last_insert_rowid()),
            created_at: now,
            is_active: true,
        })
    }

    /// Look up the user a phone routes to. Only verified mappings of active
    /// users resolve; everything else reads as unknown.
    pub async fn find_user_by_phone(
        &self,
        phone: &PhoneNumber,
    ) -> Result<Option<ResolvedUser>, StoreError> {
        let row = sqlx::query(
            "SELECT m.user_id FROM phone_mappings m
             JOIN users u ON u.id = m.user_id
             WHERE m.phone_e164 = ? AND m.is_verified = 1 AND u.is_active = 1",
        )
        .bind(phone.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ResolvedUser {
            user_id: UserId(r.get::<i64, _>("user_id")),
            verified: true,
        }))
    }

    pub async fn get_mapping_by_phone(
        &self,
        phone: &PhoneNumber,
    ) -> Result<Option<PhoneMapping>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, phone_e164, is_primary, is_verified,
                    verification_method, created_at, updated_at
             FROM phone_mappings WHERE phone_e164 = ?",
        )
        .bind(phone.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| mapping_from_row(&r)).transpose()
    }

    /// Create a mapping for an existing user.
    ///
    /// When `is_primary` is requested, any current primary for the user is
    /// demoted in the same transaction.
    pub async fn create_phone_mapping(
        &self,
        user_id: UserId,
        phone: &PhoneNumber,
        is_primary: bool,
        verified: bool,
        now: DateTime<Utc>,
    ) -> Result<PhoneMapping, IdentityError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let user_exists = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.as_i64())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from)?
            .is_some();
        if !user_exists {
            return Err(IdentityError::UserNotFound(user_id));
        }

        if is_primary {
            sqlx::query(
                "UPDATE phone_mappings SET is_primary = 0, updated_at = ?
                 WHERE user_id = ? AND is_primary = 1",
            )
            .bind(now.timestamp())
            .bind(user_id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        }

        let verification_method = verified.then(|| "admin".to_string());
        let result = sqlx::query(
            "INSERT INTO phone_mappings
                (user_id, phone_e164, is_primary, is_verified, verification_method,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id.as_i64())
        .bind(phone.as_str())
        .bind(is_primary)
        .bind(verified)
        .bind(&verification_method)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| match StoreError::from_sqlx(e) {
            StoreError::Conflict => IdentityError::DuplicatePhone,
            other => IdentityError::Store(other),
        })?;

        tx.commit().await.map_err(StoreError::from)?;

        Ok(PhoneMapping {
            id: MappingId(result.last_insert_rowid()),
            user_id,
            phone: phone.clone(),
            is_primary,
            is_verified: verified,
            verification_method,
            created_at: now,
            updated_at: now,
        })
    }

    /// Make the given mapping the user's primary, demoting any other.
    pub async fn set_primary(
        &self,
        user_id: UserId,
        mapping_id: MappingId,
        now: DateTime<Utc>,
    ) -> Result<(), IdentityError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let owned = sqlx::query("SELECT 1 FROM phone_mappings WHERE id = ? AND user_id = ?")
            .bind(mapping_id.as_i64())
            .bind(user_id.as_i64())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from)?
            .is_some();
        if !owned {
            return Err(IdentityError::MappingNotFound(mapping_id));
        }

        sqlx::query(
            "UPDATE phone_mappings SET is_primary = 0, updated_at = ?
             WHERE user_id = ? AND is_primary = 1",
        )
        .bind(now.timestamp())
        .bind(user_id.as_i64())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query("UPDATE phone_mappings SET is_primary = 1, updated_at = ? WHERE id = ?")
            .bind(now.timestamp())
            .bind(mapping_id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    pub async fn delete_mapping(
        &self,
        user_id: UserId,
        mapping_id: MappingId,
    ) -> Result<(), IdentityError> {
        let result = sqlx::query("DELETE FROM phone_mappings WHERE id = ? AND user_id = ?")
            .bind(mapping_id.as_i64())
            .bind(user_id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(IdentityError::MappingNotFound(mapping_id));
        }
        Ok(())
    }

    /// Issue a fresh 6-digit verification code, replacing any outstanding
    /// code for the same (user, phone).
    pub async fn issue_verification(
        &self,
        user_id: UserId,
        phone: &PhoneNumber,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let code = format!("{:06}", OsRng.gen_range(0..1_000_000u32));
        let expires_at = now.timestamp() + ttl.as_secs() as i64;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM verification_codes WHERE user_id = ? AND phone_e164 = ?")
            .bind(user_id.as_i64())
            .bind(phone.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO verification_codes
                (user_id, phone_e164, code, expires_at, attempts, max_attempts, created_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(user_id.as_i64())
        .bind(phone.as_str())
        .bind(&code)
        .bind(expires_at)
        .bind(DEFAULT_MAX_ATTEMPTS)
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(code)
    }

    /// Check a verification code. Success consumes the code and flips the
    /// mapping to verified in the same transaction.
    pub async fn check_verification(
        &self,
        user_id: UserId,
        phone: &PhoneNumber,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let row = sqlx::query(
            "SELECT id, code, expires_at, attempts, max_attempts
             FROM verification_codes WHERE user_id = ? AND phone_e164 = ?",
        )
        .bind(user_id.as_i64())
        .bind(phone.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let Some(row) = row else {
            // Consumed or never issued: single-use semantics read as a miss.
            return Err(VerificationError::WrongCode { remaining: 0 });
        };

        let row_id: i64 = row.get("id");
        let stored: String = row.get("code");
        let expires_at: i64 = row.get("expires_at");
        let attempts: i64 = row.get("attempts");
        let max_attempts: i64 = row.get("max_attempts");

        if now.timestamp() >= expires_at {
            sqlx::query("DELETE FROM verification_codes WHERE id = ?")
                .bind(row_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
            tx.commit().await.map_err(StoreError::from)?;
            return Err(VerificationError::Expired);
        }

        if attempts >= max_attempts {
            sqlx::query("DELETE FROM verification_codes WHERE id = ?")
                .bind(row_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
            tx.commit().await.map_err(StoreError::from)?;
            return Err(VerificationError::TooManyAttempts);
        }

        if stored != code {
            let used = attempts + 1;
            if used >= max_attempts {
                sqlx::query("DELETE FROM verification_codes WHERE id = ?")
                    .bind(row_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::from)?;
                tx.commit().await.map_err(StoreError::from)?;
                return Err(VerificationError::TooManyAttempts);
            }
            sqlx::query("UPDATE verification_codes SET attempts = ? WHERE id = ?")
                .bind(used)
                .bind(row_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
            tx.commit().await.map_err(StoreError::from)?;
            return Err(VerificationError::WrongCode {
                remaining: max_attempts - used,
            });
        }

        // Match: consume the code and verify the mapping.
        sqlx::query("DELETE FROM verification_codes WHERE id = ?")
            .bind(row_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        sqlx::query(
            "UPDATE phone_mappings
             SET is_verified = 1, verification_method = 'sms_code', updated_at = ?
             WHERE user_id = ? AND phone_e164 = ?",
        )
        .bind(now.timestamp())
        .bind(user_id.as_i64())
        .bind(phone.as_str())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        tx.commit().await.map_err(StoreError::from)?;

        Ok(())
    }
}

fn mapping_from_row(row: &SqliteRow) -> Result<PhoneMapping, StoreError> {
    let phone_raw: String = row.get("phone_e164");
    let phone = phone_raw
        .parse::<PhoneNumber>()
        .map_err(|e| StoreError::Corrupt(format!("phone '{phone_raw}': {e}")))?;
    Ok(PhoneMapping {
        id: MappingId(row.get::<i64, _>("id")),
        user_id: UserId(row.get::<i64, _>("user_id")),
        phone,
        is_primary: row.get::<bool, _>("is_primary"),
        is_verified: row.get::<bool, _>("is_verified"),
        verification_method: row.get("verification_method"),
        created_at: from_epoch(row.get("created_at"))?,
        updated_at: from_epoch(row.get("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Database, IdentityStore, User) {
        let db = Database::in_memory().await.unwrap();
        let store = IdentityStore::new(&db);
        let user = store.create_user(Utc::now()).await.unwrap();
        (db, store, user)
    }

    fn phone(raw: &str) -> PhoneNumber {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn test_unverified_mapping_does_not_resolve() {
        let (_db, store, user) = setup().await;
        let p = phone("+15551234567");
        store
            .create_phone_mapping(user.id, &p, true, false, Utc::now())
            .await
            .unwrap();
        assert!(store.find_user_by_phone(&p).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verified_mapping_resolves() {
        let (_db, store, user) = setup().await;
        let p = phone("+15551234567");
        store
            .create_phone_mapping(user.id, &p, true, true, Utc::now())
            .await
            .unwrap();
        let resolved = store.find_user_by_phone(&p).await.unwrap().unwrap();
        assert_eq!(resolved.user_id, user.id);
        assert!(resolved.verified);
    }

    #[tokio::test]
    async fn test_duplicate_phone_rejected() {
        let (_db, store, user) = setup().await;
        let other = store.create_user(Utc::now()).await.unwrap();
        let p = phone("+15551234567");
        store
            .create_phone_mapping(user.id, &p, true, true, Utc::now())
            .await
            .unwrap();
        let err = store
            .create_phone_mapping(other.id, &p, true, true, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::DuplicatePhone));
    }

    #[tokio::test]
    async fn test_mapping_requires_existing_user() {
        let (_db, store, _user) = setup().await;
        let err = store
            .create_phone_mapping(UserId(999), &phone("+15551234567"), true, true, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::UserNotFound(UserId(999))));
    }

    #[tokio::test]
    async fn test_at_most_one_primary_per_user() {
        let (db, store, user) = setup().await;
        store
            .create_phone_mapping(user.id, &phone("+15551234567"), true, true, Utc::now())
            .await
            .unwrap();
        let second = store
            .create_phone_mapping(user.id, &phone("+15559876543"), true, true, Utc::now())
            .await
            .unwrap();

        let primaries: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM phone_mappings WHERE user_id = ? AND is_primary = 1",
        )
        .bind(user.id.as_i64())
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(primaries, 1);

        let current = store
            .get_mapping_by_phone(&phone("+15559876543"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.id, second.id);
        assert!(current.is_primary);
    }

    #[tokio::test]
    async fn test_set_primary_moves_the_flag() {
        let (db, store, user) = setup().await;
        let first = store
            .create_phone_mapping(user.id, &phone("+15551234567"), true, true, Utc::now())
            .await
            .unwrap();
        store
            .create_phone_mapping(user.id, &phone("+15559876543"), true, true, Utc::now())
            .await
            .unwrap();

        store
            .set_primary(user.id, first.id, Utc::now())
            .await
            .unwrap();

        let primaries: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM phone_mappings WHERE user_id = ? AND is_primary = 1",
        )
        .bind(user.id.as_i64())
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(primaries, vec![first.id.as_i64()]);
    }

    #[tokio::test]
    async fn test_delete_mapping() {
        let (_db, store, user) = setup().await;
        let p = phone("+15551234567");
        let mapping = store
            .create_phone_mapping(user.id, &p, true, true, Utc::now())
            .await
            .unwrap();
        store.delete_mapping(user.id, mapping.id).await.unwrap();
        assert!(store.get_mapping_by_phone(&p).await.unwrap().is_none());

        let err = store.delete_mapping(user.id, mapping.id).await.unwrap_err();
        assert!(matches!(err, IdentityError::MappingNotFound(_)));
    }

    #[tokio::test]
    async fn test_verification_lifecycle() {
        let (_db, store, user) = setup().await;
        let p = phone("+15551234567");
        store
            .create_phone_mapping(user.id, &p, true, false, Utc::now())
            .await
            .unwrap();

        let now = Utc::now();
        let code = store
            .issue_verification(user.id, &p, Duration::from_secs(600), now)
            .await
            .unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        store
            .check_verification(user.id, &p, &code, now)
            .await
            .unwrap();
        let mapping = store.get_mapping_by_phone(&p).await.unwrap().unwrap();
        assert!(mapping.is_verified);
        assert_eq!(mapping.verification_method.as_deref(), Some("sms_code"));

        // Single use: replaying the same code is a miss.
        let err = store
            .check_verification(user.id, &p, &code, now)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::WrongCode { remaining: 0 }));
    }

    #[tokio::test]
    async fn test_verification_expiry_boundary() {
        let (_db, store, user) = setup().await;
        let p = phone("+15551234567");
        store
            .create_phone_mapping(user.id, &p, true, false, Utc::now())
            .await
            .unwrap();

        let issued_at = Utc::now();
        let code = store
            .issue_verification(user.id, &p, Duration::from_secs(600), issued_at)
            .await
            .unwrap();

        // Exactly at expires_at the code is already dead.
        let at_expiry = issued_at + chrono::Duration::seconds(600);
        let err = store
            .check_verification(user.id, &p, &code, at_expiry)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Expired));
    }

    #[tokio::test]
    async fn test_verification_attempt_budget() {
        let (_db, store, user) = setup().await;
        let p = phone("+15551234567");
        store
            .create_phone_mapping(user.id, &p, true, false, Utc::now())
            .await
            .unwrap();

        let now = Utc::now();
        let code = store
            .issue_verification(user.id, &p, Duration::from_secs(600), now)
            .await
            .unwrap();
        let wrong = if code == "000000" { "000001" } else { "000000" };

        for expected_remaining in (1..DEFAULT_MAX_ATTEMPTS).rev() {
            let err = store
                .check_verification(user.id, &p, wrong, now)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                VerificationError::WrongCode { remaining } if remaining == expected_remaining
            ));
        }

        let err = store
            .check_verification(user.id, &p, wrong, now)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::TooManyAttempts));
    }

    #[tokio::test]
    async fn test_reissue_replaces_code() {
        let (_db, store, user) = setup().await;
        let p = phone("+15551234567");
        store
            .create_phone_mapping(user.id, &p, true, false, Utc::now())
            .await
            .unwrap();

        let now = Utc::now();
        let first = store
            .issue_verification(user.id, &p, Duration::from_secs(600), now)
            .await
            .unwrap();
        let second = store
            .issue_verification(user.id, &p, Duration::from_secs(600), now)
            .await
            .unwrap();

        if first != second {
            let err = store
                .check_verification(user.id, &p, &first, now)
                .await
                .unwrap_err();
            assert!(matches!(err, VerificationError::WrongCode { .. }));
        }
        store
            .check_verification(user.id, &p, &second, now)
            .await
            .unwrap();
    }
}
