//! Persistence for `otp_challenges`.
//!
//! All writes take the caller's connection so they join its transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::models::OtpChallenge;

/// The user an OTP is addressed to.
#[derive(Clone, Debug)]
pub struct OtpRecipient {
    pub user_id: Uuid,
    pub email: String,
}

pub struct OtpRepo;

impl OtpRepo {
    /// Resolve `email` (case-insensitive) and lock the user row for the rest
    /// of the transaction.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn lock_recipient(
        conn: &mut PgConnection,
        email: &str,
    ) -> Result<Option<OtpRecipient>> {
        let query = "SELECT id, email FROM users WHERE lower(email) = lower($1) FOR UPDATE";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email.trim())
            .fetch_optional(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to lock OTP recipient")?;
        row.map(|row| {
            Ok(OtpRecipient {
                user_id: row.try_get("id")?,
                email: row.try_get("email")?,
            })
        })
        .transpose()
    }

    /// Replace any pending challenge for `user_id` with a fresh one.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn upsert_challenge(
        conn: &mut PgConnection,
        user_id: Uuid,
        code_hash: &str,
        expires_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<()> {
        let query = r"
            INSERT INTO otp_challenges (user_id, code_hash, expires_at, attempts, max_attempts)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET code_hash = EXCLUDED.code_hash,
                expires_at = EXCLUDED.expires_at,
                attempts = 0,
                max_attempts = EXCLUDED.max_attempts,
                created_at = NOW()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(code_hash)
            .bind(expires_at)
            .bind(max_attempts)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to store OTP challenge")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn challenge_for_update(
        conn: &mut PgConnection,
        user_id: Uuid,
    ) -> Result<Option<OtpChallenge>> {
        let query = r"
            SELECT user_id, code_hash, expires_at, attempts, max_attempts, created_at
            FROM otp_challenges
            WHERE user_id = $1
            FOR UPDATE
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, OtpChallenge>(query)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to load OTP challenge")
    }

    /// Count one failed attempt and return the new total.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn increment_attempts(conn: &mut PgConnection, user_id: Uuid) -> Result<i32> {
        let query = r"
            UPDATE otp_challenges
            SET attempts = attempts + 1
            WHERE user_id = $1
            RETURNING attempts
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to count OTP attempt")?;
        Ok(row.try_get("attempts")?)
    }

    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_challenge(conn: &mut PgConnection, user_id: Uuid) -> Result<()> {
        let query = "DELETE FROM otp_challenges WHERE user_id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to clear OTP challenge")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn touch_last_used(
        conn: &mut PgConnection,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = "UPDATE users SET otp_last_used_at = $2 WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to record OTP use")?;
        Ok(())
    }

    /// Drop every challenge whose expiry has passed, by the database clock.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_expired(conn: &mut PgConnection) -> Result<u64> {
        let query = "DELETE FROM otp_challenges WHERE expires_at <= NOW()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to sweep expired OTP challenges")?;
        Ok(result.rows_affected())
    }
}
