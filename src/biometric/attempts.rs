//! Verification ledger writes and reads. Rows are insert-only.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgExecutor, Row};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::models::{AttemptType, FailureReason, Lighting, VerificationAttempt};

pub const MAX_HISTORY_LIMIT: i64 = 100;

/// One row to append to `verification_attempts`.
#[derive(Clone, Debug)]
pub struct NewAttempt<'a> {
    pub user_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub shift_id: Option<Uuid>,
    pub attempt_type: AttemptType,
    pub success: bool,
    pub confidence: Option<f64>,
    pub liveness_detected: Option<bool>,
    pub liveness_score: Option<f64>,
    pub quality_score: Option<f64>,
    pub lighting: Option<Lighting>,
    pub failure_reason: Option<FailureReason>,
    pub device_fingerprint: Option<&'a str>,
    pub ip_address: Option<&'a str>,
}

impl<'a> NewAttempt<'a> {
    /// Row for a registration or template update: always successful, no match data.
    #[must_use]
    pub fn enrollment(
        user_id: Uuid,
        profile_id: Uuid,
        attempt_type: AttemptType,
        quality_score: f64,
        device_fingerprint: &'a str,
        ip_address: Option<&'a str>,
    ) -> Self {
        Self {
            user_id,
            profile_id: Some(profile_id),
            shift_id: None,
            attempt_type,
            success: true,
            confidence: None,
            liveness_detected: None,
            liveness_score: None,
            quality_score: Some(quality_score),
            lighting: None,
            failure_reason: None,
            device_fingerprint: Some(device_fingerprint),
            ip_address,
        }
    }
}

/// # Errors
/// Returns an error if the insert fails.
pub async fn insert(conn: &mut PgConnection, attempt: &NewAttempt<'_>) -> Result<Uuid> {
    let query = r"
        INSERT INTO verification_attempts
            (user_id, profile_id, shift_id, attempt_type, success, confidence,
             liveness_detected, liveness_score, quality_score, lighting, failure_reason,
             device_fingerprint, ip_address)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13::inet)
        RETURNING id
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(attempt.user_id)
        .bind(attempt.profile_id)
        .bind(attempt.shift_id)
        .bind(attempt.attempt_type.as_str())
        .bind(attempt.success)
        .bind(attempt.confidence)
        .bind(attempt.liveness_detected)
        .bind(attempt.liveness_score)
        .bind(attempt.quality_score)
        .bind(attempt.lighting.map(Lighting::as_str))
        .bind(attempt.failure_reason.map(FailureReason::as_str))
        .bind(attempt.device_fingerprint)
        .bind(attempt.ip_address)
        .fetch_one(&mut *conn)
        .instrument(span)
        .await
        .context("Failed to record verification attempt")?;
    Ok(row.try_get("id")?)
}

/// Most recent attempts for `user_id`, newest first.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn recent<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<VerificationAttempt>> {
    let query = r"
        SELECT id, attempt_type, shift_id, success, confidence, liveness_detected,
               liveness_score, quality_score, lighting, failure_reason, device_fingerprint,
               created_at
        FROM verification_attempts
        WHERE user_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, VerificationAttempt>(query)
        .bind(user_id)
        .bind(limit.clamp(1, MAX_HISTORY_LIMIT))
        .fetch_all(executor)
        .instrument(span)
        .await
        .context("Failed to load verification attempts")
}
