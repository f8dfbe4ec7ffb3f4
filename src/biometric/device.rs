//! Device fingerprints and per-device risk.
//!
//! A fingerprint is a SHA-256 over normalized device characteristics. Each
//! `(user, fingerprint)` pair keeps first/last sighting, a trust flag, a block
//! flag and a risk score in `[0, 100]`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgExecutor, Row};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::models::DeviceInfo;

pub const UNSEEN_RISK_SCORE: i16 = 50;
pub const TRUSTED_RISK_CEILING: i16 = 10;
pub const BLOCKED_RISK_SCORE: i16 = 100;
const SUCCESS_RISK_STEP: i16 = 5;
const FAILURE_RISK_STEP: i16 = 15;
const FINGERPRINT_HEX_LEN: usize = 64;

/// Derive a stable fingerprint from the device characteristics.
///
/// Fields are trimmed and lowercased; absent fields hash as empty strings.
#[must_use]
pub fn derive(info: &DeviceInfo) -> String {
    let parts = [
        &info.platform,
        &info.model,
        &info.locale,
        &info.timezone,
        &info.screen_resolution,
        &info.user_agent,
    ];
    let normalized = parts
        .iter()
        .map(|part| part.as_deref().unwrap_or_default().trim().to_lowercase())
        .collect::<Vec<_>>()
        .join("|");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Whether `value` looks like an output of [`derive`].
#[must_use]
pub fn is_fingerprint(value: &str) -> bool {
    value.len() == FINGERPRINT_HEX_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RiskAssessment {
    pub risk_score: i16,
    pub trusted: bool,
    pub blocked: bool,
    pub known: bool,
}

impl RiskAssessment {
    #[must_use]
    pub fn unseen() -> Self {
        Self {
            risk_score: UNSEEN_RISK_SCORE,
            trusted: false,
            blocked: false,
            known: false,
        }
    }

    /// Risk after one more attempt from this device.
    #[must_use]
    pub fn after_attempt(&self, success: bool) -> i16 {
        if self.blocked {
            return BLOCKED_RISK_SCORE;
        }
        let next = if success {
            self.risk_score.saturating_sub(SUCCESS_RISK_STEP)
        } else {
            self.risk_score.saturating_add(FAILURE_RISK_STEP)
        };
        let next = next.clamp(0, BLOCKED_RISK_SCORE);
        if self.trusted {
            next.min(TRUSTED_RISK_CEILING)
        } else {
            next
        }
    }
}

pub struct DeviceRegistry;

impl DeviceRegistry {
    /// Current standing of a device, or the unseen default.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn assess_risk<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<RiskAssessment> {
        let query = r"
            SELECT risk_score, trusted, blocked
            FROM device_fingerprints
            WHERE user_id = $1 AND fingerprint = $2
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(fingerprint)
            .fetch_optional(executor)
            .instrument(span)
            .await
            .context("Failed to load device fingerprint")?;
        match row {
            Some(row) => Ok(RiskAssessment {
                risk_score: row.try_get("risk_score")?,
                trusted: row.try_get("trusted")?,
                blocked: row.try_get("blocked")?,
                known: true,
            }),
            None => Ok(RiskAssessment::unseen()),
        }
    }

    /// Upsert a sighting and return the updated assessment.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn record_sighting(
        conn: &mut PgConnection,
        user_id: Uuid,
        fingerprint: &str,
        info: &DeviceInfo,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<RiskAssessment> {
        let current = Self::assess_risk(&mut *conn, user_id, fingerprint).await?;
        let risk_score = current.after_attempt(success);
        let device_info = serde_json::to_value(info).context("Failed to encode device info")?;

        let query = r"
            INSERT INTO device_fingerprints
                (user_id, fingerprint, device_info, first_seen_at, last_seen_at, sightings, risk_score)
            VALUES ($1, $2, $3, $4, $4, 1, $5)
            ON CONFLICT (user_id, fingerprint) DO UPDATE
            SET device_info = EXCLUDED.device_info,
                last_seen_at = EXCLUDED.last_seen_at,
                sightings = device_fingerprints.sightings + 1,
                risk_score = EXCLUDED.risk_score
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(fingerprint)
            .bind(device_info)
            .bind(now)
            .bind(risk_score)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to record device sighting")?;

        Ok(RiskAssessment {
            risk_score,
            known: true,
            ..current
        })
    }

    /// Mark a device trusted or untrusted. Creates the row if it was never seen.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn set_trusted(
        conn: &mut PgConnection,
        user_id: Uuid,
        fingerprint: &str,
        trusted: bool,
    ) -> Result<RiskAssessment> {
        let query = r"
            INSERT INTO device_fingerprints (user_id, fingerprint, trusted, risk_score)
            VALUES ($1, $2, $3, CASE WHEN $3 THEN $4 ELSE $5 END)
            ON CONFLICT (user_id, fingerprint) DO UPDATE
            SET trusted = EXCLUDED.trusted,
                risk_score = CASE
                    WHEN device_fingerprints.blocked THEN device_fingerprints.risk_score
                    WHEN EXCLUDED.trusted THEN LEAST(device_fingerprints.risk_score, $4)
                    ELSE GREATEST(device_fingerprints.risk_score, $5)
                END
            RETURNING risk_score, trusted, blocked
        ";
        Self::apply(
            conn,
            query,
            user_id,
            fingerprint,
            trusted,
            TRUSTED_RISK_CEILING,
            UNSEEN_RISK_SCORE,
        )
        .await
    }

    /// Block a device so any attempt from it hard-fails, or lift the block.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn set_blocked(
        conn: &mut PgConnection,
        user_id: Uuid,
        fingerprint: &str,
        blocked: bool,
        reason: Option<&str>,
    ) -> Result<RiskAssessment> {
        let query = r"
            INSERT INTO device_fingerprints (user_id, fingerprint, blocked, blocked_reason, risk_score)
            VALUES ($1, $2, $3, $6, CASE WHEN $3 THEN $4 ELSE $5 END)
            ON CONFLICT (user_id, fingerprint) DO UPDATE
            SET blocked = EXCLUDED.blocked,
                blocked_reason = EXCLUDED.blocked_reason,
                trusted = CASE WHEN EXCLUDED.blocked THEN FALSE ELSE device_fingerprints.trusted END,
                risk_score = CASE WHEN EXCLUDED.blocked THEN $4 ELSE $5 END
            RETURNING risk_score, trusted, blocked
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(fingerprint)
            .bind(blocked)
            .bind(BLOCKED_RISK_SCORE)
            .bind(UNSEEN_RISK_SCORE)
            .bind(if blocked { reason } else { None })
            .fetch_one(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to update device block state")?;
        Ok(RiskAssessment {
            risk_score: row.try_get("risk_score")?,
            trusted: row.try_get("trusted")?,
            blocked: row.try_get("blocked")?,
            known: true,
        })
    }

    async fn apply(
        conn: &mut PgConnection,
        query: &'static str,
        user_id: Uuid,
        fingerprint: &str,
        flag: bool,
        when_set: i16,
        when_cleared: i16,
    ) -> Result<RiskAssessment> {
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(fingerprint)
            .bind(flag)
            .bind(when_set)
            .bind(when_cleared)
            .fetch_one(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to update device trust")?;
        Ok(RiskAssessment {
            risk_score: row.try_get("risk_score")?,
            trusted: row.try_get("trusted")?,
            blocked: row.try_get("blocked")?,
            known: true,
        })
    }
}
