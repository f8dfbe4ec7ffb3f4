//! Append-only compliance ledger.
//!
//! Entries are written on the caller's connection so they commit or roll back
//! together with the state change they describe. Rows are never updated; the
//! only delete path is the retention sweep, which the schema trigger limits to
//! rows whose `retention_until` has passed.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgExecutor, Row, postgres::PgRow};
use tracing::{Instrument, info_span};
use utoipa::ToSchema;
use uuid::Uuid;

pub const DEFAULT_RETENTION_DAYS: i64 = 2555;
pub const MAX_QUERY_LIMIT: i64 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuditAction {
    ProfileCreated,
    ProfileUpdated,
    ProfileDeleted,
    VerificationAttempt,
    SettingsAccessed,
    SecurityBreachDetected,
    AccountUnlocked,
    DeviceTrusted,
    DeviceUntrusted,
    DeviceBlocked,
    DeviceUnblocked,
    OtpIssued,
    OtpVerified,
    OtpFailed,
    OtpExpired,
    ClientAuditTrail,
    OfflineAttemptSynced,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProfileCreated => "profile_created",
            Self::ProfileUpdated => "profile_updated",
            Self::ProfileDeleted => "profile_deleted",
            Self::VerificationAttempt => "verification_attempt",
            Self::SettingsAccessed => "settings_accessed",
            Self::SecurityBreachDetected => "security_breach_detected",
            Self::AccountUnlocked => "account_unlocked",
            Self::DeviceTrusted => "device_trusted",
            Self::DeviceUntrusted => "device_untrusted",
            Self::DeviceBlocked => "device_blocked",
            Self::DeviceUnblocked => "device_unblocked",
            Self::OtpIssued => "otp_issued",
            Self::OtpVerified => "otp_verified",
            Self::OtpFailed => "otp_failed",
            Self::OtpExpired => "otp_expired",
            Self::ClientAuditTrail => "client_audit_trail",
            Self::OfflineAttemptSynced => "offline_attempt_synced",
        }
    }
}

/// One entry to append.
#[derive(Clone, Debug)]
pub struct AuditRecord<'a> {
    user_id: Uuid,
    action: AuditAction,
    details: Value,
    performed_by: Option<Uuid>,
    ip_address: Option<&'a str>,
    client_ref: Option<&'a str>,
}

impl<'a> AuditRecord<'a> {
    #[must_use]
    pub fn new(user_id: Uuid, action: AuditAction, details: Value) -> Self {
        Self {
            user_id,
            action,
            details,
            performed_by: None,
            ip_address: None,
            client_ref: None,
        }
    }

    #[must_use]
    pub fn with_performed_by(mut self, actor: Uuid) -> Self {
        self.performed_by = Some(actor);
        self
    }

    #[must_use]
    pub fn with_ip_address(mut self, ip: Option<&'a str>) -> Self {
        self.ip_address = ip;
        self
    }

    /// Idempotency key for client-originated entries.
    #[must_use]
    pub fn with_client_ref(mut self, client_ref: &'a str) -> Self {
        self.client_ref = Some(client_ref);
        self
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub action_type: String,
    #[schema(value_type = Object)]
    pub details: Value,
    pub performed_by: Option<Uuid>,
    pub ip_address: Option<String>,
    pub retention_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AuditEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            action_type: row.try_get("action_type")?,
            details: row.try_get("details")?,
            performed_by: row.try_get("performed_by")?,
            ip_address: row.try_get("ip_address")?,
            retention_until: row.try_get("retention_until")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AuditLedger {
    retention: Duration,
}

impl AuditLedger {
    #[must_use]
    pub fn new(retention_days: i64) -> Self {
        Self {
            retention: Duration::days(retention_days.max(1)),
        }
    }

    #[must_use]
    pub fn retention_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.retention
    }

    /// Append one entry on `conn` and return its id.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn record(&self, conn: &mut PgConnection, record: AuditRecord<'_>) -> Result<Uuid> {
        let query = r"
            INSERT INTO audit_entries
                (user_id, action_type, details, performed_by, ip_address, client_ref, retention_until)
            VALUES ($1, $2, $3, $4, $5::inet, $6, $7)
            RETURNING id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query,
            audit.action = record.action.as_str()
        );
        let row = sqlx::query(query)
            .bind(record.user_id)
            .bind(record.action.as_str())
            .bind(&record.details)
            .bind(record.performed_by)
            .bind(record.ip_address)
            .bind(record.client_ref)
            .bind(self.retention_until(Utc::now()))
            .fetch_one(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to append audit entry")?;
        Ok(row.try_get("id")?)
    }

    /// Append an entry keyed by its client reference, at most once.
    ///
    /// Returns the id and `true` when a new row was written, or the id of the
    /// existing row and `false` on a replay.
    ///
    /// # Errors
    /// Returns an error if the record has no client reference or the query fails.
    pub async fn record_once(
        &self,
        conn: &mut PgConnection,
        record: AuditRecord<'_>,
    ) -> Result<(Uuid, bool)> {
        let client_ref = record
            .client_ref
            .context("client reference is required for idempotent audit entries")?;
        let query = r"
            INSERT INTO audit_entries
                (user_id, action_type, details, performed_by, ip_address, client_ref, retention_until)
            VALUES ($1, $2, $3, $4, $5::inet, $6, $7)
            ON CONFLICT (user_id, action_type, client_ref) WHERE client_ref IS NOT NULL
            DO NOTHING
            RETURNING id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query,
            audit.action = record.action.as_str()
        );
        let inserted = sqlx::query(query)
            .bind(record.user_id)
            .bind(record.action.as_str())
            .bind(&record.details)
            .bind(record.performed_by)
            .bind(record.ip_address)
            .bind(client_ref)
            .bind(self.retention_until(Utc::now()))
            .fetch_optional(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to append audit entry")?;
        if let Some(row) = inserted {
            return Ok((row.try_get("id")?, true));
        }

        let existing = sqlx::query(
            "SELECT id FROM audit_entries WHERE user_id = $1 AND action_type = $2 AND client_ref = $3",
        )
        .bind(record.user_id)
        .bind(record.action.as_str())
        .bind(client_ref)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to load replayed audit entry")?;
        Ok((existing.try_get("id")?, false))
    }

    /// Most recent entries for `user_id`, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn entries<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditEntry>> {
        let query = r"
            SELECT id, user_id, action_type, details, performed_by, host(ip_address) AS ip_address,
                   retention_until, created_at
            FROM audit_entries
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
        sqlx::query_as::<_, AuditEntry>(query)
            .bind(user_id)
            .bind(limit.clamp(1, MAX_QUERY_LIMIT))
            .fetch_all(executor)
            .instrument(span)
            .await
            .context("Failed to load audit entries")
    }

    /// Erase entries whose retention deadline has passed.
    ///
    /// Uses the transaction clock so the schema guard agrees on every row.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_expired(conn: &mut PgConnection) -> Result<u64> {
        let query = "DELETE FROM audit_entries WHERE retention_until < NOW()";
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
            .context("Failed to purge expired audit entries")?;
        Ok(result.rows_affected())
    }
}

impl Default for AuditLedger {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_DAYS)
    }
}
