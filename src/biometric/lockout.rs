//! Consecutive-failure lockout.
//!
//! Flow Overview:
//! 1) Every failed verification increments `users.failed_biometric_attempts`.
//! 2) Reaching the ceiling sets `biometric_locked_until = now + duration`,
//!    resets the counter and writes a `security_breach_detected` audit entry.
//! 3) A success resets the counter but leaves an active lock in place.
//! 4) An administrator can unlock early; the actor is recorded.
//!
//! All writes happen on the caller's transaction after the user row has been
//! locked with `FOR UPDATE`, so concurrent failures for one user are counted
//! one after another.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgConnection;
use std::time::Duration;
use tracing::{Instrument, info_span, warn};
use uuid::Uuid;

use super::{
    audit::{AuditAction, AuditLedger, AuditRecord},
    models::RequestContext,
};

const DEFAULT_MAX_FAILURES: i32 = 3;
const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutConfig {
    max_failures: i32,
    duration: Duration,
}

impl LockoutConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            duration: DEFAULT_LOCK_DURATION,
        }
    }

    #[must_use]
    pub fn with_max_failures(mut self, max_failures: i32) -> Self {
        self.max_failures = max_failures;
        self
    }

    #[must_use]
    pub fn with_duration_seconds(mut self, seconds: u64) -> Self {
        self.duration = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn max_failures(&self) -> i32 {
        self.max_failures
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            max_failures: self.max_failures.max(1),
            duration: if self.duration.is_zero() {
                Duration::from_secs(1)
            } else {
                self.duration
            },
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock fields embedded in the user row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockState {
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockState {
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// State after one more failure. The counter restarts once a lock is set.
    #[must_use]
    pub fn after_failure(&self, config: &LockoutConfig, now: DateTime<Utc>) -> Self {
        let failed_attempts = self.failed_attempts.saturating_add(1);
        if failed_attempts >= config.max_failures() {
            let duration = chrono::Duration::from_std(config.duration())
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
            Self {
                failed_attempts: 0,
                locked_until: Some(now + duration),
            }
        } else {
            Self {
                failed_attempts,
                locked_until: self.locked_until,
            }
        }
    }

    /// State after a success: counter cleared, any lock left to expire.
    #[must_use]
    pub fn after_success(&self) -> Self {
        Self {
            failed_attempts: 0,
            locked_until: self.locked_until,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted { failed_attempts: i32 },
    Locked { until: DateTime<Utc> },
}

#[derive(Clone, Copy, Debug)]
pub struct LockoutPolicy {
    config: LockoutConfig,
    ledger: AuditLedger,
}

impl LockoutPolicy {
    #[must_use]
    pub fn new(config: LockoutConfig, ledger: AuditLedger) -> Self {
        Self {
            config: config.normalize(),
            ledger,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    /// Count a failure for a user whose row is already locked in this transaction.
    ///
    /// # Errors
    /// Returns an error if the update or the audit insert fails.
    pub async fn record_failure(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        current: LockState,
        now: DateTime<Utc>,
        ctx: &RequestContext,
    ) -> Result<FailureOutcome> {
        let next = current.after_failure(&self.config, now);
        write_lock_state(conn, user_id, next).await?;

        if next.locked_until != current.locked_until {
            if let Some(until) = next.locked_until {
                warn!(%user_id, %until, "biometric verification locked after repeated failures");
                self.ledger
                    .record(
                        conn,
                        AuditRecord::new(
                            user_id,
                            AuditAction::SecurityBreachDetected,
                            json!({
                                "reason": "max_failed_attempts",
                                "failedAttempts": self.config.max_failures(),
                                "lockedUntil": until,
                            }),
                        )
                        .with_ip_address(ctx.ip()),
                    )
                    .await?;
                return Ok(FailureOutcome::Locked { until });
            }
        }

        Ok(FailureOutcome::Counted {
            failed_attempts: next.failed_attempts,
        })
    }

    /// Reset the failure counter. An active lock is left to expire.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn record_success(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        current: LockState,
    ) -> Result<()> {
        if current.failed_attempts == 0 {
            return Ok(());
        }
        write_lock_state(conn, user_id, current.after_success()).await
    }

    /// Clear counter and lock, recording who did it.
    ///
    /// # Errors
    /// Returns an error if the update or the audit insert fails.
    pub async fn unlock(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        performed_by: Uuid,
        previous: LockState,
        ctx: &RequestContext,
    ) -> Result<()> {
        write_lock_state(conn, user_id, LockState::default()).await?;
        self.ledger
            .record(
                conn,
                AuditRecord::new(
                    user_id,
                    AuditAction::AccountUnlocked,
                    json!({
                        "previousFailedAttempts": previous.failed_attempts,
                        "previousLockedUntil": previous.locked_until,
                    }),
                )
                .with_performed_by(performed_by)
                .with_ip_address(ctx.ip()),
            )
            .await?;
        Ok(())
    }
}

async fn write_lock_state(conn: &mut PgConnection, user_id: Uuid, state: LockState) -> Result<()> {
    let query = r"
        UPDATE users
        SET failed_biometric_attempts = $2, biometric_locked_until = $3
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(state.failed_attempts)
        .bind(state.locked_until)
        .execute(&mut *conn)
        .instrument(span)
        .await
        .context("Failed to update lock state")?;
    Ok(())
}
