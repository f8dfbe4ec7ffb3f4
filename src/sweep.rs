//! Periodic reconciliation.
//!
//! Each cycle runs two independent sweeps, each in its own transaction guarded
//! by a transaction-scoped advisory lock. When several instances run, only the
//! one holding the lock does the work; the others skip the cycle.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool, Row};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};

use crate::{biometric::audit::AuditLedger, otp::repo::OtpRepo};

pub const OTP_SWEEP_LOCK_ID: i64 = 7_301_001;
pub const AUDIT_SWEEP_LOCK_ID: i64 = 7_301_002;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// `None` when another instance held the lock.
    pub otp_challenges: Option<u64>,
    pub audit_entries: Option<u64>,
}

async fn try_lock(conn: &mut PgConnection, lock_id: i64) -> Result<bool> {
    let query = "SELECT pg_try_advisory_xact_lock($1) AS acquired";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(lock_id)
        .fetch_one(&mut *conn)
        .instrument(span)
        .await
        .context("failed to request sweep lock")?;
    Ok(row.try_get("acquired")?)
}

/// Delete expired OTP challenges.
///
/// # Errors
/// Returns an error if the transaction fails.
pub async fn sweep_expired_otps(pool: &PgPool) -> Result<Option<u64>> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin OTP sweep transaction")?;
    if !try_lock(&mut *tx, OTP_SWEEP_LOCK_ID).await? {
        debug!("OTP sweep lock held elsewhere, skipping cycle");
        return Ok(None);
    }
    let removed = OtpRepo::delete_expired(&mut *tx).await?;
    tx.commit()
        .await
        .context("failed to commit OTP sweep transaction")?;
    Ok(Some(removed))
}

/// Erase audit entries past their retention deadline.
///
/// # Errors
/// Returns an error if the transaction fails.
pub async fn purge_expired_audit(pool: &PgPool) -> Result<Option<u64>> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin audit retention transaction")?;
    if !try_lock(&mut *tx, AUDIT_SWEEP_LOCK_ID).await? {
        debug!("audit retention lock held elsewhere, skipping cycle");
        return Ok(None);
    }
    let removed = AuditLedger::purge_expired(&mut *tx).await?;
    tx.commit()
        .await
        .context("failed to commit audit retention transaction")?;
    Ok(Some(removed))
}

/// Run one full cycle. A failing sweep does not stop the other.
pub async fn run_once(pool: &PgPool) -> SweepReport {
    let otp_challenges = match sweep_expired_otps(pool).await {
        Ok(removed) => removed,
        Err(err) => {
            error!("OTP sweep failed: {err:#}");
            None
        }
    };
    let audit_entries = match purge_expired_audit(pool).await {
        Ok(removed) => removed,
        Err(err) => {
            error!("audit retention sweep failed: {err:#}");
            None
        }
    };
    SweepReport {
        otp_challenges,
        audit_entries,
    }
}

/// Start the reconciliation loop on the runtime.
#[must_use]
pub fn spawn_reconciliation(pool: PgPool, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = run_once(&pool).await;
            if report.otp_challenges.unwrap_or(0) > 0 || report.audit_entries.unwrap_or(0) > 0 {
                info!(
                    otp_challenges = report.otp_challenges.unwrap_or(0),
                    audit_entries = report.audit_entries.unwrap_or(0),
                    "reconciliation sweep removed rows"
                );
            }
        }
    })
}
