//! Sliding-window limit on verification attempts per user.
//!
//! Counts recorded `start | end | test` attempts in the trailing window. The
//! check reads only the ledger, so a limited caller never reaches the
//! credential store or pays for decryption.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, Row};
use std::time::Duration;
use tracing::{Instrument, info_span};
use uuid::Uuid;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ATTEMPTS: i64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    window: Duration,
    max_attempts: i64,
}

impl RateLimitConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_window_seconds(mut self, seconds: u64) -> Self {
        self.window = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    #[must_use]
    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            window: if self.window.is_zero() {
                Duration::from_secs(1)
            } else {
                self.window
            },
            max_attempts: self.max_attempts.max(1),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Pure decision over an already-counted window.
#[must_use]
pub fn decide(recent_attempts: i64, config: &RateLimitConfig) -> RateLimitDecision {
    if recent_attempts >= config.max_attempts() {
        RateLimitDecision::Limited
    } else {
        RateLimitDecision::Allowed
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: config.normalize(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count attempts in the trailing window and decide.
    ///
    /// # Errors
    /// Returns an error if the count query fails; callers treat that as a
    /// failure of the request, never as "allowed".
    pub async fn check_limit<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let window_start = now
            - chrono::Duration::from_std(self.config.window())
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let query = r"
            SELECT COUNT(*) AS attempts
            FROM verification_attempts
            WHERE user_id = $1
              AND attempt_type IN ('start', 'end', 'test')
              AND created_at > $2
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(window_start)
            .fetch_one(executor)
            .instrument(span)
            .await
            .context("Failed to count recent verification attempts")?;
        let attempts: i64 = row.try_get("attempts")?;
        Ok(decide(attempts, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_is_exclusive() {
        let config = RateLimitConfig::new();
        assert_eq!(decide(0, &config), RateLimitDecision::Allowed);
        assert_eq!(decide(9, &config), RateLimitDecision::Allowed);
        assert_eq!(decide(10, &config), RateLimitDecision::Limited);
        assert_eq!(decide(11, &config), RateLimitDecision::Limited);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = RateLimitConfig::new()
            .with_window_seconds(30)
            .with_max_attempts(4);
        assert_eq!(config.window(), Duration::from_secs(30));
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(decide(4, &config), RateLimitDecision::Limited);
    }

    #[test]
    fn normalize_rejects_degenerate_values() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new()
                .with_window_seconds(0)
                .with_max_attempts(0),
        );
        assert_eq!(limiter.config().window(), Duration::from_secs(1));
        assert_eq!(limiter.config().max_attempts(), 1);
    }
}
