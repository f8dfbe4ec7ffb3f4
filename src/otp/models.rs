use chrono::{DateTime, Utc};
use secrecy::SecretString;
use sqlx::{FromRow, Row, postgres::PgRow};
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MAX_ATTEMPTS: i32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OtpConfig {
    ttl: Duration,
    max_attempts: i32,
}

impl OtpConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, seconds: u64) -> Self {
        self.ttl = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            ttl: if self.ttl.is_zero() {
                Duration::from_secs(1)
            } else {
                self.ttl
            },
            max_attempts: self.max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(10))
    }
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending challenge. Holds the code hash, never the code.
#[derive(Clone, Debug)]
pub struct OtpChallenge {
    pub user_id: Uuid,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OtpChallenge {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            code_hash: row.try_get("code_hash")?,
            expires_at: row.try_get("expires_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeState {
    Active,
    Expired,
    Exhausted,
}

impl OtpChallenge {
    /// Expiry wins over exhaustion so an expired challenge is always cleared.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> ChallengeState {
        if self.expires_at <= now {
            ChallengeState::Expired
        } else if self.attempts >= self.max_attempts {
            ChallengeState::Exhausted
        } else {
            ChallengeState::Active
        }
    }
}

/// A freshly issued code. The plaintext only travels to the email channel.
#[derive(Debug)]
pub struct IssuedOtp {
    pub code: SecretString,
    pub expires_at: DateTime<Utc>,
}
