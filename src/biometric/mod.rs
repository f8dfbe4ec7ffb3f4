//! Biometric shift-presence verification.
//!
//! Flow Overview (verify):
//! 1) Validate the request (template shape, scores, device info).
//! 2) Rate-limit gate: count recent attempts in the ledger. Limited callers stop here.
//! 3) Lockout gate: a user inside `biometric_locked_until` stops here.
//! 4) Load the active profile, unwrap its key, decrypt and compare. No transaction is
//!    open yet, so a slow key custody backend never holds row locks.
//! 5) Open a transaction, lock the user row, re-check both gates and the profile
//!    version, assess the device, and decide the verdict.
//! 6) Append the attempt, bump counters, update lockout state, the device record and
//!    the audit ledger, then commit. Any error rolls every write back.
//! 7) After commit, send best-effort notifications.
//!
//! Registration, rotation and deletion follow the same shape without the match step.

pub mod attempts;
pub mod audit;
pub mod codec;
pub mod custody;
pub mod device;
pub mod error;
pub mod liveness;
pub mod lockout;
pub mod matcher;
pub mod models;
pub mod rate_limit;
pub mod service;
pub mod store;

pub use error::BiometricError;
pub use service::BiometricService;

use audit::DEFAULT_RETENTION_DAYS;
use lockout::LockoutConfig;
use matcher::MatchConfig;
use rate_limit::RateLimitConfig;

/// Tunables for the verification pipeline, assembled from CLI flags at startup.
#[derive(Clone, Copy, Debug)]
pub struct BiometricConfig {
    matching: MatchConfig,
    rate_limit: RateLimitConfig,
    lockout: LockoutConfig,
    audit_retention_days: i64,
}

impl BiometricConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            matching: MatchConfig::new(),
            rate_limit: RateLimitConfig::new(),
            lockout: LockoutConfig::new(),
            audit_retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    #[must_use]
    pub fn with_matching(mut self, matching: MatchConfig) -> Self {
        self.matching = matching;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: LockoutConfig) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_audit_retention_days(mut self, days: i64) -> Self {
        self.audit_retention_days = days;
        self
    }

    #[must_use]
    pub fn matching(&self) -> &MatchConfig {
        &self.matching
    }

    #[must_use]
    pub fn rate_limit(&self) -> &RateLimitConfig {
        &self.rate_limit
    }

    #[must_use]
    pub fn lockout(&self) -> &LockoutConfig {
        &self.lockout
    }

    #[must_use]
    pub fn audit_retention_days(&self) -> i64 {
        self.audit_retention_days
    }

    /// # Errors
    /// Returns an error if thresholds are out of range or retention is not positive.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.matching.validate()?;
        if self.audit_retention_days < 1 {
            anyhow::bail!("audit retention must be at least one day");
        }
        Ok(())
    }
}

impl Default for BiometricConfig {
    fn default() -> Self {
        Self::new()
    }
}
