use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

use crate::biometric::{
    BiometricConfig, lockout::LockoutConfig, matcher::MatchConfig, rate_limit::RateLimitConfig,
};

pub const ARG_MATCH_THRESHOLD: &str = "match-threshold";
pub const ARG_HIGH_CONFIDENCE_THRESHOLD: &str = "high-confidence-threshold";
pub const ARG_LIVENESS_THRESHOLD: &str = "liveness-threshold";
pub const ARG_RATE_LIMIT_WINDOW: &str = "rate-limit-window-seconds";
pub const ARG_RATE_LIMIT_MAX_ATTEMPTS: &str = "rate-limit-max-attempts";
pub const ARG_LOCKOUT_MAX_FAILURES: &str = "lockout-max-failures";
pub const ARG_LOCKOUT_DURATION: &str = "lockout-duration-seconds";
pub const ARG_AUDIT_RETENTION_DAYS: &str = "audit-retention-days";

pub fn with_args(command: Command) -> Command {
    let command = with_matching_args(command);
    with_abuse_args(command)
}

fn with_matching_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MATCH_THRESHOLD)
                .long(ARG_MATCH_THRESHOLD)
                .help("Minimum similarity for a face match")
                .env("SHIFTGATE_MATCH_THRESHOLD")
                .default_value("0.75")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_HIGH_CONFIDENCE_THRESHOLD)
                .long(ARG_HIGH_CONFIDENCE_THRESHOLD)
                .help("Similarity that waives the liveness requirement")
                .env("SHIFTGATE_HIGH_CONFIDENCE_THRESHOLD")
                .default_value("0.85")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_LIVENESS_THRESHOLD)
                .long(ARG_LIVENESS_THRESHOLD)
                .help("Minimum liveness score for a live capture")
                .env("SHIFTGATE_LIVENESS_THRESHOLD")
                .default_value("0.70")
                .value_parser(clap::value_parser!(f64)),
        )
}

fn with_abuse_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT_WINDOW)
                .long(ARG_RATE_LIMIT_WINDOW)
                .help("Sliding window for verification rate limiting")
                .env("SHIFTGATE_RATE_LIMIT_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_MAX_ATTEMPTS)
                .long(ARG_RATE_LIMIT_MAX_ATTEMPTS)
                .help("Verification attempts allowed per window")
                .env("SHIFTGATE_RATE_LIMIT_MAX_ATTEMPTS")
                .default_value("10")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_MAX_FAILURES)
                .long(ARG_LOCKOUT_MAX_FAILURES)
                .help("Consecutive failures before the account is locked")
                .env("SHIFTGATE_LOCKOUT_MAX_FAILURES")
                .default_value("3")
                .value_parser(clap::value_parser!(i32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_DURATION)
                .long(ARG_LOCKOUT_DURATION)
                .help("How long a lockout lasts")
                .env("SHIFTGATE_LOCKOUT_DURATION_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_AUDIT_RETENTION_DAYS)
                .long(ARG_AUDIT_RETENTION_DAYS)
                .help("Days audit entries are kept before the retention sweep erases them")
                .env("SHIFTGATE_AUDIT_RETENTION_DAYS")
                .default_value("2555")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

/// Assemble and validate the verification pipeline tunables.
///
/// # Errors
/// Returns an error if a value is missing or out of range.
pub fn parse(matches: &ArgMatches) -> Result<BiometricConfig> {
    let matching = MatchConfig::new()
        .with_match_threshold(get::<f64>(matches, ARG_MATCH_THRESHOLD)?)
        .with_high_confidence_threshold(get::<f64>(matches, ARG_HIGH_CONFIDENCE_THRESHOLD)?)
        .with_liveness_threshold(get::<f64>(matches, ARG_LIVENESS_THRESHOLD)?);
    let rate_limit = RateLimitConfig::new()
        .with_window_seconds(get::<u64>(matches, ARG_RATE_LIMIT_WINDOW)?)
        .with_max_attempts(get::<i64>(matches, ARG_RATE_LIMIT_MAX_ATTEMPTS)?);
    let lockout = LockoutConfig::new()
        .with_max_failures(get::<i32>(matches, ARG_LOCKOUT_MAX_FAILURES)?)
        .with_duration_seconds(get::<u64>(matches, ARG_LOCKOUT_DURATION)?);

    let config = BiometricConfig::new()
        .with_matching(matching)
        .with_rate_limit(rate_limit)
        .with_lockout(lockout)
        .with_audit_retention_days(get::<i64>(matches, ARG_AUDIT_RETENTION_DAYS)?);
    config.validate()?;
    Ok(config)
}

fn get<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Result<T> {
    matches
        .get_one::<T>(id)
        .cloned()
        .with_context(|| format!("missing required argument: --{id}"))
}
