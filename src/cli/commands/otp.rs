use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::otp::models::OtpConfig;

pub const ARG_OTP_TTL: &str = "otp-ttl-seconds";
pub const ARG_OTP_MAX_ATTEMPTS: &str = "otp-max-attempts";
pub const ARG_OTP_PEPPER: &str = "otp-pepper";

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OTP_TTL)
                .long(ARG_OTP_TTL)
                .help("Lifetime of an issued one-time code")
                .env("SHIFTGATE_OTP_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_OTP_MAX_ATTEMPTS)
                .long(ARG_OTP_MAX_ATTEMPTS)
                .help("Wrong guesses allowed before a code must be reissued")
                .env("SHIFTGATE_OTP_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(i32).range(1..)),
        )
        .arg(
            Arg::new(ARG_OTP_PEPPER)
                .long(ARG_OTP_PEPPER)
                .help("Base64 pepper (at least 16 bytes) mixed into one-time code hashes")
                .env("SHIFTGATE_OTP_PEPPER")
                .hide_env_values(true)
                .required(true),
        )
}

#[derive(Debug)]
pub struct Options {
    pub config: OtpConfig,
    pub pepper: SecretString,
}

impl Options {
    /// # Errors
    /// Returns an error if a required value is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let ttl = matches
            .get_one::<u64>(ARG_OTP_TTL)
            .copied()
            .context("missing required argument: --otp-ttl-seconds")?;
        let max_attempts = matches
            .get_one::<i32>(ARG_OTP_MAX_ATTEMPTS)
            .copied()
            .context("missing required argument: --otp-max-attempts")?;
        let pepper = matches
            .get_one::<String>(ARG_OTP_PEPPER)
            .cloned()
            .context("missing required argument: --otp-pepper")?;

        Ok(Self {
            config: OtpConfig::new()
                .with_ttl_seconds(ttl)
                .with_max_attempts(max_attempts),
            pepper: SecretString::from(pepper),
        })
    }
}
