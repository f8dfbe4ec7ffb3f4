//! Map validated CLI arguments to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{self, biometric, custody, otp};
use anyhow::{Context, Result};
use std::time::Duration;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let request_timeout = matches
        .get_one::<u64>(commands::ARG_REQUEST_TIMEOUT)
        .copied()
        .unwrap_or(15);
    let sweep_interval = matches
        .get_one::<u64>(commands::ARG_SWEEP_INTERVAL)
        .copied()
        .unwrap_or(60);

    let biometric = biometric::parse(matches)?;
    let otp_opts = otp::Options::parse(matches)?;
    let custody = custody::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        request_timeout: Duration::from_secs(request_timeout),
        sweep_interval: Duration::from_secs(sweep_interval),
        biometric,
        otp: otp_opts.config,
        otp_pepper: otp_opts.pepper,
        custody,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const DSN: &str = "postgres://shiftgate@localhost:5432/shiftgate";
    const KEK: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";
    const PEPPER: &str = "cGVwcGVyLXBlcHBlci1wZXBwZXI=";

    fn vars(extra: &[(&'static str, Option<&'static str>)]) -> Vec<(&'static str, Option<&'static str>)> {
        let mut vars = vec![
            ("SHIFTGATE_DSN", Some(DSN)),
            ("SHIFTGATE_OTP_PEPPER", Some(PEPPER)),
            ("SHIFTGATE_KEK", None),
            ("SHIFTGATE_VAULT_URL", None),
            ("SHIFTGATE_VAULT_ROLE_ID", None),
            ("SHIFTGATE_VAULT_SECRET_ID", None),
            ("SHIFTGATE_VAULT_WRAPPED_TOKEN", None),
            ("SHIFTGATE_MATCH_THRESHOLD", None),
            ("SHIFTGATE_HIGH_CONFIDENCE_THRESHOLD", None),
        ];
        vars.extend_from_slice(extra);
        vars
    }

    #[test]
    fn local_kek_server_action() {
        temp_env::with_vars(vars(&[("SHIFTGATE_KEK", Some(KEK))]), || {
            let matches = commands::new().get_matches_from(vec!["shiftgate"]);
            let Ok(Action::Server(args)) = handler(&matches) else {
                panic!("expected a server action");
            };
            assert_eq!(args.port, 8080);
            assert_eq!(args.dsn, DSN);
            assert_eq!(args.request_timeout, Duration::from_secs(15));
            assert_eq!(args.otp.max_attempts(), 5);
            assert_eq!(args.otp_pepper.expose_secret(), PEPPER);
            assert!(matches!(args.custody, custody::Options::LocalKek { .. }));
        });
    }

    #[test]
    fn vault_custody_needs_a_secret() {
        temp_env::with_vars(
            vars(&[
                (
                    "SHIFTGATE_VAULT_URL",
                    Some("https://vault.tld:8200/v1/auth/approle/login"),
                ),
                ("SHIFTGATE_VAULT_ROLE_ID", Some("role-id")),
            ]),
            || {
                let matches = commands::new().get_matches_from(vec!["shiftgate"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(err.to_string().contains("--vault-secret-id"));
                }
            },
        );
    }

    #[test]
    fn vault_custody_with_wrapped_token() {
        temp_env::with_vars(
            vars(&[
                (
                    "SHIFTGATE_VAULT_URL",
                    Some("https://vault.tld:8200/v1/auth/approle/login"),
                ),
                ("SHIFTGATE_VAULT_ROLE_ID", Some("role-id")),
                ("SHIFTGATE_VAULT_WRAPPED_TOKEN", Some("s.wrapped")),
            ]),
            || {
                let matches = commands::new().get_matches_from(vec!["shiftgate"]);
                let Ok(Action::Server(args)) = handler(&matches) else {
                    panic!("expected a server action");
                };
                let custody::Options::VaultTransit {
                    role_id,
                    secret_id,
                    wrapped_token,
                    mount,
                    key,
                    ..
                } = args.custody
                else {
                    panic!("expected vault custody");
                };
                assert_eq!(role_id, "role-id");
                assert!(secret_id.is_none());
                assert!(wrapped_token.is_some());
                assert_eq!(mount, "transit/shiftgate");
                assert_eq!(key, "face-templates");
            },
        );
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        temp_env::with_vars(
            vars(&[
                ("SHIFTGATE_KEK", Some(KEK)),
                ("SHIFTGATE_MATCH_THRESHOLD", Some("0.9")),
                ("SHIFTGATE_HIGH_CONFIDENCE_THRESHOLD", Some("0.8")),
            ]),
            || {
                let matches = commands::new().get_matches_from(vec!["shiftgate"]);
                assert!(handler(&matches).is_err());
            },
        );
    }
}
