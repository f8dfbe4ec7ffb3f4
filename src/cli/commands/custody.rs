//! Template key custody selection: a local KEK or Vault transit, never both.

use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgGroup, ArgMatches, Command};
use secrecy::SecretString;

use crate::vault::transit::{DEFAULT_KEY, DEFAULT_MOUNT};

pub const ARG_KEK: &str = "kek";
pub const ARG_VAULT_URL: &str = "vault-url";
pub const ARG_VAULT_ROLE_ID: &str = "vault-role-id";
pub const ARG_VAULT_SECRET_ID: &str = "vault-secret-id";
pub const ARG_VAULT_WRAPPED_TOKEN: &str = "vault-wrapped-token";
pub const ARG_VAULT_TRANSIT_MOUNT: &str = "vault-transit-mount";
pub const ARG_VAULT_TRANSIT_KEY: &str = "vault-transit-key";

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_KEK)
                .long(ARG_KEK)
                .help("Base64 key-encryption key (32 bytes) for local key custody")
                .env("SHIFTGATE_KEK")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_VAULT_URL)
                .long(ARG_VAULT_URL)
                .help("Vault AppRole login URL, e.g. https://vault.tld:8200/v1/auth/approle/login")
                .env("SHIFTGATE_VAULT_URL"),
        )
        .arg(
            Arg::new(ARG_VAULT_ROLE_ID)
                .long(ARG_VAULT_ROLE_ID)
                .help("Vault role id")
                .env("SHIFTGATE_VAULT_ROLE_ID")
                .requires(ARG_VAULT_URL),
        )
        .arg(
            Arg::new(ARG_VAULT_SECRET_ID)
                .long(ARG_VAULT_SECRET_ID)
                .help("Vault secret id")
                .env("SHIFTGATE_VAULT_SECRET_ID")
                .hide_env_values(true)
                .requires(ARG_VAULT_URL)
                .conflicts_with(ARG_VAULT_WRAPPED_TOKEN),
        )
        .arg(
            Arg::new(ARG_VAULT_WRAPPED_TOKEN)
                .long(ARG_VAULT_WRAPPED_TOKEN)
                .help("Vault response-wrapped secret id")
                .env("SHIFTGATE_VAULT_WRAPPED_TOKEN")
                .hide_env_values(true)
                .requires(ARG_VAULT_URL),
        )
        .arg(
            Arg::new(ARG_VAULT_TRANSIT_MOUNT)
                .long(ARG_VAULT_TRANSIT_MOUNT)
                .help("Vault transit mount used to wrap template keys")
                .env("SHIFTGATE_VAULT_TRANSIT_MOUNT")
                .default_value(DEFAULT_MOUNT),
        )
        .arg(
            Arg::new(ARG_VAULT_TRANSIT_KEY)
                .long(ARG_VAULT_TRANSIT_KEY)
                .help("Vault transit key name")
                .env("SHIFTGATE_VAULT_TRANSIT_KEY")
                .default_value(DEFAULT_KEY),
        )
        .group(
            ArgGroup::new("key-custody")
                .args([ARG_KEK, ARG_VAULT_URL])
                .required(true)
                .multiple(false),
        )
}

#[derive(Debug)]
pub enum Options {
    LocalKek {
        kek: SecretString,
    },
    VaultTransit {
        url: String,
        role_id: String,
        secret_id: Option<SecretString>,
        wrapped_token: Option<SecretString>,
        mount: String,
        key: String,
    },
}

impl Options {
    /// # Errors
    /// Returns an error if neither strategy is configured or Vault credentials are incomplete.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        if let Some(kek) = matches.get_one::<String>(ARG_KEK) {
            return Ok(Self::LocalKek {
                kek: SecretString::from(kek.clone()),
            });
        }

        let url = matches
            .get_one::<String>(ARG_VAULT_URL)
            .cloned()
            .ok_or_else(|| anyhow!("missing required argument: --{ARG_KEK} or --{ARG_VAULT_URL}"))?;
        let role_id = matches
            .get_one::<String>(ARG_VAULT_ROLE_ID)
            .cloned()
            .with_context(|| format!("missing required argument: --{ARG_VAULT_ROLE_ID}"))?;
        let secret_id = matches
            .get_one::<String>(ARG_VAULT_SECRET_ID)
            .map(|value| SecretString::from(value.clone()));
        let wrapped_token = matches
            .get_one::<String>(ARG_VAULT_WRAPPED_TOKEN)
            .map(|value| SecretString::from(value.clone()));
        if secret_id.is_none() && wrapped_token.is_none() {
            return Err(anyhow!(
                "missing required argument: --{ARG_VAULT_SECRET_ID} or --{ARG_VAULT_WRAPPED_TOKEN}"
            ));
        }

        Ok(Self::VaultTransit {
            url,
            role_id,
            secret_id,
            wrapped_token,
            mount: matches
                .get_one::<String>(ARG_VAULT_TRANSIT_MOUNT)
                .cloned()
                .unwrap_or_else(|| DEFAULT_MOUNT.to_string()),
            key: matches
                .get_one::<String>(ARG_VAULT_TRANSIT_KEY)
                .cloned()
                .unwrap_or_else(|| DEFAULT_KEY.to_string()),
        })
    }
}
