use crate::{
    api,
    biometric::{
        BiometricConfig,
        custody::{KeyCustody, LocalKekCustody, VaultTransitCustody},
    },
    cli::{commands::custody, globals::GlobalArgs},
    otp::{crypto::OtpHasher, models::OtpConfig},
    vault::{self, transit::TransitClient},
};
use anyhow::{Context, Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    pub biometric: BiometricConfig,
    pub otp: OtpConfig,
    pub otp_pepper: SecretString,
    pub custody: custody::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if a secret is malformed, Vault login fails, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!("Server args: {:?}", args);

    let otp_hasher =
        OtpHasher::from_base64(args.otp_pepper.expose_secret()).context("Invalid --otp-pepper")?;

    // Token renewal failures trigger a graceful shutdown.
    let (tx, rx) = mpsc::unbounded_channel();

    let custody: Arc<dyn KeyCustody> = match args.custody {
        custody::Options::LocalKek { kek } => Arc::new(
            LocalKekCustody::from_base64(kek.expose_secret()).context("Invalid --kek")?,
        ),
        custody::Options::VaultTransit {
            url,
            role_id,
            secret_id,
            wrapped_token,
            mount,
            key,
        } => {
            let mut globals = GlobalArgs::new(url);

            // If vault wrapped token try to unwrap, otherwise use secret-id.
            let secret_id = if let Some(wrapped) = &wrapped_token {
                vault::unwrap(&globals.vault_url, wrapped.expose_secret()).await?
            } else {
                secret_id
                    .as_ref()
                    .map(|secret| secret.expose_secret().to_string())
                    .ok_or_else(|| anyhow!("Vault secret-id is required"))?
            };
            let (token, lease_duration) =
                vault::approle_login(&globals.vault_url, &secret_id, &role_id).await?;
            globals.set_token(SecretString::from(token));

            vault::renew::try_renew(&globals, lease_duration, tx.clone()).await?;

            info!(mount = %mount, key = %key, "template keys held in Vault transit");
            Arc::new(VaultTransitCustody::new(TransitClient::new(
                globals, &mount, &key,
            )))
        }
    };

    let config = api::ApiConfig::new(args.biometric, args.otp)
        .with_request_timeout(args.request_timeout)
        .with_sweep_interval(args.sweep_interval);

    api::new(args.port, &args.dsn, config, custody, otp_hasher, rx).await
}
