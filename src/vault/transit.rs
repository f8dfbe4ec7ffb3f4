use crate::{cli::globals::GlobalArgs, vault};
use anyhow::{Result, anyhow};
use base64ct::{Base64, Encoding};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::{Instrument, error, info_span, instrument};

pub const DEFAULT_MOUNT: &str = "transit/shiftgate";
pub const DEFAULT_KEY: &str = "face-templates";

fn get_required_str<'a>(json_response: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = json_response;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str()
}

/// Client for one named key on a transit secrets engine.
///
/// The key must be created with `derived=true` so every call can bind a
/// context (the owning user id).
#[derive(Debug, Clone)]
pub struct TransitClient {
    globals: GlobalArgs,
    mount: String,
    key: String,
}

impl TransitClient {
    #[must_use]
    pub fn new(globals: GlobalArgs, mount: &str, key: &str) -> Self {
        Self {
            globals,
            mount: mount.trim_matches('/').to_string(),
            key: key.to_string(),
        }
    }

    fn path(&self, operation: &str) -> String {
        format!("/v1/{}/{operation}/{}", self.mount, self.key)
    }

    async fn post(&self, operation: &str, payload: &Value) -> Result<Value> {
        let client = vault::client()?;
        let url = vault::endpoint_url(&self.globals.vault_url, &self.path(operation))?;

        let span = info_span!(
            "vault.transit",
            http.method = "POST",
            transit.operation = operation,
            url = %url
        );
        let response = client
            .post(url.as_str())
            .header("X-Vault-Token", self.globals.vault_token.expose_secret())
            .json(payload)
            .send()
            .instrument(span)
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let json_response: Value = response.json().await?;

            let error_message = vault::vault_error_message(&json_response);

            error!("Failed to {operation}: {}", error_message);

            return Err(anyhow!("{status}, {error_message}"));
        }

        Ok(response.json().await?)
    }

    /// Encrypt `plaintext` bound to `context`, returns the `vault:v*:` ciphertext.
    /// # Errors
    /// Returns an error if the Vault request fails, Vault returns a non-success status, or the response is missing expected fields.
    #[instrument(skip(self, plaintext))]
    pub async fn encrypt(&self, plaintext: &[u8], context: &str) -> Result<String> {
        let payload = json!({
            "plaintext": Base64::encode_string(plaintext),
            "context": Base64::encode_string(context.as_bytes()),
        });

        let json_response = self.post("encrypt", &payload).await?;

        get_required_str(&json_response, &["data", "ciphertext"]).map_or_else(
            || {
                error!("Failed to encrypt, no ciphertext in response");
                Err(anyhow!("Failed to encrypt"))
            },
            |ciphertext| Ok(ciphertext.to_string()),
        )
    }

    /// Decrypt a transit ciphertext created with the same `context`.
    /// # Errors
    /// Returns an error if the Vault request fails, Vault returns a non-success status, or the response is missing expected fields.
    #[instrument(skip(self, ciphertext))]
    pub async fn decrypt(&self, ciphertext: &str, context: &str) -> Result<Vec<u8>> {
        let payload = json!({
            "ciphertext": ciphertext,
            "context": Base64::encode_string(context.as_bytes()),
        });

        let json_response = self.post("decrypt", &payload).await?;

        let plaintext_b64 =
            get_required_str(&json_response, &["data", "plaintext"]).ok_or_else(|| {
                error!("Failed to decrypt, no plaintext in response");
                anyhow!("Failed to decrypt")
            })?;

        Base64::decode_vec(plaintext_b64).map_err(|e| {
            error!("Failed to decode plaintext: {}", e);
            anyhow!("Failed to decode plaintext")
        })
    }
}
