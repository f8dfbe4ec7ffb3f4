//! Pluggable custody of per-profile template keys.
//!
//! Raw keys never reach the database. A custody backend wraps a fresh
//! [`TemplateKey`] into an opaque string stored next to the profile, and
//! unwraps it again on verification. The backend name is stored too, so a
//! profile always knows which backend can recover its key.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use secrecy::{ExposeSecret, SecretBox};
use uuid::Uuid;

use super::codec::{self, KEY_LEN, TemplateKey};
use crate::vault::transit::TransitClient;

const LOCAL_PREFIX: &str = "local:v1:";

#[async_trait]
pub trait KeyCustody: Send + Sync {
    /// Stable backend name recorded in `face_profiles.key_custody`.
    fn kind(&self) -> &'static str;

    /// Wrap `key` for `user_id`.
    ///
    /// # Errors
    /// Returns an error if the backend cannot wrap the key.
    async fn wrap(&self, user_id: Uuid, key: &TemplateKey) -> Result<String>;

    /// Recover the key wrapped for `user_id`.
    ///
    /// # Errors
    /// Returns an error if the wrapped value is malformed, belongs to another
    /// user, or the backend refuses to unwrap it.
    async fn unwrap(&self, user_id: Uuid, wrapped: &str) -> Result<TemplateKey>;
}

fn key_aad(user_id: Uuid) -> Vec<u8> {
    format!("face-key:v1|{user_id}").into_bytes()
}

/// Wraps keys under a locally configured 32-byte key-encryption key.
pub struct LocalKekCustody {
    kek: SecretBox<[u8; KEY_LEN]>,
}

impl LocalKekCustody {
    #[must_use]
    pub fn new(kek: [u8; KEY_LEN]) -> Self {
        Self {
            kek: SecretBox::new(Box::new(kek)),
        }
    }

    /// Build from the base64 value of `--kek`.
    ///
    /// # Errors
    /// Returns an error unless the value decodes to exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Base64::decode_vec(encoded.trim())
            .map_err(|_| anyhow!("KEK must be valid base64"))?;
        let kek: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("KEK must decode to exactly {KEY_LEN} bytes"))?;
        Ok(Self::new(kek))
    }
}

impl std::fmt::Debug for LocalKekCustody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalKekCustody(***)")
    }
}

#[async_trait]
impl KeyCustody for LocalKekCustody {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn wrap(&self, user_id: Uuid, key: &TemplateKey) -> Result<String> {
        let sealed = codec::seal(self.kek.expose_secret(), key.as_bytes(), &key_aad(user_id))
            .context("Failed to wrap template key")?;
        Ok(format!("{LOCAL_PREFIX}{}", Base64::encode_string(&sealed)))
    }

    async fn unwrap(&self, user_id: Uuid, wrapped: &str) -> Result<TemplateKey> {
        let encoded = wrapped
            .strip_prefix(LOCAL_PREFIX)
            .ok_or_else(|| anyhow!("wrapped key was not produced by local custody"))?;
        let sealed =
            Base64::decode_vec(encoded).map_err(|_| anyhow!("wrapped key is not base64"))?;
        let mut raw = codec::open(self.kek.expose_secret(), &sealed, &key_aad(user_id))
            .context("Failed to unwrap template key")?;
        let key = TemplateKey::from_slice(&raw);
        raw.fill(0);
        Ok(key?)
    }
}

/// Wraps keys with a Vault transit key, using the user id as derivation context.
#[derive(Debug, Clone)]
pub struct VaultTransitCustody {
    transit: TransitClient,
}

impl VaultTransitCustody {
    #[must_use]
    pub fn new(transit: TransitClient) -> Self {
        Self { transit }
    }
}

#[async_trait]
impl KeyCustody for VaultTransitCustody {
    fn kind(&self) -> &'static str {
        "vault-transit"
    }

    async fn wrap(&self, user_id: Uuid, key: &TemplateKey) -> Result<String> {
        self.transit
            .encrypt(key.as_bytes(), &user_id.to_string())
            .await
            .context("Failed to wrap template key with Vault transit")
    }

    async fn unwrap(&self, user_id: Uuid, wrapped: &str) -> Result<TemplateKey> {
        let mut raw = self
            .transit
            .decrypt(wrapped, &user_id.to_string())
            .await
            .context("Failed to unwrap template key with Vault transit")?;
        let key = TemplateKey::from_slice(&raw);
        raw.fill(0);
        Ok(key?)
    }
}
