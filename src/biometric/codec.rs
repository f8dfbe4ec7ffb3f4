//! Authenticated encryption for face templates and wrapped keys.
//!
//! Output layout is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! A fresh random nonce is drawn for every call, so encrypting the same
//! plaintext twice never yields the same bytes.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use uuid::Uuid;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Encryption failure")]
    EncryptionFailure,
    #[error("Decryption failure")]
    DecryptionFailure,
}

/// Per-profile symmetric key. Never persisted in raw form.
#[derive(Clone, PartialEq, Eq)]
pub struct TemplateKey([u8; KEY_LEN]);

impl TemplateKey {
    /// Draw a fresh key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// # Errors
    /// Returns `CodecError::InvalidKeyLength` unless `bytes` is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CodecError::InvalidKeyLength)?;
        Ok(Self(key))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for TemplateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TemplateKey(***)")
    }
}

impl Drop for TemplateKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

/// Seal `plaintext` under `key`, binding `aad` into the tag.
///
/// # Errors
/// Returns `CodecError::EncryptionFailure` if the cipher rejects the input.
#[allow(deprecated)]
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CodecError::EncryptionFailure)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a blob produced by [`seal`].
///
/// # Errors
/// Returns `CodecError::DecryptionFailure` on a wrong key, wrong AAD,
/// truncated input or any tampering.
#[allow(deprecated)]
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CodecError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CodecError::DecryptionFailure);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CodecError::DecryptionFailure)
}

/// Encrypt a serialized template for `user_id`.
///
/// # Errors
/// Returns `CodecError::EncryptionFailure` if sealing fails.
pub fn encrypt_template(
    key: &TemplateKey,
    plaintext: &[u8],
    user_id: Uuid,
) -> Result<Vec<u8>, CodecError> {
    seal(key.as_bytes(), plaintext, &template_aad(user_id))
}

/// Decrypt a template ciphertext stored for `user_id`.
///
/// # Errors
/// Returns `CodecError::DecryptionFailure` if the key, owner or bytes do not match.
pub fn decrypt_template(
    key: &TemplateKey,
    sealed: &[u8],
    user_id: Uuid,
) -> Result<Vec<u8>, CodecError> {
    open(key.as_bytes(), sealed, &template_aad(user_id))
}

fn template_aad(user_id: Uuid) -> Vec<u8> {
    format!("face-template:v1|{user_id}").into_bytes()
}
