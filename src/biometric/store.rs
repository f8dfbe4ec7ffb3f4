//! Credential store: owns every write to `face_profiles`.
//!
//! Key material is produced and recovered here, outside of any transaction,
//! because unwrapping may call out to Vault. Row writes take the caller's
//! connection so they share the caller's transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgExecutor, Row};
use std::sync::Arc;
use tracing::{Instrument, error, info_span};
use uuid::Uuid;

use super::{
    codec::{self, TemplateKey},
    custody::KeyCustody,
    error::BiometricError,
    matcher::Template,
    models::{FaceProfile, UserRecord},
};

const USER_COLUMNS: &str = "id, email, company_id, role, biometric_enabled, biometric_registered, \
     failed_biometric_attempts, biometric_locked_until";

const PROFILE_COLUMNS: &str = "id, user_id, template_hash, template_ciphertext, template_dim, \
     wrapped_key, key_custody, template_version, quality_score, is_active, total_verifications, \
     successful_verifications, last_verification_at, registered_at, updated_at, deactivated_at";

/// Encrypted template ready to persist.
#[derive(Debug)]
pub struct SealedTemplate {
    pub ciphertext: Vec<u8>,
    pub hash: Vec<u8>,
    pub dim: i32,
    pub wrapped_key: String,
    pub key_custody: &'static str,
}

#[derive(Clone)]
pub struct CredentialStore {
    custody: Arc<dyn KeyCustody>,
}

impl CredentialStore {
    #[must_use]
    pub fn new(custody: Arc<dyn KeyCustody>) -> Self {
        Self { custody }
    }

    #[must_use]
    pub fn custody_kind(&self) -> &'static str {
        self.custody.kind()
    }

    /// Encrypt `template` under a fresh per-profile key and wrap the key.
    ///
    /// # Errors
    /// Returns `BiometricError::Internal` if encryption or wrapping fails.
    pub async fn seal(
        &self,
        user_id: Uuid,
        template: &Template,
    ) -> Result<SealedTemplate, BiometricError> {
        let key = TemplateKey::generate();
        let ciphertext = codec::encrypt_template(&key, &template.to_bytes(), user_id)
            .context("Failed to encrypt face template")?;
        let wrapped_key = self.custody.wrap(user_id, &key).await?;
        let dim = i32::try_from(template.dim()).map_err(|_| BiometricError::InvalidTemplate)?;

        Ok(SealedTemplate {
            ciphertext,
            hash: template.digest(),
            dim,
            wrapped_key,
            key_custody: self.custody.kind(),
        })
    }

    /// Recover the plaintext template of a stored profile.
    ///
    /// Any failure to unwrap, decrypt, decode or verify the stored digest is a
    /// `DecryptionFailure`; it is logged here with the profile id.
    ///
    /// # Errors
    /// Returns `BiometricError::DecryptionFailure` on any integrity fault.
    pub async fn open(&self, profile: &FaceProfile) -> Result<Template, BiometricError> {
        if profile.key_custody != self.custody.kind() {
            error!(
                user_id = %profile.user_id,
                profile_id = %profile.id,
                stored = %profile.key_custody,
                configured = self.custody.kind(),
                "profile key was wrapped by a different custody backend"
            );
            return Err(BiometricError::DecryptionFailure);
        }

        let key = self
            .custody
            .unwrap(profile.user_id, &profile.wrapped_key)
            .await
            .map_err(|err| {
                error!(
                    user_id = %profile.user_id,
                    profile_id = %profile.id,
                    "failed to unwrap template key: {err:#}"
                );
                BiometricError::DecryptionFailure
            })?;

        let mut plaintext =
            codec::decrypt_template(&key, &profile.template_ciphertext, profile.user_id).map_err(
                |err| {
                    error!(
                        user_id = %profile.user_id,
                        profile_id = %profile.id,
                        "failed to decrypt template: {err}"
                    );
                    BiometricError::DecryptionFailure
                },
            )?;
        let decoded = Template::from_bytes(&plaintext);
        plaintext.fill(0);

        let template = decoded.map_err(|err| {
            error!(
                user_id = %profile.user_id,
                profile_id = %profile.id,
                "decrypted template is malformed: {err}"
            );
            BiometricError::DecryptionFailure
        })?;

        let dim_matches = usize::try_from(profile.template_dim).is_ok_and(|dim| dim == template.dim());
        if !dim_matches || template.digest() != profile.template_hash {
            error!(
                user_id = %profile.user_id,
                profile_id = %profile.id,
                "decrypted template does not match the stored digest"
            );
            return Err(BiometricError::DecryptionFailure);
        }

        Ok(template)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn find_user<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: Uuid,
    ) -> Result<Option<UserRecord>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        sqlx::query_as::<_, UserRecord>(&query)
            .bind(user_id)
            .fetch_optional(executor)
            .instrument(span)
            .await
            .context("Failed to load user")
    }

    /// Lock the user row for the rest of the transaction.
    ///
    /// Every mutating flow starts here so writes for one user serialize.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn lock_user(conn: &mut PgConnection, user_id: Uuid) -> Result<Option<UserRecord>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        sqlx::query_as::<_, UserRecord>(&query)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to lock user")
    }

    /// The user's profile row, active or not.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn profile<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: Uuid,
    ) -> Result<Option<FaceProfile>> {
        let query = format!("SELECT {PROFILE_COLUMNS} FROM face_profiles WHERE user_id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        sqlx::query_as::<_, FaceProfile>(&query)
            .bind(user_id)
            .fetch_optional(executor)
            .instrument(span)
            .await
            .context("Failed to load face profile")
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn active_profile<'e, E: PgExecutor<'e>>(
        executor: E,
        user_id: Uuid,
    ) -> Result<Option<FaceProfile>> {
        Ok(Self::profile(executor, user_id)
            .await?
            .filter(|profile| profile.is_active))
    }

    /// The user's profile row, locked for the rest of the transaction.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn profile_for_update(
        conn: &mut PgConnection,
        user_id: Uuid,
    ) -> Result<Option<FaceProfile>> {
        let query =
            format!("SELECT {PROFILE_COLUMNS} FROM face_profiles WHERE user_id = $1 FOR UPDATE");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        sqlx::query_as::<_, FaceProfile>(&query)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to lock face profile")
    }

    /// Create the profile, or reactivate a previously deactivated one with a new template.
    ///
    /// The caller has already checked that no active profile exists.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn insert_or_reactivate(
        conn: &mut PgConnection,
        user_id: Uuid,
        sealed: &SealedTemplate,
        quality_score: f64,
        now: DateTime<Utc>,
    ) -> Result<(Uuid, DateTime<Utc>)> {
        let query = r"
            INSERT INTO face_profiles
                (user_id, template_hash, template_ciphertext, template_dim, wrapped_key,
                 key_custody, quality_score, registered_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (user_id) DO UPDATE
            SET template_hash = EXCLUDED.template_hash,
                template_ciphertext = EXCLUDED.template_ciphertext,
                template_dim = EXCLUDED.template_dim,
                wrapped_key = EXCLUDED.wrapped_key,
                key_custody = EXCLUDED.key_custody,
                quality_score = EXCLUDED.quality_score,
                template_version = face_profiles.template_version + 1,
                is_active = TRUE,
                total_verifications = 0,
                successful_verifications = 0,
                last_verification_at = NULL,
                registered_at = EXCLUDED.registered_at,
                updated_at = EXCLUDED.updated_at,
                deactivated_at = NULL
            WHERE face_profiles.is_active = FALSE
            RETURNING id, registered_at
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(&sealed.hash)
            .bind(&sealed.ciphertext)
            .bind(sealed.dim)
            .bind(&sealed.wrapped_key)
            .bind(sealed.key_custody)
            .bind(quality_score)
            .bind(now)
            .fetch_optional(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to store face profile")?
            .context("Face profile is already active")?;
        Ok((row.try_get("id")?, row.try_get("registered_at")?))
    }

    /// Swap in a new template and key; counters restart.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn replace_template(
        conn: &mut PgConnection,
        profile_id: Uuid,
        sealed: &SealedTemplate,
        quality_score: f64,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let query = r"
            UPDATE face_profiles
            SET template_hash = $2,
                template_ciphertext = $3,
                template_dim = $4,
                wrapped_key = $5,
                key_custody = $6,
                quality_score = $7,
                template_version = template_version + 1,
                total_verifications = 0,
                successful_verifications = 0,
                last_verification_at = NULL,
                updated_at = $8
            WHERE id = $1 AND is_active = TRUE
            RETURNING template_version
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(profile_id)
            .bind(&sealed.hash)
            .bind(&sealed.ciphertext)
            .bind(sealed.dim)
            .bind(&sealed.wrapped_key)
            .bind(sealed.key_custody)
            .bind(quality_score)
            .bind(now)
            .fetch_one(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to replace face template")?;
        Ok(row.try_get("template_version")?)
    }

    /// Bump verification counters after a decided attempt.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn record_verification(
        conn: &mut PgConnection,
        profile_id: Uuid,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = r"
            UPDATE face_profiles
            SET total_verifications = total_verifications + 1,
                successful_verifications = successful_verifications + CASE WHEN $2 THEN 1 ELSE 0 END,
                last_verification_at = $3
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(profile_id)
            .bind(success)
            .bind(now)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to update verification counters")?;
        Ok(())
    }

    /// Soft delete. The row stays for the ledgers that reference it.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn deactivate(
        conn: &mut PgConnection,
        profile_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = r"
            UPDATE face_profiles
            SET is_active = FALSE, deactivated_at = $2, updated_at = $2
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(profile_id)
            .bind(now)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to deactivate face profile")?;
        Ok(())
    }

    /// Flip the user's biometric flags. `consent_at` is stored only when enrolling.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn set_enrollment(
        conn: &mut PgConnection,
        user_id: Uuid,
        enrolled: bool,
        consent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let query = r"
            UPDATE users
            SET biometric_enabled = $2,
                biometric_registered = $2,
                biometric_consent_at = COALESCE($3, biometric_consent_at)
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(enrolled)
            .bind(consent_at)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("Failed to update biometric flags")?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::biometric::custody::LocalKekCustody;

    fn store() -> CredentialStore {
        CredentialStore::new(Arc::new(LocalKekCustody::new([3u8; 32])))
    }

    fn profile_from(user_id: Uuid, sealed: SealedTemplate) -> FaceProfile {
        let now = Utc::now();
        FaceProfile {
            id: Uuid::new_v4(),
            user_id,
            template_hash: sealed.hash,
            template_ciphertext: sealed.ciphertext,
            template_dim: sealed.dim,
            wrapped_key: sealed.wrapped_key,
            key_custody: sealed.key_custody.to_string(),
            template_version: 1,
            quality_score: 0.9,
            is_active: true,
            total_verifications: 0,
            successful_verifications: 0,
            last_verification_at: None,
            registered_at: now,
            updated_at: now,
            deactivated_at: None,
        }
    }

    #[tokio::test]
    async fn sealed_template_opens_to_the_same_vector() {
        let user_id = Uuid::new_v4();
        let template = Template::new(vec![0.1, -0.4, 0.9, 0.25]).unwrap();
        let sealed = store().seal(user_id, &template).await.unwrap();

        assert_eq!(sealed.dim, 4);
        assert_eq!(sealed.key_custody, "local");
        assert_ne!(sealed.ciphertext, template.to_bytes());

        let opened = store().open(&profile_from(user_id, sealed)).await.unwrap();
        assert_eq!(opened, template);
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_a_decryption_failure() {
        let user_id = Uuid::new_v4();
        let template = Template::new(vec![1.0, 2.0, 3.0]).unwrap();
        let mut profile = profile_from(user_id, store().seal(user_id, &template).await.unwrap());
        let last = profile.template_ciphertext.len() - 1;
        profile.template_ciphertext[last] ^= 0x01;

        assert!(matches!(
            store().open(&profile).await,
            Err(BiometricError::DecryptionFailure)
        ));
    }

    #[tokio::test]
    async fn digest_mismatch_is_a_decryption_failure() {
        let user_id = Uuid::new_v4();
        let template = Template::new(vec![1.0, 2.0, 3.0]).unwrap();
        let mut profile = profile_from(user_id, store().seal(user_id, &template).await.unwrap());
        profile.template_hash = vec![0u8; 32];

        assert!(matches!(
            store().open(&profile).await,
            Err(BiometricError::DecryptionFailure)
        ));
    }

    #[tokio::test]
    async fn wrong_kek_or_backend_is_a_decryption_failure() {
        let user_id = Uuid::new_v4();
        let template = Template::new(vec![1.0, 2.0, 3.0]).unwrap();
        let profile = profile_from(user_id, store().seal(user_id, &template).await.unwrap());

        let other = CredentialStore::new(Arc::new(LocalKekCustody::new([4u8; 32])));
        assert!(matches!(
            other.open(&profile).await,
            Err(BiometricError::DecryptionFailure)
        ));

        let mut foreign = profile.clone();
        foreign.key_custody = "vault-transit".to_string();
        assert!(matches!(
            store().open(&foreign).await,
            Err(BiometricError::DecryptionFailure)
        ));
    }
}
