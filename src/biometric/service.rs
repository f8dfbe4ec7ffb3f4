use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    BiometricConfig,
    attempts::{self, NewAttempt},
    audit::{AuditAction, AuditEntry, AuditLedger, AuditRecord},
    device::{self, DeviceRegistry, RiskAssessment},
    error::BiometricError,
    liveness::{self, LivenessSignal},
    lockout::{FailureOutcome, LockoutPolicy},
    matcher::{self, MatchConfig, Template},
    models::{
        Actor, AttemptType, AuditTrailInput, DeviceInfo, DeviceUpdate, FaceProfile, FailureReason,
        OfflineSyncInput, OfflineSyncReceipt, ProfileStatus, RegisterInput, Registration,
        RequestContext, Role, RotateInput, UserRecord, VerificationAttempt, VerificationOutcome,
        VerifyInput, validate_unit_score,
    },
    rate_limit::{RateLimitDecision, RateLimiter},
    store::CredentialStore,
};
use crate::notify::{self, Notification, NotificationKind, PushNotifier};

const MAX_BLOCK_REASON_LEN: usize = 256;
const MAX_CLIENT_REF_LEN: usize = 128;

/// Composes the biometric components into the public operations.
///
/// One instance is built at startup and shared by every handler.
#[derive(Clone)]
pub struct BiometricService {
    pool: PgPool,
    store: CredentialStore,
    matching: MatchConfig,
    rate_limiter: RateLimiter,
    lockout: LockoutPolicy,
    ledger: AuditLedger,
    notifier: Arc<dyn PushNotifier>,
}

fn parse_template(values: Vec<f32>) -> Result<Template, BiometricError> {
    Template::new(values).map_err(|_| BiometricError::InvalidTemplate)
}

fn validate_enrollment(
    quality_score: f64,
    device_info: &DeviceInfo,
) -> Result<(), BiometricError> {
    if !validate_unit_score(quality_score) {
        return Err(BiometricError::InvalidQualityScore);
    }
    device_info.validate()
}

/// Tenant rule for privileged operations on another user.
fn authorize(actor: &Actor, target: &UserRecord) -> Result<(), BiometricError> {
    if !actor.role.is_admin() {
        return Err(BiometricError::InsufficientPermissions);
    }
    if target.company_id != actor.company_id && actor.role != Role::SuperAdmin {
        return Err(BiometricError::CrossTenantDenied);
    }
    Ok(())
}

fn require_admin(actor: &Actor) -> Result<(), BiometricError> {
    if actor.role.is_admin() {
        Ok(())
    } else {
        Err(BiometricError::InsufficientPermissions)
    }
}

fn require_client_ref(value: &str) -> Result<&str, BiometricError> {
    let value = value.trim();
    if value.is_empty() || value.len() > MAX_CLIENT_REF_LEN || value.chars().any(char::is_control) {
        return Err(BiometricError::MissingFields);
    }
    Ok(value)
}

impl BiometricService {
    #[must_use]
    pub fn new(
        pool: PgPool,
        store: CredentialStore,
        config: &BiometricConfig,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        let ledger = AuditLedger::new(config.audit_retention_days());
        Self {
            pool,
            store,
            matching: *config.matching(),
            rate_limiter: RateLimiter::new(*config.rate_limit()),
            lockout: LockoutPolicy::new(*config.lockout(), ledger),
            ledger,
            notifier,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[must_use]
    pub fn ledger(&self) -> AuditLedger {
        self.ledger
    }

    fn notify(&self, user_id: Uuid, kind: NotificationKind) {
        notify::dispatch(self.notifier.clone(), Notification::new(user_id, kind));
    }

    /// Enroll a face template for `user_id`.
    ///
    /// # Errors
    /// `ConsentRequired`, `InvalidQualityScore`, `InvalidTemplate`, `InvalidDeviceInfo`,
    /// `UserNotFound`, `AccountLocked`, `ProfileExists`, or `Internal`.
    #[instrument(skip(self, input, ctx))]
    pub async fn register(
        &self,
        user_id: Uuid,
        input: RegisterInput,
        ctx: &RequestContext,
    ) -> Result<Registration, BiometricError> {
        if !input.consent_given {
            return Err(BiometricError::ConsentRequired);
        }
        validate_enrollment(input.quality_score, &input.device_info)?;
        let template = parse_template(input.template)?;

        let now = Utc::now();
        let user = CredentialStore::find_user(&self.pool, user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        if user.lock.is_locked(now) {
            return Err(BiometricError::AccountLocked);
        }

        let sealed = self.store.seal(user_id, &template).await?;
        let fingerprint = device::derive(&input.device_info);

        let mut tx = self.pool.begin().await?;
        let user = CredentialStore::lock_user(&mut *tx, user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        if user.lock.is_locked(now) {
            return Err(BiometricError::AccountLocked);
        }
        if CredentialStore::profile_for_update(&mut *tx, user_id)
            .await?
            .is_some_and(|profile| profile.is_active)
        {
            return Err(BiometricError::ProfileExists);
        }

        let (profile_id, registered_at) = CredentialStore::insert_or_reactivate(
            &mut *tx,
            user_id,
            &sealed,
            input.quality_score,
            now,
        )
        .await?;
        CredentialStore::set_enrollment(&mut *tx, user_id, true, Some(now)).await?;
        attempts::insert(
            &mut *tx,
            &NewAttempt::enrollment(
                user_id,
                profile_id,
                AttemptType::Registration,
                input.quality_score,
                &fingerprint,
                ctx.ip(),
            ),
        )
        .await?;
        DeviceRegistry::record_sighting(&mut *tx, user_id, &fingerprint, &input.device_info, true, now)
            .await?;
        self.ledger
            .record(
                &mut *tx,
                AuditRecord::new(
                    user_id,
                    AuditAction::ProfileCreated,
                    json!({
                        "profileId": profile_id,
                        "qualityScore": input.quality_score,
                        "templateDim": sealed.dim,
                        "keyCustody": sealed.key_custody,
                        "deviceFingerprint": fingerprint,
                    }),
                )
                .with_ip_address(ctx.ip()),
            )
            .await?;
        tx.commit().await?;

        info!(%profile_id, "face profile registered");
        self.notify(user_id, NotificationKind::ProfileRegistered);

        Ok(Registration {
            profile_id,
            registered_at,
        })
    }

    /// Replace the stored template and key. Counters restart.
    ///
    /// # Errors
    /// `InvalidQualityScore`, `InvalidTemplate`, `InvalidDeviceInfo`, `UserNotFound`,
    /// `AccountLocked`, `ProfileNotFound`, or `Internal`.
    #[instrument(skip(self, input, ctx))]
    pub async fn rotate(
        &self,
        user_id: Uuid,
        input: RotateInput,
        ctx: &RequestContext,
    ) -> Result<DateTime<Utc>, BiometricError> {
        validate_enrollment(input.quality_score, &input.device_info)?;
        let template = parse_template(input.template)?;

        let now = Utc::now();
        let user = CredentialStore::find_user(&self.pool, user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        if user.lock.is_locked(now) {
            return Err(BiometricError::AccountLocked);
        }
        if CredentialStore::active_profile(&self.pool, user_id)
            .await?
            .is_none()
        {
            return Err(BiometricError::ProfileNotFound);
        }

        let sealed = self.store.seal(user_id, &template).await?;
        let fingerprint = device::derive(&input.device_info);

        let mut tx = self.pool.begin().await?;
        let user = CredentialStore::lock_user(&mut *tx, user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        if user.lock.is_locked(now) {
            return Err(BiometricError::AccountLocked);
        }
        let profile = CredentialStore::profile_for_update(&mut *tx, user_id)
            .await?
            .filter(|profile| profile.is_active)
            .ok_or(BiometricError::ProfileNotFound)?;

        let template_version = CredentialStore::replace_template(
            &mut *tx,
            profile.id,
            &sealed,
            input.quality_score,
            now,
        )
        .await?;
        attempts::insert(
            &mut *tx,
            &NewAttempt::enrollment(
                user_id,
                profile.id,
                AttemptType::Update,
                input.quality_score,
                &fingerprint,
                ctx.ip(),
            ),
        )
        .await?;
        DeviceRegistry::record_sighting(&mut *tx, user_id, &fingerprint, &input.device_info, true, now)
            .await?;
        self.ledger
            .record(
                &mut *tx,
                AuditRecord::new(
                    user_id,
                    AuditAction::ProfileUpdated,
                    json!({
                        "profileId": profile.id,
                        "templateVersion": template_version,
                        "previousQualityScore": profile.quality_score,
                        "qualityScore": input.quality_score,
                        "keyCustody": sealed.key_custody,
                        "deviceFingerprint": fingerprint,
                    }),
                )
                .with_ip_address(ctx.ip()),
            )
            .await?;
        tx.commit().await?;

        info!(profile_id = %profile.id, template_version, "face template rotated");
        self.notify(user_id, NotificationKind::ProfileUpdated);

        Ok(now)
    }

    /// Soft-delete the active profile and clear the user's biometric flags.
    ///
    /// # Errors
    /// `UserNotFound`, `ProfileNotFound`, or `Internal`.
    #[instrument(skip(self, ctx))]
    pub async fn deactivate(
        &self,
        user_id: Uuid,
        performed_by: Uuid,
        ctx: &RequestContext,
    ) -> Result<DateTime<Utc>, BiometricError> {
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        CredentialStore::lock_user(&mut *tx, user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        let profile = CredentialStore::profile_for_update(&mut *tx, user_id)
            .await?
            .filter(|profile| profile.is_active)
            .ok_or(BiometricError::ProfileNotFound)?;

        CredentialStore::deactivate(&mut *tx, profile.id, now).await?;
        CredentialStore::set_enrollment(&mut *tx, user_id, false, None).await?;

        let mut record = AuditRecord::new(
            user_id,
            AuditAction::ProfileDeleted,
            json!({
                "profileId": profile.id,
                "totalVerifications": profile.total_verifications,
                "successfulVerifications": profile.successful_verifications,
            }),
        )
        .with_ip_address(ctx.ip());
        if performed_by != user_id {
            record = record.with_performed_by(performed_by);
        }
        self.ledger.record(&mut *tx, record).await?;
        tx.commit().await?;

        info!(profile_id = %profile.id, "face profile deactivated");
        self.notify(user_id, NotificationKind::ProfileDeleted);

        Ok(now)
    }

    /// Verify a candidate template against the user's active profile.
    ///
    /// A completed comparison that does not pass is `Ok` with `success = false`.
    ///
    /// # Errors
    /// Validation errors, `RateLimitExceeded`, `UserNotFound`, `AccountLocked`,
    /// `ProfileNotFound`, `ProfileChanged`, `DecryptionFailure`, `DimensionMismatch`,
    /// or `Internal`.
    #[instrument(skip(self, input, ctx))]
    pub async fn verify(
        &self,
        user_id: Uuid,
        input: VerifyInput,
        ctx: &RequestContext,
    ) -> Result<VerificationOutcome, BiometricError> {
        let candidate = parse_template(input.template)?;
        if !validate_unit_score(input.liveness_score) {
            return Err(BiometricError::InvalidLivenessScore);
        }
        if !validate_unit_score(input.quality_score) {
            return Err(BiometricError::InvalidQualityScore);
        }
        input.device_info.validate()?;

        let now = Utc::now();
        if self.rate_limiter.check_limit(&self.pool, user_id, now).await?
            == RateLimitDecision::Limited
        {
            warn!("verification rate limit exceeded");
            return Err(BiometricError::RateLimitExceeded);
        }

        let user = CredentialStore::find_user(&self.pool, user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        if user.lock.is_locked(now) {
            warn!("verification attempted while locked");
            return Err(BiometricError::AccountLocked);
        }

        let snapshot = CredentialStore::active_profile(&self.pool, user_id)
            .await?
            .ok_or(BiometricError::ProfileNotFound)?;
        let fingerprint = device::derive(&input.device_info);
        let attempt_type = AttemptType::from(input.verification_type);

        let confidence = match self.score(&snapshot, &candidate).await {
            Ok(confidence) => confidence,
            Err(err) if err.is_integrity_fault() => {
                self.record_integrity_fault(
                    &NewAttempt {
                        user_id,
                        profile_id: Some(snapshot.id),
                        shift_id: input.shift_id,
                        attempt_type,
                        success: false,
                        confidence: None,
                        liveness_detected: Some(input.liveness_detected),
                        liveness_score: Some(input.liveness_score),
                        quality_score: Some(input.quality_score),
                        lighting: input.lighting,
                        failure_reason: Some(FailureReason::IntegrityFault),
                        device_fingerprint: Some(&fingerprint),
                        ip_address: ctx.ip(),
                    },
                    ctx,
                )
                .await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let mut tx = self.pool.begin().await?;
        let user = CredentialStore::lock_user(&mut *tx, user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        if user.lock.is_locked(now) {
            warn!("verification attempted while locked");
            return Err(BiometricError::AccountLocked);
        }
        if self.rate_limiter.check_limit(&mut *tx, user_id, now).await?
            == RateLimitDecision::Limited
        {
            warn!("verification rate limit exceeded");
            return Err(BiometricError::RateLimitExceeded);
        }
        let profile = CredentialStore::profile_for_update(&mut *tx, user_id)
            .await?
            .filter(|profile| profile.is_active)
            .ok_or(BiometricError::ProfileNotFound)?;
        if profile.id != snapshot.id || profile.template_version != snapshot.template_version {
            warn!(profile_id = %profile.id, "face profile changed during verification");
            return Err(BiometricError::ProfileChanged);
        }

        let risk: RiskAssessment = DeviceRegistry::assess_risk(&mut *tx, user_id, &fingerprint).await?;
        let verdict = liveness::evaluate(
            confidence,
            LivenessSignal {
                detected: input.liveness_detected,
                score: input.liveness_score,
            },
            &self.matching,
            risk.blocked,
        );
        let success = verdict.is_success();
        let failure_reason = verdict.failure_reason();

        let verification_id = attempts::insert(
            &mut *tx,
            &NewAttempt {
                user_id,
                profile_id: Some(profile.id),
                shift_id: input.shift_id,
                attempt_type,
                success,
                confidence: Some(confidence),
                liveness_detected: Some(input.liveness_detected),
                liveness_score: Some(input.liveness_score),
                quality_score: Some(input.quality_score),
                lighting: input.lighting,
                failure_reason,
                device_fingerprint: Some(&fingerprint),
                ip_address: ctx.ip(),
            },
        )
        .await?;
        CredentialStore::record_verification(&mut *tx, profile.id, success, now).await?;

        let lock_outcome = if success {
            self.lockout.record_success(&mut *tx, user_id, user.lock).await?;
            None
        } else {
            Some(
                self.lockout
                    .record_failure(&mut *tx, user_id, user.lock, now, ctx)
                    .await?,
            )
        };

        let device = DeviceRegistry::record_sighting(
            &mut *tx,
            user_id,
            &fingerprint,
            &input.device_info,
            success,
            now,
        )
        .await?;

        self.ledger
            .record(
                &mut *tx,
                AuditRecord::new(
                    user_id,
                    AuditAction::VerificationAttempt,
                    json!({
                        "verificationId": verification_id,
                        "profileId": profile.id,
                        "verificationType": attempt_type.as_str(),
                        "shiftId": input.shift_id,
                        "success": success,
                        "failureReason": failure_reason.map(|reason| reason.as_str()),
                        "livenessDetected": input.liveness_detected,
                        "deviceFingerprint": fingerprint,
                        "deviceRiskScore": device.risk_score,
                    }),
                )
                .with_ip_address(ctx.ip()),
            )
            .await?;
        tx.commit().await?;

        if let Some(FailureOutcome::Locked { .. }) = lock_outcome {
            self.notify(user_id, NotificationKind::AccountLocked);
        }
        if success {
            info!(%verification_id, "face verification succeeded");
        } else {
            warn!(%verification_id, reason = ?failure_reason, "face verification failed");
        }

        Ok(VerificationOutcome {
            verification_id,
            success,
            confidence,
            high_confidence: success && confidence >= self.matching.high_confidence_threshold(),
            liveness_score: input.liveness_score,
            failure_reason,
        })
    }

    async fn score(
        &self,
        profile: &FaceProfile,
        candidate: &Template,
    ) -> Result<f64, BiometricError> {
        let stored = self.store.open(profile).await?;
        matcher::compare(&stored, candidate).map_err(|err| {
            error!(profile_id = %profile.id, "template comparison failed: {err}");
            BiometricError::from(err)
        })
    }

    /// Record a verification that could not be scored. It counts toward the
    /// rate limit but not toward lockout.
    async fn record_integrity_fault(
        &self,
        attempt: &NewAttempt<'_>,
        ctx: &RequestContext,
    ) -> Result<(), BiometricError> {
        let mut tx = self.pool.begin().await?;
        CredentialStore::lock_user(&mut *tx, attempt.user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        let verification_id = attempts::insert(&mut *tx, attempt).await?;
        self.ledger
            .record(
                &mut *tx,
                AuditRecord::new(
                    attempt.user_id,
                    AuditAction::VerificationAttempt,
                    json!({
                        "verificationId": verification_id,
                        "profileId": attempt.profile_id,
                        "verificationType": attempt.attempt_type.as_str(),
                        "shiftId": attempt.shift_id,
                        "success": false,
                        "failureReason": attempt.failure_reason.map(|reason| reason.as_str()),
                        "deviceFingerprint": attempt.device_fingerprint,
                    }),
                )
                .with_ip_address(ctx.ip()),
            )
            .await?;
        tx.commit().await?;

        error!(%verification_id, "face verification stopped by an integrity fault");
        Ok(())
    }

    /// Enrollment and lock state for the status screen. Read-only.
    ///
    /// # Errors
    /// `UserNotFound` or `Internal`.
    #[instrument(skip(self))]
    pub async fn status(&self, user_id: Uuid) -> Result<ProfileStatus, BiometricError> {
        let user = CredentialStore::find_user(&self.pool, user_id)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        let profile = CredentialStore::profile(&self.pool, user_id).await?;
        let active = profile.as_ref().is_some_and(|profile| profile.is_active);
        let current = profile.filter(|profile| profile.is_active);

        Ok(ProfileStatus {
            registered: user.biometric_registered,
            enabled: user.biometric_enabled,
            active,
            total_verifications: current.as_ref().map_or(0, |p| p.total_verifications),
            successful_verifications: current.as_ref().map_or(0, |p| p.successful_verifications),
            quality_score: current.as_ref().map(|p| p.quality_score),
            last_verification_at: current.as_ref().and_then(|p| p.last_verification_at),
            registered_at: current.as_ref().map(|p| p.registered_at),
            locked: user.lock.is_locked(Utc::now()),
        })
    }

    /// # Errors
    /// Returns `Internal` if the query fails.
    pub async fn recent_attempts(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<VerificationAttempt>, BiometricError> {
        Ok(attempts::recent(&self.pool, user_id, limit).await?)
    }

    /// Clear the failure counter and lock of `target`.
    ///
    /// # Errors
    /// `InsufficientPermissions`, `UserNotFound`, `CrossTenantDenied`, or `Internal`.
    #[instrument(skip(self, actor, ctx), fields(actor_id = %actor.user_id))]
    pub async fn unlock(
        &self,
        actor: &Actor,
        target: Uuid,
        ctx: &RequestContext,
    ) -> Result<DateTime<Utc>, BiometricError> {
        require_admin(actor)?;

        let mut tx = self.pool.begin().await?;
        let user = CredentialStore::lock_user(&mut *tx, target)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        authorize(actor, &user)?;

        self.lockout
            .unlock(&mut *tx, target, actor.user_id, user.lock, ctx)
            .await?;
        tx.commit().await?;

        info!("biometric lock cleared by administrator");
        Ok(Utc::now())
    }

    /// Change the standing of one of `target`'s devices.
    ///
    /// Trusting or blocking an unseen fingerprint registers it; untrusting or
    /// unblocking requires a known device.
    ///
    /// # Errors
    /// `InsufficientPermissions`, `UserNotFound`, `CrossTenantDenied`, `DeviceNotFound`,
    /// `InvalidDeviceInfo`, or `Internal`.
    #[instrument(skip(self, actor, update, ctx), fields(actor_id = %actor.user_id))]
    pub async fn update_device(
        &self,
        actor: &Actor,
        target: Uuid,
        fingerprint: &str,
        update: DeviceUpdate,
        ctx: &RequestContext,
    ) -> Result<RiskAssessment, BiometricError> {
        require_admin(actor)?;
        if !device::is_fingerprint(fingerprint) {
            return Err(BiometricError::DeviceNotFound);
        }
        if let DeviceUpdate::Block {
            reason: Some(reason),
        } = &update
        {
            if reason.len() > MAX_BLOCK_REASON_LEN || reason.chars().any(char::is_control) {
                return Err(BiometricError::InvalidDeviceInfo);
            }
        }

        let mut tx = self.pool.begin().await?;
        let user = CredentialStore::lock_user(&mut *tx, target)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        authorize(actor, &user)?;

        let before = DeviceRegistry::assess_risk(&mut *tx, target, fingerprint).await?;
        if matches!(update, DeviceUpdate::Untrust | DeviceUpdate::Unblock) && !before.known {
            return Err(BiometricError::DeviceNotFound);
        }

        let (after, action) = match &update {
            DeviceUpdate::Trust => (
                DeviceRegistry::set_trusted(&mut *tx, target, fingerprint, true).await?,
                AuditAction::DeviceTrusted,
            ),
            DeviceUpdate::Untrust => (
                DeviceRegistry::set_trusted(&mut *tx, target, fingerprint, false).await?,
                AuditAction::DeviceUntrusted,
            ),
            DeviceUpdate::Block { reason } => (
                DeviceRegistry::set_blocked(&mut *tx, target, fingerprint, true, reason.as_deref())
                    .await?,
                AuditAction::DeviceBlocked,
            ),
            DeviceUpdate::Unblock => (
                DeviceRegistry::set_blocked(&mut *tx, target, fingerprint, false, None).await?,
                AuditAction::DeviceUnblocked,
            ),
        };

        let reason = match &update {
            DeviceUpdate::Block { reason } => reason.as_deref(),
            _ => None,
        };
        self.ledger
            .record(
                &mut *tx,
                AuditRecord::new(
                    target,
                    action,
                    json!({
                        "deviceFingerprint": fingerprint,
                        "previousRiskScore": before.risk_score,
                        "riskScore": after.risk_score,
                        "reason": reason,
                    }),
                )
                .with_performed_by(actor.user_id)
                .with_ip_address(ctx.ip()),
            )
            .await?;
        tx.commit().await?;

        info!(action = action.as_str(), "device standing updated");
        Ok(after)
    }

    /// Compliance view of `target`'s audit trail. The read itself is audited.
    ///
    /// # Errors
    /// `InsufficientPermissions`, `UserNotFound`, `CrossTenantDenied`, or `Internal`.
    #[instrument(skip(self, actor, ctx), fields(actor_id = %actor.user_id))]
    pub async fn audit_entries(
        &self,
        actor: &Actor,
        target: Uuid,
        limit: i64,
        ctx: &RequestContext,
    ) -> Result<Vec<AuditEntry>, BiometricError> {
        require_admin(actor)?;

        let mut tx = self.pool.begin().await?;
        let user = CredentialStore::find_user(&mut *tx, target)
            .await?
            .ok_or(BiometricError::UserNotFound)?;
        authorize(actor, &user)?;

        let entries = AuditLedger::entries(&mut *tx, target, limit).await?;
        self.ledger
            .record(
                &mut *tx,
                AuditRecord::new(
                    target,
                    AuditAction::SettingsAccessed,
                    json!({
                        "resource": "audit_entries",
                        "returned": entries.len(),
                    }),
                )
                .with_performed_by(actor.user_id)
                .with_ip_address(ctx.ip()),
            )
            .await?;
        tx.commit().await?;

        Ok(entries)
    }

    /// Store client capture telemetry for the submitting user.
    ///
    /// # Errors
    /// `MissingFields`, `AccessDenied`, or `Internal`.
    #[instrument(skip(self, input, ctx))]
    pub async fn append_audit_trail(
        &self,
        submitter: Uuid,
        input: AuditTrailInput,
        ctx: &RequestContext,
    ) -> Result<Uuid, BiometricError> {
        let session_id = require_client_ref(&input.session_id)?;
        if input.steps.is_empty() && input.events.is_empty() {
            return Err(BiometricError::MissingFields);
        }
        if input.subject_user_id != submitter {
            return Err(BiometricError::AccessDenied);
        }

        let mut conn = self.pool.acquire().await?;
        let audit_id = self
            .ledger
            .record(
                &mut *conn,
                AuditRecord::new(
                    submitter,
                    AuditAction::ClientAuditTrail,
                    json!({
                        "sessionId": session_id,
                        "steps": input.steps,
                        "events": input.events,
                    }),
                )
                .with_ip_address(ctx.ip()),
            )
            .await?;
        Ok(audit_id)
    }

    /// Record a verification captured offline. Replays of the same offline id
    /// return the original entry.
    ///
    /// # Errors
    /// `MissingFields`, `AccessDenied`, or `Internal`.
    #[instrument(skip(self, input, ctx))]
    pub async fn sync_offline_attempt(
        &self,
        submitter: Uuid,
        input: OfflineSyncInput,
        ctx: &RequestContext,
    ) -> Result<OfflineSyncReceipt, BiometricError> {
        let offline_id = require_client_ref(&input.offline_id)?;
        if input.captures.is_empty() {
            return Err(BiometricError::MissingFields);
        }
        if input.subject_user_id != submitter {
            return Err(BiometricError::AccessDenied);
        }

        let mut conn = self.pool.acquire().await?;
        let (audit_id, created) = self
            .ledger
            .record_once(
                &mut *conn,
                AuditRecord::new(
                    submitter,
                    AuditAction::OfflineAttemptSynced,
                    json!({
                        "offlineId": offline_id,
                        "capturedAt": input.captured_at,
                        "captures": input.captures,
                    }),
                )
                .with_ip_address(ctx.ip())
                .with_client_ref(offline_id),
            )
            .await?;
        if !created {
            info!(%audit_id, "offline attempt already synced");
        }

        Ok(OfflineSyncReceipt {
            audit_id,
            offline_id: offline_id.to_string(),
            replayed: !created,
        })
    }
}
