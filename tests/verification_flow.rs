//! Service-level biometric flows against a real Postgres.

mod common;

use anyhow::Result;
use common::{
    ENROLLED, IMPOSTOR, OTHER_KEK, TestEnv, capture, ctx, device, registration, run_concurrently,
};
use shiftgate::biometric::{
    BiometricConfig, BiometricError,
    lockout::LockoutConfig,
    models::{
        Actor, AttemptType, AuditTrailInput, DeviceUpdate, FailureReason, OfflineSyncInput, Role,
        RotateInput,
    },
    rate_limit::RateLimitConfig,
};
use serde_json::json;

const ATTEMPTS: &str =
    "SELECT COUNT(*) FROM verification_attempts WHERE user_id = $1 AND attempt_type = 'start'";

#[tokio::test]
async fn enrolled_user_verifies_and_history_is_recorded() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("ada@shiftgate.dev", "employee").await?;

    let enrolled = service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    let outcome = service.verify(user_id, capture(&ENROLLED), &ctx()).await?;
    assert!(outcome.success);
    assert!(outcome.high_confidence);
    assert!(outcome.failure_reason.is_none());
    assert!((outcome.confidence - 1.0).abs() < 1e-6);

    let status = service.status(user_id).await?;
    assert!(status.registered && status.enabled && status.active);
    assert!(!status.locked);
    assert_eq!(status.total_verifications, 1);
    assert_eq!(status.successful_verifications, 1);

    let recent = service.recent_attempts(user_id, 10).await?;
    assert_eq!(recent.len(), 2, "enrollment and verification");
    assert_eq!(recent[0].id, outcome.verification_id);
    assert_eq!(recent[1].attempt_type, AttemptType::Registration);
    assert!(!enrolled.profile_id.is_nil());

    let actions = env.audit_actions(user_id).await?;
    assert_eq!(actions, vec!["profile_created", "verification_attempt"]);

    // Plaintext never reaches the table.
    let stored: Vec<u8> = sqlx::query_scalar(
        "SELECT template_ciphertext FROM face_profiles WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(env.pool())
    .await?;
    let plaintext: Vec<u8> = ENROLLED.iter().flat_map(|v| v.to_le_bytes()).collect();
    assert!(!stored.windows(plaintext.len()).any(|w| w == plaintext.as_slice()));
    Ok(())
}

#[tokio::test]
async fn registration_requires_consent_and_is_unique() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("grace@shiftgate.dev", "employee").await?;

    let mut input = registration(&ENROLLED);
    input.consent_given = false;
    assert!(matches!(
        service.register(user_id, input, &ctx()).await,
        Err(BiometricError::ConsentRequired)
    ));

    service.register(user_id, registration(&ENROLLED), &ctx()).await?;
    assert!(matches!(
        service.register(user_id, registration(&ENROLLED), &ctx()).await,
        Err(BiometricError::ProfileExists)
    ));

    // After deactivation the same user may enroll again.
    service.deactivate(user_id, user_id, &ctx()).await?;
    assert!(!service.status(user_id).await?.registered);
    assert!(matches!(
        service.verify(user_id, capture(&ENROLLED), &ctx()).await,
        Err(BiometricError::ProfileNotFound)
    ));
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;
    assert!(service.status(user_id).await?.active);
    Ok(())
}

#[tokio::test]
async fn repeated_mismatches_lock_until_an_admin_unlocks() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("linus@shiftgate.dev", "employee").await?;
    let admin_id = env.insert_user("admin@shiftgate.dev", "admin").await?;
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    for _ in 0..3 {
        let outcome = service.verify(user_id, capture(&IMPOSTOR), &ctx()).await?;
        assert!(!outcome.success);
        assert_eq!(outcome.failure_reason, Some(FailureReason::FaceMismatch));
    }

    // The genuine face is refused while locked, and nothing is recorded.
    assert!(matches!(
        service.verify(user_id, capture(&ENROLLED), &ctx()).await,
        Err(BiometricError::AccountLocked)
    ));
    assert_eq!(env.count(ATTEMPTS, user_id).await?, 3);
    assert!(service.status(user_id).await?.locked);

    let employee = Actor {
        user_id,
        company_id: env.company_id,
        role: Role::Employee,
    };
    assert!(matches!(
        service.unlock(&employee, user_id, &ctx()).await,
        Err(BiometricError::InsufficientPermissions)
    ));

    let admin = Actor {
        user_id: admin_id,
        company_id: env.company_id,
        role: Role::Admin,
    };
    service.unlock(&admin, user_id, &ctx()).await?;
    assert!(service.verify(user_id, capture(&ENROLLED), &ctx()).await?.success);

    let actions = env.audit_actions(user_id).await?;
    assert!(actions.contains(&"security_breach_detected".to_string()));
    assert!(actions.contains(&"account_unlocked".to_string()));
    Ok(())
}

#[tokio::test]
async fn weak_liveness_fails_without_matching_on_face() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("barbara@shiftgate.dev", "employee").await?;
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    let mut input = capture(&ENROLLED);
    input.liveness_score = 0.2;
    let outcome = service.verify(user_id, input, &ctx()).await?;
    assert!(!outcome.success);
    assert!(!outcome.high_confidence);
    assert_eq!(outcome.failure_reason, Some(FailureReason::LivenessFailed));
    Ok(())
}

#[tokio::test]
async fn rate_limit_bounds_concurrent_verifications() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let config = BiometricConfig::new()
        .with_rate_limit(RateLimitConfig::new().with_max_attempts(3).with_window_seconds(60));
    let service = env.biometric(&config);
    let user_id = env.insert_user("ken@shiftgate.dev", "employee").await?;
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    let results = run_concurrently((0..8).map(|_| {
        let service = service.clone();
        async move { service.verify(user_id, capture(&ENROLLED), &ctx()).await }
    }))
    .await;

    let completed = results.iter().filter(|result| result.is_ok()).count();
    let limited = results
        .iter()
        .filter(|result| matches!(result, Err(BiometricError::RateLimitExceeded)))
        .count();
    assert_eq!(completed, 3);
    assert_eq!(limited, 5);
    assert_eq!(env.count(ATTEMPTS, user_id).await?, 3);
    Ok(())
}

#[tokio::test]
async fn concurrent_failures_set_exactly_one_lock() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let config = BiometricConfig::new()
        .with_lockout(LockoutConfig::new().with_max_failures(3).with_duration_seconds(600));
    let service = env.biometric(&config);
    let user_id = env.insert_user("dennis@shiftgate.dev", "employee").await?;
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    let results = run_concurrently((0..6).map(|_| {
        let service = service.clone();
        async move { service.verify(user_id, capture(&IMPOSTOR), &ctx()).await }
    }))
    .await;

    let failed = results
        .iter()
        .filter(|result| matches!(result, Ok(outcome) if !outcome.success))
        .count();
    let locked = results
        .iter()
        .filter(|result| matches!(result, Err(BiometricError::AccountLocked)))
        .count();
    assert_eq!(failed, 3);
    assert_eq!(locked, 3);

    let breaches = env
        .count(
            "SELECT COUNT(*) FROM audit_entries WHERE user_id = $1 AND action_type = 'security_breach_detected'",
            user_id,
        )
        .await?;
    assert_eq!(breaches, 1);
    Ok(())
}

#[tokio::test]
async fn lockout_of_one_user_never_touches_another() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let config = BiometricConfig::new()
        .with_lockout(LockoutConfig::new().with_max_failures(3).with_duration_seconds(600));
    let service = env.biometric(&config);
    let intruded = env.insert_user("alan@shiftgate.dev", "employee").await?;
    let genuine = env.insert_user("katherine@shiftgate.dev", "employee").await?;
    service.register(intruded, registration(&ENROLLED), &ctx()).await?;
    service.register(genuine, registration(&ENROLLED), &ctx()).await?;

    let results = run_concurrently((0..12).map(|i| {
        let service = service.clone();
        let (user_id, template) = if i % 2 == 0 {
            (intruded, IMPOSTOR)
        } else {
            (genuine, ENROLLED)
        };
        async move { (user_id, service.verify(user_id, capture(&template), &ctx()).await) }
    }))
    .await;

    let genuine_results: Vec<_> = results
        .iter()
        .filter(|(user_id, _)| *user_id == genuine)
        .map(|(_, result)| result)
        .collect();
    assert_eq!(genuine_results.len(), 6);
    assert!(
        genuine_results
            .iter()
            .all(|result| matches!(result, Ok(outcome) if outcome.success))
    );

    let locked = results
        .iter()
        .filter(|(user_id, result)| {
            *user_id == intruded && matches!(result, Err(BiometricError::AccountLocked))
        })
        .count();
    assert_eq!(locked, 3);
    assert!(service.status(intruded).await?.locked);

    let status = service.status(genuine).await?;
    assert!(!status.locked);
    assert_eq!(status.successful_verifications, 6);
    let failures = env
        .count(
            "SELECT failed_biometric_attempts::bigint FROM users WHERE id = $1",
            genuine,
        )
        .await?;
    assert_eq!(failures, 0);
    Ok(())
}

#[tokio::test]
async fn template_sealed_under_another_key_is_an_integrity_fault() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let config = BiometricConfig::new();
    let user_id = env.insert_user("radia@shiftgate.dev", "employee").await?;
    env.biometric(&config)
        .register(user_id, registration(&ENROLLED), &ctx())
        .await?;

    let rotated_kek = env.biometric_with_kek(&config, OTHER_KEK);
    let err = rotated_kek
        .verify(user_id, capture(&ENROLLED), &ctx())
        .await
        .err();
    assert!(matches!(err, Some(BiometricError::DecryptionFailure)));
    assert_eq!(env.count(ATTEMPTS, user_id).await?, 1);

    // A candidate of another dimensionality is refused the same way.
    let err = env
        .biometric(&config)
        .verify(user_id, capture(&[0.1, 0.2, 0.3]), &ctx())
        .await
        .err();
    assert!(matches!(err, Some(BiometricError::DimensionMismatch)));

    let faults = env
        .count(
            "SELECT COUNT(*) FROM verification_attempts WHERE user_id = $1 AND NOT success AND failure_reason = 'integrity_fault' AND confidence IS NULL",
            user_id,
        )
        .await?;
    assert_eq!(faults, 2);
    assert_eq!(
        env.audit_actions(user_id).await?,
        vec!["profile_created", "verification_attempt", "verification_attempt"]
    );

    // Server-side faults never count toward lockout.
    let failures = env
        .count(
            "SELECT failed_biometric_attempts::bigint FROM users WHERE id = $1",
            user_id,
        )
        .await?;
    assert_eq!(failures, 0);
    assert!(!env.biometric(&config).status(user_id).await?.locked);
    Ok(())
}

#[tokio::test]
async fn integrity_faults_are_rate_limited() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let config = BiometricConfig::new()
        .with_rate_limit(RateLimitConfig::new().with_max_attempts(3).with_window_seconds(60));
    let service = env.biometric(&config);
    let user_id = env.insert_user("barbara@shiftgate.dev", "employee").await?;
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    for _ in 0..3 {
        assert!(matches!(
            service.verify(user_id, capture(&[0.1, 0.2, 0.3]), &ctx()).await,
            Err(BiometricError::DimensionMismatch)
        ));
    }
    assert!(matches!(
        service.verify(user_id, capture(&[0.1, 0.2, 0.3]), &ctx()).await,
        Err(BiometricError::RateLimitExceeded)
    ));
    // The window is shared with well-formed captures.
    assert!(matches!(
        service.verify(user_id, capture(&ENROLLED), &ctx()).await,
        Err(BiometricError::RateLimitExceeded)
    ));

    assert_eq!(env.count(ATTEMPTS, user_id).await?, 3);
    let audited = env
        .count(
            "SELECT COUNT(*) FROM audit_entries WHERE user_id = $1 AND action_type = 'verification_attempt'",
            user_id,
        )
        .await?;
    assert_eq!(audited, 3);
    Ok(())
}

#[tokio::test]
async fn rotation_replaces_the_template() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("frances@shiftgate.dev", "employee").await?;
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    service
        .rotate(
            user_id,
            RotateInput {
                template: IMPOSTOR.to_vec(),
                device_info: device("pixel-8"),
                quality_score: 0.88,
            },
            &ctx(),
        )
        .await?;

    assert!(service.verify(user_id, capture(&IMPOSTOR), &ctx()).await?.success);
    assert!(!service.verify(user_id, capture(&ENROLLED), &ctx()).await?.success);
    assert!(env.audit_actions(user_id).await?.contains(&"profile_updated".to_string()));
    Ok(())
}

#[tokio::test]
async fn blocked_device_never_verifies() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("margaret@shiftgate.dev", "employee").await?;
    let admin_id = env.insert_user("lead@shiftgate.dev", "admin").await?;
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    let admin = Actor {
        user_id: admin_id,
        company_id: env.company_id,
        role: Role::Admin,
    };
    let fingerprint = shiftgate::biometric::device::derive(&device("pixel-8"));
    let assessment = service
        .update_device(
            &admin,
            user_id,
            &fingerprint,
            DeviceUpdate::Block {
                reason: Some("reported stolen".to_string()),
            },
            &ctx(),
        )
        .await?;
    assert!(assessment.blocked);

    let outcome = service.verify(user_id, capture(&ENROLLED), &ctx()).await?;
    assert!(!outcome.success);
    assert_eq!(outcome.failure_reason, Some(FailureReason::DeviceBlocked));

    // Unblocking an unknown device is refused.
    let unknown = shiftgate::biometric::device::derive(&device("unknown-model"));
    assert!(matches!(
        service
            .update_device(&admin, user_id, &unknown, DeviceUpdate::Unblock, &ctx())
            .await,
        Err(BiometricError::DeviceNotFound)
    ));
    Ok(())
}

#[tokio::test]
async fn admins_cannot_reach_other_companies() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("hedy@shiftgate.dev", "employee").await?;
    let other_company = uuid::Uuid::new_v4();
    let outsider_id = env
        .insert_user_in("outsider@elsewhere.dev", other_company, "admin")
        .await?;

    let outsider = Actor {
        user_id: outsider_id,
        company_id: other_company,
        role: Role::Admin,
    };
    assert!(matches!(
        service.audit_entries(&outsider, user_id, 10, &ctx()).await,
        Err(BiometricError::CrossTenantDenied)
    ));
    assert!(matches!(
        service.unlock(&outsider, user_id, &ctx()).await,
        Err(BiometricError::CrossTenantDenied)
    ));

    let root_id = env
        .insert_user_in("root@elsewhere.dev", other_company, "super_admin")
        .await?;
    let root = Actor {
        user_id: root_id,
        company_id: other_company,
        role: Role::SuperAdmin,
    };
    service.audit_entries(&root, user_id, 10, &ctx()).await?;
    // The read itself is on the record.
    assert!(env.audit_actions(user_id).await?.contains(&"settings_accessed".to_string()));
    Ok(())
}

#[tokio::test]
async fn offline_sync_is_idempotent_and_owner_only() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("annie@shiftgate.dev", "employee").await?;
    let other_id = env.insert_user("joan@shiftgate.dev", "employee").await?;

    let input = OfflineSyncInput {
        subject_user_id: user_id,
        offline_id: "device-42:0007".to_string(),
        captured_at: chrono::Utc::now(),
        captures: vec![json!({ "type": "start", "confidence": 0.91 })],
    };
    let first = service.sync_offline_attempt(user_id, input.clone(), &ctx()).await?;
    assert!(!first.replayed);
    let replay = service.sync_offline_attempt(user_id, input.clone(), &ctx()).await?;
    assert!(replay.replayed);
    assert_eq!(replay.audit_id, first.audit_id);

    assert!(matches!(
        service.sync_offline_attempt(other_id, input, &ctx()).await,
        Err(BiometricError::AccessDenied)
    ));

    let trail = AuditTrailInput {
        subject_user_id: user_id,
        session_id: "capture-session-1".to_string(),
        steps: vec![json!({ "step": "face_detected", "ms": 420 })],
        events: vec![],
    };
    service.append_audit_trail(user_id, trail, &ctx()).await?;

    let empty = AuditTrailInput {
        subject_user_id: user_id,
        session_id: "capture-session-2".to_string(),
        steps: vec![],
        events: vec![],
    };
    assert!(matches!(
        service.append_audit_trail(user_id, empty, &ctx()).await,
        Err(BiometricError::MissingFields)
    ));

    let actions = env.audit_actions(user_id).await?;
    assert_eq!(actions, vec!["offline_attempt_synced", "client_audit_trail"]);
    Ok(())
}

#[tokio::test]
async fn ledger_rows_cannot_be_rewritten() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let user_id = env.insert_user("sophie@shiftgate.dev", "employee").await?;
    service.register(user_id, registration(&ENROLLED), &ctx()).await?;

    let update = sqlx::query("UPDATE audit_entries SET details = '{}'::jsonb WHERE user_id = $1")
        .bind(user_id)
        .execute(env.pool())
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM verification_attempts WHERE user_id = $1")
        .bind(user_id)
        .execute(env.pool())
        .await;
    assert!(delete.is_err());
    Ok(())
}

#[tokio::test]
async fn failed_audit_write_rolls_back_the_whole_operation() -> Result<()> {
    let Ok(env) = TestEnv::new().await else {
        return Ok(());
    };
    let service = env.biometric(&BiometricConfig::new());
    let enrolled = env.insert_user("hedy@shiftgate.dev", "employee").await?;
    let pending = env.insert_user("joan@shiftgate.dev", "employee").await?;
    service.register(enrolled, registration(&ENROLLED), &ctx()).await?;

    sqlx::raw_sql(
        r"
            CREATE FUNCTION fail_audit_insert() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'audit storage unavailable';
            END;
            $$ LANGUAGE plpgsql;
            CREATE TRIGGER audit_entries_fail
                BEFORE INSERT ON audit_entries
                FOR EACH ROW EXECUTE FUNCTION fail_audit_insert();
        ",
    )
    .execute(env.pool())
    .await?;

    assert!(matches!(
        service.verify(enrolled, capture(&IMPOSTOR), &ctx()).await,
        Err(BiometricError::Internal(_))
    ));
    assert_eq!(env.count(ATTEMPTS, enrolled).await?, 0);
    let failures = env
        .count(
            "SELECT failed_biometric_attempts::bigint FROM users WHERE id = $1",
            enrolled,
        )
        .await?;
    assert_eq!(failures, 0);

    assert!(matches!(
        service.register(pending, registration(&ENROLLED), &ctx()).await,
        Err(BiometricError::Internal(_))
    ));
    let profiles = env
        .count("SELECT COUNT(*) FROM face_profiles WHERE user_id = $1", pending)
        .await?;
    assert_eq!(profiles, 0);
    assert!(!service.status(pending).await?.registered);
    Ok(())
}
