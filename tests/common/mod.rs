//! Shared fixtures for the Postgres-backed integration tests.
//!
//! Every `TestEnv` owns a fresh container, so tests never share rows.
#![allow(dead_code)]

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use shiftgate::{
    biometric::{
        BiometricConfig, BiometricService,
        audit::AuditLedger,
        custody::{KeyCustody, LocalKekCustody},
        models::{DeviceInfo, RegisterInput, RequestContext, VerificationType, VerifyInput},
        store::CredentialStore,
    },
    email::{EmailMessage, EmailSender},
    notify::LogPushNotifier,
    otp::{OtpService, crypto::OtpHasher, models::OtpConfig},
};
use sqlx::{PgPool, Row};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use test_support::{postgres::TestDatabase, runtime};
use tokio::task::JoinSet;
use uuid::Uuid;

pub const KEK: [u8; 32] = [7; 32];
pub const OTHER_KEK: [u8; 32] = [9; 32];
pub const PEPPER: &[u8] = b"integration-pepper-0001";

/// Enrolled reference vector. Identical captures score 1.0, the negated one 0.0.
pub const ENROLLED: [f32; 4] = [0.6, 0.8, 0.0, 0.0];
pub const IMPOSTOR: [f32; 4] = [-0.6, -0.8, 0.0, 0.0];

pub struct TestEnv {
    pub db: TestDatabase,
    pub company_id: Uuid,
}

impl TestEnv {
    /// Start a database, or return an error (after printing why) so the test can skip.
    pub async fn new() -> Result<Self> {
        if let Err(err) = runtime::ensure_container_runtime() {
            eprintln!("Skipping integration test: {err}");
            return Err(err);
        }
        let db = TestDatabase::start().await?;
        Ok(Self {
            db,
            company_id: Uuid::new_v4(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.db.pool()
    }

    pub fn biometric(&self, config: &BiometricConfig) -> BiometricService {
        self.biometric_with_kek(config, KEK)
    }

    pub fn biometric_with_kek(&self, config: &BiometricConfig, kek: [u8; 32]) -> BiometricService {
        let custody: Arc<dyn KeyCustody> = Arc::new(LocalKekCustody::new(kek));
        BiometricService::new(
            self.pool().clone(),
            CredentialStore::new(custody),
            config,
            Arc::new(LogPushNotifier),
        )
    }

    pub fn otp(&self, config: OtpConfig, sender: Arc<dyn EmailSender>) -> Result<OtpService> {
        let hasher = OtpHasher::new(PEPPER.to_vec())?;
        Ok(OtpService::new(
            self.pool().clone(),
            hasher,
            config,
            AuditLedger::default(),
            sender,
        ))
    }

    pub async fn insert_user(&self, email: &str, role: &str) -> Result<Uuid> {
        self.insert_user_in(email, self.company_id, role).await
    }

    pub async fn insert_user_in(&self, email: &str, company_id: Uuid, role: &str) -> Result<Uuid> {
        let row = sqlx::query(
            "INSERT INTO users (email, company_id, role) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(email)
        .bind(company_id)
        .bind(role)
        .fetch_one(self.pool())
        .await
        .context("insert user")?;
        Ok(row.try_get("id")?)
    }

    /// Mint a bearer token for `user_id`. Only its SHA-256 is stored.
    pub async fn insert_session(&self, user_id: Uuid) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        sqlx::query(
            r"
                INSERT INTO user_sessions (token_hash, user_id, expires_at)
                VALUES ($1, $2, NOW() + INTERVAL '1 hour')
            ",
        )
        .bind(Sha256::digest(token.as_bytes()).to_vec())
        .bind(user_id)
        .execute(self.pool())
        .await
        .context("insert session")?;
        Ok(token)
    }

    pub async fn count(&self, query: &str, user_id: Uuid) -> Result<i64> {
        let row = sqlx::query(query).bind(user_id).fetch_one(self.pool()).await?;
        Ok(row.try_get(0)?)
    }

    pub async fn audit_actions(&self, user_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT action_type FROM audit_entries WHERE user_id = $1 ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| row.try_get("action_type").map_err(Into::into))
            .collect()
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::new(Some("203.0.113.10".to_string()))
}

pub fn device(model: &str) -> DeviceInfo {
    DeviceInfo {
        platform: Some("android".to_string()),
        model: Some(model.to_string()),
        os_version: Some("14".to_string()),
        app_version: Some("2.3.0".to_string()),
        screen_resolution: Some("1080x2400".to_string()),
        ..DeviceInfo::default()
    }
}

pub fn registration(template: &[f32]) -> RegisterInput {
    RegisterInput {
        template: template.to_vec(),
        device_info: device("pixel-8"),
        quality_score: 0.92,
        consent_given: true,
    }
}

pub fn capture(template: &[f32]) -> VerifyInput {
    VerifyInput {
        template: template.to_vec(),
        liveness_detected: true,
        liveness_score: 0.95,
        verification_type: VerificationType::Start,
        shift_id: Some(Uuid::new_v4()),
        device_info: device("pixel-8"),
        quality_score: 0.9,
        lighting: None,
    }
}

/// Spawn every future on the runtime and collect the outputs in completion order.
pub async fn run_concurrently<F, T>(futures: impl IntoIterator<Item = F>) -> Vec<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut set = JoinSet::new();
    for future in futures {
        set.spawn(future);
    }
    let mut outputs = Vec::new();
    while let Some(joined) = set.join_next().await {
        if let Ok(output) = joined {
            outputs.push(output);
        }
    }
    outputs
}

/// Email sender that keeps every message for assertions.
#[derive(Default)]
pub struct RecordingSender {
    messages: Mutex<Vec<EmailMessage>>,
}

impl RecordingSender {
    pub fn messages(&self) -> Vec<EmailMessage> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    /// Delivery runs on the blocking pool; poll briefly until `n` messages arrived.
    pub async fn wait_for(&self, n: usize) -> Vec<EmailMessage> {
        for _ in 0..50 {
            let messages = self.messages();
            if messages.len() >= n {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.messages()
    }
}

impl EmailSender for RecordingSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.clone());
        }
        Ok(())
    }
}
