use axum::http::StatusCode;
use chrono::Utc;
use secrecy::ExposeSecret;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{
    crypto::{self, OtpHasher},
    models::{ChallengeState, IssuedOtp, OtpConfig},
    repo::OtpRepo,
};
use crate::{
    biometric::{
        audit::{AuditAction, AuditLedger, AuditRecord},
        models::RequestContext,
    },
    email::{self, EmailMessage, EmailSender},
};

const OTP_EMAIL_TEMPLATE: &str = "otp_code";

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("User not found")]
    UserNotFound,
    #[error("No active code")]
    NoActiveChallenge,
    #[error("Code expired")]
    Expired,
    #[error("Too many attempts")]
    TooManyAttempts,
    #[error("Invalid code")]
    InvalidCode,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OtpError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserNotFound => "user_not_found",
            Self::NoActiveChallenge => "no_active_challenge",
            Self::Expired => "expired",
            Self::TooManyAttempts => "too_many_attempts",
            Self::InvalidCode => "invalid_code",
            Self::Internal(_) => "internal_error",
        }
    }

    #[must_use]
    pub fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            Self::UserNotFound => (StatusCode::NOT_FOUND, "User not found"),
            Self::NoActiveChallenge => (StatusCode::BAD_REQUEST, "No active code, request a new one"),
            Self::Expired => (StatusCode::GONE, "Code expired, request a new one"),
            Self::TooManyAttempts => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many attempts, request a new code",
            ),
            Self::InvalidCode => (StatusCode::UNAUTHORIZED, "Invalid code"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        }
    }
}

impl From<sqlx::Error> for OtpError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

/// Issues and checks email one-time codes.
///
/// Every state change and its audit entry commit together under the user's
/// row lock. The email is sent after commit.
#[derive(Clone)]
pub struct OtpService {
    pool: PgPool,
    hasher: Arc<OtpHasher>,
    config: OtpConfig,
    ledger: AuditLedger,
    sender: Arc<dyn EmailSender>,
}

impl OtpService {
    #[must_use]
    pub fn new(
        pool: PgPool,
        hasher: OtpHasher,
        config: OtpConfig,
        ledger: AuditLedger,
        sender: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            pool,
            hasher: Arc::new(hasher),
            config: config.normalize(),
            ledger,
            sender,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    /// Issue a fresh code for `email`, replacing any pending one.
    ///
    /// # Errors
    /// `UserNotFound` when no user has that email; `Internal` on storage failures.
    #[instrument(skip(self, email, ctx))]
    pub async fn issue(&self, email: &str, ctx: &RequestContext) -> Result<IssuedOtp, OtpError> {
        let code = crypto::generate_code();
        let code_hash = self.hasher.hash(&code)?;
        let now = Utc::now();
        let expires_at = self.config.expires_at(now);

        let mut tx = self.pool.begin().await?;
        let recipient = OtpRepo::lock_recipient(&mut *tx, email)
            .await?
            .ok_or(OtpError::UserNotFound)?;
        OtpRepo::upsert_challenge(
            &mut *tx,
            recipient.user_id,
            &code_hash,
            expires_at,
            self.config.max_attempts(),
        )
        .await?;
        self.ledger
            .record(
                &mut *tx,
                AuditRecord::new(
                    recipient.user_id,
                    AuditAction::OtpIssued,
                    json!({ "expiresAt": expires_at }),
                )
                .with_ip_address(ctx.ip()),
            )
            .await?;
        tx.commit().await?;

        info!(user_id = %recipient.user_id, "otp issued");
        email::dispatch(
            self.sender.clone(),
            EmailMessage {
                to_email: recipient.email,
                template: OTP_EMAIL_TEMPLATE.to_string(),
                payload: json!({
                    "code": code.expose_secret(),
                    "expiresAt": expires_at,
                }),
            },
        );

        Ok(IssuedOtp { code, expires_at })
    }

    /// Check `candidate` against the pending code for `email`.
    ///
    /// A success consumes the challenge. Expired challenges are cleared and a
    /// mismatch counts against the attempt ceiling; both outcomes commit
    /// before the error is returned.
    ///
    /// # Errors
    /// `NoActiveChallenge`, `Expired`, `TooManyAttempts`, `InvalidCode`, or `Internal`.
    #[instrument(skip(self, email, candidate, ctx))]
    pub async fn verify(
        &self,
        email: &str,
        candidate: &str,
        ctx: &RequestContext,
    ) -> Result<(), OtpError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let Some(recipient) = OtpRepo::lock_recipient(&mut *tx, email).await? else {
            return Err(OtpError::NoActiveChallenge);
        };
        let user_id = recipient.user_id;
        let challenge = OtpRepo::challenge_for_update(&mut *tx, user_id)
            .await?
            .ok_or(OtpError::NoActiveChallenge)?;

        match challenge.state(now) {
            ChallengeState::Expired => {
                OtpRepo::delete_challenge(&mut *tx, user_id).await?;
                self.ledger
                    .record(
                        &mut *tx,
                        AuditRecord::new(user_id, AuditAction::OtpExpired, json!({}))
                            .with_ip_address(ctx.ip()),
                    )
                    .await?;
                tx.commit().await?;
                warn!(%user_id, "otp verification against an expired code");
                return Err(OtpError::Expired);
            }
            ChallengeState::Exhausted => {
                warn!(%user_id, "otp attempt ceiling reached");
                return Err(OtpError::TooManyAttempts);
            }
            ChallengeState::Active => {}
        }

        let candidate = candidate.trim();
        let matched = crypto::is_well_formed(candidate)
            && self.hasher.verify(candidate, &challenge.code_hash)?;

        if matched {
            OtpRepo::delete_challenge(&mut *tx, user_id).await?;
            OtpRepo::touch_last_used(&mut *tx, user_id, now).await?;
            self.ledger
                .record(
                    &mut *tx,
                    AuditRecord::new(user_id, AuditAction::OtpVerified, json!({}))
                        .with_ip_address(ctx.ip()),
                )
                .await?;
            tx.commit().await?;
            info!(%user_id, "otp verified");
            return Ok(());
        }

        let attempts = OtpRepo::increment_attempts(&mut *tx, user_id).await?;
        self.ledger
            .record(
                &mut *tx,
                AuditRecord::new(user_id, AuditAction::OtpFailed, json!({ "attempts": attempts }))
                    .with_ip_address(ctx.ip()),
            )
            .await?;
        tx.commit().await?;
        warn!(%user_id, "otp mismatch");
        Err(OtpError::InvalidCode)
    }
}
