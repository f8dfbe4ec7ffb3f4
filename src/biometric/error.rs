use axum::http::StatusCode;

use super::{codec::CodecError, matcher::MatchError};

/// Failure kinds surfaced by biometric operations.
///
/// A verification that runs to completion but does not match is not an error;
/// it is reported as an unsuccessful outcome with a failure reason.
#[derive(Debug, thiserror::Error)]
pub enum BiometricError {
    #[error("Biometric consent is required")]
    ConsentRequired,
    #[error("Quality score must be a number between 0 and 1")]
    InvalidQualityScore,
    #[error("Liveness score must be a number between 0 and 1")]
    InvalidLivenessScore,
    #[error("Invalid face template")]
    InvalidTemplate,
    #[error("Invalid device information")]
    InvalidDeviceInfo,
    #[error("Biometric verification is temporarily locked")]
    AccountLocked,
    #[error("Face profile already exists")]
    ProfileExists,
    #[error("Face profile not found")]
    ProfileNotFound,
    #[error("Face profile changed during verification")]
    ProfileChanged,
    #[error("Too many verification attempts")]
    RateLimitExceeded,
    #[error("User not found")]
    UserNotFound,
    #[error("Stored template could not be decrypted")]
    DecryptionFailure,
    #[error("Template dimensions do not match")]
    DimensionMismatch,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Cross-tenant access denied")]
    CrossTenantDenied,
    #[error("Missing required fields")]
    MissingFields,
    #[error("Access denied")]
    AccessDenied,
    #[error("Device not found")]
    DeviceNotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BiometricError {
    /// Stable machine-readable code returned to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConsentRequired => "consent_required",
            Self::InvalidQualityScore => "invalid_quality_score",
            Self::InvalidLivenessScore => "invalid_liveness_score",
            Self::InvalidTemplate => "invalid_template",
            Self::InvalidDeviceInfo => "invalid_device_info",
            Self::AccountLocked => "account_locked",
            Self::ProfileExists => "profile_exists",
            Self::ProfileNotFound => "profile_not_found",
            Self::ProfileChanged => "profile_changed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::UserNotFound => "user_not_found",
            Self::DecryptionFailure => "decryption_failure",
            Self::DimensionMismatch => "dimension_mismatch",
            Self::InsufficientPermissions => "insufficient_permissions",
            Self::CrossTenantDenied => "cross_tenant_denied",
            Self::MissingFields => "missing_fields",
            Self::AccessDenied => "access_denied",
            Self::DeviceNotFound => "device_not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status and client-safe message for this error.
    ///
    /// Internal details never leave the process; callers log them separately.
    #[must_use]
    pub fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            Self::ConsentRequired => (StatusCode::BAD_REQUEST, "Biometric consent is required"),
            Self::InvalidQualityScore => (
                StatusCode::BAD_REQUEST,
                "Quality score must be a number between 0 and 1",
            ),
            Self::InvalidLivenessScore => (
                StatusCode::BAD_REQUEST,
                "Liveness score must be a number between 0 and 1",
            ),
            Self::InvalidTemplate => (StatusCode::BAD_REQUEST, "Invalid face template"),
            Self::InvalidDeviceInfo => (StatusCode::BAD_REQUEST, "Invalid device information"),
            Self::MissingFields => (StatusCode::BAD_REQUEST, "Missing required fields"),
            Self::AccountLocked => (StatusCode::LOCKED, "Too many failed attempts, try later"),
            Self::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many verification attempts, try later",
            ),
            Self::ProfileExists => (StatusCode::CONFLICT, "Face profile already exists"),
            Self::ProfileChanged => (
                StatusCode::CONFLICT,
                "Face profile changed, retry the verification",
            ),
            Self::ProfileNotFound => (
                StatusCode::NOT_FOUND,
                "No face profile registered, register first",
            ),
            Self::UserNotFound => (StatusCode::NOT_FOUND, "User not found"),
            Self::DeviceNotFound => (StatusCode::NOT_FOUND, "Device not found"),
            Self::InsufficientPermissions => (StatusCode::FORBIDDEN, "Insufficient permissions"),
            Self::CrossTenantDenied => (StatusCode::FORBIDDEN, "Cross-tenant access denied"),
            Self::AccessDenied => (StatusCode::FORBIDDEN, "Access denied"),
            Self::DecryptionFailure | Self::DimensionMismatch => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Verification failed")
            }
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        }
    }

    /// Integrity faults are server-side and get logged with full detail.
    #[must_use]
    pub fn is_integrity_fault(&self) -> bool {
        matches!(self, Self::DecryptionFailure | Self::DimensionMismatch)
    }
}

impl From<sqlx::Error> for BiometricError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

impl From<CodecError> for BiometricError {
    fn from(_: CodecError) -> Self {
        Self::DecryptionFailure
    }
}

impl From<MatchError> for BiometricError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::DimensionMismatch { .. } => Self::DimensionMismatch,
            MatchError::EmptyTemplate
            | MatchError::TooLarge(_)
            | MatchError::NonFinite
            | MatchError::ZeroNorm
            | MatchError::Malformed => Self::InvalidTemplate,
        }
    }
}
