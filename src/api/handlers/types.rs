//! Request and response bodies. All JSON uses camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::biometric::{
    audit::AuditEntry,
    device::RiskAssessment,
    models::{
        DeviceInfo, DeviceUpdate, FailureReason, Lighting, ProfileStatus, VerificationAttempt,
        VerificationOutcome, VerificationType,
    },
};

/// Client-facing error body. `code` is stable, `message` is generic.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub face_template: Vec<f32>,
    #[serde(default)]
    pub device_info: DeviceInfo,
    pub quality_score: f64,
    #[serde(default)]
    pub consent_given: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub profile_id: Uuid,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub face_template: Vec<f32>,
    pub liveness_detected: bool,
    pub liveness_score: f64,
    pub verification_type: VerificationType,
    pub shift_id: Option<Uuid>,
    #[serde(default)]
    pub device_info: DeviceInfo,
    pub quality_score: f64,
    pub lighting: Option<Lighting>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub verification_id: Uuid,
    pub success: bool,
    pub confidence: f64,
    pub high_confidence: bool,
    pub liveness_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl From<VerificationOutcome> for VerifyResponse {
    fn from(outcome: VerificationOutcome) -> Self {
        Self {
            verification_id: outcome.verification_id,
            success: outcome.success,
            confidence: outcome.confidence,
            high_confidence: outcome.high_confidence,
            liveness_score: outcome.liveness_score,
            reason: outcome.failure_reason,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RotateRequest {
    pub face_template: Vec<f32>,
    #[serde(default)]
    pub device_info: DeviceInfo,
    pub quality_score: f64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RotateResponse {
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub deactivated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct LimitQuery {
    /// Maximum rows to return (1-100).
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub registered: bool,
    pub enabled: bool,
    pub active: bool,
    pub locked: bool,
    pub total_verifications: i64,
    pub successful_verifications: i64,
    pub success_rate: Option<f64>,
    pub quality_score: Option<f64>,
    pub last_verification_at: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
    pub recent_attempts: Vec<VerificationAttempt>,
}

impl StatusResponse {
    #[must_use]
    pub fn new(status: ProfileStatus, recent_attempts: Vec<VerificationAttempt>) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let success_rate = (status.total_verifications > 0).then(|| {
            status.successful_verifications as f64 / status.total_verifications as f64
        });
        Self {
            registered: status.registered,
            enabled: status.enabled,
            active: status.active,
            locked: status.locked,
            total_verifications: status.total_verifications,
            successful_verifications: status.successful_verifications,
            success_rate,
            quality_score: status.quality_score,
            last_verification_at: status.last_verification_at,
            registered_at: status.registered_at,
            recent_attempts,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrailRequest {
    pub user_id: Uuid,
    pub session_id: String,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub steps: Vec<Value>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub events: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrailResponse {
    pub audit_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSyncRequest {
    pub user_id: Uuid,
    pub offline_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub captures: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSyncResponse {
    pub audit_id: Uuid,
    pub offline_id: String,
    pub replayed: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnlockResponse {
    pub unlocked_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Trust,
    Untrust,
    Block,
    Unblock,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdateRequest {
    pub action: DeviceAction,
    pub reason: Option<String>,
}

impl DeviceUpdateRequest {
    #[must_use]
    pub fn into_update(self) -> DeviceUpdate {
        match self.action {
            DeviceAction::Trust => DeviceUpdate::Trust,
            DeviceAction::Untrust => DeviceUpdate::Untrust,
            DeviceAction::Block => DeviceUpdate::Block {
                reason: self.reason,
            },
            DeviceAction::Unblock => DeviceUpdate::Unblock,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub fingerprint: String,
    pub risk_score: i16,
    pub trusted: bool,
    pub blocked: bool,
}

impl DeviceResponse {
    #[must_use]
    pub fn new(fingerprint: String, assessment: &RiskAssessment) -> Self {
        Self {
            fingerprint,
            risk_score: assessment.risk_score,
            trusted: assessment.trusted,
            blocked: assessment.blocked,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditListResponse {
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OtpIssueRequest {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtpIssueResponse {
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OtpVerifyRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OtpVerifyResponse {
    pub verified: bool,
}
