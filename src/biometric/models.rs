use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, postgres::PgRow};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{error::BiometricError, lockout::LockState};

const MAX_DEVICE_FIELD_LEN: usize = 256;

fn decode_error(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid {column} value: {value}"),
    )))
}

/// Kind of row in the verification ledger.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptType {
    Registration,
    Update,
    Start,
    End,
    Test,
}

impl AttemptType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Update => "update",
            Self::Start => "start",
            Self::End => "end",
            Self::Test => "test",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "registration" => Ok(Self::Registration),
            "update" => Ok(Self::Update),
            "start" => Ok(Self::Start),
            "end" => Ok(Self::End),
            "test" => Ok(Self::Test),
            _ => Err(decode_error("verification_attempts.attempt_type", value)),
        }
    }
}

/// Attempt kinds a client may request when verifying.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    Start,
    End,
    Test,
}

impl From<VerificationType> for AttemptType {
    fn from(value: VerificationType) -> Self {
        match value {
            VerificationType::Start => Self::Start,
            VerificationType::End => Self::End,
            VerificationType::Test => Self::Test,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Lighting {
    Good,
    Low,
    Bright,
    Backlit,
}

impl Lighting {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Low => "low",
            Self::Bright => "bright",
            Self::Backlit => "backlit",
        }
    }
}

/// Coarse reason returned for an unsuccessful verification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    FaceMismatch,
    LivenessFailed,
    DeviceBlocked,
    /// The stored template could not be decrypted or compared.
    IntegrityFault,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FaceMismatch => "face_mismatch",
            Self::LivenessFailed => "liveness_failed",
            Self::DeviceBlocked => "device_blocked",
            Self::IntegrityFault => "integrity_fault",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Employee,
    Manager,
    Admin,
    SuperAdmin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Manager => "manager",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "employee" => Ok(Self::Employee),
            "manager" => Ok(Self::Manager),
            "admin" => Ok(Self::Admin),
            "super_admin" => Ok(Self::SuperAdmin),
            _ => Err(decode_error("users.role", value)),
        }
    }

    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }
}

/// Device characteristics reported by the client. All fields are optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub platform: Option<String>,
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub screen_resolution: Option<String>,
    pub user_agent: Option<String>,
}

impl DeviceInfo {
    /// # Errors
    /// Returns `BiometricError::InvalidDeviceInfo` for oversized fields or
    /// fields containing control characters.
    pub fn validate(&self) -> Result<(), BiometricError> {
        let fields = [
            &self.platform,
            &self.model,
            &self.os_version,
            &self.app_version,
            &self.locale,
            &self.timezone,
            &self.screen_resolution,
            &self.user_agent,
        ];
        for value in fields.into_iter().flatten() {
            if value.len() > MAX_DEVICE_FIELD_LEN || value.chars().any(char::is_control) {
                return Err(BiometricError::InvalidDeviceInfo);
            }
        }
        Ok(())
    }
}

/// Stored face profile. Template material stays encrypted.
#[derive(Clone, Debug)]
pub struct FaceProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub template_hash: Vec<u8>,
    pub template_ciphertext: Vec<u8>,
    pub template_dim: i32,
    pub wrapped_key: String,
    pub key_custody: String,
    pub template_version: i32,
    pub quality_score: f64,
    pub is_active: bool,
    pub total_verifications: i64,
    pub successful_verifications: i64,
    pub last_verification_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for FaceProfile {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            template_hash: row.try_get("template_hash")?,
            template_ciphertext: row.try_get("template_ciphertext")?,
            template_dim: row.try_get("template_dim")?,
            wrapped_key: row.try_get("wrapped_key")?,
            key_custody: row.try_get("key_custody")?,
            template_version: row.try_get("template_version")?,
            quality_score: row.try_get("quality_score")?,
            is_active: row.try_get("is_active")?,
            total_verifications: row.try_get("total_verifications")?,
            successful_verifications: row.try_get("successful_verifications")?,
            last_verification_at: row.try_get("last_verification_at")?,
            registered_at: row.try_get("registered_at")?,
            updated_at: row.try_get("updated_at")?,
            deactivated_at: row.try_get("deactivated_at")?,
        })
    }
}

/// User row fields the biometric flows depend on.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub company_id: Uuid,
    pub role: Role,
    pub biometric_enabled: bool,
    pub biometric_registered: bool,
    pub lock: LockState,
}

impl<'r> FromRow<'r, PgRow> for UserRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            company_id: row.try_get("company_id")?,
            role: Role::from_db(&role)?,
            biometric_enabled: row.try_get("biometric_enabled")?,
            biometric_registered: row.try_get("biometric_registered")?,
            lock: LockState {
                failed_attempts: row.try_get("failed_biometric_attempts")?,
                locked_until: row.try_get("biometric_locked_until")?,
            },
        })
    }
}

/// Ledger row as returned to clients. Never carries template material.
#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerificationAttempt {
    pub id: Uuid,
    pub attempt_type: AttemptType,
    pub shift_id: Option<Uuid>,
    pub success: bool,
    pub confidence: Option<f64>,
    pub liveness_detected: Option<bool>,
    pub liveness_score: Option<f64>,
    pub quality_score: Option<f64>,
    pub lighting: Option<String>,
    pub failure_reason: Option<String>,
    pub device_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for VerificationAttempt {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let attempt_type: String = row.try_get("attempt_type")?;
        Ok(Self {
            id: row.try_get("id")?,
            attempt_type: AttemptType::from_db(&attempt_type)?,
            shift_id: row.try_get("shift_id")?,
            success: row.try_get("success")?,
            confidence: row.try_get("confidence")?,
            liveness_detected: row.try_get("liveness_detected")?,
            liveness_score: row.try_get("liveness_score")?,
            quality_score: row.try_get("quality_score")?,
            lighting: row.try_get("lighting")?,
            failure_reason: row.try_get("failure_reason")?,
            device_fingerprint: row.try_get("device_fingerprint")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Who is acting and on behalf of which tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub role: Role,
}

/// Request metadata recorded alongside ledger rows.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub ip_address: Option<String>,
}

impl RequestContext {
    /// Keep the address only if Postgres `INET` will accept it.
    #[must_use]
    pub fn new(ip_address: Option<String>) -> Self {
        let ip_address = ip_address.filter(|ip| ip.parse::<std::net::IpAddr>().is_ok());
        Self { ip_address }
    }

    pub(crate) fn ip(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }
}

#[derive(Clone, Debug)]
pub struct RegisterInput {
    pub template: Vec<f32>,
    pub device_info: DeviceInfo,
    pub quality_score: f64,
    pub consent_given: bool,
}

#[derive(Clone, Debug)]
pub struct RotateInput {
    pub template: Vec<f32>,
    pub device_info: DeviceInfo,
    pub quality_score: f64,
}

#[derive(Clone, Debug)]
pub struct VerifyInput {
    pub template: Vec<f32>,
    pub liveness_detected: bool,
    pub liveness_score: f64,
    pub verification_type: VerificationType,
    pub shift_id: Option<Uuid>,
    pub device_info: DeviceInfo,
    pub quality_score: f64,
    pub lighting: Option<Lighting>,
}

#[derive(Clone, Debug)]
pub struct Registration {
    pub profile_id: Uuid,
    pub registered_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct VerificationOutcome {
    pub verification_id: Uuid,
    pub success: bool,
    pub confidence: f64,
    pub high_confidence: bool,
    pub liveness_score: f64,
    pub failure_reason: Option<FailureReason>,
}

#[derive(Clone, Debug)]
pub struct ProfileStatus {
    pub registered: bool,
    pub enabled: bool,
    pub active: bool,
    pub total_verifications: i64,
    pub successful_verifications: i64,
    pub quality_score: Option<f64>,
    pub last_verification_at: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
    pub locked: bool,
}

/// Privileged change to a device's standing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceUpdate {
    Trust,
    Untrust,
    Block { reason: Option<String> },
    Unblock,
}

/// Client-originated telemetry describing a capture session.
#[derive(Clone, Debug)]
pub struct AuditTrailInput {
    pub subject_user_id: Uuid,
    pub session_id: String,
    pub steps: Vec<serde_json::Value>,
    pub events: Vec<serde_json::Value>,
}

/// A verification captured while the device was offline.
#[derive(Clone, Debug)]
pub struct OfflineSyncInput {
    pub subject_user_id: Uuid,
    pub offline_id: String,
    pub captured_at: DateTime<Utc>,
    pub captures: Vec<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct OfflineSyncReceipt {
    pub audit_id: Uuid,
    pub offline_id: String,
    pub replayed: bool,
}

pub(crate) fn validate_unit_score(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_type_roundtrips_through_db_text() {
        for kind in [
            AttemptType::Registration,
            AttemptType::Update,
            AttemptType::Start,
            AttemptType::End,
            AttemptType::Test,
        ] {
            assert!(matches!(AttemptType::from_db(kind.as_str()), Ok(k) if k == kind));
        }
        assert!(AttemptType::from_db("checkin").is_err());
    }

    #[test]
    fn verification_types_map_to_attempt_types() {
        assert_eq!(AttemptType::from(VerificationType::End), AttemptType::End);
    }

    #[test]
    fn failure_reasons_match_their_wire_names() {
        for reason in [
            FailureReason::FaceMismatch,
            FailureReason::LivenessFailed,
            FailureReason::DeviceBlocked,
            FailureReason::IntegrityFault,
        ] {
            assert_eq!(
                serde_json::to_value(reason).ok(),
                Some(serde_json::Value::from(reason.as_str()))
            );
        }
    }

    #[test]
    fn only_admins_are_privileged() {
        assert!(Role::Admin.is_admin());
        assert!(Role::SuperAdmin.is_admin());
        assert!(!Role::Manager.is_admin());
        assert!(!Role::Employee.is_admin());
        assert!(Role::from_db("root").is_err());
    }

    #[test]
    fn device_info_rejects_oversized_or_control_fields() {
        let ok = DeviceInfo {
            platform: Some("android".to_string()),
            ..DeviceInfo::default()
        };
        assert!(ok.validate().is_ok());

        let long = DeviceInfo {
            model: Some("x".repeat(MAX_DEVICE_FIELD_LEN + 1)),
            ..DeviceInfo::default()
        };
        assert!(matches!(
            long.validate(),
            Err(BiometricError::InvalidDeviceInfo)
        ));

        let control = DeviceInfo {
            user_agent: Some("agent\u{0}".to_string()),
            ..DeviceInfo::default()
        };
        assert!(control.validate().is_err());
    }

    #[test]
    fn device_info_uses_camel_case() {
        let info: DeviceInfo = serde_json::from_str(
            r#"{"platform":"ios","screenResolution":"1170x2532","userAgent":"shiftgate/1"}"#,
        )
        .unwrap_or_default();
        assert_eq!(info.screen_resolution.as_deref(), Some("1170x2532"));
        assert_eq!(info.user_agent.as_deref(), Some("shiftgate/1"));
    }

    #[test]
    fn request_context_drops_unparseable_addresses() {
        assert_eq!(
            RequestContext::new(Some("203.0.113.7".to_string())).ip(),
            Some("203.0.113.7")
        );
        assert_eq!(RequestContext::new(Some("unknown".to_string())).ip(), None);
    }

    #[test]
    fn unit_scores() {
        assert!(validate_unit_score(0.0));
        assert!(validate_unit_score(1.0));
        assert!(!validate_unit_score(1.01));
        assert!(!validate_unit_score(-0.1));
        assert!(!validate_unit_score(f64::NAN));
    }
}
