//! API handlers and shared helpers.
//!
//! Handlers resolve the principal, translate the JSON body into a domain
//! input, call the service, and map typed errors to a status plus a generic
//! message. Internal error detail is logged here and never returned.

pub mod admin;
pub mod biometric;
pub mod client_audit;
pub mod health;
pub mod otp;
pub mod principal;
pub mod types;

use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use regex::Regex;
use tracing::{error, warn};

use crate::{
    biometric::{BiometricError, models::RequestContext},
    otp::OtpError,
};
use types::ErrorResponse;

/// Lightweight email sanity check before touching the database.
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

/// Extract a client IP from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn request_context(headers: &HeaderMap) -> RequestContext {
    RequestContext::new(extract_client_ip(headers))
}

pub(crate) fn error_body(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

pub(crate) fn missing_payload() -> Response {
    error_body(StatusCode::BAD_REQUEST, "missing_fields", "Missing payload")
}

pub(crate) fn biometric_error_response(err: &BiometricError) -> Response {
    let (status, message) = err.status_and_message();
    match err {
        BiometricError::Internal(inner) => error!("Biometric operation failed: {inner:#}"),
        err if err.is_integrity_fault() => error!("Biometric integrity fault: {err}"),
        err if status.is_server_error() => error!("Biometric operation failed: {err}"),
        err => warn!(code = err.code(), "Biometric request rejected"),
    }
    error_body(status, err.code(), message)
}

pub(crate) fn otp_error_response(err: &OtpError) -> Response {
    let (status, message) = err.status_and_message();
    match err {
        OtpError::Internal(inner) => error!("OTP operation failed: {inner:#}"),
        err => warn!(code = err.code(), "OTP request rejected"),
    }
    error_body(status, err.code(), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("198.51.100.7"));
        assert!(extract_client_ip(&HeaderMap::new()).is_none());
    }

    #[test]
    fn unparseable_addresses_are_dropped_from_context() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("unknown"));
        assert!(request_context(&headers).ip_address.is_none());
    }

    #[test]
    fn valid_email_shapes() {
        assert!(valid_email("ada@shiftgate.dev"));
        assert!(!valid_email("ada@shiftgate"));
        assert!(!valid_email("ada shiftgate.dev"));
    }

    #[test]
    fn biometric_errors_keep_their_status() {
        let response = biometric_error_response(&BiometricError::AccountLocked);
        assert_eq!(response.status(), StatusCode::LOCKED);

        let response =
            biometric_error_response(&BiometricError::Internal(anyhow::anyhow!("db down")));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
