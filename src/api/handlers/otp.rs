//! One-time code fallback for users who cannot complete a face verification.
//!
//! Flow Overview:
//! 1) `issue` stores a hashed code for the email and delivers it out-of-band.
//! 2) `verify` consumes the code once; failures count toward the attempt cap.
//!
//! The code itself is never part of a response.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use super::{
    error_body, missing_payload, otp_error_response, request_context,
    types::{ErrorResponse, OtpIssueRequest, OtpIssueResponse, OtpVerifyRequest, OtpVerifyResponse},
    valid_email,
};
use crate::otp::OtpService;

fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    valid_email(&email).then_some(email)
}

fn invalid_email() -> Response {
    error_body(StatusCode::BAD_REQUEST, "invalid_email", "Invalid email")
}

#[utoipa::path(
    post,
    path = "/v1/otp/issue",
    request_body = OtpIssueRequest,
    responses(
        (status = 201, description = "Code issued and sent.", body = OtpIssueResponse),
        (status = 400, description = "Invalid email.", body = ErrorResponse),
        (status = 404, description = "User not found.", body = ErrorResponse)
    ),
    tag = "otp"
)]
pub async fn issue(
    headers: HeaderMap,
    service: Extension<OtpService>,
    payload: Option<Json<OtpIssueRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let Some(email) = normalize_email(&request.email) else {
        return invalid_email();
    };

    match service.issue(&email, &request_context(&headers)).await {
        Ok(issued) => (
            StatusCode::CREATED,
            Json(OtpIssueResponse {
                expires_at: issued.expires_at,
            }),
        )
            .into_response(),
        Err(err) => otp_error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/otp/verify",
    request_body = OtpVerifyRequest,
    responses(
        (status = 200, description = "Code accepted and consumed.", body = OtpVerifyResponse),
        (status = 400, description = "Invalid email or no active code.", body = ErrorResponse),
        (status = 401, description = "Code does not match.", body = ErrorResponse),
        (status = 410, description = "Code expired.", body = ErrorResponse),
        (status = 429, description = "Too many attempts.", body = ErrorResponse)
    ),
    tag = "otp"
)]
pub async fn verify(
    headers: HeaderMap,
    service: Extension<OtpService>,
    payload: Option<Json<OtpVerifyRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let Some(email) = normalize_email(&request.email) else {
        return invalid_email();
    };

    match service
        .verify(&email, request.code.trim(), &request_context(&headers))
        .await
    {
        Ok(()) => (StatusCode::OK, Json(OtpVerifyResponse { verified: true })).into_response(),
        Err(err) => otp_error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_trimmed_and_lowercased() {
        assert_eq!(
            normalize_email("  Ada@ShiftGate.dev ").as_deref(),
            Some("ada@shiftgate.dev")
        );
        assert!(normalize_email("not-an-email").is_none());
        assert!(normalize_email("").is_none());
    }
}
