//! Self-service biometric endpoints.
//!
//! Flow Overview:
//! 1) Authenticate via bearer session.
//! 2) Translate the body into a service input for the authenticated user.
//! 3) Map the outcome or typed error to a response.

use axum::{
    Json,
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use sqlx::PgPool;

use super::{
    biometric_error_response, missing_payload,
    principal::require_auth,
    request_context,
    types::{
        DeleteResponse, ErrorResponse, LimitQuery, RegisterRequest, RegisterResponse,
        RotateRequest, RotateResponse, StatusResponse, VerifyRequest, VerifyResponse,
    },
};
use crate::biometric::{
    BiometricService,
    models::{RegisterInput, RotateInput, VerifyInput},
};

const DEFAULT_RECENT_ATTEMPTS: i64 = 10;

#[utoipa::path(
    post,
    path = "/v1/biometric/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Face profile registered.", body = RegisterResponse),
        (status = 400, description = "Missing consent or invalid template, quality or device info.", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 404, description = "User not found.", body = ErrorResponse),
        (status = 409, description = "Face profile already exists.", body = ErrorResponse),
        (status = 423, description = "Biometric access is locked.", body = ErrorResponse)
    ),
    tag = "biometric"
)]
pub async fn register(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    payload: Option<Json<RegisterRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return missing_payload();
    };

    let input = RegisterInput {
        template: request.face_template,
        device_info: request.device_info,
        quality_score: request.quality_score,
        consent_given: request.consent_given,
    };
    match service
        .register(principal.user_id, input, &request_context(&headers))
        .await
    {
        Ok(registration) => (
            StatusCode::CREATED,
            Json(RegisterResponse {
                profile_id: registration.profile_id,
                registered_at: registration.registered_at,
            }),
        )
            .into_response(),
        Err(err) => biometric_error_response(&err),
    }
}

/// A completed comparison is always 200; `success` carries the verdict.
#[utoipa::path(
    post,
    path = "/v1/biometric/verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Comparison completed, see success and reason.", body = VerifyResponse),
        (status = 400, description = "Invalid template, scores or device info.", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 404, description = "No face profile registered.", body = ErrorResponse),
        (status = 409, description = "Profile changed during verification.", body = ErrorResponse),
        (status = 423, description = "Biometric access is locked.", body = ErrorResponse),
        (status = 429, description = "Too many verification attempts.", body = ErrorResponse),
        (status = 500, description = "Stored template could not be used.", body = ErrorResponse)
    ),
    tag = "biometric"
)]
pub async fn verify(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    payload: Option<Json<VerifyRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return missing_payload();
    };

    let input = VerifyInput {
        template: request.face_template,
        liveness_detected: request.liveness_detected,
        liveness_score: request.liveness_score,
        verification_type: request.verification_type,
        shift_id: request.shift_id,
        device_info: request.device_info,
        quality_score: request.quality_score,
        lighting: request.lighting,
    };
    match service
        .verify(principal.user_id, input, &request_context(&headers))
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(VerifyResponse::from(outcome))).into_response(),
        Err(err) => biometric_error_response(&err),
    }
}

#[utoipa::path(
    put,
    path = "/v1/biometric/template",
    request_body = RotateRequest,
    responses(
        (status = 200, description = "Template replaced.", body = RotateResponse),
        (status = 400, description = "Invalid template, quality or device info.", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 404, description = "No face profile registered.", body = ErrorResponse),
        (status = 423, description = "Biometric access is locked.", body = ErrorResponse)
    ),
    tag = "biometric"
)]
pub async fn rotate_template(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    payload: Option<Json<RotateRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return missing_payload();
    };

    let input = RotateInput {
        template: request.face_template,
        device_info: request.device_info,
        quality_score: request.quality_score,
    };
    match service
        .rotate(principal.user_id, input, &request_context(&headers))
        .await
    {
        Ok(updated_at) => (StatusCode::OK, Json(RotateResponse { updated_at })).into_response(),
        Err(err) => biometric_error_response(&err),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/biometric/profile",
    responses(
        (status = 200, description = "Face profile deactivated.", body = DeleteResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 404, description = "No face profile registered.", body = ErrorResponse)
    ),
    tag = "biometric"
)]
pub async fn delete_profile(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    match service
        .deactivate(
            principal.user_id,
            principal.user_id,
            &request_context(&headers),
        )
        .await
    {
        Ok(deactivated_at) => {
            (StatusCode::OK, Json(DeleteResponse { deactivated_at })).into_response()
        }
        Err(err) => biometric_error_response(&err),
    }
}

#[utoipa::path(
    get,
    path = "/v1/biometric/status",
    params(LimitQuery),
    responses(
        (status = 200, description = "Enrollment state and recent attempts.", body = StatusResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 404, description = "User not found.", body = ErrorResponse)
    ),
    tag = "biometric"
)]
pub async fn status(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let status = match service.status(principal.user_id).await {
        Ok(status) => status,
        Err(err) => return biometric_error_response(&err),
    };
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_ATTEMPTS);
    match service.recent_attempts(principal.user_id, limit).await {
        Ok(attempts) => (StatusCode::OK, Json(StatusResponse::new(status, attempts))).into_response(),
        Err(err) => biometric_error_response(&err),
    }
}
