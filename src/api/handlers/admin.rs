//! Admin endpoints scoped to the admin's own company.
//!
//! Role and tenant checks live in the service so every caller gets them.

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    biometric_error_response, missing_payload,
    principal::require_auth,
    request_context,
    types::{
        AuditListResponse, DeviceResponse, DeviceUpdateRequest, ErrorResponse, LimitQuery,
        UnlockResponse,
    },
};
use crate::biometric::BiometricService;

const DEFAULT_AUDIT_LIMIT: i64 = 50;

#[utoipa::path(
    post,
    path = "/v1/admin/users/{user_id}/unlock",
    params(("user_id" = Uuid, Path, description = "User to unlock")),
    responses(
        (status = 200, description = "Lock and failure counter cleared.", body = UnlockResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 403, description = "Caller is not an admin of the user's company.", body = ErrorResponse),
        (status = 404, description = "User not found.", body = ErrorResponse)
    ),
    tag = "admin"
)]
pub async fn unlock_user(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    Path(user_id): Path<Uuid>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    match service
        .unlock(&principal.actor(), user_id, &request_context(&headers))
        .await
    {
        Ok(unlocked_at) => (StatusCode::OK, Json(UnlockResponse { unlocked_at })).into_response(),
        Err(err) => biometric_error_response(&err),
    }
}

#[utoipa::path(
    put,
    path = "/v1/admin/users/{user_id}/devices/{fingerprint}",
    params(
        ("user_id" = Uuid, Path, description = "Device owner"),
        ("fingerprint" = String, Path, description = "Device fingerprint (hex)")
    ),
    request_body = DeviceUpdateRequest,
    responses(
        (status = 200, description = "Device standing updated.", body = DeviceResponse),
        (status = 400, description = "Unknown action or invalid block reason.", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 403, description = "Caller is not an admin of the user's company.", body = ErrorResponse),
        (status = 404, description = "User or device not found.", body = ErrorResponse)
    ),
    tag = "admin"
)]
pub async fn update_device(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    Path((user_id, fingerprint)): Path<(Uuid, String)>,
    payload: Option<Json<DeviceUpdateRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return missing_payload();
    };

    match service
        .update_device(
            &principal.actor(),
            user_id,
            &fingerprint,
            request.into_update(),
            &request_context(&headers),
        )
        .await
    {
        Ok(assessment) => (
            StatusCode::OK,
            Json(DeviceResponse::new(fingerprint, &assessment)),
        )
            .into_response(),
        Err(err) => biometric_error_response(&err),
    }
}

#[utoipa::path(
    get,
    path = "/v1/admin/users/{user_id}/audit",
    params(
        ("user_id" = Uuid, Path, description = "Subject of the audit entries"),
        LimitQuery
    ),
    responses(
        (status = 200, description = "Most recent audit entries first.", body = AuditListResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 403, description = "Caller is not an admin of the user's company.", body = ErrorResponse),
        (status = 404, description = "User not found.", body = ErrorResponse)
    ),
    tag = "admin"
)]
pub async fn list_audit(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
    match service
        .audit_entries(&principal.actor(), user_id, limit, &request_context(&headers))
        .await
    {
        Ok(entries) => (StatusCode::OK, Json(AuditListResponse { entries })).into_response(),
        Err(err) => biometric_error_response(&err),
    }
}
