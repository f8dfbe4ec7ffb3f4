//! Client-submitted telemetry: capture audit trails and offline verifications.
//!
//! Clients may only submit telemetry about their own user.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use sqlx::PgPool;

use super::{
    biometric_error_response, missing_payload,
    principal::require_auth,
    request_context,
    types::{
        AuditTrailRequest, AuditTrailResponse, ErrorResponse, OfflineSyncRequest,
        OfflineSyncResponse,
    },
};
use crate::biometric::{
    BiometricService,
    models::{AuditTrailInput, OfflineSyncInput},
};

#[utoipa::path(
    post,
    path = "/v1/biometric/audit-trail",
    request_body = AuditTrailRequest,
    responses(
        (status = 201, description = "Audit trail recorded.", body = AuditTrailResponse),
        (status = 400, description = "Missing session id or empty trail.", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 403, description = "Submitter is not the subject.", body = ErrorResponse)
    ),
    tag = "biometric"
)]
pub async fn audit_trail(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    payload: Option<Json<AuditTrailRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return missing_payload();
    };

    let input = AuditTrailInput {
        subject_user_id: request.user_id,
        session_id: request.session_id,
        steps: request.steps,
        events: request.events,
    };
    match service
        .append_audit_trail(principal.user_id, input, &request_context(&headers))
        .await
    {
        Ok(audit_id) => (StatusCode::CREATED, Json(AuditTrailResponse { audit_id })).into_response(),
        Err(err) => biometric_error_response(&err),
    }
}

/// Replays of a known `offlineId` return the original receipt with 200.
#[utoipa::path(
    post,
    path = "/v1/biometric/offline-sync",
    request_body = OfflineSyncRequest,
    responses(
        (status = 201, description = "Offline verification recorded.", body = OfflineSyncResponse),
        (status = 200, description = "Offline verification was already recorded.", body = OfflineSyncResponse),
        (status = 400, description = "Missing offline id or captures.", body = ErrorResponse),
        (status = 401, description = "Missing or invalid session."),
        (status = 403, description = "Submitter is not the subject.", body = ErrorResponse)
    ),
    tag = "biometric"
)]
pub async fn offline_sync(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    service: Extension<BiometricService>,
    payload: Option<Json<OfflineSyncRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    let Some(Json(request)) = payload else {
        return missing_payload();
    };

    let input = OfflineSyncInput {
        subject_user_id: request.user_id,
        offline_id: request.offline_id,
        captured_at: request.captured_at,
        captures: request.captures,
    };
    match service
        .sync_offline_attempt(principal.user_id, input, &request_context(&headers))
        .await
    {
        Ok(receipt) => {
            let status = if receipt.replayed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (
                status,
                Json(OfflineSyncResponse {
                    audit_id: receipt.audit_id,
                    offline_id: receipt.offline_id,
                    replayed: receipt.replayed,
                }),
            )
                .into_response()
        }
        Err(err) => biometric_error_response(&err),
    }
}
