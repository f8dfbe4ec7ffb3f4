//! Authenticated principal extraction.
//!
//! Flow Overview: read the bearer token, hash it, resolve the session to a
//! user and return the principal handlers act as. Sessions are minted by the
//! outer application; this service only reads them.

use anyhow::{Context, Result};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tracing::{Instrument, error, info_span};
use uuid::Uuid;

use crate::biometric::models::{Actor, Role};

/// Authenticated user context derived from the bearer token.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub company_id: Uuid,
    pub role: Role,
}

impl Principal {
    #[must_use]
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id,
            company_id: self.company_id,
            role: self.role,
        }
    }
}

/// Resolve a bearer token into a principal, or return 401 for missing or expired sessions.
pub async fn require_auth(headers: &HeaderMap, pool: &PgPool) -> Result<Principal, StatusCode> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let token_hash = hash_session_token(&token);
    match lookup_session(pool, &token_hash).await {
        Ok(Some(principal)) => Ok(principal),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("Failed to lookup session: {err:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Hash a session token so raw values never touch the database.
pub(crate) fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn lookup_session(pool: &PgPool, token_hash: &[u8]) -> Result<Option<Principal>> {
    let query = r"
        SELECT u.id, u.email, u.company_id, u.role
        FROM user_sessions s
        JOIN users u ON u.id = s.user_id
        WHERE s.token_hash = $1 AND s.expires_at > NOW()
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("Failed to lookup session")?;
    let Some(row) = row else {
        return Ok(None);
    };
    let role: String = row.try_get("role")?;
    Ok(Some(Principal {
        user_id: row.try_get("id")?,
        email: row.try_get("email")?,
        company_id: row.try_get("company_id")?,
        role: Role::from_db(&role)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  abc123 "));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer xyz"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("xyz"));
    }

    #[test]
    fn non_bearer_or_empty_tokens_are_rejected() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert!(extract_bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer    "));
        assert!(extract_bearer_token(&headers).is_none());
    }

    #[test]
    fn session_hash_is_sha256() {
        let hash = hash_session_token("token");
        assert_eq!(hash.len(), 32);
        assert_eq!(
            hex::encode(&hash),
            "3c469e9d6c5875d37a43f353d4f88e61fcf812c66eee3457465a40b0da4153e0"
        );
    }

    #[test]
    fn principal_becomes_actor() {
        let principal = Principal {
            user_id: Uuid::new_v4(),
            email: "ada@shiftgate.dev".to_string(),
            company_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        let actor = principal.actor();
        assert_eq!(actor.user_id, principal.user_id);
        assert_eq!(actor.company_id, principal.company_id);
        assert_eq!(actor.role, Role::Admin);
    }
}
