use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use kicho_core::Session;

use crate::{api::AppState, storage::StorageError};

/// Authenticated caller identity, available to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Serialize)]
struct AuthErrorBody {
    success: bool,
    error: String,
}

pub fn hash_password(password: &str) -> Result<String, StorageError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| StorageError::Other(format!("Failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Create and persist a session for the user. The token is an opaque
/// random value handed back as a bearer token.
pub fn issue_session(
    state: &AppState,
    user_id: Uuid,
) -> Result<Session, StorageError> {
    let now = OffsetDateTime::now_utc();
    state.storage.purge_expired_sessions(now)?;
    let session = Session {
        token: Uuid::new_v4().simple().to_string(),
        user_id,
        created_at: now,
        expires_at: now + Duration::hours(state.config.auth.session_ttl_hours as i64),
    };
    state.storage.insert_session(&session)?;
    Ok(session)
}

pub fn token_from_headers(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get("X-API-Key")
        .or_else(|| headers.get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s))
}

fn bearer_token<B>(req: &Request<B>) -> Option<&str> {
    token_from_headers(req.headers())
}

pub async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    let token = match bearer_token(&req) {
        Some(t) => t.to_string(),
        None => {
            return unauthorized("Missing session token. Provide Authorization: Bearer <token>");
        }
    };

    let now = OffsetDateTime::now_utc();
    let session = match state.storage.find_session(&token, now) {
        Ok(Some(s)) => s,
        Ok(None) => {
            tracing::warn!("Invalid or expired session token presented");
            return unauthorized("Invalid or expired session token");
        }
        Err(e) => {
            tracing::error!(error = %e, "Session lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AuthErrorBody {
                    success: false,
                    error: "Internal error".to_string(),
                }),
            )
                .into_response();
        }
    };

    match state.storage.get_user(session.user_id) {
        Ok(user) => {
            tracing::debug!(caller = %user.email, "Authenticated request");
            req.extensions_mut().insert(CallerIdentity {
                user_id: user.id,
                email: user.email,
            });
            next.run(req).await
        }
        Err(_) => unauthorized("Session user no longer exists"),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(AuthErrorBody {
            success: false,
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_roundtrip() {
        let hash = hash_password("kaikei-2024").unwrap();
        assert!(verify_password("kaikei-2024", &hash));
        assert!(!verify_password("kaikei-2025", &hash));
    }

    #[test]
    fn test_garbage_hash_rejected() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }
}
