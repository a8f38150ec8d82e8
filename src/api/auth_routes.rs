use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use kicho_core::{CreateUserCommand, User};

use crate::auth::{self, CallerIdentity};

use super::{ApiError, AppState};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub display_name: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: User,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config.auth.registration_open {
        return Err(ApiError::Forbidden);
    }
    if body.email.trim().is_empty() || !body.email.contains('@') {
        return Err(ApiError::Validation("A valid email address is required".to_string()));
    }
    if body.password.chars().count() < 8 {
        return Err(ApiError::Validation(
            "Password must be at least 8 characters".to_string(),
        ));
    }
    let command = CreateUserCommand {
        email: body.email.trim().to_lowercase(),
        display_name: body.display_name.trim().to_string(),
        password_hash: auth::hash_password(&body.password)?,
    };
    let user = state.storage.create_user(&command)?;
    tracing::info!(user_id = %user.id, "User registered");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .storage
        .find_user_by_email(&body.email.trim().to_lowercase())?;
    let user = match user {
        Some(u) if auth::verify_password(&body.password, &u.password_hash) => u,
        _ => {
            tracing::warn!("Failed login attempt");
            return Err(ApiError::Unauthorized);
        }
    };
    let session = auth::issue_session(&state, user.id)?;
    metrics::counter!("kicho_logins", 1);
    tracing::info!(user_id = %user.id, "User logged in");
    Ok(Json(LoginResponse {
        token: session.token,
        expires_at: session.expires_at,
        user,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(token) = auth::token_from_headers(&headers) {
        state.storage.delete_session(token)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Json<User>, ApiError> {
    let user = state.storage.get_user(caller.user_id)?;
    Ok(Json(user))
}
