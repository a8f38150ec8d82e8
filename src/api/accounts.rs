use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use kicho_core::{Account, CreateAccountCommand, Role, UpdateAccountCommand};

use crate::auth::CallerIdentity;

use super::{require_role, ApiError, AppState};

pub async fn create(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Json(command): Json<CreateAccountCommand>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    command.validate()?;
    let account = state.storage.create_account(org_id, &command)?;
    tracing::info!(org_id = %org_id, code = %account.code, "Account created");
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<Account>>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(state.storage.list_accounts(org_id)?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, account_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Account>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(state.storage.get_account(org_id, account_id)?))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, account_id)): Path<(Uuid, Uuid)>,
    Json(command): Json<UpdateAccountCommand>,
) -> Result<Json<Account>, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    Ok(Json(state.storage.update_account(org_id, account_id, &command)?))
}

/// Accounts referenced by journal lines are never hard-deleted, only
/// deactivated so history stays intact.
pub async fn deactivate(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, account_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    state.storage.deactivate_account(org_id, account_id)?;
    Ok(StatusCode::NO_CONTENT)
}
