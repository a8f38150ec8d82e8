use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use kicho_core::{AccountingPeriod, CreatePeriodCommand, Role};

use crate::auth::CallerIdentity;

use super::{require_role, ApiError, AppState};

pub async fn create(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Json(command): Json<CreatePeriodCommand>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    command.validate()?;
    let period = state.storage.create_period(org_id, &command)?;
    tracing::info!(org_id = %org_id, period = %period.name, "Accounting period created");
    Ok((StatusCode::CREATED, Json(period)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<AccountingPeriod>>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(state.storage.list_periods(org_id)?))
}

/// Closing a period freezes every journal entry dated inside it.
pub async fn close(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, period_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<AccountingPeriod>, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    let period = state.storage.set_period_closed(org_id, period_id, true)?;
    tracing::info!(org_id = %org_id, period = %period.name, "Accounting period closed");
    Ok(Json(period))
}

pub async fn reopen(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, period_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<AccountingPeriod>, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    let period = state.storage.set_period_closed(org_id, period_id, false)?;
    tracing::info!(org_id = %org_id, period = %period.name, "Accounting period reopened");
    Ok(Json(period))
}
