use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use kicho_core::{CreatePartnerCommand, Partner, Role, UpdatePartnerCommand};

use crate::auth::CallerIdentity;

use super::{require_role, ApiError, AppState};

pub async fn create(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Json(command): Json<CreatePartnerCommand>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    command.validate()?;
    let partner = state.storage.create_partner(org_id, &command)?;
    tracing::info!(org_id = %org_id, code = %partner.code, "Partner created");
    Ok((StatusCode::CREATED, Json(partner)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<Partner>>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(state.storage.list_partners(org_id)?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, partner_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Partner>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(state.storage.get_partner(org_id, partner_id)?))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, partner_id)): Path<(Uuid, Uuid)>,
    Json(command): Json<UpdatePartnerCommand>,
) -> Result<Json<Partner>, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    Ok(Json(state.storage.update_partner(org_id, partner_id, &command)?))
}

pub async fn deactivate(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, partner_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    state.storage.deactivate_partner(org_id, partner_id)?;
    Ok(StatusCode::NO_CONTENT)
}
