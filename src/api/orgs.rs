use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kicho_core::{Organization, Role, User};

use crate::auth::CallerIdentity;

use super::{require_role, ApiError, AppState};

#[derive(Deserialize)]
pub struct CreateOrgRequest {
    pub name: String,
}

#[derive(Serialize)]
pub struct OrgWithRole {
    #[serde(flatten)]
    pub organization: Organization,
    pub role: Role,
}

#[derive(Serialize)]
pub struct MemberResponse {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: Role,
}

#[derive(Deserialize)]
pub struct UpsertMemberRequest {
    pub email: String,
    pub role: Role,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(body): Json<CreateOrgRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Organization name is required".to_string()));
    }
    let org = state.storage.create_organization(name, caller.user_id)?;
    tracing::info!(org_id = %org.id, owner = %caller.email, "Organization created");
    Ok((StatusCode::CREATED, Json(org)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Json<Vec<OrgWithRole>>, ApiError> {
    let orgs = state
        .storage
        .list_organizations_for_user(caller.user_id)?
        .into_iter()
        .map(|(organization, role)| OrgWithRole { organization, role })
        .collect();
    Ok(Json(orgs))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Organization>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(state.storage.get_organization(org_id)?))
}

pub async fn list_members(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<MemberResponse>>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    let members = state
        .storage
        .list_members(org_id)?
        .into_iter()
        .map(|(user, role)| member_response(user, role))
        .collect();
    Ok(Json(members))
}

pub async fn upsert_member(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Json(body): Json<UpsertMemberRequest>,
) -> Result<Json<MemberResponse>, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    let user = state
        .storage
        .find_user_by_email(&body.email.trim().to_lowercase())?
        .ok_or_else(|| ApiError::NotFound(format!("No user with email {}", body.email)))?;
    state.storage.upsert_member(org_id, user.id, body.role)?;
    tracing::info!(org_id = %org_id, member = %user.email, role = ?body.role, "Membership updated");
    Ok(Json(member_response(user, body.role)))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    state.storage.remove_member(org_id, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn member_response(user: User, role: Role) -> MemberResponse {
    MemberResponse {
        user_id: user.id,
        email: user.email,
        display_name: user.display_name,
        role,
    }
}
