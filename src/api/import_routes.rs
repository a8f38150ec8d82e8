use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use kicho_core::{CreateImportRuleCommand, ImportRule, Role};

use crate::{
    auth::CallerIdentity,
    import::{self, ColumnMapping, CommitRow, ImportOutcome, ImportPreview},
};

use super::{ensure_open_period, require_role, ApiError, AppState};

#[derive(Deserialize)]
pub struct PreviewRequest {
    pub csv: String,
    #[serde(default)]
    pub mapping: Option<ColumnMapping>,
}

#[derive(Deserialize)]
pub struct CommitRequest {
    pub bank_account_id: Uuid,
    pub rows: Vec<CommitRow>,
}

pub async fn preview(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Json(body): Json<PreviewRequest>,
) -> Result<Json<ImportPreview>, ApiError> {
    require_role(&state, &caller, org_id, Role::Member)?;
    let statement = import::parse_statement(&body.csv, body.mapping)?;
    let preview = import::build_preview(&state.storage, org_id, statement)?;
    Ok(Json(preview))
}

pub async fn commit(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Json(body): Json<CommitRequest>,
) -> Result<Json<ImportOutcome>, ApiError> {
    require_role(&state, &caller, org_id, Role::Member)?;
    let bank = state.storage.get_account(org_id, body.bank_account_id)?;
    if !bank.active {
        return Err(ApiError::Validation(format!(
            "Bank account {} is inactive",
            bank.code
        )));
    }
    for row in body.rows.iter().filter(|r| !r.skip) {
        ensure_open_period(&state, org_id, row.date)?;
    }
    let outcome = import::commit_import(&state.storage, org_id, body.bank_account_id, &body.rows)?;
    Ok(Json(outcome))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Json(command): Json<CreateImportRuleCommand>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    command.validate()?;
    let rule = state.storage.create_import_rule(org_id, &command)?;
    tracing::info!(org_id = %org_id, keyword = %rule.keyword, "Import rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn list_rules(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<ImportRule>>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(state.storage.list_import_rules(org_id)?))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, rule_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Admin)?;
    state.storage.delete_import_rule(org_id, rule_id)?;
    Ok(StatusCode::NO_CONTENT)
}
