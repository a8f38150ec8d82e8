use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use time::Date;
use uuid::Uuid;

use kicho_core::{BalanceSheet, LedgerRow, ProfitLoss, Role, TrialBalance};

use crate::{auth::CallerIdentity, reports};

use super::{
    journal::{bounds, DateRangeQuery},
    require_role, ApiError, AppState,
};

#[derive(Deserialize)]
pub struct AsOfQuery {
    pub as_of: Date,
}

#[derive(Deserialize)]
pub struct PeriodQuery {
    pub from: Date,
    pub to: Date,
}

pub async fn trial_balance(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<AsOfQuery>,
) -> Result<Json<TrialBalance>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(reports::trial_balance(&state.storage, org_id, query.as_of)?))
}

pub async fn balance_sheet(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<AsOfQuery>,
) -> Result<Json<BalanceSheet>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(reports::balance_sheet(&state.storage, org_id, query.as_of)?))
}

pub async fn profit_loss(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<ProfitLoss>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    if query.from > query.to {
        return Err(ApiError::Validation(
            "from must not be later than to".to_string(),
        ));
    }
    Ok(Json(reports::profit_loss(
        &state.storage,
        org_id,
        query.from,
        query.to,
    )?))
}

pub async fn ledger(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, account_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<DateRangeQuery>,
) -> Result<Json<Vec<LedgerRow>>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    let (from, to) = bounds(&query);
    Ok(Json(state.storage.account_ledger(org_id, account_id, from, to)?))
}
