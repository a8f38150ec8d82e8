use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use time::Date;
use uuid::Uuid;

use kicho_core::{Role, ValidationError};

use crate::{
    auth::{self, CallerIdentity},
    config::Config,
    import::ImportError,
    storage::{StorageBackend, StorageError},
};

pub mod accounts;
pub mod auth_routes;
pub mod import_routes;
pub mod journal;
pub mod orgs;
pub mod partners;
pub mod periods;
pub mod reports_routes;

use thiserror::Error;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StorageBackend>,
    pub config: Arc<Config>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                success: false,
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::OrganizationNotFound(_)
            | StorageError::AccountNotFound(_)
            | StorageError::PartnerNotFound(_)
            | StorageError::PeriodNotFound(_)
            | StorageError::JournalNotFound(_)
            | StorageError::UserNotFound(_)
            | StorageError::ImportRuleNotFound(_) => ApiError::NotFound(e.to_string()),
            StorageError::DuplicateAccountCode(_)
            | StorageError::DuplicatePartnerCode(_)
            | StorageError::DuplicateEmail(_)
            | StorageError::PeriodOverlap
            | StorageError::PeriodClosed(_)
            | StorageError::LastOwner => ApiError::Conflict(e.to_string()),
            StorageError::AccountInactive(_) => ApiError::Validation(e.to_string()),
            StorageError::IOError(_) | StorageError::Other(_) | StorageError::NoActiveTransaction => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl From<ImportError> for ApiError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Duplicate { .. } => ApiError::Conflict(e.to_string()),
            ImportError::Storage(se) => se.into(),
            ImportError::Csv(_)
            | ImportError::MissingHeader
            | ImportError::NoDateColumn
            | ImportError::NoAmountColumn
            | ImportError::MissingAccount { .. }
            | ImportError::BadRow { .. }
            | ImportError::Validation(_) => ApiError::Validation(e.to_string()),
        }
    }
}

/// Resolve the caller's role in the organization and require at least
/// `min`. Non-members are turned away without confirming the
/// organization exists.
pub(crate) fn require_role(
    state: &AppState,
    caller: &CallerIdentity,
    org_id: Uuid,
    min: Role,
) -> Result<Role, ApiError> {
    let role = state
        .storage
        .member_role(org_id, caller.user_id)?
        .ok_or_else(|| ApiError::NotFound(format!("organization not found: {}", org_id)))?;
    if role < min {
        return Err(ApiError::Forbidden);
    }
    Ok(role)
}

/// Reject writes dated inside a closed accounting period. Dates not
/// covered by any period are allowed.
pub(crate) fn ensure_open_period(
    state: &AppState,
    org_id: Uuid,
    date: Date,
) -> Result<(), ApiError> {
    if let Some(period) = state.storage.period_containing(org_id, date)? {
        if period.closed {
            return Err(StorageError::PeriodClosed(date).into());
        }
    }
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn render_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/me", get(auth_routes::me))
        .route("/api/auth/logout", post(auth_routes::logout))
        .route("/api/orgs", post(orgs::create).get(orgs::list))
        .route("/api/orgs/:org_id", get(orgs::get_one))
        .route(
            "/api/orgs/:org_id/members",
            get(orgs::list_members).put(orgs::upsert_member),
        )
        .route("/api/orgs/:org_id/members/:user_id", delete(orgs::remove_member))
        .route(
            "/api/orgs/:org_id/accounts",
            post(accounts::create).get(accounts::list),
        )
        .route(
            "/api/orgs/:org_id/accounts/:account_id",
            get(accounts::get_one).put(accounts::update).delete(accounts::deactivate),
        )
        .route(
            "/api/orgs/:org_id/partners",
            post(partners::create).get(partners::list),
        )
        .route(
            "/api/orgs/:org_id/partners/:partner_id",
            get(partners::get_one).put(partners::update).delete(partners::deactivate),
        )
        .route(
            "/api/orgs/:org_id/periods",
            post(periods::create).get(periods::list),
        )
        .route("/api/orgs/:org_id/periods/:period_id/close", post(periods::close))
        .route("/api/orgs/:org_id/periods/:period_id/reopen", post(periods::reopen))
        .route(
            "/api/orgs/:org_id/journal-entries",
            post(journal::create).get(journal::list),
        )
        .route(
            "/api/orgs/:org_id/journal-entries/:journal_id",
            get(journal::get_one).put(journal::update).delete(journal::delete_one),
        )
        .route("/api/orgs/:org_id/ledger/:account_id", get(reports_routes::ledger))
        .route(
            "/api/orgs/:org_id/reports/trial-balance",
            get(reports_routes::trial_balance),
        )
        .route(
            "/api/orgs/:org_id/reports/balance-sheet",
            get(reports_routes::balance_sheet),
        )
        .route(
            "/api/orgs/:org_id/reports/profit-loss",
            get(reports_routes::profit_loss),
        )
        .route("/api/orgs/:org_id/import/preview", post(import_routes::preview))
        .route("/api/orgs/:org_id/import/commit", post(import_routes::commit))
        .route(
            "/api/orgs/:org_id/import/rules",
            post(import_routes::create_rule).get(import_routes::list_rules),
        )
        .route(
            "/api/orgs/:org_id/import/rules/:rule_id",
            delete(import_routes::delete_rule),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/api/auth/register", post(auth_routes::register))
        .route("/api/auth/login", post(auth_routes::login))
        .merge(protected)
        .with_state(state)
}
