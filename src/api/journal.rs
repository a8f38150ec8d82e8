use std::ops::Bound;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use time::Date;
use uuid::Uuid;

use kicho_core::{CreateJournalCommand, JournalEntry, Role};

use crate::auth::CallerIdentity;

use super::{ensure_open_period, require_role, ApiError, AppState};

#[derive(Deserialize)]
pub struct DateRangeQuery {
    pub from: Option<Date>,
    pub to: Option<Date>,
}

pub(crate) fn bounds(query: &DateRangeQuery) -> (Bound<Date>, Bound<Date>) {
    let from = query.from.map_or(Bound::Unbounded, Bound::Included);
    let to = query.to.map_or(Bound::Unbounded, Bound::Included);
    (from, to)
}

pub async fn create(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Json(command): Json<CreateJournalCommand>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Member)?;
    command.validate()?;
    ensure_open_period(&state, org_id, command.entry_date)?;
    let entry = state.storage.create_journal(org_id, &command)?;
    metrics::counter!("kicho_journals_created", 1);
    tracing::info!(org_id = %org_id, journal_id = %entry.id, sequence = entry.sequence, "Journal entry posted");
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<DateRangeQuery>,
) -> Result<Json<Vec<JournalEntry>>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    let (from, to) = bounds(&query);
    Ok(Json(state.storage.list_journals(org_id, from, to)?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, journal_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<JournalEntry>, ApiError> {
    require_role(&state, &caller, org_id, Role::Viewer)?;
    Ok(Json(state.storage.get_journal(org_id, journal_id)?))
}

/// Both the entry's current date and the new date must fall outside
/// any closed period, so an entry cannot be moved into or out of a
/// frozen range.
pub async fn update(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, journal_id)): Path<(Uuid, Uuid)>,
    Json(command): Json<CreateJournalCommand>,
) -> Result<Json<JournalEntry>, ApiError> {
    require_role(&state, &caller, org_id, Role::Member)?;
    command.validate()?;
    let existing = state.storage.get_journal(org_id, journal_id)?;
    ensure_open_period(&state, org_id, existing.entry_date)?;
    ensure_open_period(&state, org_id, command.entry_date)?;
    Ok(Json(state.storage.update_journal(org_id, journal_id, &command)?))
}

pub async fn delete_one(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((org_id, journal_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    require_role(&state, &caller, org_id, Role::Member)?;
    let existing = state.storage.get_journal(org_id, journal_id)?;
    ensure_open_period(&state, org_id, existing.entry_date)?;
    state.storage.delete_journal(org_id, journal_id)?;
    tracing::info!(org_id = %org_id, journal_id = %journal_id, "Journal entry deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;
    use time::macros::date;

    use kicho_core::{
        AccountType, CreateAccountCommand, CreatePeriodCommand, CreateUserCommand,
    };

    use crate::config::Config;
    use crate::storage::{InMemoryStorage, StorageBackend};

    use super::*;

    fn setup() -> (AppState, CallerIdentity, Uuid) {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let user = storage
            .create_user(&CreateUserCommand {
                email: "keiri@example.jp".to_string(),
                display_name: "経理担当".to_string(),
                password_hash: "x".to_string(),
            })
            .unwrap();
        let org = storage.create_organization("株式会社テスト", user.id).unwrap();
        let state = AppState {
            storage,
            config: Arc::new(Config::default()),
            metrics: None,
        };
        let caller = CallerIdentity {
            user_id: user.id,
            email: user.email,
        };
        (state, caller, org.id)
    }

    fn entry(debit: Uuid, credit: Uuid, entry_date: Date) -> CreateJournalCommand {
        CreateJournalCommand {
            entry_date,
            description: "売上".to_string(),
            lines: vec![
                kicho_core::JournalLineCommand {
                    account_id: debit,
                    side: kicho_core::Side::Debit,
                    amount: dec!(1000),
                    partner_id: None,
                    memo: None,
                },
                kicho_core::JournalLineCommand {
                    account_id: credit,
                    side: kicho_core::Side::Credit,
                    amount: dec!(1000),
                    partner_id: None,
                    memo: None,
                },
            ],
            source_key: None,
        }
    }

    #[tokio::test]
    async fn test_closed_period_blocks_journal_writes() {
        let (state, caller, org) = setup();
        let bank = state
            .storage
            .create_account(
                org,
                &CreateAccountCommand {
                    code: "1110".to_string(),
                    name: "普通預金".to_string(),
                    account_type: AccountType::Asset,
                    parent_id: None,
                },
            )
            .unwrap()
            .id;
        let sales = state
            .storage
            .create_account(
                org,
                &CreateAccountCommand {
                    code: "4110".to_string(),
                    name: "売上高".to_string(),
                    account_type: AccountType::Revenue,
                    parent_id: None,
                },
            )
            .unwrap()
            .id;

        let existing = state
            .storage
            .create_journal(org, &entry(bank, sales, date!(2024 - 06 - 01)))
            .unwrap();

        let period = state
            .storage
            .create_period(
                org,
                &CreatePeriodCommand {
                    name: "2024年度".to_string(),
                    start_date: date!(2024 - 04 - 01),
                    end_date: date!(2025 - 03 - 31),
                },
            )
            .unwrap();
        state.storage.set_period_closed(org, period.id, true).unwrap();

        let result = create(
            State(state.clone()),
            Extension(caller.clone()),
            Path(org),
            Json(entry(bank, sales, date!(2024 - 07 - 01))),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));

        let result = update(
            State(state.clone()),
            Extension(caller.clone()),
            Path((org, existing.id)),
            Json(entry(bank, sales, date!(2024 - 06 - 02))),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));

        let result = delete_one(
            State(state.clone()),
            Extension(caller.clone()),
            Path((org, existing.id)),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));

        // Dates outside any period are still accepted.
        let result = create(
            State(state.clone()),
            Extension(caller.clone()),
            Path(org),
            Json(entry(bank, sales, date!(2023 - 06 - 01))),
        )
        .await;
        assert!(result.is_ok());

        // Reopening the period unfreezes it.
        state.storage.set_period_closed(org, period.id, false).unwrap();
        let result = delete_one(State(state), Extension(caller), Path((org, existing.id))).await;
        assert!(result.is_ok());
    }
}
