use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::require_internal_key,
    error::{AppError, AppResult},
    repository::table_service::list_rows,
    schemas::{clamp_limit_in_range, AccountPath, EntryPath, JournalQuery, ReverseEntryInput},
    services::ledger::{account_balance, list_journal, post_reversal},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/ledger/accounts", axum::routing::get(list_accounts))
        .route(
            "/ledger/accounts/{account_id}/balance",
            axum::routing::get(get_account_balance),
        )
        .route("/ledger/journal", axum::routing::get(journal))
        .route(
            "/ledger/journal/{entry_id}/reverse",
            axum::routing::post(reverse_entry),
        )
}

async fn list_accounts(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let rows = list_rows(pool, "accounts", None, 500, 0, "code", true).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_account_balance(
    State(state): State<AppState>,
    Path(path): Path<AccountPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let balance = account_balance(pool, &path.account_id).await?;
    Ok(Json(balance))
}

async fn journal(
    State(state): State<AppState>,
    Query(query): Query<JournalQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let entries = list_journal(
        pool,
        query
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty()),
        clamp_limit_in_range(query.limit, 1, 500),
    )
    .await?;
    Ok(Json(json!({ "data": entries })))
}

/// Posted entries are never edited; corrections go through offsetting
/// reversal entries.
async fn reverse_entry(
    State(state): State<AppState>,
    Path(path): Path<EntryPath>,
    headers: HeaderMap,
    Json(payload): Json<ReverseEntryInput>,
) -> AppResult<Json<Value>> {
    require_internal_key(&state, &headers)?;
    let pool = db_pool(&state)?;

    let reason = payload.reason.trim();
    if reason.is_empty() {
        return Err(AppError::UnprocessableEntity(
            "A reversal requires a reason.".to_string(),
        ));
    }

    let reversal = post_reversal(pool, &path.entry_id, reason).await?;
    Ok(Json(reversal))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
