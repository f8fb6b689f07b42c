use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_internal_key,
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows},
    schemas::{clamp_limit_in_range, InvoicePath, InvoicesQuery, RunBillingCycleInput},
    services::{audit::write_audit_log, billing_cycle::run_billing_cycle},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/billing/run-cycle", axum::routing::post(run_cycle))
        .route("/invoices", axum::routing::get(list_invoices))
        .route("/invoices/{invoice_id}", axum::routing::get(get_invoice))
}

/// Cron-triggered entry point. Safe to re-invoke: already-billed leases come
/// back as `skipped`.
async fn run_cycle(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Option<Json<RunBillingCycleInput>>,
) -> AppResult<Json<Value>> {
    require_internal_key(&state, &headers)?;

    let as_of = payload
        .and_then(|Json(input)| input.as_of)
        .unwrap_or_else(|| Utc::now().date_naive());

    let result = run_billing_cycle(&state, as_of).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "billing_cycle_run",
        "invoices",
        None,
        None,
        serde_json::to_value(&result).ok(),
    )
    .await;

    Ok(Json(json!({
        "as_of": as_of.to_string(),
        "total_processed": result.total_processed,
        "created": result.created,
        "skipped": result.skipped,
        "failed": result.failed,
        "failures": result.failures,
    })))
}

async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoicesQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(lease_id) = non_empty_opt(query.lease_id.as_deref()) {
        filters.insert("lease_id".to_string(), Value::String(lease_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(invoice_type) = non_empty_opt(query.invoice_type.as_deref()) {
        filters.insert(
            "invoice_type".to_string(),
            Value::String(invoice_type.to_ascii_uppercase()),
        );
    }

    let rows = list_rows(
        pool,
        "invoices",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "due_date",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
) -> AppResult<impl IntoResponse> {
    let pool = db_pool(&state)?;

    let mut invoice = get_row(pool, "invoices", &path.invoice_id, "id").await?;

    let mut filters = Map::new();
    filters.insert(
        "invoice_id".to_string(),
        Value::String(path.invoice_id.clone()),
    );
    let items = list_rows(pool, "invoice_items", Some(&filters), 100, 0, "created_at", true).await?;
    if let Some(obj) = invoice.as_object_mut() {
        obj.insert("items".to_string(), Value::Array(items));
    }

    Ok(Json(invoice))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
