use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_internal_key,
    error::{AppError, AppResult},
    repository::table_service::{
        create_row, get_row, list_rows, map_db_error, row_decimal, update_row_tx,
    },
    schemas::{
        remove_nulls, serialize_to_map, validate_input, ApproveUtilityBillInput, BillPath,
        CreateUtilityBillInput, CreateUtilityReadingInput, GenerateUtilityInvoicesInput,
    },
    services::{
        allocation::{allocate_bill, SplitMethod},
        audit::write_audit_log,
        billing_cycle::generate_utility_invoices,
        ledger::{build_entry, resolve_entry_accounts, write_entry, BillingEvent},
        metering::{record_reading, validate_bill_intake},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/utility-readings", axum::routing::post(create_reading))
        .route("/utility-bills", axum::routing::post(create_bill))
        .route(
            "/utility-bills/{bill_id}/allocate",
            axum::routing::post(allocate),
        )
        .route(
            "/utility-bills/{bill_id}/allocations",
            axum::routing::get(list_allocations),
        )
        .route(
            "/utility-bills/{bill_id}/approve",
            axum::routing::post(approve_bill),
        )
        .route(
            "/utility-bills/{bill_id}/invoice",
            axum::routing::post(invoice_bill),
        )
}

async fn create_reading(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUtilityReadingInput>,
) -> AppResult<impl IntoResponse> {
    require_internal_key(&state, &headers)?;
    let pool = db_pool(&state)?;

    let created = record_reading(pool, &payload).await?;
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

/// Intake for externally-issued property-level utility bills.
async fn create_bill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUtilityBillInput>,
) -> AppResult<impl IntoResponse> {
    require_internal_key(&state, &headers)?;
    let pool = db_pool(&state)?;

    validate_input(&payload)?;
    validate_bill_intake(payload.total_amount, payload.consumption)?;
    SplitMethod::parse(&payload.split_method)?;
    if payload.period_end < payload.period_start {
        return Err(AppError::UnprocessableEntity(
            "Bill period end cannot precede its start.".to_string(),
        ));
    }
    // The bill must reference real collaborators before it can be allocated.
    get_row(pool, "properties", &payload.property_id, "id").await?;
    get_row(pool, "utilities", &payload.utility_id, "id").await?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("status".to_string(), Value::String("pending".to_string()));

    let created = create_row(pool, "utility_bills", &record).await?;
    let bill_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        "create",
        "utility_bills",
        Some(&bill_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn allocate(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_internal_key(&state, &headers)?;
    let pool = db_pool(&state)?;

    let allocations = allocate_bill(pool, &path.bill_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "allocate",
        "utility_bills",
        Some(&path.bill_id),
        None,
        Some(json!({ "allocations": allocations.len() })),
    )
    .await;

    Ok(Json(json!({ "data": allocations })))
}

async fn list_allocations(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    get_row(pool, "utility_bills", &path.bill_id, "id").await?;

    let mut filters = Map::new();
    filters.insert(
        "utility_bill_id".to_string(),
        Value::String(path.bill_id.clone()),
    );
    let rows = list_rows(
        pool,
        "utility_allocations",
        Some(&filters),
        500,
        0,
        "created_at",
        true,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

/// Approving a bill posts it to the ledger (utility expense against payable,
/// or cash when it was paid on receipt). Status flip and journal entry
/// commit together.
async fn approve_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    payload: Option<Json<ApproveUtilityBillInput>>,
) -> AppResult<Json<Value>> {
    require_internal_key(&state, &headers)?;
    let pool = db_pool(&state)?;

    let bill = get_row(pool, "utility_bills", &path.bill_id, "id").await?;
    let status = value_str(&bill, "status");
    if status != "allocated" {
        return Err(AppError::Conflict(format!(
            "Utility bill is '{status}'; only allocated bills can be approved."
        )));
    }

    let total_amount = row_decimal(&bill, "total_amount").ok_or_else(|| {
        AppError::Internal("Utility bill has no parseable total amount.".to_string())
    })?;
    let paid_immediately = payload.is_some_and(|Json(input)| input.paid_immediately);
    let bill_date = value_str(&bill, "bill_date")
        .parse()
        .unwrap_or_else(|_| Utc::now().date_naive());

    let entry_spec = build_entry(&BillingEvent::UtilityBillApproved {
        bill_id: path.bill_id.clone(),
        amount: total_amount,
        property_id: non_empty(value_str(&bill, "property_id")),
        paid_immediately,
        bill_date,
    });
    let account_ids = resolve_entry_accounts(pool, &state.accounts_cache, &entry_spec).await?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("approved".to_string()));
    let updated = update_row_tx(&mut tx, "utility_bills", &path.bill_id, &patch, "id").await?;
    let entry = write_entry(&mut tx, &entry_spec, &account_ids).await?;
    tx.commit().await.map_err(map_db_error)?;

    write_audit_log(
        state.db_pool.as_ref(),
        "status_transition",
        "utility_bills",
        Some(&path.bill_id),
        Some(bill),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(json!({ "bill": updated, "journal_entry": entry })))
}

/// Turn an allocated bill into per-lease utility invoices.
async fn invoice_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    payload: Option<Json<GenerateUtilityInvoicesInput>>,
) -> AppResult<Json<Value>> {
    require_internal_key(&state, &headers)?;

    let as_of = payload
        .and_then(|Json(input)| input.as_of)
        .unwrap_or_else(|| Utc::now().date_naive());

    let result = generate_utility_invoices(&state, &path.bill_id, as_of).await?;

    Ok(Json(json!({
        "bill_id": path.bill_id,
        "total_processed": result.total_processed,
        "created": result.created,
        "skipped": result.skipped,
        "failed": result.failed,
        "failures": result.failures,
    })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}
