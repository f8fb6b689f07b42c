use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use crate::{
    auth::require_internal_key,
    error::{AppError, AppResult},
    schemas::{validate_input, LeasePath, RecordPaymentInput},
    services::{
        audit::write_audit_log,
        reconciliation::{apply_payment, summarize},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/payments", axum::routing::post(record_payment))
        .route(
            "/leases/{lease_id}/billing-summary",
            axum::routing::get(lease_billing_summary),
        )
}

/// Intake for settled payments from the payment-capture workflow.
async fn record_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RecordPaymentInput>,
) -> AppResult<impl IntoResponse> {
    require_internal_key(&state, &headers)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let today = Utc::now().date_naive();
    let applied = apply_payment(pool, &state.accounts_cache, &payload, today).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "payment_applied",
        "payments",
        applied
            .payment
            .get("id")
            .and_then(Value::as_str),
        None,
        Some(applied.payment.clone()),
    )
    .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({
            "payment": applied.payment,
            "invoice": applied.invoice,
            "outcome": applied.outcome,
            "total_paid": applied.total_paid.to_string(),
            "remaining": applied.remaining.to_string(),
        })),
    ))
}

async fn lease_billing_summary(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let summary = summarize(pool, &path.lease_id).await?;
    Ok(Json(summary))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
