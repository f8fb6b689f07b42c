use chrono::NaiveDate;
use moka::future::Cache;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{
    create_row_tx, get_row, map_db_error, row_decimal, update_row_tx,
};
use crate::schemas::RecordPaymentInput;
use crate::services::ledger::{build_entry, resolve_entry_accounts, write_entry, BillingEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    ExactMatch,
    PartialPayment,
    Overpayment,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AppliedPayment {
    pub payment: Value,
    pub invoice: Value,
    pub outcome: PaymentOutcome,
    pub total_paid: Decimal,
    pub remaining: Decimal,
}

/// Status an invoice should carry after payments totalling `total_paid`.
/// The flip to `paid` depends on the cumulative sum, never on a single
/// payment record.
pub fn status_after_payments(invoice_amount: Decimal, total_paid: Decimal) -> (&'static str, PaymentOutcome) {
    if total_paid > invoice_amount {
        ("paid", PaymentOutcome::Overpayment)
    } else if total_paid == invoice_amount {
        ("paid", PaymentOutcome::ExactMatch)
    } else {
        ("pending", PaymentOutcome::PartialPayment)
    }
}

/// Record a settled payment against an invoice.
///
/// The payment row, the invoice status transition, and the ledger entry
/// commit in one transaction. Payments are additive history; the invoice
/// amount is never touched.
pub async fn apply_payment(
    pool: &PgPool,
    accounts_cache: &Cache<String, Value>,
    input: &RecordPaymentInput,
    fallback_paid_on: NaiveDate,
) -> AppResult<AppliedPayment> {
    if input.amount <= Decimal::ZERO {
        return Err(AppError::UnprocessableEntity(
            "Payment amount must be positive.".to_string(),
        ));
    }

    let invoice = get_row(pool, "invoices", &input.invoice_id, "id").await?;
    let invoice_amount = row_decimal(&invoice, "amount").ok_or_else(|| {
        AppError::Internal("Invoice has no parseable amount.".to_string())
    })?;
    let current_status = value_str(&invoice, "status");
    let paid_on = input.paid_on.unwrap_or(fallback_paid_on);

    let mut tx = pool.begin().await.map_err(map_db_error)?;

    let mut payment_row = Map::new();
    payment_row.insert(
        "invoice_id".to_string(),
        Value::String(input.invoice_id.clone()),
    );
    payment_row.insert(
        "amount".to_string(),
        Value::String(input.amount.to_string()),
    );
    payment_row.insert("paid_on".to_string(), Value::String(paid_on.to_string()));
    payment_row.insert("method".to_string(), Value::String(input.method.clone()));
    if let Some(reference) = input
        .reference
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        payment_row.insert("reference".to_string(), Value::String(reference.to_string()));
    }
    let payment = create_row_tx(&mut tx, "payments", &payment_row).await?;
    let payment_id = value_str(&payment, "id");

    // Cumulative sum over the append-only payment history, inside the same
    // transaction so a concurrent payment cannot be missed by the flip.
    let (total_paid,): (Decimal,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0) FROM payments WHERE invoice_id = $1::uuid",
    )
    .bind(&input.invoice_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_db_error)?;

    // Only the flip to `paid` is ours; an `overdue` invoice stays overdue
    // under partial payment (the overdue sweep is an external concern).
    let (next_status, outcome) = status_after_payments(invoice_amount, total_paid);
    let invoice = if next_status == "paid" && current_status != "paid" {
        let mut patch = Map::new();
        patch.insert("status".to_string(), Value::String(next_status.to_string()));
        update_row_tx(&mut tx, "invoices", &input.invoice_id, &patch, "id").await?
    } else {
        invoice
    };

    let entry_spec = build_entry(&BillingEvent::PaymentReceived {
        payment_id: payment_id.clone(),
        invoice_id: input.invoice_id.clone(),
        amount: input.amount,
        paid_on,
    });
    let account_ids = resolve_entry_accounts(pool, accounts_cache, &entry_spec).await?;
    write_entry(&mut tx, &entry_spec, &account_ids).await?;

    tx.commit().await.map_err(map_db_error)?;

    info!(
        payment_id,
        invoice_id = %input.invoice_id,
        amount = %input.amount,
        outcome = ?outcome,
        "Payment applied"
    );

    let remaining = (invoice_amount - total_paid).max(Decimal::ZERO);
    Ok(AppliedPayment {
        payment,
        invoice,
        outcome,
        total_paid,
        remaining,
    })
}

/// Derived billing position of a lease. Always aggregated from the invoice
/// and payment history; no stored running totals to drift.
pub async fn summarize(pool: &PgPool, lease_id: &str) -> AppResult<Value> {
    // Existence check so an unknown lease is a 404, not an all-zero summary.
    let lease = get_row(pool, "leases", lease_id, "id").await?;

    let (total_invoiced,): (Decimal,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0) FROM invoices WHERE lease_id = $1::uuid",
    )
    .bind(lease_id)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    let (total_paid,): (Decimal,) = sqlx::query_as(
        "SELECT COALESCE(SUM(p.amount), 0)
         FROM payments p
         JOIN invoices i ON i.id = p.invoice_id
         WHERE i.lease_id = $1::uuid",
    )
    .bind(lease_id)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    let balance = total_invoiced - total_paid;
    Ok(json!({
        "lease_id": lease_id,
        "tenant_full_name": lease.get("tenant_full_name").cloned().unwrap_or(Value::Null),
        "total_invoiced": total_invoiced.to_string(),
        "total_paid": total_paid.to_string(),
        "balance": balance.to_string(),
    }))
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

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::{status_after_payments, PaymentOutcome};

    #[test]
    fn partial_payment_keeps_invoice_pending() {
        let (status, outcome) = status_after_payments(dec!(1500.00), dec!(750.00));
        assert_eq!(status, "pending");
        assert_eq!(outcome, PaymentOutcome::PartialPayment);
    }

    #[test]
    fn cumulative_payments_flip_to_paid() {
        let (status, outcome) = status_after_payments(dec!(1500.00), dec!(1500.00));
        assert_eq!(status, "paid");
        assert_eq!(outcome, PaymentOutcome::ExactMatch);
    }

    #[test]
    fn overpayment_is_flagged_but_still_paid() {
        let (status, outcome) = status_after_payments(dec!(1500.00), dec!(1600.00));
        assert_eq!(status, "paid");
        assert_eq!(outcome, PaymentOutcome::Overpayment);
    }

    #[test]
    fn balance_never_increases_as_payments_accumulate() {
        let invoice = dec!(1500.00);
        let mut last_remaining = invoice;
        for paid in [dec!(100), dec!(600), dec!(1100), dec!(1500), dec!(1700)] {
            let remaining = (invoice - paid).max(dec!(0));
            assert!(remaining <= last_remaining);
            last_remaining = remaining;
        }
    }
}
