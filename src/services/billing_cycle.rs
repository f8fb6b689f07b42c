use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use moka::future::Cache;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{
    create_row_tx, get_row, list_rows, map_db_error, row_decimal,
};
use crate::services::ledger::{
    build_entry, ensure_account, write_entry, BillingEvent, RevenueSource,
    ACCT_ACCOUNTS_RECEIVABLE, ACCT_RENTAL_REVENUE, ACCT_UTILITY_REVENUE,
};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingFrequency {
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingFrequency {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "MONTHLY" => Ok(Self::Monthly),
            "QUARTERLY" => Ok(Self::Quarterly),
            "YEARLY" => Ok(Self::Yearly),
            other => Err(AppError::UnprocessableEntity(format!(
                "Unknown payment frequency '{other}'."
            ))),
        }
    }

    pub fn period_months(self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Yearly => 12,
        }
    }
}

/// Next rent due date strictly after `as_of`.
///
/// The candidate is `as_of`'s own month at the lease's due day (clamped to
/// the month length); once that date has passed, the due date advances one
/// period, with the day re-clamped for the target month.
pub fn next_due_date(as_of: NaiveDate, frequency: BillingFrequency, due_day: u32) -> NaiveDate {
    let due_day = due_day.clamp(1, 31);
    let candidate = date_with_clamped_day(as_of.year(), as_of.month(), due_day);
    if candidate > as_of {
        return candidate;
    }

    let total_months = as_of.month0() + frequency.period_months();
    let year = as_of.year() + (total_months / 12) as i32;
    let month = total_months % 12 + 1;
    date_with_clamped_day(year, month, due_day)
}

/// Calendar-month key used to deduplicate recurring invoices.
pub fn billing_period(due_date: NaiveDate) -> String {
    due_date.format("%Y-%m").to_string()
}

fn date_with_clamped_day(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| {
            let last = days_in_month(year, month);
            NaiveDate::from_ymd_opt(year, month, last).expect("valid month end")
        })
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid first of month")
        .pred_opt()
        .expect("valid month end")
        .day()
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LeaseFailure {
    pub lease_id: String,
    pub reason: String,
}

/// Structured summary of one billing cycle run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BillingCycleResult {
    pub total_processed: u32,
    pub created: u32,
    pub skipped: u32,
    pub failed: u32,
    pub failures: Vec<LeaseFailure>,
}

impl BillingCycleResult {
    fn empty() -> Self {
        Self {
            total_processed: 0,
            created: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseOutcome {
    Created,
    Skipped,
}

/// Generate recurring RENT invoices for a bounded batch of active leases.
///
/// Fan-out/fan-in: one task per lease, every task settles (success, failure
/// or timeout) before the summary is assembled. A lease's existence check
/// and insert are one `ON CONFLICT DO NOTHING` statement against the
/// (lease, billing period) unique index, so overlapping cycle runs — even
/// from separate processes — cannot double-book a lease. No retries here;
/// the external trigger re-invokes and idempotency makes that safe.
pub async fn run_billing_cycle(state: &AppState, as_of: NaiveDate) -> AppResult<BillingCycleResult> {
    let pool = db_pool(state)?;

    let mut filters = Map::new();
    filters.insert(
        "lease_status".to_string(),
        Value::String("active".to_string()),
    );
    let leases = list_rows(
        pool,
        "leases",
        Some(&filters),
        state.config.billing_batch_size,
        0,
        "created_at",
        true,
    )
    .await?;

    let mut result = BillingCycleResult::empty();
    result.total_processed = leases.len() as u32;

    let task_timeout = Duration::from_secs(state.config.lease_task_timeout_seconds.max(1));
    let mut tasks = tokio::task::JoinSet::new();
    for lease in leases {
        let pool = pool.clone();
        let accounts_cache = state.accounts_cache.clone();
        tasks.spawn(async move {
            let lease_id = value_str(&lease, "id");
            let outcome = match tokio::time::timeout(
                task_timeout,
                process_lease(&pool, &accounts_cache, &lease, as_of),
            )
            .await
            {
                Ok(processed) => processed,
                Err(_) => Err(AppError::Dependency(
                    "Lease billing task timed out.".to_string(),
                )),
            };
            (lease_id, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(LeaseOutcome::Created))) => result.created += 1,
            Ok((_, Ok(LeaseOutcome::Skipped))) => result.skipped += 1,
            Ok((lease_id, Err(error))) => {
                warn!(lease_id, error = %error, "Lease billing failed");
                result.failed += 1;
                result.failures.push(LeaseFailure {
                    lease_id,
                    reason: error.to_string(),
                });
            }
            Err(join_error) => {
                warn!(error = %join_error, "Lease billing task panicked");
                result.failed += 1;
                result.failures.push(LeaseFailure {
                    lease_id: String::new(),
                    reason: "Lease billing task panicked.".to_string(),
                });
            }
        }
    }

    info!(
        as_of = %as_of,
        total = result.total_processed,
        created = result.created,
        skipped = result.skipped,
        failed = result.failed,
        "Billing cycle completed"
    );
    Ok(result)
}

/// One lease's unit of work: compute the due date, then atomically
/// check-and-create the invoice and its ledger entry.
async fn process_lease(
    pool: &PgPool,
    accounts_cache: &Cache<String, Value>,
    lease: &Value,
    as_of: NaiveDate,
) -> Result<LeaseOutcome, AppError> {
    let lease_id = value_str(lease, "id");
    let rent_amount = row_decimal(lease, "rent_amount").ok_or_else(|| {
        AppError::UnprocessableEntity("Lease has no parseable rent amount.".to_string())
    })?;
    if rent_amount <= Decimal::ZERO {
        return Err(AppError::UnprocessableEntity(
            "Lease rent amount must be positive.".to_string(),
        ));
    }
    let frequency = BillingFrequency::parse(&value_str(lease, "payment_frequency"))?;
    let due_day = lease
        .as_object()
        .and_then(|obj| obj.get("payment_due_day"))
        .and_then(Value::as_i64)
        .unwrap_or(1)
        .clamp(1, 31) as u32;

    let due_date = next_due_date(as_of, frequency, due_day);
    let period = billing_period(due_date);

    // Accounts are resolved up front; they are reference data and must not
    // extend the write transaction below.
    let receivable = ensure_account(pool, accounts_cache, ACCT_ACCOUNTS_RECEIVABLE).await?;
    let revenue = ensure_account(pool, accounts_cache, ACCT_RENTAL_REVENUE).await?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;

    let inserted: Option<(Value,)> = sqlx::query_as(
        "INSERT INTO invoices (lease_id, invoice_type, amount, due_date, billing_period, status)
         VALUES ($1::uuid, 'RENT', $2, $3, $4, 'pending')
         ON CONFLICT (lease_id, billing_period) WHERE invoice_type = 'RENT' DO NOTHING
         RETURNING row_to_json(invoices.*)",
    )
    .bind(&lease_id)
    .bind(rent_amount)
    .bind(due_date)
    .bind(&period)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_error)?;

    let Some((invoice,)) = inserted else {
        // Already invoiced for this billing period: the expected idempotent
        // outcome, not an error.
        return Ok(LeaseOutcome::Skipped);
    };

    let entry_spec = build_entry(&BillingEvent::InvoiceIssued {
        invoice_id: value_str(&invoice, "id"),
        source: RevenueSource::Rent,
        amount: rent_amount,
        property_id: non_empty(value_str(lease, "property_id")),
        unit_id: non_empty(value_str(lease, "unit_id")),
        issued_on: as_of,
    });
    let account_ids = vec![value_str(&receivable, "id"), value_str(&revenue, "id")];
    write_entry(&mut tx, &entry_spec, &account_ids).await?;

    tx.commit().await.map_err(map_db_error)?;
    Ok(LeaseOutcome::Created)
}

/// Build per-lease UTILITY invoices from an allocated bill.
///
/// Each allocation maps to the unit's active lease, gated on the lease
/// carrying a tenant-responsible link for the bill's utility. The
/// (lease, source bill) unique index makes re-generation idempotent.
pub async fn generate_utility_invoices(
    state: &AppState,
    bill_id: &str,
    as_of: NaiveDate,
) -> AppResult<BillingCycleResult> {
    let pool = db_pool(state)?;

    let bill = get_row(pool, "utility_bills", bill_id, "id").await?;
    let bill_status = value_str(&bill, "status");
    if bill_status != "allocated" && bill_status != "approved" {
        return Err(AppError::Conflict(format!(
            "Utility bill is '{bill_status}'; allocate it before invoicing."
        )));
    }

    let utility_id = value_str(&bill, "utility_id");
    let utility = get_row(pool, "utilities", &utility_id, "id").await?;
    let utility_name = value_str(&utility, "name");
    let due_date = value_str(&bill, "due_date");
    let period_end = value_str(&bill, "period_end");
    let period = period_end
        .get(0..7)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| billing_period(as_of));

    let mut filters = Map::new();
    filters.insert(
        "utility_bill_id".to_string(),
        Value::String(bill_id.to_string()),
    );
    let allocations = list_rows(
        pool,
        "utility_allocations",
        Some(&filters),
        500,
        0,
        "created_at",
        true,
    )
    .await?;

    let mut result = BillingCycleResult::empty();
    result.total_processed = allocations.len() as u32;

    for allocation in &allocations {
        let allocation_id = value_str(allocation, "id");
        match invoice_allocation(
            state,
            allocation,
            bill_id,
            &utility_id,
            &utility_name,
            &due_date,
            &period,
            as_of,
        )
        .await
        {
            Ok(Some(_)) => result.created += 1,
            Ok(None) => result.skipped += 1,
            Err(error) => {
                warn!(allocation_id, error = %error, "Utility invoicing failed for allocation");
                result.failed += 1;
                result.failures.push(LeaseFailure {
                    lease_id: allocation_id,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        bill_id,
        created = result.created,
        skipped = result.skipped,
        failed = result.failed,
        "Utility invoices generated"
    );
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
async fn invoice_allocation(
    state: &AppState,
    allocation: &Value,
    bill_id: &str,
    utility_id: &str,
    utility_name: &str,
    due_date: &str,
    period: &str,
    as_of: NaiveDate,
) -> AppResult<Option<Value>> {
    let pool = db_pool(state)?;
    let unit_id = value_str(allocation, "unit_id");
    let amount = row_decimal(allocation, "amount").ok_or_else(|| {
        AppError::Internal("Allocation has no parseable amount.".to_string())
    })?;

    // Only an occupied unit with a tenant-responsible utility link is billed.
    let mut lease_filters = Map::new();
    lease_filters.insert("unit_id".to_string(), Value::String(unit_id.clone()));
    lease_filters.insert(
        "lease_status".to_string(),
        Value::String("active".to_string()),
    );
    let lease = list_rows(pool, "leases", Some(&lease_filters), 1, 0, "created_at", false)
        .await?
        .pop();
    let Some(lease) = lease else {
        return Ok(None);
    };
    let lease_id = value_str(&lease, "id");

    let mut link_filters = Map::new();
    link_filters.insert("lease_id".to_string(), Value::String(lease_id.clone()));
    link_filters.insert(
        "utility_id".to_string(),
        Value::String(utility_id.to_string()),
    );
    let link = list_rows(
        pool,
        "lease_utilities",
        Some(&link_filters),
        1,
        0,
        "created_at",
        false,
    )
    .await?
    .pop();
    let tenant_responsible = link
        .as_ref()
        .and_then(|row| row.get("is_tenant_responsible"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !tenant_responsible {
        return Ok(None);
    }

    let receivable =
        ensure_account(pool, &state.accounts_cache, ACCT_ACCOUNTS_RECEIVABLE).await?;
    let revenue = ensure_account(pool, &state.accounts_cache, ACCT_UTILITY_REVENUE).await?;

    let mut tx = pool.begin().await.map_err(map_db_error)?;

    let inserted: Option<(Value,)> = sqlx::query_as(
        "INSERT INTO invoices (lease_id, invoice_type, amount, due_date, billing_period, status, source_bill_id)
         VALUES ($1::uuid, 'UTILITY', $2, $3::date, $4, 'pending', $5::uuid)
         ON CONFLICT (lease_id, source_bill_id) WHERE invoice_type = 'UTILITY' DO NOTHING
         RETURNING row_to_json(invoices.*)",
    )
    .bind(&lease_id)
    .bind(amount)
    .bind(due_date)
    .bind(period)
    .bind(bill_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_error)?;

    let Some((invoice,)) = inserted else {
        return Ok(None);
    };
    let invoice_id = value_str(&invoice, "id");

    let mut item = Map::new();
    item.insert("invoice_id".to_string(), Value::String(invoice_id.clone()));
    item.insert(
        "description".to_string(),
        Value::String(format!("{utility_name} ({period})")),
    );
    item.insert("amount".to_string(), Value::String(amount.to_string()));
    item.insert(
        "utility_allocation_id".to_string(),
        Value::String(value_str(allocation, "id")),
    );
    create_row_tx(&mut tx, "invoice_items", &item).await?;

    let entry_spec = build_entry(&BillingEvent::InvoiceIssued {
        invoice_id,
        source: RevenueSource::Utility,
        amount,
        property_id: non_empty(value_str(&lease, "property_id")),
        unit_id: non_empty(unit_id),
        issued_on: as_of,
    });
    let account_ids = vec![value_str(&receivable, "id"), value_str(&revenue, "id")];
    write_entry(&mut tx, &entry_spec, &account_ids).await?;

    tx.commit().await.map_err(map_db_error)?;
    Ok(Some(invoice))
}

fn db_pool(state: &AppState) -> AppResult<&PgPool> {
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

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{billing_period, next_due_date, BillingFrequency};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn due_day_ahead_in_current_month_is_used() {
        let due = next_due_date(date(2025, 1, 15), BillingFrequency::Monthly, 20);
        assert_eq!(due, date(2025, 1, 20));
    }

    #[test]
    fn passed_due_day_advances_one_month() {
        let due = next_due_date(date(2025, 1, 15), BillingFrequency::Monthly, 1);
        assert_eq!(due, date(2025, 2, 1));
        assert_eq!(billing_period(due), "2025-02");
    }

    #[test]
    fn due_day_equal_to_as_of_advances() {
        let due = next_due_date(date(2025, 1, 15), BillingFrequency::Monthly, 15);
        assert_eq!(due, date(2025, 2, 15));
    }

    #[test]
    fn quarterly_and_yearly_periods() {
        let quarterly = next_due_date(date(2025, 1, 15), BillingFrequency::Quarterly, 1);
        assert_eq!(quarterly, date(2025, 4, 1));

        let yearly = next_due_date(date(2025, 3, 10), BillingFrequency::Yearly, 5);
        assert_eq!(yearly, date(2026, 3, 5));
    }

    #[test]
    fn due_day_clamps_to_short_months() {
        let due = next_due_date(date(2025, 2, 10), BillingFrequency::Monthly, 31);
        assert_eq!(due, date(2025, 2, 28));

        let advanced = next_due_date(date(2025, 1, 31), BillingFrequency::Monthly, 31);
        assert_eq!(advanced, date(2025, 2, 28));
    }

    #[test]
    fn december_rollover_crosses_the_year() {
        let due = next_due_date(date(2025, 12, 20), BillingFrequency::Monthly, 5);
        assert_eq!(due, date(2026, 1, 5));

        let quarterly = next_due_date(date(2025, 11, 20), BillingFrequency::Quarterly, 10);
        assert_eq!(quarterly, date(2026, 2, 10));
    }

    #[test]
    fn parses_frequencies() {
        assert_eq!(
            BillingFrequency::parse("monthly").unwrap(),
            BillingFrequency::Monthly
        );
        assert_eq!(BillingFrequency::parse("QUARTERLY").unwrap().period_months(), 3);
        assert!(BillingFrequency::parse("WEEKLY").is_err());
    }
}
