use chrono::NaiveDate;
use moka::future::Cache;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{create_row_tx, get_row, list_rows, map_db_error};

pub const ACCT_CASH: &str = "1000";
pub const ACCT_ACCOUNTS_RECEIVABLE: &str = "1100";
pub const ACCT_ACCOUNTS_PAYABLE: &str = "2000";
pub const ACCT_RENTAL_REVENUE: &str = "4000";
pub const ACCT_UTILITY_REVENUE: &str = "4100";
pub const ACCT_UTILITY_EXPENSE: &str = "5100";

/// Chart of accounts seeded lazily the first time a code is posted against.
const CHART: &[(&str, &str, &str)] = &[
    (ACCT_CASH, "Cash", "ASSET"),
    (ACCT_ACCOUNTS_RECEIVABLE, "Accounts Receivable", "ASSET"),
    (ACCT_ACCOUNTS_PAYABLE, "Accounts Payable", "LIABILITY"),
    (ACCT_RENTAL_REVENUE, "Rental Revenue", "REVENUE"),
    (ACCT_UTILITY_REVENUE, "Utility Revenue", "REVENUE"),
    (ACCT_UTILITY_EXPENSE, "Utility Expense", "EXPENSE"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevenueSource {
    Rent,
    Utility,
}

/// Billing events the poster knows how to translate into journal entries.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    InvoiceIssued {
        invoice_id: String,
        source: RevenueSource,
        amount: Decimal,
        property_id: Option<String>,
        unit_id: Option<String>,
        issued_on: NaiveDate,
    },
    PaymentReceived {
        payment_id: String,
        invoice_id: String,
        amount: Decimal,
        paid_on: NaiveDate,
    },
    UtilityBillApproved {
        bill_id: String,
        amount: Decimal,
        property_id: Option<String>,
        paid_immediately: bool,
        bill_date: NaiveDate,
    },
}

/// One journal line before account resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSpec {
    pub account_code: &'static str,
    pub debit: Decimal,
    pub credit: Decimal,
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    pub description: Option<String>,
}

impl LineSpec {
    fn debit(account_code: &'static str, amount: Decimal) -> Self {
        Self {
            account_code,
            debit: amount,
            credit: Decimal::ZERO,
            property_id: None,
            unit_id: None,
            description: None,
        }
    }

    fn credit(account_code: &'static str, amount: Decimal) -> Self {
        Self {
            account_code,
            debit: Decimal::ZERO,
            credit: amount,
            property_id: None,
            unit_id: None,
            description: None,
        }
    }

    fn tagged(mut self, property_id: Option<&String>, unit_id: Option<&String>) -> Self {
        self.property_id = property_id.cloned();
        self.unit_id = unit_id.cloned();
        self
    }
}

#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub transaction_date: NaiveDate,
    pub description: String,
    pub reference: String,
    pub lines: Vec<LineSpec>,
}

/// Translate a billing event into its double-entry shape.
pub fn build_entry(event: &BillingEvent) -> EntrySpec {
    match event {
        BillingEvent::InvoiceIssued {
            invoice_id,
            source,
            amount,
            property_id,
            unit_id,
            issued_on,
        } => {
            let (revenue_account, label) = match source {
                RevenueSource::Rent => (ACCT_RENTAL_REVENUE, "Rent invoice issued"),
                RevenueSource::Utility => (ACCT_UTILITY_REVENUE, "Utility invoice issued"),
            };
            EntrySpec {
                transaction_date: *issued_on,
                description: label.to_string(),
                reference: format!("invoice:{invoice_id}"),
                lines: vec![
                    LineSpec::debit(ACCT_ACCOUNTS_RECEIVABLE, *amount)
                        .tagged(property_id.as_ref(), unit_id.as_ref()),
                    LineSpec::credit(revenue_account, *amount)
                        .tagged(property_id.as_ref(), unit_id.as_ref()),
                ],
            }
        }
        BillingEvent::PaymentReceived {
            payment_id,
            invoice_id,
            amount,
            paid_on,
        } => EntrySpec {
            transaction_date: *paid_on,
            description: format!("Payment received against invoice {invoice_id}"),
            reference: format!("payment:{payment_id}"),
            lines: vec![
                LineSpec::debit(ACCT_CASH, *amount),
                LineSpec::credit(ACCT_ACCOUNTS_RECEIVABLE, *amount),
            ],
        },
        BillingEvent::UtilityBillApproved {
            bill_id,
            amount,
            property_id,
            paid_immediately,
            bill_date,
        } => {
            let liability_account = if *paid_immediately {
                ACCT_CASH
            } else {
                ACCT_ACCOUNTS_PAYABLE
            };
            EntrySpec {
                transaction_date: *bill_date,
                description: "Utility bill approved".to_string(),
                reference: format!("utility_bill:{bill_id}"),
                lines: vec![
                    LineSpec::debit(ACCT_UTILITY_EXPENSE, *amount)
                        .tagged(property_id.as_ref(), None),
                    LineSpec::credit(liability_account, *amount)
                        .tagged(property_id.as_ref(), None),
                ],
            }
        }
    }
}

/// A ledger that does not balance is worse than no entry: enforced before
/// anything is written, and a violation is a programming error, not input.
pub fn assert_balanced(lines: &[LineSpec]) -> AppResult<()> {
    if lines.len() < 2 {
        return Err(AppError::Internal(
            "Journal entry must carry at least two lines.".to_string(),
        ));
    }
    let debits: Decimal = lines.iter().map(|line| line.debit).sum();
    let credits: Decimal = lines.iter().map(|line| line.credit).sum();
    if debits != credits {
        return Err(AppError::Internal(format!(
            "Unbalanced journal entry: debits {debits} != credits {credits}."
        )));
    }
    if lines
        .iter()
        .any(|line| line.debit < Decimal::ZERO || line.credit < Decimal::ZERO)
    {
        return Err(AppError::Internal(
            "Journal lines cannot carry negative amounts.".to_string(),
        ));
    }
    Ok(())
}

/// Resolve the chart accounts an entry posts against. Runs outside the write
/// transaction; accounts are shared reference data never mutated by posters.
pub async fn resolve_entry_accounts(
    pool: &PgPool,
    accounts_cache: &Cache<String, Value>,
    spec: &EntrySpec,
) -> AppResult<Vec<String>> {
    let mut account_ids = Vec::with_capacity(spec.lines.len());
    for line in &spec.lines {
        let account = ensure_account(pool, accounts_cache, line.account_code).await?;
        account_ids.push(value_str(&account, "id"));
    }
    Ok(account_ids)
}

/// Write a balanced entry and its lines on the caller's connection, so a
/// caller can commit the entry atomically with the billing row it records.
pub async fn write_entry(
    conn: &mut sqlx::PgConnection,
    spec: &EntrySpec,
    account_ids: &[String],
) -> AppResult<Value> {
    if let Err(violation) = assert_balanced(&spec.lines) {
        error!(reference = %spec.reference, detail = %violation, "Refusing to post unbalanced journal entry");
        return Err(violation);
    }

    let mut entry_row = Map::new();
    entry_row.insert(
        "transaction_date".to_string(),
        Value::String(spec.transaction_date.to_string()),
    );
    entry_row.insert(
        "description".to_string(),
        Value::String(spec.description.clone()),
    );
    entry_row.insert(
        "reference".to_string(),
        Value::String(spec.reference.clone()),
    );
    let entry = create_row_tx(&mut *conn, "journal_entries", &entry_row).await?;
    let entry_id = value_str(&entry, "id");

    let mut lines = Vec::with_capacity(spec.lines.len());
    for (index, line) in spec.lines.iter().enumerate() {
        let mut line_row = Map::new();
        line_row.insert(
            "journal_entry_id".to_string(),
            Value::String(entry_id.clone()),
        );
        line_row.insert("line_no".to_string(), json!(index as i32 + 1));
        line_row.insert(
            "account_id".to_string(),
            Value::String(account_ids[index].clone()),
        );
        line_row.insert("debit".to_string(), Value::String(line.debit.to_string()));
        line_row.insert("credit".to_string(), Value::String(line.credit.to_string()));
        if let Some(property_id) = &line.property_id {
            line_row.insert("property_id".to_string(), Value::String(property_id.clone()));
        }
        if let Some(unit_id) = &line.unit_id {
            line_row.insert("unit_id".to_string(), Value::String(unit_id.clone()));
        }
        if let Some(description) = &line.description {
            line_row.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
        lines.push(create_row_tx(&mut *conn, "journal_lines", &line_row).await?);
    }

    info!(
        entry_id,
        reference = %spec.reference,
        lines = lines.len(),
        "Journal entry posted"
    );

    let mut entry_with_lines = entry;
    if let Some(obj) = entry_with_lines.as_object_mut() {
        obj.insert("lines".to_string(), Value::Array(lines));
    }
    Ok(entry_with_lines)
}

/// Corrections are offsetting entries; posted entries are never mutated.
pub async fn post_reversal(pool: &PgPool, entry_id: &str, reason: &str) -> AppResult<Value> {
    let original = get_row(pool, "journal_entries", entry_id, "id").await?;
    let original_lines = entry_lines(pool, entry_id).await?;
    if original_lines.len() < 2 {
        return Err(AppError::Internal(format!(
            "Journal entry {entry_id} has no lines to reverse."
        )));
    }

    let mut tx = pool.begin().await.map_err(map_db_error)?;

    let mut entry_row = Map::new();
    entry_row.insert(
        "transaction_date".to_string(),
        original
            .get("transaction_date")
            .cloned()
            .unwrap_or(Value::Null),
    );
    entry_row.insert(
        "description".to_string(),
        Value::String(format!("Reversal of {entry_id}: {reason}")),
    );
    entry_row.insert(
        "reference".to_string(),
        Value::String(format!("reversal:{entry_id}")),
    );
    let reversal = create_row_tx(&mut tx, "journal_entries", &entry_row).await?;
    let reversal_id = value_str(&reversal, "id");

    for (index, line) in original_lines.iter().enumerate() {
        let mut line_row = Map::new();
        line_row.insert(
            "journal_entry_id".to_string(),
            Value::String(reversal_id.clone()),
        );
        line_row.insert("line_no".to_string(), json!(index as i32 + 1));
        line_row.insert(
            "account_id".to_string(),
            line.get("account_id").cloned().unwrap_or(Value::Null),
        );
        // Swap sides.
        line_row.insert(
            "debit".to_string(),
            line.get("credit").cloned().unwrap_or(Value::Null),
        );
        line_row.insert(
            "credit".to_string(),
            line.get("debit").cloned().unwrap_or(Value::Null),
        );
        for key in ["property_id", "unit_id"] {
            if let Some(value) = line.get(key) {
                if !value.is_null() {
                    line_row.insert(key.to_string(), value.clone());
                }
            }
        }
        create_row_tx(&mut tx, "journal_lines", &line_row).await?;
    }

    tx.commit().await.map_err(map_db_error)?;

    info!(original = entry_id, reversal = reversal_id, "Journal entry reversed");
    Ok(reversal)
}

/// Look up (or lazily seed) a chart-of-accounts row by code.
pub async fn ensure_account(
    pool: &PgPool,
    accounts_cache: &Cache<String, Value>,
    code: &str,
) -> AppResult<Value> {
    if let Some(cached) = accounts_cache.get(code).await {
        return Ok(cached);
    }

    let (_, name, account_type) = CHART
        .iter()
        .find(|(chart_code, _, _)| *chart_code == code)
        .ok_or_else(|| {
            AppError::Internal(format!("Account code '{code}' is not in the chart."))
        })?;

    sqlx::query(
        "INSERT INTO accounts (code, name, account_type)
         VALUES ($1, $2, $3)
         ON CONFLICT (code) DO NOTHING",
    )
    .bind(code)
    .bind(name)
    .bind(account_type)
    .execute(pool)
    .await
    .map_err(map_db_error)?;

    let account = get_row(pool, "accounts", code, "code").await?;
    accounts_cache
        .insert(code.to_string(), account.clone())
        .await;
    Ok(account)
}

/// Derive an account balance by aggregating its journal lines. Asset and
/// expense accounts are debit-normal; the rest are credit-normal.
pub async fn account_balance(pool: &PgPool, account_id: &str) -> AppResult<Value> {
    let account = get_row(pool, "accounts", account_id, "id").await?;
    let account_type = value_str(&account, "account_type");

    let (debit_total, credit_total): (Decimal, Decimal) = sqlx::query_as(
        "SELECT COALESCE(SUM(debit), 0), COALESCE(SUM(credit), 0)
         FROM journal_lines
         WHERE account_id = $1::uuid",
    )
    .bind(account_id)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    let debit_normal = matches!(account_type.as_str(), "ASSET" | "EXPENSE");
    let balance = if debit_normal {
        debit_total - credit_total
    } else {
        credit_total - debit_total
    };

    Ok(json!({
        "account": account,
        "debit_total": debit_total.to_string(),
        "credit_total": credit_total.to_string(),
        "balance": balance.to_string(),
    }))
}

/// Journal listing (entries with their lines) for reporting consumers.
pub async fn list_journal(
    pool: &PgPool,
    account_id: Option<&str>,
    limit: i64,
) -> AppResult<Vec<Value>> {
    let entries = match account_id {
        Some(account_id) => {
            let rows = sqlx::query_as::<_, (String,)>(
                "SELECT DISTINCT journal_entry_id::text
                 FROM journal_lines
                 WHERE account_id = $1::uuid",
            )
            .bind(account_id)
            .fetch_all(pool)
            .await
            .map_err(map_db_error)?;

            if rows.is_empty() {
                return Ok(Vec::new());
            }
            let entry_ids = rows.into_iter().map(|(id,)| Value::String(id)).collect();
            let mut filters = Map::new();
            filters.insert("id".to_string(), Value::Array(entry_ids));
            list_rows(
                pool,
                "journal_entries",
                Some(&filters),
                limit,
                0,
                "transaction_date",
                false,
            )
            .await?
        }
        None => {
            list_rows(pool, "journal_entries", None, limit, 0, "transaction_date", false).await?
        }
    };

    let mut listed = Vec::with_capacity(entries.len());
    for mut entry in entries {
        let entry_id = value_str(&entry, "id");
        let lines = entry_lines(pool, &entry_id).await?;
        if let Some(obj) = entry.as_object_mut() {
            obj.insert("lines".to_string(), Value::Array(lines));
        }
        listed.push(entry);
    }
    Ok(listed)
}

async fn entry_lines(pool: &PgPool, entry_id: &str) -> AppResult<Vec<Value>> {
    let mut filters = Map::new();
    filters.insert(
        "journal_entry_id".to_string(),
        Value::String(entry_id.to_string()),
    );
    list_rows(pool, "journal_lines", Some(&filters), 100, 0, "line_no", true).await
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
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::{
        assert_balanced, build_entry, BillingEvent, LineSpec, RevenueSource,
        ACCT_ACCOUNTS_PAYABLE, ACCT_ACCOUNTS_RECEIVABLE, ACCT_CASH, ACCT_RENTAL_REVENUE,
        ACCT_UTILITY_EXPENSE, ACCT_UTILITY_REVENUE,
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn invoice_issued_debits_receivable_credits_revenue() {
        let entry = build_entry(&BillingEvent::InvoiceIssued {
            invoice_id: "inv-1".to_string(),
            source: RevenueSource::Rent,
            amount: dec!(1500.00),
            property_id: Some("prop-1".to_string()),
            unit_id: Some("unit-1".to_string()),
            issued_on: date(2025, 1, 15),
        });

        assert_eq!(entry.lines.len(), 2);
        assert_eq!(entry.lines[0].account_code, ACCT_ACCOUNTS_RECEIVABLE);
        assert_eq!(entry.lines[0].debit, dec!(1500.00));
        assert_eq!(entry.lines[1].account_code, ACCT_RENTAL_REVENUE);
        assert_eq!(entry.lines[1].credit, dec!(1500.00));
        assert_eq!(entry.lines[0].unit_id.as_deref(), Some("unit-1"));
        assert!(assert_balanced(&entry.lines).is_ok());
    }

    #[test]
    fn utility_invoice_credits_utility_revenue() {
        let entry = build_entry(&BillingEvent::InvoiceIssued {
            invoice_id: "inv-2".to_string(),
            source: RevenueSource::Utility,
            amount: dec!(21.00),
            property_id: None,
            unit_id: None,
            issued_on: date(2025, 2, 1),
        });
        assert_eq!(entry.lines[1].account_code, ACCT_UTILITY_REVENUE);
    }

    #[test]
    fn payment_received_moves_receivable_to_cash() {
        let entry = build_entry(&BillingEvent::PaymentReceived {
            payment_id: "pay-1".to_string(),
            invoice_id: "inv-1".to_string(),
            amount: dec!(750.00),
            paid_on: date(2025, 2, 3),
        });
        assert_eq!(entry.lines[0].account_code, ACCT_CASH);
        assert_eq!(entry.lines[1].account_code, ACCT_ACCOUNTS_RECEIVABLE);
        assert!(assert_balanced(&entry.lines).is_ok());
    }

    #[test]
    fn approved_bill_credits_payable_or_cash() {
        let on_credit = build_entry(&BillingEvent::UtilityBillApproved {
            bill_id: "bill-1".to_string(),
            amount: dec!(63.00),
            property_id: Some("prop-1".to_string()),
            paid_immediately: false,
            bill_date: date(2025, 2, 1),
        });
        assert_eq!(on_credit.lines[0].account_code, ACCT_UTILITY_EXPENSE);
        assert_eq!(on_credit.lines[1].account_code, ACCT_ACCOUNTS_PAYABLE);

        let paid_now = build_entry(&BillingEvent::UtilityBillApproved {
            bill_id: "bill-1".to_string(),
            amount: dec!(63.00),
            property_id: None,
            paid_immediately: true,
            bill_date: date(2025, 2, 1),
        });
        assert_eq!(paid_now.lines[1].account_code, ACCT_CASH);
    }

    #[test]
    fn rejects_unbalanced_or_degenerate_entries() {
        let unbalanced = vec![
            LineSpec::debit(ACCT_CASH, dec!(10.00)),
            LineSpec::credit(ACCT_RENTAL_REVENUE, dec!(9.99)),
        ];
        assert!(assert_balanced(&unbalanced).is_err());

        let single = vec![LineSpec::debit(ACCT_CASH, dec!(10.00))];
        assert!(assert_balanced(&single).is_err());

        let negative = vec![
            LineSpec::debit(ACCT_CASH, dec!(-10.00)),
            LineSpec::credit(ACCT_RENTAL_REVENUE, dec!(-10.00)),
        ];
        assert!(assert_balanced(&negative).is_err());
    }

    #[test]
    fn multi_line_entries_balance_as_a_whole() {
        let lines = vec![
            LineSpec::debit(ACCT_ACCOUNTS_RECEIVABLE, dec!(30.00)),
            LineSpec::credit(ACCT_RENTAL_REVENUE, dec!(21.00)),
            LineSpec::credit(ACCT_UTILITY_REVENUE, dec!(9.00)),
        ];
        assert!(assert_balanced(&lines).is_ok());
        let debits: Decimal = lines.iter().map(|l| l.debit).sum();
        assert_eq!(debits, dec!(30.00));
    }
}
