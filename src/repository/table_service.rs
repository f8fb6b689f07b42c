use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, PgConnection, Postgres, QueryBuilder, Row};

use crate::error::AppError;

/// Tables the billing engine is allowed to touch. Everything else in the
/// platform schema belongs to other services.
const ALLOWED_TABLES: &[&str] = &[
    "accounts",
    "audit_logs",
    "invoice_items",
    "invoices",
    "journal_entries",
    "journal_lines",
    "lease_utilities",
    "leases",
    "payments",
    "properties",
    "units",
    "utilities",
    "utility_allocations",
    "utility_bills",
    "utility_readings",
];

pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query.push(" ORDER BY t.").push(order_name);
    query.push(if ascending { " ASC" } else { " DESC" });
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        &infer_scalar(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let mut conn = pool.acquire().await.map_err(map_db_error)?;
    create_row_tx(&mut conn, table, payload).await
}

/// Insert through `jsonb_populate_record` so PostgreSQL resolves column
/// types (uuid, enum, date, numeric) from the table definition. Usable both
/// standalone and inside a caller-owned transaction.
pub async fn create_row_tx(
    conn: &mut PgConnection,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }

    let keys = sorted_valid_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    push_column_list(&mut query, &keys);
    query.push(") SELECT ");
    push_record_columns(&mut query, &keys);
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row_tx(
    conn: &mut PgConnection,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let keys = sorted_valid_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
            separated.push_unseparated(" = r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        &infer_scalar(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn sorted_valid_keys(payload: &Map<String, Value>) -> Result<Vec<String>, AppError> {
    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }
    Ok(keys)
}

fn push_column_list(query: &mut QueryBuilder<Postgres>, keys: &[String]) {
    let mut separated = query.separated(", ");
    for key in keys {
        separated.push(key.as_str());
    }
}

fn push_record_columns(query: &mut QueryBuilder<Postgres>, keys: &[String]) {
    let mut separated = query.separated(", ");
    for key in keys {
        separated.push("r.");
        separated.push_unseparated(key.as_str());
    }
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    let mut chars = trimmed.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_');
    let rest_ok = trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    });
    if !starts_ok || !rest_ok {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Gte,
    Lte,
}

/// Filter keys support a `column__gte` / `column__lte` suffix for range
/// scans (due-date windows) and array values for `IN`-style matches.
fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    if let Some((column, suffix)) = filter_key.rsplit_once("__") {
        let operator = match suffix {
            "gte" => FilterOperator::Gte,
            "lte" => FilterOperator::Lte,
            "in" => FilterOperator::Eq,
            _ => {
                return Err(AppError::BadRequest(format!(
                    "Unsupported filter suffix '{suffix}'."
                )))
            }
        };
        return Ok((validate_identifier(column)?, operator));
    }
    Ok((validate_identifier(filter_key)?, FilterOperator::Eq))
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if operator != FilterOperator::Eq {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                return Ok(());
            }
            query.push(" AND ");
            push_array_filter(query, column, items);
            Ok(())
        }
        _ => {
            query.push(" AND ");
            push_scalar_filter(query, column, operator, &infer_scalar(column, value));
            Ok(())
        }
    }
}

fn push_scalar_filter(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &ScalarFilter,
) {
    query.push("t.").push(column);
    let sql_operator = match operator {
        FilterOperator::Eq => " = ",
        FilterOperator::Gte => " >= ",
        FilterOperator::Lte => " <= ",
    };
    match value {
        ScalarFilter::Text(text) => {
            query
                .push("::text")
                .push(sql_operator)
                .push_bind(text.clone());
        }
        ScalarFilter::Uuid(id) => {
            query.push(sql_operator).push_bind(*id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(sql_operator).push_bind(*flag);
        }
        ScalarFilter::I64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::Date(date) => {
            query.push(sql_operator).push_bind(*date);
        }
    }
}

fn push_array_filter(query: &mut QueryBuilder<Postgres>, column: &str, items: &[Value]) {
    if is_uuid_identifier(column) {
        let parsed = items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|text| uuid::Uuid::parse_str(text.trim()).ok())
            .collect::<Vec<_>>();
        if parsed.len() == items.len() {
            query
                .push("t.")
                .push(column)
                .push(" = ANY(")
                .push_bind(parsed)
                .push(")");
            return;
        }
    }
    let rendered = items
        .iter()
        .map(|item| match item {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>();
    query
        .push("t.")
        .push(column)
        .push("::text = ANY(")
        .push_bind(rendered)
        .push(")");
}

fn infer_scalar(column: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => number
            .as_i64()
            .map(ScalarFilter::I64)
            .unwrap_or_else(|| ScalarFilter::Text(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_date_identifier(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        other => ScalarFilter::Text(other.to_string()),
    }
}

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || normalized.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized.ends_with("_date")
        || normalized.ends_with("_on")
        || matches!(normalized, "period_start" | "period_end" | "due_date")
}

/// Read a numeric column out of a `row_to_json` row. Postgres renders
/// NUMERIC as a JSON number; intake payloads may carry it as a string.
pub fn row_decimal(row: &Value, key: &str) -> Option<rust_decimal::Decimal> {
    match row.as_object()?.get(key)? {
        Value::Number(number) => number.to_string().parse().ok(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{parse_filter_key, push_filter_clause, validate_identifier, FilterOperator};

    #[test]
    fn rejects_unknown_tables_and_bad_identifiers() {
        assert!(super::validate_table("organizations").is_err());
        assert!(super::validate_table("invoices").is_ok());
        assert!(validate_identifier("due_date").is_ok());
        assert!(validate_identifier("due-date").is_err());
        assert!(validate_identifier("1invoice").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn parses_range_suffixes() {
        assert!(matches!(
            parse_filter_key("due_date__gte"),
            Ok(("due_date", FilterOperator::Gte))
        ));
        assert!(matches!(
            parse_filter_key("status"),
            Ok(("status", FilterOperator::Eq))
        ));
        assert!(parse_filter_key("status__ilike").is_err());
    }

    #[test]
    fn builds_date_range_sql() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM invoices t WHERE 1=1");
        push_filter_clause(
            &mut query,
            "due_date__gte",
            &Value::String("2025-01-01".to_string()),
        )
        .expect("valid clause");
        let sql = query.sql();
        assert!(sql.contains("t.due_date >= "), "got: {sql}");
    }

    #[test]
    fn builds_status_set_sql() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM invoices t WHERE 1=1");
        let statuses = Value::Array(vec![
            Value::String("pending".to_string()),
            Value::String("overdue".to_string()),
        ]);
        push_filter_clause(&mut query, "status", &statuses).expect("valid clause");
        let sql = query.sql();
        assert!(sql.contains("t.status::text = ANY("), "got: {sql}");
    }

    #[test]
    fn skips_null_and_empty_array_filters() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM invoices t WHERE 1=1");
        push_filter_clause(&mut query, "lease_id", &Value::Null).expect("null ok");
        push_filter_clause(&mut query, "status", &Value::Array(Vec::new())).expect("empty ok");
        assert_eq!(query.sql(), "SELECT 1 FROM invoices t WHERE 1=1");
    }

    #[test]
    fn insert_sql_uses_jsonb_populate_record() {
        let mut payload = Map::new();
        payload.insert("amount".to_string(), Value::String("1500.00".to_string()));
        payload.insert(
            "lease_id".to_string(),
            Value::String("550e8400-e29b-41d4-a716-446655440000".to_string()),
        );

        let keys = super::sorted_valid_keys(&payload).expect("valid keys");
        let mut query = QueryBuilder::<Postgres>::new("INSERT INTO invoices (");
        super::push_column_list(&mut query, &keys);
        query.push(") SELECT ");
        super::push_record_columns(&mut query, &keys);
        query.push(" FROM jsonb_populate_record(NULL::invoices, ");
        query.push_bind(Value::Object(payload));
        query.push(") r");

        let sql = query.sql();
        assert!(
            sql.contains("jsonb_populate_record(NULL::invoices"),
            "got: {sql}"
        );
        assert!(sql.contains("SELECT r.amount, r.lease_id"), "got: {sql}");
    }
}
