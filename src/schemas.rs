use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

fn default_equal_usage() -> String {
    "EQUAL_USAGE".to_string()
}
fn default_false() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunBillingCycleInput {
    /// Scheduling reference date. Defaults to today (UTC) at the HTTP edge;
    /// core logic never reads the wall clock.
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateUtilityBillInput {
    pub property_id: String,
    pub utility_id: String,
    #[validate(length(min = 1, max = 255))]
    pub provider_name: String,
    pub total_amount: Decimal,
    pub consumption: Option<Decimal>,
    pub rate: Option<Decimal>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub bill_date: NaiveDate,
    pub due_date: NaiveDate,
    #[serde(default = "default_equal_usage")]
    pub split_method: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApproveUtilityBillInput {
    #[serde(default = "default_false")]
    pub paid_immediately: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateUtilityInvoicesInput {
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateUtilityReadingInput {
    pub lease_utility_id: String,
    pub reading_value: Decimal,
    pub reading_date: NaiveDate,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RecordPaymentInput {
    pub invoice_id: String,
    pub amount: Decimal,
    #[validate(length(min = 1, max = 64))]
    pub method: String,
    pub reference: Option<String>,
    pub paid_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoicesQuery {
    pub lease_id: Option<String>,
    pub status: Option<String>,
    pub invoice_type: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalQuery {
    pub account_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePath {
    pub invoice_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillPath {
    pub bill_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeasePath {
    pub lease_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountPath {
    pub account_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryPath {
    pub entry_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReverseEntryInput {
    pub reason: String,
}

pub fn clamp_limit_in_range(limit: Option<i64>, min: i64, max: i64) -> i64 {
    limit.unwrap_or(max).clamp(min, max)
}

pub fn serialize_to_map<T: Serialize>(input: &T) -> Map<String, Value> {
    match serde_json::to_value(input) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

pub fn remove_nulls(mut map: Map<String, Value>) -> Map<String, Value> {
    map.retain(|_, value| !value.is_null());
    map
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::Value;

    use super::{clamp_limit_in_range, remove_nulls, serialize_to_map, CreateUtilityBillInput};

    #[test]
    fn clamps_limits() {
        assert_eq!(clamp_limit_in_range(None, 1, 100), 100);
        assert_eq!(clamp_limit_in_range(Some(0), 1, 100), 1);
        assert_eq!(clamp_limit_in_range(Some(5000), 1, 100), 100);
        assert_eq!(clamp_limit_in_range(Some(42), 1, 100), 42);
    }

    #[test]
    fn bill_input_round_trips_through_map() {
        let input: CreateUtilityBillInput = serde_json::from_value(serde_json::json!({
            "property_id": "550e8400-e29b-41d4-a716-446655440000",
            "utility_id": "550e8400-e29b-41d4-a716-446655440001",
            "provider_name": "Metro Water",
            "total_amount": "63.00",
            "period_start": "2025-01-01",
            "period_end": "2025-01-31",
            "bill_date": "2025-02-01",
            "due_date": "2025-02-15"
        }))
        .expect("valid input");
        assert_eq!(input.split_method, "EQUAL_USAGE");
        assert_eq!(input.total_amount, dec!(63.00));

        let map = remove_nulls(serialize_to_map(&input));
        assert!(!map.contains_key("consumption"));
        assert_eq!(
            map.get("provider_name"),
            Some(&Value::String("Metro Water".to_string()))
        );
    }
}
