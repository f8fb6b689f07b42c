use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{create_row, get_row, list_rows, row_decimal};
use crate::schemas::CreateUtilityReadingInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilityKind {
    Fixed,
    Metered,
}

impl UtilityKind {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FIXED" => Ok(Self::Fixed),
            "METERED" => Ok(Self::Metered),
            other => Err(AppError::UnprocessableEntity(format!(
                "Unknown utility type '{other}'."
            ))),
        }
    }
}

/// Derived charge for one billing cycle of a lease utility.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingCharge {
    pub consumption: Decimal,
    pub amount: Decimal,
}

/// Compute the charge for a (previous, current) reading pair.
///
/// METERED: consumption is the reading delta; a negative delta means meter
/// rollover or a data entry error and is rejected, never billed as zero.
/// FIXED: the flat amount applies regardless of readings.
pub fn compute_reading_charge(
    kind: UtilityKind,
    unit_price: Option<Decimal>,
    fixed_amount: Option<Decimal>,
    previous_value: Decimal,
    current_value: Decimal,
) -> AppResult<ReadingCharge> {
    match kind {
        UtilityKind::Fixed => {
            let amount = fixed_amount.ok_or_else(|| {
                AppError::UnprocessableEntity(
                    "Fixed utility has no fixed_amount configured.".to_string(),
                )
            })?;
            Ok(ReadingCharge {
                consumption: Decimal::ZERO,
                amount,
            })
        }
        UtilityKind::Metered => {
            let consumption = current_value - previous_value;
            if consumption < Decimal::ZERO {
                return Err(AppError::UnprocessableEntity(format!(
                    "Negative consumption ({consumption}): current reading {current_value} is below previous reading {previous_value}."
                )));
            }
            let unit_price = unit_price.ok_or_else(|| {
                AppError::UnprocessableEntity(
                    "Metered utility has no unit_price configured.".to_string(),
                )
            })?;
            Ok(ReadingCharge {
                consumption,
                amount: (consumption * unit_price).round_dp(2),
            })
        }
    }
}

/// Fail-closed validation for externally-entered utility bills.
pub fn validate_bill_intake(total_amount: Decimal, consumption: Option<Decimal>) -> AppResult<()> {
    if total_amount <= Decimal::ZERO {
        return Err(AppError::UnprocessableEntity(
            "Utility bill total must be positive.".to_string(),
        ));
    }
    if let Some(consumption) = consumption {
        if consumption < Decimal::ZERO {
            return Err(AppError::UnprocessableEntity(
                "Utility bill consumption cannot be negative.".to_string(),
            ));
        }
    }
    Ok(())
}

/// Store a meter reading, deriving its billed amount from the previous
/// reading on the same lease utility. The first reading of a meter is a
/// baseline: stored without an amount.
pub async fn record_reading(
    pool: &PgPool,
    input: &CreateUtilityReadingInput,
) -> AppResult<Value> {
    let lease_utility = get_row(pool, "lease_utilities", &input.lease_utility_id, "id").await?;
    let utility_id = value_str(&lease_utility, "utility_id");
    let utility = get_row(pool, "utilities", &utility_id, "id").await?;

    let kind = UtilityKind::parse(&value_str(&utility, "utility_type"))?;
    let previous = latest_reading(pool, &input.lease_utility_id).await?;

    let charge = match (kind, &previous) {
        (UtilityKind::Metered, None) => None,
        (_, previous) => {
            let previous_value = previous
                .as_ref()
                .and_then(|row| row_decimal(row, "reading_value"))
                .unwrap_or(Decimal::ZERO);
            Some(compute_reading_charge(
                kind,
                row_decimal(&utility, "unit_price"),
                row_decimal(&utility, "fixed_amount"),
                previous_value,
                input.reading_value,
            )?)
        }
    };

    let mut row = Map::new();
    row.insert(
        "lease_utility_id".to_string(),
        Value::String(input.lease_utility_id.clone()),
    );
    row.insert(
        "reading_value".to_string(),
        Value::String(input.reading_value.to_string()),
    );
    row.insert(
        "reading_date".to_string(),
        Value::String(input.reading_date.to_string()),
    );
    if let Some(charge) = charge {
        row.insert(
            "amount".to_string(),
            Value::String(charge.amount.to_string()),
        );
    }

    let created = create_row(pool, "utility_readings", &row).await?;
    info!(
        lease_utility_id = %input.lease_utility_id,
        reading_value = %input.reading_value,
        baseline = charge.is_none(),
        "Utility reading recorded"
    );
    Ok(created)
}

async fn latest_reading(pool: &PgPool, lease_utility_id: &str) -> AppResult<Option<Value>> {
    let mut filters = Map::new();
    filters.insert(
        "lease_utility_id".to_string(),
        Value::String(lease_utility_id.to_string()),
    );
    let mut rows = list_rows(
        pool,
        "utility_readings",
        Some(&filters),
        1,
        0,
        "reading_date",
        false,
    )
    .await?;
    Ok(rows.pop())
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

    use super::{compute_reading_charge, validate_bill_intake, UtilityKind};

    #[test]
    fn metered_charge_is_delta_times_price() {
        let charge = compute_reading_charge(
            UtilityKind::Metered,
            Some(dec!(0.15)),
            None,
            dec!(1000),
            dec!(1240),
        )
        .expect("charge");
        assert_eq!(charge.consumption, dec!(240));
        assert_eq!(charge.amount, dec!(36.00));
    }

    #[test]
    fn rejects_negative_consumption() {
        let result = compute_reading_charge(
            UtilityKind::Metered,
            Some(dec!(0.15)),
            None,
            dec!(1240),
            dec!(1000),
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_consumption_is_billable() {
        let charge = compute_reading_charge(
            UtilityKind::Metered,
            Some(dec!(0.15)),
            None,
            dec!(500),
            dec!(500),
        )
        .expect("charge");
        assert_eq!(charge.amount, dec!(0.00));
    }

    #[test]
    fn fixed_charge_ignores_readings() {
        let charge = compute_reading_charge(
            UtilityKind::Fixed,
            None,
            Some(dec!(25.00)),
            dec!(900),
            dec!(100),
        )
        .expect("charge");
        assert_eq!(charge.consumption, dec!(0));
        assert_eq!(charge.amount, dec!(25.00));
    }

    #[test]
    fn bill_intake_fails_closed() {
        assert!(validate_bill_intake(dec!(0), None).is_err());
        assert!(validate_bill_intake(dec!(-10), None).is_err());
        assert!(validate_bill_intake(dec!(10), Some(dec!(-1))).is_err());
        assert!(validate_bill_intake(dec!(10), Some(dec!(0))).is_ok());
    }

    #[test]
    fn parses_utility_kinds() {
        assert_eq!(UtilityKind::parse("metered").unwrap(), UtilityKind::Metered);
        assert_eq!(UtilityKind::parse("FIXED").unwrap(), UtilityKind::Fixed);
        assert!(UtilityKind::parse("SOLAR").is_err());
    }
}
