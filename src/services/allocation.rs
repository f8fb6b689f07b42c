use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{
    create_row_tx, get_row, list_rows, map_db_error, row_decimal, update_row_tx,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMethod {
    EqualUsage,
    ConsumptionWeighted,
}

impl SplitMethod {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "EQUAL_USAGE" => Ok(Self::EqualUsage),
            "CONSUMPTION_WEIGHTED" => Ok(Self::ConsumptionWeighted),
            other => Err(AppError::UnprocessableEntity(format!(
                "Unknown split method '{other}'."
            ))),
        }
    }
}

/// One unit's computed share of a property-level bill.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationShare {
    pub unit_id: String,
    pub amount: Decimal,
    pub percentage: Decimal,
}

/// Split `total` evenly across `unit_ids`. The first n-1 shares are the
/// per-unit quotient truncated to cents; the last share absorbs the
/// remainder so the amounts sum to `total` exactly and percentages to 100.
pub fn split_equal(total: Decimal, unit_ids: &[String]) -> AppResult<Vec<AllocationShare>> {
    let weights = vec![Decimal::ONE; unit_ids.len()];
    split_weighted(total, unit_ids, &weights)
}

/// Split `total` across `unit_ids` proportionally to `weights`.
pub fn split_weighted(
    total: Decimal,
    unit_ids: &[String],
    weights: &[Decimal],
) -> AppResult<Vec<AllocationShare>> {
    if unit_ids.is_empty() {
        return Err(AppError::UnprocessableEntity(
            "Cannot allocate a bill across zero candidate units.".to_string(),
        ));
    }
    if total <= Decimal::ZERO {
        return Err(AppError::UnprocessableEntity(
            "Bill total must be positive to allocate.".to_string(),
        ));
    }
    if weights.len() != unit_ids.len() || weights.iter().any(|weight| *weight < Decimal::ZERO) {
        return Err(AppError::UnprocessableEntity(
            "Allocation weights must be non-negative, one per unit.".to_string(),
        ));
    }
    let total_weight: Decimal = weights.iter().copied().sum();
    if total_weight <= Decimal::ZERO {
        return Err(AppError::UnprocessableEntity(
            "Total allocation weight is zero; record consumption or use EQUAL_USAGE.".to_string(),
        ));
    }

    let hundred = dec!(100);
    let mut shares = Vec::with_capacity(unit_ids.len());
    let mut amount_assigned = Decimal::ZERO;
    let mut percentage_assigned = Decimal::ZERO;

    for (index, unit_id) in unit_ids.iter().enumerate() {
        let is_last = index == unit_ids.len() - 1;
        let (amount, percentage) = if is_last {
            // Remainder cent (and percentage residue) lands here.
            (total - amount_assigned, hundred - percentage_assigned)
        } else {
            // Multiply before dividing: an even split of 63.00 across 3 must
            // come out at exactly 21.00, not trunc(63 * 0.3333…) = 20.99.
            let amount = (total * weights[index] / total_weight)
                .round_dp_with_strategy(2, RoundingStrategy::ToZero);
            let percentage = (hundred * weights[index] / total_weight)
                .round_dp_with_strategy(2, RoundingStrategy::ToZero);
            (amount, percentage)
        };
        amount_assigned += amount;
        percentage_assigned += percentage;
        shares.push(AllocationShare {
            unit_id: unit_id.clone(),
            amount,
            percentage,
        });
    }

    debug_assert_eq!(amount_assigned, total);
    debug_assert_eq!(percentage_assigned, hundred);
    Ok(shares)
}

/// Allocate a pending utility bill across the property's occupied units.
///
/// The allocation rows and the bill's `allocated` status transition commit in
/// one transaction; a partially-allocated bill is never observable.
pub async fn allocate_bill(pool: &PgPool, bill_id: &str) -> AppResult<Vec<Value>> {
    let bill = get_row(pool, "utility_bills", bill_id, "id").await?;

    let status = value_str(&bill, "status");
    if status != "pending" {
        return Err(AppError::Conflict(format!(
            "Utility bill is '{status}'; only pending bills can be allocated."
        )));
    }

    let total_amount = row_decimal(&bill, "total_amount").ok_or_else(|| {
        AppError::UnprocessableEntity("Utility bill has no parseable total amount.".to_string())
    })?;
    let property_id = value_str(&bill, "property_id");
    let split_method = SplitMethod::parse(&value_str(&bill, "split_method"))?;

    let unit_ids = occupied_unit_ids(pool, &property_id).await?;
    let shares = match split_method {
        SplitMethod::EqualUsage => split_equal(total_amount, &unit_ids)?,
        SplitMethod::ConsumptionWeighted => {
            let utility_id = value_str(&bill, "utility_id");
            let period_start = value_str(&bill, "period_start");
            let period_end = value_str(&bill, "period_end");
            let weights =
                unit_consumption_weights(pool, &unit_ids, &utility_id, &period_start, &period_end)
                    .await?;
            split_weighted(total_amount, &unit_ids, &weights)?
        }
    };

    let mut tx = pool.begin().await.map_err(map_db_error)?;
    let mut created = Vec::with_capacity(shares.len());
    for share in &shares {
        let mut row = Map::new();
        row.insert(
            "utility_bill_id".to_string(),
            Value::String(bill_id.to_string()),
        );
        row.insert("unit_id".to_string(), Value::String(share.unit_id.clone()));
        row.insert(
            "amount".to_string(),
            Value::String(share.amount.to_string()),
        );
        row.insert(
            "percentage".to_string(),
            Value::String(share.percentage.to_string()),
        );
        created.push(create_row_tx(&mut tx, "utility_allocations", &row).await?);
    }

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("allocated".to_string()));
    update_row_tx(&mut tx, "utility_bills", bill_id, &patch, "id").await?;
    tx.commit().await.map_err(map_db_error)?;

    info!(
        bill_id,
        units = created.len(),
        total = %total_amount,
        "Utility bill allocated"
    );
    Ok(created)
}

async fn occupied_unit_ids(pool: &PgPool, property_id: &str) -> AppResult<Vec<String>> {
    let mut filters = Map::new();
    filters.insert(
        "property_id".to_string(),
        Value::String(property_id.to_string()),
    );
    filters.insert("is_occupied".to_string(), Value::Bool(true));

    let units = list_rows(pool, "units", Some(&filters), 500, 0, "code", true).await?;
    Ok(units
        .iter()
        .map(|unit| value_str(unit, "id"))
        .filter(|id| !id.is_empty())
        .collect())
}

/// Per-unit consumption over the bill period: the spread between the highest
/// and lowest meter reading recorded in the window for the unit's active
/// lease. Units without two readings weigh zero.
async fn unit_consumption_weights(
    pool: &PgPool,
    unit_ids: &[String],
    utility_id: &str,
    period_start: &str,
    period_end: &str,
) -> AppResult<Vec<Decimal>> {
    let mut weights = Vec::with_capacity(unit_ids.len());
    for unit_id in unit_ids {
        let row: Option<(Option<Decimal>,)> = sqlx::query_as(
            "SELECT MAX(r.reading_value) - MIN(r.reading_value)
             FROM utility_readings r
             JOIN lease_utilities lu ON lu.id = r.lease_utility_id
             JOIN leases l ON l.id = lu.lease_id
             WHERE l.unit_id = $1::uuid
               AND lu.utility_id = $2::uuid
               AND r.reading_date >= $3::date
               AND r.reading_date <= $4::date
             HAVING COUNT(*) >= 2",
        )
        .bind(unit_id)
        .bind(utility_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

        let spread = row.and_then(|(value,)| value).unwrap_or(Decimal::ZERO);
        weights.push(spread.max(Decimal::ZERO));
    }
    Ok(weights)
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
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::{split_equal, split_weighted, SplitMethod};

    fn units(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("unit-{i}")).collect()
    }

    #[test]
    fn divisible_total_splits_evenly() {
        let shares = split_equal(dec!(63.00), &units(3)).expect("splits");
        assert_eq!(
            shares.iter().map(|s| s.amount).collect::<Vec<_>>(),
            vec![dec!(21.00), dec!(21.00), dec!(21.00)]
        );
        assert_eq!(shares.iter().map(|s| s.percentage).sum::<Decimal>(), dec!(100));
    }

    #[test]
    fn last_share_absorbs_remainder_cent() {
        let shares = split_equal(dec!(10.00), &units(3)).expect("splits");
        assert_eq!(
            shares.iter().map(|s| s.amount).collect::<Vec<_>>(),
            vec![dec!(3.33), dec!(3.33), dec!(3.34)]
        );
        assert_eq!(shares.iter().map(|s| s.amount).sum::<Decimal>(), dec!(10.00));
        assert_eq!(shares.iter().map(|s| s.percentage).sum::<Decimal>(), dec!(100));
    }

    #[test]
    fn single_unit_takes_the_whole_bill() {
        let shares = split_equal(dec!(87.65), &units(1)).expect("splits");
        assert_eq!(shares[0].amount, dec!(87.65));
        assert_eq!(shares[0].percentage, dec!(100));
    }

    #[test]
    fn weighted_split_follows_consumption() {
        let weights = vec![dec!(30), dec!(10)];
        let shares = split_weighted(dec!(40.00), &units(2), &weights).expect("splits");
        assert_eq!(shares[0].amount, dec!(30.00));
        assert_eq!(shares[1].amount, dec!(10.00));
        assert_eq!(shares[0].percentage, dec!(75.00));
    }

    #[test]
    fn weighted_split_sum_is_exact_for_odd_weights() {
        let weights = vec![dec!(1), dec!(1), dec!(1)];
        let shares = split_weighted(dec!(100.00), &units(3), &weights).expect("splits");
        assert_eq!(
            shares.iter().map(|s| s.amount).sum::<Decimal>(),
            dec!(100.00)
        );
        assert_eq!(shares[2].amount, dec!(33.34));
    }

    #[test]
    fn fails_closed_on_empty_units_and_bad_totals() {
        assert!(split_equal(dec!(10.00), &units(0)).is_err());
        assert!(split_equal(dec!(0), &units(2)).is_err());
        assert!(split_equal(dec!(-5), &units(2)).is_err());
        assert!(split_weighted(dec!(10.00), &units(2), &[dec!(0), dec!(0)]).is_err());
    }

    #[test]
    fn parses_split_methods() {
        assert_eq!(
            SplitMethod::parse("equal_usage").unwrap(),
            SplitMethod::EqualUsage
        );
        assert_eq!(
            SplitMethod::parse("CONSUMPTION_WEIGHTED").unwrap(),
            SplitMethod::ConsumptionWeighted
        );
        assert!(SplitMethod::parse("BY_AREA").is_err());
    }
}
