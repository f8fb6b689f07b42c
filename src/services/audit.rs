use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::warn;

use crate::repository::table_service::create_row;

/// Append an audit trail row for a billing mutation. Best-effort: audit
/// failures are logged and never fail the request that triggered them.
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    before: Option<Value>,
    after: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut row = Map::new();
    row.insert("action".to_string(), Value::String(action.to_string()));
    row.insert(
        "entity_type".to_string(),
        Value::String(entity_type.to_string()),
    );
    if let Some(entity_id) = entity_id.map(str::trim).filter(|value| !value.is_empty()) {
        row.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
    }
    if let Some(before) = before {
        row.insert("before_state".to_string(), before);
    }
    if let Some(after) = after {
        row.insert("after_state".to_string(), after);
    }

    if let Err(error) = create_row(pool, "audit_logs", &row).await {
        warn!(action, entity_type, error = %error, "Failed to write audit log");
    }
}
