use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::config::AppConfig;

/// Build a lazily-connecting Postgres pool from configuration.
///
/// Returns `None` when no DATABASE_URL is configured so the service can
/// still boot (health reports degraded) in environments without a database.
pub fn build_pg_pool(config: &AppConfig) -> Result<Option<PgPool>, sqlx::Error> {
    let Some(url) = config.database_url.as_deref() else {
        return Ok(None);
    };

    let options = PgConnectOptions::from_str(url)?;
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections.max(1))
        .min_connections(config.db_pool_min_connections)
        .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds.max(1)))
        .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds.max(1)))
        .connect_lazy_with(options);

    Ok(Some(pool))
}
