use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db::build_pg_pool;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db_pool: Option<PgPool>,
    /// Chart-of-accounts rows keyed by account code. Accounts are read-mostly
    /// reference data; balances are never cached.
    pub accounts_cache: Cache<String, Value>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = build_pg_pool(&config)?;
        if db_pool.is_none() {
            tracing::warn!("DATABASE_URL is not set — billing endpoints will report a dependency error");
        }

        let accounts_cache = Cache::builder()
            .max_capacity(config.accounts_cache_max_entries)
            .time_to_live(Duration::from_secs(config.accounts_cache_ttl_seconds.max(1)))
            .build();

        Ok(Self {
            config,
            db_pool,
            accounts_cache,
        })
    }
}
