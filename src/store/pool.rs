use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;

/// Thin wrapper around a Postgres connection pool so callers depend on
/// `DbPool` rather than `sqlx::PgPool` directly.
#[derive(Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
            .connect(&config.url)
            .await
            .context("failed to connect to postgres")?;

        Ok(Self { pool })
    }

    pub fn get(&self) -> &PgPool {
        &self.pool
    }
}
