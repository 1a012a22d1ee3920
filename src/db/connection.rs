//! Database connection management using sqlx

use crate::config::DatabaseConfig;
use crate::error::ConfigError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

pub type DbPool = PgPool;

/// Initialize the database connection pool
pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| sqlx::Error::Configuration(Box::new(ConfigError::Missing("DATABASE_URL".to_string()))))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(config.acquire_timeout)
        .connect(url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("✅ Connected to PostgreSQL (pool size {})", config.pool_size);
    Ok(pool)
}
