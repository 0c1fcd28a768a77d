//! Database pool construction
//!
//! Two pool flavors: the regular request pool (small, short acquire
//! timeout, suitable for pooler endpoints) and the migration pool (single
//! connection, longer timeout, pointed at the direct database URL so DDL
//! is not interleaved through a transaction pooler).

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the regular query pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections = 10, "Database pool created");
    Ok(pool)
}

/// Create a single-connection pool for running migrations.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    tracing::info!("Migration pool created");
    Ok(pool)
}
