//! Storage layer: DuckDB behind an r2d2 pool, one service module per
//! collection. This is the only place in the engine with durable I/O.

pub mod models;
pub mod monitor_service;
pub mod result_service;
pub mod scheduler_job_service;

use duckdb::{Connection, Row};
use tracing::{error, info};

pub type DbPool = r2d2::Pool<duckdb::DuckdbConnectionManager>;

/// Open a pooled connection to the given DuckDB file and run migrations.
pub fn open_pool(path: &str) -> Result<DbPool, crate::web::error::AppError> {
    let manager = duckdb::DuckdbConnectionManager::file(path)
        .map_err(|e| crate::web::error::AppError::DatabaseError(e.to_string()))?;
    let pool = r2d2::Pool::new(manager)?;
    initialize_db(&*pool.get()?)?;
    Ok(pool)
}

/// Run the initial schema migration. Idempotent.
pub fn initialize_db(conn: &Connection) -> Result<(), duckdb::Error> {
    info!("Running DuckDB migrations...");
    let migrations = include_str!("../../migrations/20250712000000_create_initial_tables.sql");
    conn.execute_batch(migrations).map_err(|e| {
        error!("Failed to execute DuckDB migrations: {}", e);
        e
    })?;
    info!("DuckDB migrations completed.");
    Ok(())
}

/// Decode a JSON TEXT column, treating empty strings as NULL.
pub fn json_from_row(
    row: &Row<'_>,
    col_name: &str,
) -> Result<Option<serde_json::Value>, duckdb::Error> {
    let value: Option<String> = row.get(col_name)?;
    match value {
        Some(s) if !s.is_empty() => serde_json::from_str(&s).map(Some).map_err(|e| {
            duckdb::Error::FromSqlConversionFailure(0, duckdb::types::Type::Text, Box::new(e))
        }),
        _ => Ok(None),
    }
}
