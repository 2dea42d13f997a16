//! Embedded database pools for integration tests.

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// Opens an in-memory SQLite pool for one test.
///
/// The pool is capped at a single connection: every connection to
/// `sqlite::memory:` is its own database, so a second connection would
/// see none of the test's tables.
///
/// # Errors
///
/// Returns the underlying sqlx error when the pool cannot be opened.
pub async fn sqlite_test_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}
