//! `SQLite` schema bootstrap logic.
//!
//! Uses `CREATE TABLE IF NOT EXISTS`, so it is safe to re-run on every
//! startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the table definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id              TEXT PRIMARY KEY NOT NULL,
    owner           TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('created','starting','running','stopped','error')),
    created_at      TEXT NOT NULL,
    last_seen       TEXT NOT NULL,
    error_message   TEXT
);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
