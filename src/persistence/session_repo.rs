//! Session record repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{SessionRecord, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    owner: String,
    status: String,
    created_at: String,
    last_seen: String,
    error_message: Option<String>,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        Ok(SessionRecord {
            status: parse_status(&self.status)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            last_seen: parse_timestamp("last_seen", &self.last_seen)?,
            session_id: self.id,
            owner: self.owner,
            error_message: self.error_message,
        })
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "created" => Ok(SessionStatus::Created),
        "starting" => Ok(SessionStatus::Starting),
        "running" => Ok(SessionStatus::Running),
        "stopped" => Ok(SessionStatus::Stopped),
        "error" => Ok(SessionStatus::Error),
        other => Err(AppError::Db(format!("invalid session status: {other}"))),
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or fully replace a session record.
    ///
    /// `owner` and `created_at` are never rewritten once the row exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO session (id, owner, status, created_at, last_seen, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                last_seen = excluded.last_seen,
                error_message = excluded.error_message",
        )
        .bind(&record.session_id)
        .bind(&record.owner)
        .bind(record.status.as_str())
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_seen.to_rfc3339())
        .bind(&record.error_message)
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Retrieve a session record by identifier.
    ///
    /// Returns `Ok(None)` if the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the row is malformed.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_record).transpose()
    }

    /// Delete a session record. Deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        Ok(())
    }

    /// List every persisted record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or any row is malformed.
    pub async fn list_all(&self) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as("SELECT * FROM session ORDER BY created_at")
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }
}
