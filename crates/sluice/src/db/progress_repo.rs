//! Progress repository: single-statement operations on the `progress` table.
//!
//! Every function issues exactly one write, so a crash leaves each row at
//! its last fully-applied state. Status guards live in the `WHERE` clause
//! and callers inspect the affected-row count.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw progress row from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRow {
    pub file_path: String,
    pub status: String,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub destination_key: Option<String>,
    pub bytes_transferred: Option<i64>,
    pub error_detail: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ProgressRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            file_path: row.get("file_path")?,
            status: row.get("status")?,
            size_bytes: row.get("size_bytes")?,
            checksum: row.get("checksum")?,
            destination_key: row.get("destination_key")?,
            bytes_transferred: row.get("bytes_transferred")?,
            error_detail: row.get("error_detail")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a `pending` row, or refreshes size and checksum of an existing
/// row that has not reached a terminal status. Returns the row as stored.
pub fn upsert_pending(
    db: &Database,
    file_path: &str,
    size_bytes: i64,
    checksum: Option<&str>,
    now: &str,
) -> Result<ProgressRow, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO progress (file_path, status, size_bytes, checksum, created_at, updated_at)
             VALUES (?1, 'pending', ?2, ?3, ?4, ?4)
             ON CONFLICT(file_path) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                updated_at = excluded.updated_at
             WHERE progress.status IN ('pending', 'in_progress')",
            params![file_path, size_bytes, checksum, now],
        )?;
        let row = conn.query_row(
            "SELECT * FROM progress WHERE file_path = ?1",
            params![file_path],
            ProgressRow::from_row,
        )?;
        Ok(row)
    })
}

/// Finds a row by its file path.
pub fn find(db: &Database, file_path: &str) -> Result<Option<ProgressRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM progress WHERE file_path = ?1",
                params![file_path],
                ProgressRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Lists rows with the given status, oldest first.
pub fn list_by_status(db: &Database, status: &str) -> Result<Vec<ProgressRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM progress WHERE status = ?1 ORDER BY created_at ASC, file_path ASC",
        )?;
        let rows = stmt
            .query_map(params![status], ProgressRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists rows other than `file_path` whose destination is `destination_key`.
pub fn list_by_destination(
    db: &Database,
    destination_key: &str,
    file_path: &str,
) -> Result<Vec<ProgressRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM progress WHERE destination_key = ?1 AND file_path != ?2 \
             ORDER BY updated_at ASC, file_path ASC",
        )?;
        let rows = stmt
            .query_map(params![destination_key, file_path], ProgressRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts rows with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM progress WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Moves a `pending` or `in_progress` row to `in_progress`.
pub fn set_in_progress(db: &Database, file_path: &str, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET status = 'in_progress', updated_at = ?2
             WHERE file_path = ?1 AND status IN ('pending', 'in_progress')",
            params![file_path, now],
        )?;
        Ok(changed)
    })
}

/// Records the destination key of an `in_progress` row.
pub fn set_destination(
    db: &Database,
    file_path: &str,
    destination_key: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET destination_key = ?2, updated_at = ?3
             WHERE file_path = ?1 AND status = 'in_progress'",
            params![file_path, destination_key, now],
        )?;
        Ok(changed)
    })
}

/// Moves an `in_progress` row to `completed`.
pub fn set_completed(
    db: &Database,
    file_path: &str,
    destination_key: &str,
    bytes_transferred: i64,
    now: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET status = 'completed', destination_key = ?2,
                bytes_transferred = ?3, error_detail = NULL, updated_at = ?4
             WHERE file_path = ?1 AND status = 'in_progress'",
            params![file_path, destination_key, bytes_transferred, now],
        )?;
        Ok(changed)
    })
}

/// Moves a `pending` or `in_progress` row to `failed`.
pub fn set_failed(
    db: &Database,
    file_path: &str,
    error_detail: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET status = 'failed', error_detail = ?2, updated_at = ?3
             WHERE file_path = ?1 AND status IN ('pending', 'in_progress')",
            params![file_path, error_detail, now],
        )?;
        Ok(changed)
    })
}

/// Deletes a `completed` row whose checksum differs from `checksum`.
pub fn delete_if_stale(
    db: &Database,
    file_path: &str,
    checksum: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM progress
             WHERE file_path = ?1 AND status = 'completed'
               AND (checksum IS NULL OR checksum != ?2)",
            params![file_path, checksum],
        )?;
        Ok(changed)
    })
}

/// Deletes a row regardless of status.
pub fn delete(db: &Database, file_path: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM progress WHERE file_path = ?1",
            params![file_path],
        )?;
        Ok(changed)
    })
}
