//! Durable per-file lifecycle records.
//!
//! The ledger is the only writer of progress rows. Each operation maps to a
//! single SQL statement and is persisted before it returns.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::db::{progress_repo, progress_repo::ProgressRow, Database, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProgressStatus::Pending),
            "in_progress" => Ok(ProgressStatus::InProgress),
            "completed" => Ok(ProgressStatus::Completed),
            "failed" => Ok(ProgressStatus::Failed),
            other => Err(LedgerError::InvalidRow(format!("unknown status '{}'", other))),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Cannot move '{path}' to {to}: no record in an eligible state")]
    InvalidTransition { path: PathBuf, to: ProgressStatus },

    #[error("Malformed progress row: {0}")]
    InvalidRow(String),

    #[error("Ledger task failed: {0}")]
    Task(String),
}

/// The durable lifecycle record of one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub file_path: PathBuf,
    pub status: ProgressStatus,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub destination_key: Option<String>,
    pub bytes_transferred: Option<u64>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ProgressRow> for ProgressRecord {
    type Error = LedgerError;

    fn try_from(row: ProgressRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse()?,
            size_bytes: to_u64(row.size_bytes, "size_bytes")?,
            bytes_transferred: row
                .bytes_transferred
                .map(|b| to_u64(b, "bytes_transferred"))
                .transpose()?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            file_path: PathBuf::from(row.file_path),
            checksum: row.checksum,
            destination_key: row.destination_key,
            error_detail: row.error_detail,
        })
    }
}

fn to_u64(value: i64, column: &str) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::InvalidRow(format!("negative {}", column)))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::InvalidRow(format!("bad timestamp '{}': {}", value, e)))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn key_of(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Crash-safe store of [`ProgressRecord`]s keyed by absolute file path.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct ProgressLedger {
    db: Database,
}

impl ProgressLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Opens the ledger file. Corruption is reported as an error and must
    /// stop the process.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Inserts a `Pending` record, or returns the existing one. An open
    /// record gets its size and checksum refreshed. Never fails on duplicates.
    pub fn record_start(
        &self,
        path: &Path,
        size_bytes: u64,
        checksum: &str,
    ) -> Result<ProgressRecord, LedgerError> {
        let row = progress_repo::upsert_pending(
            &self.db,
            &key_of(path),
            to_i64(size_bytes),
            Some(checksum),
            &now(),
        )?;
        row.try_into()
    }

    /// Like [`record_start`](Self::record_start) for a file whose content
    /// could not be read. The checksum stays null.
    pub fn record_start_unreadable(
        &self,
        path: &Path,
        size_bytes: u64,
    ) -> Result<ProgressRecord, LedgerError> {
        let row =
            progress_repo::upsert_pending(&self.db, &key_of(path), to_i64(size_bytes), None, &now())?;
        row.try_into()
    }

    pub fn mark_in_progress(&self, path: &Path) -> Result<(), LedgerError> {
        let changed = progress_repo::set_in_progress(&self.db, &key_of(path), &now())?;
        expect_one(changed, path, ProgressStatus::InProgress)
    }

    /// Persists the destination key of an in-progress record. Must happen
    /// before the first byte is uploaded so recovery can find the object.
    pub fn assign_destination(&self, path: &Path, destination_key: &str) -> Result<(), LedgerError> {
        let changed =
            progress_repo::set_destination(&self.db, &key_of(path), destination_key, &now())?;
        expect_one(changed, path, ProgressStatus::InProgress)
    }

    pub fn mark_completed(
        &self,
        path: &Path,
        destination_key: &str,
        bytes_transferred: u64,
    ) -> Result<(), LedgerError> {
        let changed = progress_repo::set_completed(
            &self.db,
            &key_of(path),
            destination_key,
            to_i64(bytes_transferred),
            &now(),
        )?;
        expect_one(changed, path, ProgressStatus::Completed)
    }

    pub fn mark_failed(&self, path: &Path, reason: &str) -> Result<(), LedgerError> {
        let reason = if reason.is_empty() { "unknown error" } else { reason };
        let changed = progress_repo::set_failed(&self.db, &key_of(path), reason, &now())?;
        expect_one(changed, path, ProgressStatus::Failed)
    }

    pub fn lookup(&self, path: &Path) -> Result<Option<ProgressRecord>, LedgerError> {
        progress_repo::find(&self.db, &key_of(path))?
            .map(ProgressRecord::try_from)
            .transpose()
    }

    pub fn list_by_status(&self, status: ProgressStatus) -> Result<Vec<ProgressRecord>, LedgerError> {
        progress_repo::list_by_status(&self.db, status.as_str())?
            .into_iter()
            .map(ProgressRecord::try_from)
            .collect()
    }

    pub fn count_by_status(&self, status: ProgressStatus) -> Result<u64, LedgerError> {
        Ok(progress_repo::count_by_status(&self.db, status.as_str())?)
    }

    /// Drops a completed record whose stored checksum differs from
    /// `new_checksum`. Returns true when the record was dropped.
    pub fn detect_content_change(&self, path: &Path, new_checksum: &str) -> Result<bool, LedgerError> {
        Ok(progress_repo::delete_if_stale(&self.db, &key_of(path), new_checksum)? > 0)
    }

    /// Deletes the record. Returns false when there was none.
    pub fn remove(&self, path: &Path) -> Result<bool, LedgerError> {
        Ok(progress_repo::delete(&self.db, &key_of(path))? > 0)
    }

    /// Records of other files whose output went, or is going, to
    /// `destination_key`.
    pub fn claims_on(
        &self,
        destination_key: &str,
        except: &Path,
    ) -> Result<Vec<ProgressRecord>, LedgerError> {
        progress_repo::list_by_destination(&self.db, destination_key, &key_of(except))?
            .into_iter()
            .map(ProgressRecord::try_from)
            .collect()
    }

    /// Runs `op` against this ledger on the blocking thread pool.
    ///
    /// Every write is fsynced, so async callers go through here rather than
    /// calling the ledger from a runtime worker.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&ProgressLedger) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.clone();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || span.in_scope(|| op(&ledger)))
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }
}

fn expect_one(changed: usize, path: &Path, to: ProgressStatus) -> Result<(), LedgerError> {
    if changed == 1 {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition {
            path: path.to_path_buf(),
            to,
        })
    }
}
