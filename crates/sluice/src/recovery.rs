//! Startup reconciliation of interrupted work against the object store.
//!
//! Every record still `in_progress` at startup belongs to a pipeline that
//! never reached a terminal state. Each one is either promoted to
//! `completed` (the upload landed and verifies) or deleted so the file is
//! processed again from scratch. Marker-less objects are removed first.

use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

use crate::ledger::{LedgerError, ProgressLedger, ProgressRecord, ProgressStatus};
use crate::sanitize;
use crate::upload::{Expectation, UploadError, Uploader, Verification};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Object store check failed for '{key}': {source}")]
    Store {
        key: String,
        #[source]
        source: UploadError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub examined: usize,
    /// Records deleted because no upload had started.
    pub discarded: usize,
    /// Records whose upload had landed and were marked completed.
    pub promoted: usize,
    /// Marker-less objects deleted from the store.
    pub cleaned: usize,
    /// Records deleted so the file is reprocessed.
    pub reset: usize,
}

/// Outcome for a single record.
enum Resolution {
    Discarded,
    Promoted,
    Reset { cleaned: usize },
}

pub struct RecoveryCoordinator {
    ledger: ProgressLedger,
    uploader: Uploader,
}

impl RecoveryCoordinator {
    pub fn new(ledger: ProgressLedger, uploader: Uploader) -> Self {
        Self { ledger, uploader }
    }

    /// Runs to completion before any new detection is accepted. Any error
    /// means ground truth could not be established.
    pub async fn run(&self) -> Result<RecoveryReport, RecoveryError> {
        let pending = self
            .ledger
            .blocking(|ledger| ledger.list_by_status(ProgressStatus::InProgress))
            .await?;
        let mut report = RecoveryReport {
            examined: pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            debug!("No interrupted files to recover");
            return Ok(report);
        }
        info!(count = pending.len(), "Recovering interrupted files");

        for record in &pending {
            let span = info_span!("recover",
                file = %sanitize::redact_path(&record.file_path),
                path_hash = %sanitize::hash_path(&record.file_path),
            );
            match self.resolve(record).instrument(span).await? {
                Resolution::Discarded => report.discarded += 1,
                Resolution::Promoted => report.promoted += 1,
                Resolution::Reset { cleaned } => {
                    report.reset += 1;
                    report.cleaned += cleaned;
                }
            }
        }

        info!(
            examined = report.examined,
            discarded = report.discarded,
            promoted = report.promoted,
            cleaned = report.cleaned,
            reset = report.reset,
            "Recovery complete"
        );
        Ok(report)
    }

    async fn resolve(&self, record: &ProgressRecord) -> Result<Resolution, RecoveryError> {
        let Some(key) = record.destination_key.as_deref() else {
            self.forget(record).await?;
            info!("No upload had started, record discarded");
            return Ok(Resolution::Discarded);
        };

        if key.ends_with('/') {
            return self.reset_archive(record, key).await;
        }

        let expected = Expectation {
            etag: None,
            source_checksum: record.checksum.as_deref(),
        };
        let verification = self
            .uploader
            .inspect(key, &expected)
            .await
            .map_err(|source| store_error(key, source))?;

        if let Verification::Verified { size, .. } = verification {
            let path = record.file_path.clone();
            let owned_key = key.to_string();
            self.ledger
                .blocking(move |ledger| ledger.mark_completed(&path, &owned_key, size))
                .await?;
            info!(key, size, "Upload had landed, record promoted to completed");
            return Ok(Resolution::Promoted);
        }

        let cleaned = self
            .uploader
            .cleanup_incomplete(key)
            .await
            .map_err(|source| store_error(key, source))?;
        self.forget(record).await?;
        info!(key, ?verification, cleaned, "Upload unverified, file will be reprocessed");

        Ok(Resolution::Reset {
            cleaned: usize::from(cleaned),
        })
    }

    /// Archive entries are not tracked individually, so the whole archive
    /// is redone after its marker-less leftovers are removed.
    async fn reset_archive(
        &self,
        record: &ProgressRecord,
        root: &str,
    ) -> Result<Resolution, RecoveryError> {
        let keys = self
            .uploader
            .list(root)
            .await
            .map_err(|source| store_error(root, source))?;

        let mut cleaned = 0;
        for key in &keys {
            if self
                .uploader
                .cleanup_incomplete(key)
                .await
                .map_err(|source| store_error(key, source))?
            {
                cleaned += 1;
            }
        }

        self.forget(record).await?;
        info!(
            root,
            objects = keys.len(),
            cleaned,
            "Archive interrupted, file will be reprocessed"
        );
        Ok(Resolution::Reset { cleaned })
    }

    async fn forget(&self, record: &ProgressRecord) -> Result<bool, LedgerError> {
        let path = record.file_path.clone();
        self.ledger.blocking(move |ledger| ledger.remove(&path)).await
    }
}

fn store_error(key: &str, source: UploadError) -> RecoveryError {
    RecoveryError::Store {
        key: key.to_string(),
        source,
    }
}
