use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checksum::{self, Checksum};
use crate::classify::{
    passthrough_content_type, ArchiveFormat, FileClass, KeyBuilder, KeyError, TabularFormat,
};
use crate::config::{Config, ConversionConfig};
use crate::ledger::{LedgerError, ProgressLedger, ProgressStatus};
use crate::sanitize;
use crate::storage::ErrorArea;
use crate::store::{ObjectStore, UploadBody};
use crate::transform::{
    self, ArchiveExtractor, Converter, Extractor, ParquetConverter, TransformError,
};
use crate::upload::{RetryPolicy, Uploader};
use crate::worker::job::FileDetected;

use super::context::FileContext;
use super::error::{FatalError, PipelineError};
use super::progress::ProgressReporter;
use super::state::FileState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A completed record with the same checksum exists.
    Unchanged,
    /// The source disappeared before it could be read.
    Vanished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Skipped {
        reason: SkipReason,
    },
    Completed {
        destination_key: String,
        objects: usize,
        bytes_transferred: u64,
    },
    Failed {
        reason: String,
        relocated_to: Option<PathBuf>,
    },
}

/// An upload-ready output spooled to the work directory.
struct SpooledObject {
    key: String,
    content_type: String,
    file: NamedTempFile,
}

type EntrySender = mpsc::Sender<Result<SpooledObject, PipelineError>>;

/// Drives one file from detection to a terminal ledger state.
pub struct FilePipeline {
    ledger: ProgressLedger,
    uploader: Uploader,
    keys: KeyBuilder,
    converter: Arc<dyn Converter>,
    extractor: Arc<dyn Extractor>,
    error_area: ErrorArea,
    work_dir: PathBuf,
}

impl FilePipeline {
    /// Production constructor.
    pub fn from_config(config: &Config, ledger: ProgressLedger, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            ledger,
            uploader: Uploader::new(store, RetryPolicy::from_config(&config.retry)),
            keys: KeyBuilder::new(&config.s3.key_prefix),
            converter: Arc::new(ParquetConverter::new(&config.conversion)),
            extractor: Arc::new(ArchiveExtractor),
            error_area: ErrorArea::new(&config.error_directory),
            work_dir: config.work_directory(),
        }
    }

    /// Constructor with the default converter and extractor.
    pub fn new(
        ledger: ProgressLedger,
        uploader: Uploader,
        keys: KeyBuilder,
        error_area: ErrorArea,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            ledger,
            uploader,
            keys,
            converter: Arc::new(ParquetConverter::new(&ConversionConfig::default())),
            extractor: Arc::new(ArchiveExtractor),
            error_area,
            work_dir,
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// Runs the full pipeline for one detected file.
    ///
    /// Per-file problems end in `Ok(FileOutcome::Failed)`. Only ledger
    /// failures are returned as errors, since no further file can be
    /// processed safely after one.
    pub async fn run(
        &self,
        event: &FileDetected,
        progress: &dyn ProgressReporter,
    ) -> Result<FileOutcome, FatalError> {
        let span = info_span!("pipeline",
            run_id = %Uuid::new_v4(),
            file = %sanitize::redact_path(&event.absolute_path),
            path_hash = %sanitize::hash_path(&event.absolute_path),
        );
        self.run_steps(event, progress).instrument(span).await
    }

    async fn run_steps(
        &self,
        event: &FileDetected,
        progress: &dyn ProgressReporter,
    ) -> Result<FileOutcome, FatalError> {
        let path = event.absolute_path.as_path();
        let fatal = |source: LedgerError| FatalError::Ledger {
            path: path.to_path_buf(),
            source,
        };
        let mut ctx = FileContext::new(event, progress);

        // Step 1: Checksum
        ctx.advance(FileState::ChecksumPending);
        let source = match self.step_checksum(path).await {
            Ok(source) => source,
            Err(PipelineError::Checksum(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Source vanished before it could be read");
                return Ok(FileOutcome::Skipped {
                    reason: SkipReason::Vanished,
                });
            }
            Err(e) => return self.fail(&mut ctx, e).await,
        };
        ctx.checksum = Some(source.hex.clone());

        // Step 2: Deduplicate
        ctx.advance(FileState::Deduplicating);
        let unchanged = {
            let path = path.to_path_buf();
            let hex = source.hex.clone();
            self.ledger
                .blocking(move |ledger| deduplicate(ledger, &path, &hex))
                .await
                .map_err(fatal)?
        };
        if unchanged {
            ctx.advance(FileState::Completed);
            debug!("Unchanged since last upload, skipping");
            return Ok(FileOutcome::Skipped {
                reason: SkipReason::Unchanged,
            });
        }

        // Step 3: Snapshot. Everything after this reads the snapshot, so the
        // uploaded bytes are exactly the ones the recorded checksum covers.
        let (snapshot, source) = match self.step_snapshot(path).await {
            Ok(taken) => taken,
            Err(PipelineError::Checksum(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Source vanished before it could be read");
                return Ok(FileOutcome::Skipped {
                    reason: SkipReason::Vanished,
                });
            }
            Err(e) => return self.fail(&mut ctx, e).await,
        };
        if ctx.checksum.as_deref() != Some(source.hex.as_str()) {
            info!("Source changed while being read, processing the newer content");
            ctx.checksum = Some(source.hex.clone());
        }

        // Step 4: Open the record
        {
            let path = path.to_path_buf();
            let hex = source.hex.clone();
            let bytes = source.bytes;
            self.ledger
                .blocking(move |ledger| {
                    ledger.record_start(&path, bytes, &hex)?;
                    ledger.mark_in_progress(&path)
                })
                .await
                .map_err(fatal)?;
        }

        // Step 5: Classify
        ctx.advance(FileState::Classifying);
        let class = FileClass::of(&event.file_name());
        ctx.class = Some(class);
        debug!(?class, "Classified");

        // Steps 6-7: Transform, upload and verify
        let input = snapshot.path();
        let result = match class {
            FileClass::Passthrough => {
                self.process_passthrough(&mut ctx, input, &source.hex)
                    .await
            }
            FileClass::Convertible(format) => {
                self.process_convertible(&mut ctx, input, format, &source.hex)
                    .await
            }
            FileClass::Archive(format) => {
                self.process_archive(&mut ctx, input, format, &source.hex)
                    .await
            }
        };
        let destination_key = match result {
            Ok(key) => key,
            Err(PipelineError::Ledger(e)) => return Err(fatal(e)),
            Err(e) => return self.fail(&mut ctx, e).await,
        };

        // Step 8: Complete
        {
            let path = path.to_path_buf();
            let key = destination_key.clone();
            let bytes = ctx.bytes_transferred;
            self.ledger
                .blocking(move |ledger| ledger.mark_completed(&path, &key, bytes))
                .await
                .map_err(fatal)?;
        }
        ctx.advance(FileState::Completed);
        info!(
            key = %destination_key,
            objects = ctx.objects_uploaded,
            bytes = ctx.bytes_transferred,
            "File completed"
        );

        Ok(FileOutcome::Completed {
            destination_key,
            objects: ctx.objects_uploaded,
            bytes_transferred: ctx.bytes_transferred,
        })
    }

    async fn step_checksum(&self, path: &Path) -> Result<Checksum, PipelineError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || checksum::sha256_file(&path))
            .await?
            .map_err(PipelineError::Checksum)
    }

    /// Copies the source into the work directory, hashing the copy as it
    /// is written.
    async fn step_snapshot(&self, path: &Path) -> Result<(NamedTempFile, Checksum), PipelineError> {
        let path = path.to_path_buf();
        let work_dir = self.work_dir.clone();
        tokio::task::spawn_blocking(move || {
            let source = File::open(&path).map_err(PipelineError::Checksum)?;
            let mut snapshot = transform::spool_file(&work_dir)?;
            let sum = checksum::sha256_copy(source, snapshot.as_file_mut())
                .map_err(PipelineError::Checksum)?;
            Ok::<_, PipelineError>((snapshot, sum))
        })
        .await?
    }

    async fn process_passthrough(
        &self,
        ctx: &mut FileContext<'_>,
        input: &Path,
        checksum: &str,
    ) -> Result<String, PipelineError> {
        let key = self
            .keys
            .object_key(&ctx.event.relative_path, FileClass::Passthrough)?;
        self.assign_destination(ctx, &key, checksum).await?;

        ctx.advance(FileState::Transforming);
        let body = UploadBody::File(input.to_path_buf());
        self.upload_object(ctx, &key, body, &passthrough_content_type(&key), checksum)
            .await?;
        Ok(key)
    }

    async fn process_convertible(
        &self,
        ctx: &mut FileContext<'_>,
        input: &Path,
        format: TabularFormat,
        checksum: &str,
    ) -> Result<String, PipelineError> {
        let key = self
            .keys
            .object_key(&ctx.event.relative_path, FileClass::Convertible(format))?;
        self.assign_destination(ctx, &key, checksum).await?;

        ctx.advance(FileState::Transforming);
        let converter = self.converter.clone();
        let work_dir = self.work_dir.clone();
        let input = input.to_path_buf();
        let span = info_span!("convert", ?format);
        let spool = tokio::task::spawn_blocking(move || {
            span.in_scope(|| convert_to_spool(converter.as_ref(), &input, format, &work_dir))
        })
        .await??;

        let body = UploadBody::File(spool.path().to_path_buf());
        self.upload_object(ctx, &key, body, self.converter.content_type(), checksum)
            .await?;
        Ok(key)
    }

    /// Entries are extracted on a blocking thread and handed over one at a
    /// time through a channel of capacity 1.
    async fn process_archive(
        &self,
        ctx: &mut FileContext<'_>,
        input: &Path,
        format: ArchiveFormat,
        checksum: &str,
    ) -> Result<String, PipelineError> {
        let root = self.keys.archive_root(&ctx.event.relative_path, format)?;
        self.assign_destination(ctx, &root, checksum).await?;

        ctx.advance(FileState::Transforming);
        let (tx, mut rx) = mpsc::channel(1);
        let producer = {
            let extractor = self.extractor.clone();
            let converter = self.converter.clone();
            let work_dir = self.work_dir.clone();
            let source = input.to_path_buf();
            let root = root.clone();
            let span = info_span!("extract", ?format);
            tokio::task::spawn_blocking(move || {
                span.in_scope(|| {
                    produce_entries(
                        extractor.as_ref(),
                        converter.as_ref(),
                        &source,
                        format,
                        &root,
                        &work_dir,
                        &tx,
                    )
                })
            })
        };

        let mut failure = None;
        while let Some(item) = rx.recv().await {
            let object: SpooledObject = match item {
                Ok(object) => object,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let body = UploadBody::File(object.file.path().to_path_buf());
            if let Err(e) = self
                .upload_object(ctx, &object.key, body, &object.content_type, checksum)
                .await
            {
                failure = Some(e);
                break;
            }
            ctx.advance(FileState::Transforming);
        }

        // Closing the receiver makes a still-running producer stop at its
        // next send.
        drop(rx);
        let joined = producer.await;
        if let Some(e) = failure {
            return Err(e);
        }
        joined?;
        Ok(root)
    }

    /// Persists the destination, then warns when another source file
    /// already claims the same key. The later upload replaces the object.
    async fn assign_destination(
        &self,
        ctx: &mut FileContext<'_>,
        key: &str,
        checksum: &str,
    ) -> Result<(), PipelineError> {
        let path = ctx.event.absolute_path.clone();
        let owned_key = key.to_string();
        let claims = self
            .ledger
            .blocking(move |ledger| {
                ledger.assign_destination(&path, &owned_key)?;
                ledger.claims_on(&owned_key, &path)
            })
            .await?;

        for other in claims
            .iter()
            .filter(|r| r.checksum.as_deref() != Some(checksum))
        {
            warn!(
                key,
                other = %sanitize::redact_path(&other.file_path),
                other_status = %other.status,
                "Destination key already holds output of another source file"
            );
        }
        ctx.destination_key = Some(key.to_string());
        Ok(())
    }

    async fn upload_object(
        &self,
        ctx: &mut FileContext<'_>,
        key: &str,
        body: UploadBody,
        content_type: &str,
        checksum: &str,
    ) -> Result<(), PipelineError> {
        ctx.advance(FileState::Uploading);
        let record = self
            .uploader
            .upload_and_verify(key, body, content_type, checksum)
            .instrument(info_span!("upload", key))
            .await?;
        ctx.advance(FileState::Verifying);
        ctx.record_upload(&record.key, record.bytes_transferred);
        Ok(())
    }

    /// Marks the record failed and moves the source into the error area.
    async fn fail(
        &self,
        ctx: &mut FileContext<'_>,
        error: PipelineError,
    ) -> Result<FileOutcome, FatalError> {
        let path = ctx.event.absolute_path.clone();
        let fatal = |source: LedgerError| FatalError::Ledger {
            path: path.clone(),
            source,
        };
        let reason = error.to_string();
        warn!(error = %reason, state = %ctx.state(), "File failed");

        {
            let path = path.clone();
            let reason = reason.clone();
            let checksum = ctx.checksum.clone();
            let size = ctx.event.size;
            self.ledger
                .blocking(move |ledger| {
                    let open = ledger.lookup(&path)?.is_some_and(|r| {
                        matches!(r.status, ProgressStatus::Pending | ProgressStatus::InProgress)
                    });
                    if !open {
                        // Failed before this run opened a record.
                        ledger.remove(&path)?;
                        match checksum {
                            Some(hex) => ledger.record_start(&path, size, &hex)?,
                            None => ledger.record_start_unreadable(&path, size)?,
                        };
                    }
                    ledger.mark_failed(&path, &reason)
                })
                .await
                .map_err(fatal)?;
        }
        ctx.advance(FileState::Failed);

        let area = self.error_area.clone();
        let source = path.clone();
        let relative = ctx.event.relative_path.clone();
        let relocated_to = match tokio::task::spawn_blocking(move || area.relocate(&source, &relative)).await {
            Ok(Ok(target)) => {
                info!(to = %sanitize::redact_path(&target), "Source moved to error area");
                Some(target)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Could not move source to error area");
                None
            }
            Err(e) => {
                warn!(error = %e, "Error area task failed");
                None
            }
        };

        Ok(FileOutcome::Failed {
            reason,
            relocated_to,
        })
    }
}

/// Returns true when the file can be skipped. Stale or failed records
/// are dropped so the file starts over with a fresh record.
fn deduplicate(ledger: &ProgressLedger, path: &Path, checksum: &str) -> Result<bool, LedgerError> {
    let Some(record) = ledger.lookup(path)? else {
        return Ok(false);
    };

    match record.status {
        ProgressStatus::Completed if record.checksum.as_deref() == Some(checksum) => Ok(true),
        ProgressStatus::Completed => {
            ledger.detect_content_change(path, checksum)?;
            info!("Content changed since last upload, reprocessing");
            Ok(false)
        }
        ProgressStatus::Failed => {
            ledger.remove(path)?;
            info!("Retrying previously failed file");
            Ok(false)
        }
        ProgressStatus::Pending | ProgressStatus::InProgress => {
            info!("Resuming interrupted file from the beginning");
            Ok(false)
        }
    }
}

fn convert_to_spool(
    converter: &dyn Converter,
    input: &Path,
    format: TabularFormat,
    work_dir: &Path,
) -> Result<NamedTempFile, TransformError> {
    let mut spool = transform::spool_file(work_dir)?;
    converter.convert(input, format, spool.as_file_mut())?;
    Ok(spool)
}

fn produce_entries(
    extractor: &dyn Extractor,
    converter: &dyn Converter,
    source: &Path,
    format: ArchiveFormat,
    root: &str,
    work_dir: &Path,
    tx: &EntrySender,
) {
    let mut emit = |object: SpooledObject| tx.blocking_send(Ok(object)).is_ok();
    let result = extract_entries(
        extractor, converter, source, format, root, work_dir, &mut emit,
    );
    if let Err(e) = result {
        // The receiver may already be gone; nothing left to report to.
        let _ = tx.blocking_send(Err(e));
    }
}

/// Walks the archive and hands each spooled output to `emit`. Stops early
/// when `emit` returns false.
fn extract_entries(
    extractor: &dyn Extractor,
    converter: &dyn Converter,
    source: &Path,
    format: ArchiveFormat,
    root: &str,
    work_dir: &Path,
    emit: &mut dyn FnMut(SpooledObject) -> bool,
) -> Result<(), PipelineError> {
    let mut archive = extractor.open(source, format)?;
    let mut cursor = archive.cursor()?;
    let mut count = 0usize;

    while let Some(mut entry) = cursor.next_entry()? {
        if entry.is_dir {
            continue;
        }

        let class = FileClass::of_archive_entry(&entry.path);
        let key = match KeyBuilder::entry_key(root, &entry.path, class) {
            Ok(key) => key,
            Err(KeyError::Empty) => {
                debug!(entry = %entry.path, "Skipping entry without a name");
                continue;
            }
            Err(KeyError::Unsafe(_)) => {
                return Err(TransformError::UnsafeEntryPath(entry.path.clone()).into())
            }
        };

        let (raw, size) = transform::spool_entry(&mut entry.reader, &entry.path, work_dir)?;
        let object = match class {
            FileClass::Convertible(tabular) => SpooledObject {
                file: convert_to_spool(converter, raw.path(), tabular, work_dir)?,
                content_type: converter.content_type().to_string(),
                key,
            },
            _ => SpooledObject {
                content_type: passthrough_content_type(&key),
                key,
                file: raw,
            },
        };
        debug!(entry = %entry.path, size, "Spooled archive entry");
        count += 1;

        if !emit(object) {
            debug!("Upload side stopped, ending extraction");
            return Ok(());
        }
    }

    debug!(entries = count, "Archive exhausted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::progress::NoopProgress;
    use crate::store::{InMemoryObjectStore, SOURCE_SHA256_KEY};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        watch: PathBuf,
        errors: PathBuf,
        store: Arc<InMemoryObjectStore>,
        pipeline: FilePipeline,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let watch = temp.path().join("inbox");
        let errors = temp.path().join("errors");
        std::fs::create_dir_all(&watch).unwrap();

        let store = Arc::new(InMemoryObjectStore::new());
        let uploader = Uploader::new(
            store.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        );
        let pipeline = FilePipeline::new(
            ProgressLedger::open_in_memory().unwrap(),
            uploader,
            KeyBuilder::default(),
            ErrorArea::new(&errors),
            temp.path().join("work"),
        );

        Fixture {
            watch,
            errors,
            store,
            pipeline,
            _temp: temp,
        }
    }

    impl Fixture {
        fn write(&self, name: &str, content: &[u8]) -> FileDetected {
            let path = self.watch.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, content).unwrap();
            FileDetected::from_path(&self.watch, &path).unwrap()
        }

        async fn run(&self, event: &FileDetected) -> FileOutcome {
            self.pipeline.run(event, &NoopProgress).await.unwrap()
        }

        fn status(&self, event: &FileDetected) -> Option<ProgressStatus> {
            self.pipeline
                .ledger()
                .lookup(&event.absolute_path)
                .unwrap()
                .map(|r| r.status)
        }
    }

    #[tokio::test]
    async fn test_passthrough_uploads_verbatim() {
        let fx = fixture();
        let event = fx.write("notes.txt", b"hello");

        let outcome = fx.run(&event).await;

        assert_eq!(
            outcome,
            FileOutcome::Completed {
                destination_key: "notes.txt".to_string(),
                objects: 1,
                bytes_transferred: 5,
            }
        );
        assert_eq!(fx.store.object("notes.txt").unwrap().body, b"hello");
        let record = fx.pipeline.ledger().lookup(&event.absolute_path).unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Completed);
        assert_eq!(
            record.checksum.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[tokio::test]
    async fn test_unchanged_file_is_skipped_without_writes() {
        let fx = fixture();
        let event = fx.write("same.txt", b"same");
        fx.run(&event).await;
        let before = fx.pipeline.ledger().lookup(&event.absolute_path).unwrap();
        let calls = fx.store.total_calls();

        let outcome = fx.run(&event).await;

        assert_eq!(
            outcome,
            FileOutcome::Skipped {
                reason: SkipReason::Unchanged
            }
        );
        assert_eq!(fx.store.total_calls(), calls);
        assert_eq!(fx.pipeline.ledger().lookup(&event.absolute_path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_modified_file_is_reuploaded() {
        let fx = fixture();
        let event = fx.write("doc.txt", b"v1");
        fx.run(&event).await;

        let event = fx.write("doc.txt", b"version two");
        let outcome = fx.run(&event).await;

        assert!(matches!(outcome, FileOutcome::Completed { .. }));
        assert_eq!(fx.store.object("doc.txt").unwrap().body, b"version two");
        let record = fx.pipeline.ledger().lookup(&event.absolute_path).unwrap().unwrap();
        assert_eq!(
            record.checksum.as_deref(),
            Some(checksum::sha256_bytes(b"version two").as_str())
        );
    }

    #[tokio::test]
    async fn test_csv_is_converted_and_original_not_uploaded() {
        let fx = fixture();
        let event = fx.write("data.csv", b"id,name\n1,a\n2,b\n3,c\n");

        let outcome = fx.run(&event).await;

        assert!(matches!(outcome, FileOutcome::Completed { ref destination_key, .. } if destination_key == "data.parquet"));
        assert_eq!(fx.store.keys(), vec!["data.parquet"]);
        let object = fx.store.object("data.parquet").unwrap();
        assert_eq!(&object.body[..4], b"PAR1");
    }

    #[tokio::test]
    async fn test_zip_entries_uploaded_archive_is_not() {
        let fx = fixture();
        let path = fx.watch.join("bundle.zip");
        {
            use std::io::Write;
            let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("a.txt", options).unwrap();
            zip.write_all(b"alpha").unwrap();
            zip.start_file("b.csv", options).unwrap();
            zip.write_all(b"x,y\n1,2\n").unwrap();
            zip.finish().unwrap();
        }
        let event = FileDetected::from_path(&fx.watch, &path).unwrap();

        let outcome = fx.run(&event).await;

        match outcome {
            FileOutcome::Completed {
                destination_key,
                objects,
                ..
            } => {
                assert_eq!(destination_key, "bundle/");
                assert_eq!(objects, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(fx.store.keys(), vec!["bundle/a.txt", "bundle/b.parquet"]);
        assert!(fx.store.object("bundle.zip").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails_and_relocates() {
        let fx = fixture();
        let event = fx.write("broken.zip", b"not a zip at all");

        let outcome = fx.run(&event).await;

        let FileOutcome::Failed {
            reason,
            relocated_to,
        } = outcome
        else {
            panic!("expected failure");
        };
        assert!(reason.contains("Corrupt archive"), "{reason}");
        let relocated = relocated_to.unwrap();
        assert!(relocated.starts_with(&fx.errors));
        assert!(!event.absolute_path.exists());
        assert_eq!(fx.status(&event), Some(ProgressStatus::Failed));
        assert!(fx.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_csv_is_not_retried() {
        let fx = fixture();
        let event = fx.write("empty.csv", b"");

        let outcome = fx.run(&event).await;

        assert!(matches!(outcome, FileOutcome::Failed { .. }));
        assert_eq!(fx.store.put_calls(), 0);
    }

    #[tokio::test]
    async fn test_upload_retries_exhausted_fails_file() {
        let fx = fixture();
        fx.store.fail_next_puts(10);
        let event = fx.write("notes.txt", b"hello");

        let outcome = fx.run(&event).await;

        assert!(matches!(outcome, FileOutcome::Failed { .. }));
        assert_eq!(fx.store.put_calls(), 3);
        let record = fx.pipeline.ledger().lookup(&event.absolute_path).unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Failed);
        assert!(record.error_detail.unwrap().contains("3 attempts"));
    }

    #[tokio::test]
    async fn test_failed_file_is_retried_on_next_detection() {
        let fx = fixture();
        fx.store.fail_next_puts(3);
        let event = fx.write("notes.txt", b"hello");
        fx.run(&event).await;

        let event = fx.write("notes.txt", b"hello");
        let outcome = fx.run(&event).await;

        assert!(matches!(outcome, FileOutcome::Completed { .. }));
        assert_eq!(fx.status(&event), Some(ProgressStatus::Completed));
    }

    #[tokio::test]
    async fn test_vanished_file_is_skipped() {
        let fx = fixture();
        let event = fx.write("gone.txt", b"x");
        std::fs::remove_file(&event.absolute_path).unwrap();

        let outcome = fx.run(&event).await;

        assert_eq!(
            outcome,
            FileOutcome::Skipped {
                reason: SkipReason::Vanished
            }
        );
        assert_eq!(fx.status(&event), None);
    }

    #[tokio::test]
    async fn test_destination_assigned_before_upload() {
        let fx = fixture();
        fx.store.set_put_delay(Duration::from_millis(300));
        let event = fx.write("slow.txt", b"slow");

        let pipeline = &fx.pipeline;
        let run = pipeline.run(&event, &NoopProgress);
        tokio::pin!(run);
        let _ = tokio::time::timeout(Duration::from_millis(100), &mut run).await;

        let record = pipeline.ledger().lookup(&event.absolute_path).unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::InProgress);
        assert_eq!(record.destination_key.as_deref(), Some("slow.txt"));

        assert!(matches!(run.await.unwrap(), FileOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_rewrite_during_upload_keeps_hashed_bytes() {
        let fx = fixture();
        fx.store.set_put_delay(Duration::from_millis(300));
        let event = fx.write("doc.txt", b"v1");

        let rewrite = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&event.absolute_path, b"version two").unwrap();
        };
        let (outcome, ()) = tokio::join!(fx.run(&event), rewrite);

        assert!(matches!(outcome, FileOutcome::Completed { .. }));
        let v1 = checksum::sha256_bytes(b"v1");
        let object = fx.store.object("doc.txt").unwrap();
        assert_eq!(object.body, b"v1");
        assert_eq!(
            object.metadata.get(SOURCE_SHA256_KEY).map(String::as_str),
            Some(v1.as_str())
        );
        let record = fx.pipeline.ledger().lookup(&event.absolute_path).unwrap().unwrap();
        assert_eq!(record.checksum.as_deref(), Some(v1.as_str()));
        assert_eq!(record.bytes_transferred, Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_is_removed_after_run() {
        let fx = fixture();
        let event = fx.write("notes.txt", b"hello");

        fx.run(&event).await;

        let work = fx._temp.path().join("work");
        let leftovers = std::fs::read_dir(&work).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
        assert!(event.absolute_path.exists());
    }

    #[tokio::test]
    async fn test_colliding_destination_keys_are_tracked() {
        let fx = fixture();
        let csv = fx.write("data.csv", b"id,name\n1,a\n");
        let tsv = fx.write("data.tsv", b"id\tname\n2\tb\n");

        fx.run(&csv).await;
        let outcome = fx.run(&tsv).await;

        assert!(matches!(outcome, FileOutcome::Completed { ref destination_key, .. } if destination_key == "data.parquet"));
        let claims = fx
            .pipeline
            .ledger()
            .claims_on("data.parquet", &tsv.absolute_path)
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].file_path, csv.absolute_path);
        assert_eq!(fx.store.keys(), vec!["data.parquet"]);
    }
}
