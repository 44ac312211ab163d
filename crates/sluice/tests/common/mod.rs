//! Shared test utilities for sluice integration tests.
//!
//! `TestHarness` gives each test its own watched directory, error area,
//! in-memory ledger and in-memory object store.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use sluice::classify::KeyBuilder;
use sluice::ledger::{ProgressLedger, ProgressRecord};
use sluice::pipeline::{FileOutcome, FilePipeline, NoopProgress};
use sluice::recovery::{RecoveryCoordinator, RecoveryReport};
use sluice::storage::ErrorArea;
use sluice::store::InMemoryObjectStore;
use sluice::upload::{RetryPolicy, Uploader};
use sluice::worker::{FileDetected, Orchestrator, OrchestratorOptions};

pub struct TestHarness {
    temp_dir: TempDir,
    pub watch_dir: PathBuf,
    pub error_dir: PathBuf,
    pub work_dir: PathBuf,
    pub store: Arc<InMemoryObjectStore>,
    pub ledger: ProgressLedger,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let watch_dir = base.join("inbox");
        let error_dir = base.join("errors");
        let work_dir = base.join("work");
        std::fs::create_dir_all(&watch_dir).expect("Failed to create watch dir");

        Self {
            watch_dir,
            error_dir,
            work_dir,
            store: Arc::new(InMemoryObjectStore::new()),
            ledger: ProgressLedger::open_in_memory().expect("Failed to open ledger"),
            temp_dir,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn uploader(&self) -> Uploader {
        Uploader::new(
            self.store.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        )
    }

    /// A fresh pipeline over the shared ledger and store, as after a restart.
    pub fn pipeline(&self) -> FilePipeline {
        FilePipeline::new(
            self.ledger.clone(),
            self.uploader(),
            KeyBuilder::default(),
            ErrorArea::new(&self.error_dir),
            self.work_dir.clone(),
        )
    }

    pub fn orchestrator(&self, worker_count: usize) -> Orchestrator {
        Orchestrator::new(
            Arc::new(self.pipeline()),
            OrchestratorOptions {
                worker_count,
                queue_capacity: 32,
            },
        )
        .with_progress(Arc::new(NoopProgress))
    }

    pub async fn recover(&self) -> RecoveryReport {
        RecoveryCoordinator::new(self.ledger.clone(), self.uploader())
            .run()
            .await
            .expect("Recovery failed")
    }

    /// Writes a file below the watched directory and returns its detection.
    pub fn write_input(&self, relative: &str, content: &[u8]) -> FileDetected {
        let path = self.watch_dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create input parent");
        }
        std::fs::write(&path, content).expect("Failed to write input file");
        self.detect(relative)
    }

    /// Writes a zip archive holding `entries` and returns its detection.
    pub fn write_zip(&self, relative: &str, entries: &[(&str, &[u8])]) -> FileDetected {
        let path = self.watch_dir.join(relative);
        let file = std::fs::File::create(&path).expect("Failed to create zip");
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, options).expect("Failed to start zip entry");
            zip.write_all(body).expect("Failed to write zip entry");
        }
        zip.finish().expect("Failed to finish zip");
        self.detect(relative)
    }

    pub fn detect(&self, relative: &str) -> FileDetected {
        FileDetected::from_path(&self.watch_dir, &self.watch_dir.join(relative))
            .expect("Failed to stat input")
    }

    pub async fn process(&self, event: &FileDetected) -> FileOutcome {
        self.pipeline()
            .run(event, &NoopProgress)
            .await
            .expect("Ledger failure")
    }

    pub fn record(&self, event: &FileDetected) -> Option<ProgressRecord> {
        self.ledger
            .lookup(&event.absolute_path)
            .expect("Ledger lookup failed")
    }

    /// Files currently in the error area, relative to it.
    pub fn error_area_files(&self) -> Vec<PathBuf> {
        if !self.error_dir.exists() {
            return Vec::new();
        }
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(&self.error_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(&self.error_dir)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| e.path().to_path_buf())
            })
            .collect();
        files.sort();
        files
    }

    /// Row count of a stored parquet object.
    pub fn parquet_rows(&self, key: &str) -> i64 {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let object = self.store.object(key).expect("Object missing");
        let path = self.temp_path().join("readback.parquet");
        std::fs::write(&path, &object.body).expect("Failed to write readback");
        let file = std::fs::File::open(&path).expect("Failed to open readback");
        let reader = SerializedFileReader::new(file).expect("Not a parquet file");
        reader.metadata().file_metadata().num_rows()
    }
}
