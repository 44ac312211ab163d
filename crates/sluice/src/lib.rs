pub mod checksum;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod recovery;
pub mod sanitize;
pub mod secrets;
pub mod storage;
pub mod store;
pub mod transform;
pub mod upload;
pub mod worker;

pub use classify::{ArchiveFormat, FileClass, KeyBuilder, TabularFormat};
pub use config::{load_config, Config};
pub use error::{ConfigError, Result, SluiceError, StorageError, WorkerError};
pub use ledger::{LedgerError, ProgressLedger, ProgressRecord, ProgressStatus};
pub use pipeline::{FatalError, FileOutcome, FilePipeline, FileState, ProgressReporter};
pub use recovery::{RecoveryCoordinator, RecoveryError, RecoveryReport};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use store::{InMemoryObjectStore, ObjectStore, S3ObjectStore, StoreError};
pub use upload::{RetryPolicy, UploadError, Uploader};
pub use worker::{DetectionSender, DirectoryScanner, FileDetected, FileReport, Orchestrator, StopReport};
