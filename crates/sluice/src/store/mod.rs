//! Object store abstraction.
//!
//! An object is complete only when it carries the completion marker in its
//! user metadata. Implementations must write metadata in the same call that
//! commits the object, so a marker can never exist without its body.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod s3;

pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

/// Metadata key carrying the completion marker.
pub const COMPLETION_MARKER_KEY: &str = "sluice-complete";
/// Sentinel value of the completion marker.
pub const COMPLETION_MARKER_VALUE: &str = "true";
/// Metadata key carrying the SHA-256 of the source file.
pub const SOURCE_SHA256_KEY: &str = "sluice-source-sha256";

#[derive(Error, Debug)]
pub enum StoreError {
    /// Network failures, throttling and 5xx responses.
    #[error("{op} '{key}' failed transiently: {message}")]
    Transient {
        op: &'static str,
        key: String,
        message: String,
    },

    /// The store refused the request. Retrying will not help.
    #[error("{op} '{key}' was rejected: {message}")]
    Rejected {
        op: &'static str,
        key: String,
        message: String,
    },

    /// The local body could not be read.
    #[error("Failed to read upload body for '{key}': {source}")]
    Body {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

/// Where the bytes of an upload come from. File bodies can be re-read on retry.
#[derive(Debug, Clone)]
pub enum UploadBody {
    File(PathBuf),
    Bytes(Vec<u8>),
}

impl UploadBody {
    pub async fn len(&self) -> std::io::Result<u64> {
        match self {
            UploadBody::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            UploadBody::Bytes(bytes) => Ok(bytes.len() as u64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: String,
    pub body: UploadBody,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub etag: String,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ObjectHead {
    pub fn is_complete(&self) -> bool {
        self.metadata.get(COMPLETION_MARKER_KEY).map(String::as_str) == Some(COMPLETION_MARKER_VALUE)
    }

    pub fn source_checksum(&self) -> Option<&str> {
        self.metadata.get(SOURCE_SHA256_KEY).map(String::as_str)
    }
}

/// Minimal object store surface. Handles are shared by all workers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes the body and its metadata as one commit.
    async fn put(&self, request: &PutRequest) -> Result<PutOutcome, StoreError>;

    /// Returns `None` when no object exists at `key`.
    async fn head(&self, key: &str) -> Result<Option<ObjectHead>, StoreError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lists every key starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Strips the quotes some stores wrap ETags in.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}
