//! Upload and verification protocol.
//!
//! Every put carries the completion marker and the source checksum in the
//! same call that commits the body. Verification reads them back together
//! with the store's integrity tag.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::store::{
    normalize_etag, ObjectHead, ObjectStore, PutOutcome, PutRequest, StoreError, UploadBody,
    COMPLETION_MARKER_KEY, COMPLETION_MARKER_VALUE, SOURCE_SHA256_KEY,
};

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Object store rejected '{key}': {source}")]
    Rejected {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Giving up on '{key}' after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },
}

/// Transfer state of one destination object. Dropped once verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub key: String,
    pub bytes_transferred: u64,
    pub etag: Option<String>,
    pub verified: bool,
}

/// What a verified object must match. `None` fields are not checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expectation<'a> {
    pub etag: Option<&'a str>,
    pub source_checksum: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { size: u64, etag: Option<String> },
    Missing,
    Incomplete,
    Mismatch { reason: String },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified { .. })
    }

    fn of(head: Option<ObjectHead>, expected: &Expectation<'_>) -> Self {
        let Some(head) = head else {
            return Verification::Missing;
        };
        if !head.is_complete() {
            return Verification::Incomplete;
        }
        if let Some(expected_etag) = expected.etag.filter(|e| !e.is_empty()) {
            let actual = head.etag.as_deref().map(normalize_etag);
            if actual.as_deref() != Some(normalize_etag(expected_etag).as_str()) {
                return Verification::Mismatch {
                    reason: format!("etag {:?} != {}", actual, expected_etag),
                };
            }
        }
        if let Some(expected_sum) = expected.source_checksum {
            if head.source_checksum() != Some(expected_sum) {
                return Verification::Mismatch {
                    reason: format!(
                        "source checksum {:?} != {}",
                        head.source_checksum(),
                        expected_sum
                    ),
                };
            }
        }
        Verification::Verified {
            size: head.size,
            etag: head.etag,
        }
    }
}

/// Shared, stateless front for all object store traffic.
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// One put attempt with the completion marker attached.
    pub async fn upload(
        &self,
        key: &str,
        body: UploadBody,
        content_type: &str,
        source_checksum: &str,
    ) -> Result<PutOutcome, StoreError> {
        self.store
            .put(&marked_request(key, body, content_type, source_checksum))
            .await
    }

    /// Uploads and verifies, retrying transient failures and failed
    /// verifications with backoff. Permanent rejections fail immediately.
    pub async fn upload_and_verify(
        &self,
        key: &str,
        body: UploadBody,
        content_type: &str,
        source_checksum: &str,
    ) -> Result<UploadRecord, UploadError> {
        let request = marked_request(key, body, content_type, source_checksum);
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match self.store.put(&request).await {
                Ok(outcome) => {
                    let expected = Expectation {
                        etag: Some(&outcome.etag),
                        source_checksum: Some(source_checksum),
                    };
                    match self.store.head(key).await {
                        Ok(head) => match Verification::of(head, &expected) {
                            Verification::Verified { etag, .. } => {
                                debug!(key, attempt, bytes = outcome.bytes_written, "Upload verified");
                                return Ok(UploadRecord {
                                    key: key.to_string(),
                                    bytes_transferred: outcome.bytes_written,
                                    etag,
                                    verified: true,
                                });
                            }
                            other => last_error = format!("verification failed: {:?}", other),
                        },
                        Err(e) if e.is_retryable() => last_error = e.to_string(),
                        Err(e) => {
                            return Err(UploadError::Rejected {
                                key: key.to_string(),
                                source: e,
                            })
                        }
                    }
                }
                Err(e) if e.is_retryable() => last_error = e.to_string(),
                Err(e) => {
                    return Err(UploadError::Rejected {
                        key: key.to_string(),
                        source: e,
                    })
                }
            }

            if attempt < self.policy.max_attempts {
                let delay = self.policy.delay_after(attempt);
                warn!(key, attempt, ?delay, error = %last_error, "Upload attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        Err(UploadError::RetriesExhausted {
            key: key.to_string(),
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    /// Reads the object's metadata and classifies it against `expected`.
    /// Transient store errors are retried; only exhaustion is an error.
    pub async fn inspect(
        &self,
        key: &str,
        expected: &Expectation<'_>,
    ) -> Result<Verification, UploadError> {
        let head = self.retrying(key, || self.store.head(key)).await?;
        Ok(Verification::of(head, expected))
    }

    /// True only when the object exists, carries the marker and matches
    /// `expected`. A missing or mismatched object is `Ok(false)`.
    pub async fn verify(&self, key: &str, expected: &Expectation<'_>) -> Result<bool, UploadError> {
        Ok(self.inspect(key, expected).await?.is_verified())
    }

    /// Deletes an object that lacks the completion marker. Returns false
    /// when there is nothing at `key` or the object is complete.
    pub async fn cleanup_incomplete(&self, key: &str) -> Result<bool, UploadError> {
        let head = self.retrying(key, || self.store.head(key)).await?;
        match head {
            Some(head) if !head.is_complete() => {
                self.retrying(key, || self.store.delete(key)).await?;
                debug!(key, "Deleted incomplete object");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Lists keys under `prefix` with the same retry treatment.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, UploadError> {
        self.retrying(prefix, || self.store.list(prefix)).await
    }

    async fn retrying<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(key, attempt, ?delay, error = %e, "Store call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(UploadError::RetriesExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    })
                }
                Err(e) => {
                    return Err(UploadError::Rejected {
                        key: key.to_string(),
                        source: e,
                    })
                }
            }
        }
    }
}

fn marked_request(key: &str, body: UploadBody, content_type: &str, source_checksum: &str) -> PutRequest {
    PutRequest {
        key: key.to_string(),
        body,
        content_type: content_type.to_string(),
        metadata: HashMap::from([
            (
                COMPLETION_MARKER_KEY.to_string(),
                COMPLETION_MARKER_VALUE.to_string(),
            ),
            (SOURCE_SHA256_KEY.to_string(), source_checksum.to_string()),
        ]),
    }
}
