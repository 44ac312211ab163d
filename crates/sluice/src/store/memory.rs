//! In-process object store with call accounting and fault injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ObjectHead, ObjectStore, PutOutcome, PutRequest, StoreError, UploadBody};
use crate::checksum::sha256_bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub etag: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Default)]
struct Counters {
    put: AtomicUsize,
    head: AtomicUsize,
    delete: AtomicUsize,
    list: AtomicUsize,
}

/// Thread-safe object store kept in memory.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    calls: Counters,
    failing_puts: AtomicUsize,
    failing_heads: AtomicUsize,
    put_delay: Mutex<Option<Duration>>,
}

fn etag_of(body: &[u8]) -> String {
    format!("\"{}\"", &sha256_bytes(body)[..32])
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` puts fail with a transient error before touching state.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// The next `n` heads fail with a transient error.
    pub fn fail_next_heads(&self, n: usize) {
        self.failing_heads.store(n, Ordering::SeqCst);
    }

    /// Every put sleeps for `delay` before committing.
    pub fn set_put_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.put_delay.lock() {
            *guard = Some(delay);
        }
    }

    /// Stores an object exactly as given, bypassing the marker protocol.
    /// Models a body that landed without its final commit.
    pub fn insert_raw(&self, key: &str, body: &[u8], metadata: HashMap<String, String>) {
        let object = StoredObject {
            etag: etag_of(body),
            body: body.to_vec(),
            content_type: "application/octet-stream".to_string(),
            metadata,
        };
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), object);
        }
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn put_calls(&self) -> usize {
        self.calls.put.load(Ordering::SeqCst)
    }

    pub fn head_calls(&self) -> usize {
        self.calls.head.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.calls.delete.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.calls.list.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.put_calls() + self.head_calls() + self.delete_calls() + self.list_calls()
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn poisoned(op: &'static str, key: &str) -> StoreError {
        StoreError::Rejected {
            op,
            key: key.to_string(),
            message: "store lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, request: &PutRequest) -> Result<PutOutcome, StoreError> {
        self.calls.put.fetch_add(1, Ordering::SeqCst);

        let delay = self.put_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_fault(&self.failing_puts) {
            return Err(StoreError::Transient {
                op: "put",
                key: request.key.clone(),
                message: "injected fault".to_string(),
            });
        }

        let body = match &request.body {
            UploadBody::File(path) => tokio::fs::read(path).await.map_err(|e| StoreError::Body {
                key: request.key.clone(),
                source: e,
            })?,
            UploadBody::Bytes(bytes) => bytes.clone(),
        };

        let etag = etag_of(&body);
        let bytes_written = body.len() as u64;
        let object = StoredObject {
            body,
            content_type: request.content_type.clone(),
            etag: etag.clone(),
            metadata: request.metadata.clone(),
        };
        self.objects
            .lock()
            .map_err(|_| Self::poisoned("put", &request.key))?
            .insert(request.key.clone(), object);

        Ok(PutOutcome {
            etag,
            bytes_written,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectHead>, StoreError> {
        self.calls.head.fetch_add(1, Ordering::SeqCst);

        if Self::take_fault(&self.failing_heads) {
            return Err(StoreError::Transient {
                op: "head",
                key: key.to_string(),
                message: "injected fault".to_string(),
            });
        }

        let objects = self.objects.lock().map_err(|_| Self::poisoned("head", key))?;
        Ok(objects.get(key).map(|o| ObjectHead {
            key: key.to_string(),
            size: o.body.len() as u64,
            etag: Some(o.etag.clone()),
            metadata: o.metadata.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .map_err(|_| Self::poisoned("delete", key))?
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().map_err(|_| Self::poisoned("list", prefix))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::COMPLETION_MARKER_KEY;

    fn request(key: &str, body: &[u8]) -> PutRequest {
        PutRequest {
            key: key.to_string(),
            body: UploadBody::Bytes(body.to_vec()),
            content_type: "text/plain".to_string(),
            metadata: HashMap::from([(COMPLETION_MARKER_KEY.to_string(), "true".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_put_then_head() {
        let store = InMemoryObjectStore::new();
        let out = store.put(&request("a.txt", b"hello")).await.unwrap();
        assert_eq!(out.bytes_written, 5);

        let head = store.head("a.txt").await.unwrap().unwrap();
        assert_eq!(head.size, 5);
        assert_eq!(head.etag.as_deref(), Some(out.etag.as_str()));
        assert!(head.is_complete());
        assert_eq!(store.put_calls(), 1);
        assert_eq!(store.head_calls(), 1);
    }

    #[tokio::test]
    async fn test_head_missing() {
        let store = InMemoryObjectStore::new();
        assert!(store.head("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_put_faults() {
        let store = InMemoryObjectStore::new();
        store.fail_next_puts(2);

        assert!(store.put(&request("a", b"x")).await.unwrap_err().is_retryable());
        assert!(store.put(&request("a", b"x")).await.is_err());
        assert!(store.put(&request("a", b"x")).await.is_ok());
        assert_eq!(store.keys(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_insert_raw_has_no_marker() {
        let store = InMemoryObjectStore::new();
        store.insert_raw("big.bin", &[0u8; 16], HashMap::new());
        let head = store.head("big.bin").await.unwrap().unwrap();
        assert!(!head.is_complete());
    }

    #[tokio::test]
    async fn test_list_by_prefix_and_delete() {
        let store = InMemoryObjectStore::new();
        store.put(&request("bundle/a.txt", b"a")).await.unwrap();
        store.put(&request("bundle/b.parquet", b"b")).await.unwrap();
        store.put(&request("bundles.txt", b"c")).await.unwrap();

        let listed = store.list("bundle/").await.unwrap();
        assert_eq!(listed, vec!["bundle/a.txt", "bundle/b.parquet"]);

        store.delete("bundle/a.txt").await.unwrap();
        store.delete("bundle/a.txt").await.unwrap();
        assert_eq!(store.list("bundle/").await.unwrap().len(), 1);
        assert_eq!(store.delete_calls(), 2);
    }
}
