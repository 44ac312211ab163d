//! S3 (and S3-compatible) object store.
//!
//! The completion marker travels as user metadata on `PutObject` or
//! `CreateMultipartUpload`. Either way S3 only exposes the object, metadata
//! included, once the final commit succeeds.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use secrecy::ExposeSecret;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use super::{normalize_etag, ObjectHead, ObjectStore, PutOutcome, PutRequest, StoreError, UploadBody};
use crate::config::S3Config;
use crate::error::ConfigError;
use crate::sanitize;
use crate::secrets::resolve_secret_optional;

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    multipart_threshold: u64,
    part_size: u64,
}

impl S3ObjectStore {
    /// Builds a client from config. Explicit credentials win over the
    /// default AWS provider chain.
    pub async fn connect(config: &S3Config) -> Result<Self, ConfigError> {
        let access_key = resolve_secret_optional(
            config.access_key.as_deref(),
            config.access_key_file.as_deref(),
            config.access_key_env.as_deref(),
        )
        .map_err(|e| ConfigError::Secret {
            name: "s3.access_key".to_string(),
            source: e,
        })?;
        let secret_key = resolve_secret_optional(
            config.secret_key.as_deref(),
            config.secret_key_file.as_deref(),
            config.secret_key_env.as_deref(),
        )
        .map_err(|e| ConfigError::Secret {
            name: "s3.secret_key".to_string(),
            source: e,
        })?;

        let region = Region::new(config.region.clone());
        let mut builder = match (access_key, secret_key) {
            (Some(access), Some(secret)) => {
                let credentials = Credentials::new(
                    access.expose_secret(),
                    secret.expose_secret(),
                    None,
                    None,
                    "sluice-config",
                );
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(region)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!(
            bucket = %config.bucket,
            endpoint = %config.endpoint.as_deref().map(sanitize::redact_endpoint).unwrap_or_else(|| "aws".to_string()),
            path_style = config.path_style,
            "Object store client initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            multipart_threshold: config.multipart_threshold_bytes,
            part_size: config.part_size_bytes.max(1),
        })
    }

    async fn put_single(&self, request: &PutRequest, size: u64) -> Result<PutOutcome, StoreError> {
        let body = match &request.body {
            UploadBody::File(path) => {
                ByteStream::from_path(path)
                    .await
                    .map_err(|e| StoreError::Body {
                        key: request.key.clone(),
                        source: std::io::Error::other(e),
                    })?
            }
            UploadBody::Bytes(bytes) => ByteStream::from(bytes.clone()),
        };

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .content_length(i64::try_from(size).unwrap_or(i64::MAX))
            .set_metadata(Some(request.metadata.clone()))
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk_error("put", &request.key, e))?;

        Ok(PutOutcome {
            etag: output.e_tag().map(normalize_etag).unwrap_or_default(),
            bytes_written: size,
        })
    }

    async fn put_multipart(&self, request: &PutRequest, size: u64) -> Result<PutOutcome, StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .set_metadata(Some(request.metadata.clone()))
            .send()
            .await
            .map_err(|e| map_sdk_error("create_multipart_upload", &request.key, e))?;

        let upload_id = created.upload_id().unwrap_or_default().to_string();
        if upload_id.is_empty() {
            return Err(StoreError::Rejected {
                op: "create_multipart_upload",
                key: request.key.clone(),
                message: "no upload id returned".to_string(),
            });
        }

        match self.upload_parts(request, &upload_id).await {
            Ok(etag) => Ok(PutOutcome {
                etag,
                bytes_written: size,
            }),
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&request.key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %request.key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, request: &PutRequest, upload_id: &str) -> Result<String, StoreError> {
        let mut parts = Vec::new();
        let mut source = PartSource::open(&request.body, self.part_size)
            .await
            .map_err(|e| StoreError::Body {
                key: request.key.clone(),
                source: e,
            })?;

        let mut part_number = 1i32;
        while let Some(chunk) = source.next_part().await.map_err(|e| StoreError::Body {
            key: request.key.clone(),
            source: e,
        })? {
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&request.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| map_sdk_error("upload_part", &request.key, e))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            debug!(key = %request.key, part_number, "Uploaded part");
            part_number += 1;
        }

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&request.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error("complete_multipart_upload", &request.key, e))?;

        Ok(completed.e_tag().map(normalize_etag).unwrap_or_default())
    }
}

/// Yields a body in fixed-size parts without holding more than one in memory.
enum PartSource<'a> {
    File {
        file: tokio::fs::File,
        part_size: usize,
    },
    Bytes {
        chunks: std::slice::Chunks<'a, u8>,
    },
}

impl<'a> PartSource<'a> {
    async fn open(body: &'a UploadBody, part_size: u64) -> std::io::Result<Self> {
        let part_size = usize::try_from(part_size).unwrap_or(usize::MAX);
        Ok(match body {
            UploadBody::File(path) => PartSource::File {
                file: tokio::fs::File::open(path).await?,
                part_size,
            },
            UploadBody::Bytes(bytes) => PartSource::Bytes {
                chunks: bytes.chunks(part_size),
            },
        })
    }

    async fn next_part(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match self {
            PartSource::File { file, part_size } => {
                let mut buf = Vec::with_capacity(*part_size);
                let mut limited = file.take(*part_size as u64);
                limited.read_to_end(&mut buf).await?;
                Ok(if buf.is_empty() { None } else { Some(buf) })
            }
            PartSource::Bytes { chunks } => Ok(chunks.next().map(<[u8]>::to_vec)),
        }
    }
}

/// Splits SDK failures into retryable and permanent errors.
fn map_sdk_error<E>(op: &'static str, key: &str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            status >= 500 || status == 408 || status == 429
        }
        _ => false,
    };

    if transient {
        StoreError::Transient {
            op,
            key: key.to_string(),
            message,
        }
    } else {
        StoreError::Rejected {
            op,
            key: key.to_string(),
            message,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, request), fields(key = %request.key))]
    async fn put(&self, request: &PutRequest) -> Result<PutOutcome, StoreError> {
        let size = request.body.len().await.map_err(|e| StoreError::Body {
            key: request.key.clone(),
            source: e,
        })?;

        debug!("Uploading {} bytes to s3://{}/{}", size, self.bucket, request.key);

        if size > self.multipart_threshold {
            self.put_multipart(request, size).await
        } else {
            self.put_single(request, size).await
        }
    }

    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> Result<Option<ObjectHead>, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectHead {
                key: key.to_string(),
                size: output
                    .content_length()
                    .and_then(|n| u64::try_from(n).ok())
                    .unwrap_or(0),
                etag: output.e_tag().map(normalize_etag),
                metadata: output.metadata().cloned().unwrap_or_else(HashMap::new),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(map_sdk_error("head", key, e)),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("delete", key, e))?;

        debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error("list", prefix, e))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_part_source_splits_bytes() {
        let body = UploadBody::Bytes(vec![1u8; 10]);
        let mut source = PartSource::open(&body, 4).await.unwrap();
        let mut sizes = Vec::new();
        while let Some(part) = source.next_part().await.unwrap() {
            sizes.push(part.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_part_source_splits_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![9u8; 9]).unwrap();

        let body = UploadBody::File(path);
        let mut source = PartSource::open(&body, 3).await.unwrap();
        let mut total = 0;
        let mut parts = 0;
        while let Some(part) = source.next_part().await.unwrap() {
            total += part.len();
            parts += 1;
        }
        assert_eq!((parts, total), (3, 9));
    }

    #[tokio::test]
    async fn test_connect_with_static_credentials() {
        let config: S3Config = serde_json::from_value(serde_json::json!({
            "bucket": "landing",
            "endpoint": "http://localhost:9000",
            "path_style": true,
            "access_key": "minio",
            "secret_key": "minio123"
        }))
        .unwrap();

        let store = S3ObjectStore::connect(&config).await.unwrap();
        assert_eq!(store.bucket, "landing");
        assert_eq!(store.multipart_threshold, 16 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_connect_reports_missing_secret_file() {
        let config: S3Config = serde_json::from_value(serde_json::json!({
            "bucket": "landing",
            "access_key": "minio",
            "secret_key_file": "/no/such/secret"
        }))
        .unwrap();

        let err = S3ObjectStore::connect(&config).await.err().unwrap();
        assert!(matches!(err, ConfigError::Secret { .. }));
    }
}
