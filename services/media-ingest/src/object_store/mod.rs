//! Object storage for originals and derivatives.
//!
//! [`ObjectBackend`] is the set of primitives a storage service offers;
//! [`StoreClient`] layers the upload contract on top of it: multipart for
//! large bodies, per-part retries, a shared transfer pool and cancellation.

pub mod memory;
pub mod s3;

use crate::config::{RetryConfig, StoreConfig};
use crate::models::StoredLocation;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use memory::InMemoryBackend;
pub use s3::S3Backend;

/// Parts of one multipart upload in flight at once
const MAX_PARTS_IN_FLIGHT: usize = 4;

/// Object store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Permanent store error: {0}")]
    Permanent(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Store operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Stable error code for API responses and artifact records
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Transient(_) => "STORE_TRANSIENT",
            StoreError::Permanent(_) => "STORE_PERMANENT",
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Cancelled => "CANCELLED",
        }
    }
}

/// Per-object write options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub content_type: String,
    /// Canned ACL, e.g. `private` or `public-read`
    pub acl: Option<String>,
    pub metadata: Vec<(String, String)>,
}

impl PutOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            ..Default::default()
        }
    }

    pub fn with_acl(mut self, acl: Option<String>) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// A stored part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: i32,
    pub etag: String,
}

/// Primitives a storage service provides.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Bucket (or namespace) objects are written to
    fn bucket(&self) -> String;

    async fn put_object(&self, key: &str, body: Bytes, options: &PutOptions)
        -> Result<(), StoreError>;

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Start a multipart upload and return its upload id
    async fn create_multipart(&self, key: &str, options: &PutOptions)
        -> Result<String, StoreError>;

    /// Store one part and return its etag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartReceipt>,
    ) -> Result<(), StoreError>;

    /// Discard an upload and every part already stored for it
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError>;
}

/// Shared store client.
///
/// Cheap to share behind an `Arc`; the transfer semaphore bounds concurrent
/// backend calls across every job using this client.
pub struct StoreClient {
    backend: Arc<dyn ObjectBackend>,
    multipart_threshold: usize,
    part_size: usize,
    part_retry: RetryConfig,
    transfers: Semaphore,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn ObjectBackend>, config: &StoreConfig) -> Self {
        Self {
            backend,
            multipart_threshold: config.multipart_threshold_bytes,
            part_size: config.part_size_bytes.max(1),
            part_retry: config.part_retry.clone(),
            transfers: Semaphore::new(config.transfer_concurrency.max(1)),
        }
    }

    pub fn bucket(&self) -> String {
        self.backend.bucket()
    }

    /// Write an object. Bodies larger than the multipart threshold are split
    /// into parts. Success means the backend acknowledged the write.
    #[instrument(skip(self, data, options, cancel), fields(size_bytes = data.len()))]
    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        options: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<StoredLocation, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let size = data.len();
        if size > self.multipart_threshold {
            self.put_multipart(key, data, options, cancel).await?;
        } else {
            self.run_transfer(cancel, self.backend.put_object(key, data, options))
                .await?;
        }

        metrics::counter!("media.store.bytes_written").increment(size as u64);
        debug!(key = %key, size_bytes = size, "Object stored");

        Ok(StoredLocation {
            bucket: self.backend.bucket(),
            key: key.to_string(),
        })
    }

    /// Read a whole object
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let _permit = self.acquire().await?;
        self.backend.get_object(key).await
    }

    /// Delete one object; fails with NotFound when it does not exist
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _permit = self.acquire().await?;
        if !self.backend.exists(key).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.backend.delete_object(key).await
    }

    /// Keys of every object under `prefix`
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let _permit = self.acquire().await?;
        self.backend.list_keys(prefix).await
    }

    /// Delete the given objects, returning how many were removed. Objects
    /// already gone are skipped.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn delete_many(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut deleted = 0;

        for key in keys {
            let _permit = self.acquire().await?;
            match self.backend.delete_object(key).await {
                Ok(()) => deleted += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(deleted, "Deleted objects");
        Ok(deleted)
    }

    /// Time-limited download URL for an object
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        self.backend.presign_get(key, expires_in).await
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>, StoreError> {
        self.transfers
            .acquire()
            .await
            .map_err(|_| StoreError::Permanent("Transfer pool closed".to_string()))
    }

    /// Run one backend call under a transfer permit, dropping it on cancel.
    async fn run_transfer<T>(
        &self,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            result = async {
                let _permit = self.acquire().await?;
                call.await
            } => result,
        }
    }

    async fn put_multipart(
        &self,
        key: &str,
        data: Bytes,
        options: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let upload_id = self
            .run_transfer(cancel, self.backend.create_multipart(key, options))
            .await?;

        debug!(
            key = %key,
            upload_id = %upload_id,
            part_size = self.part_size,
            "Started multipart upload"
        );

        let uploaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            result = self.upload_parts(key, &upload_id, &data, cancel) => result,
        };

        let completed = match uploaded {
            Ok(parts) if !cancel.is_cancelled() => {
                self.run_transfer(cancel, self.backend.complete_multipart(key, &upload_id, parts))
                    .await
            }
            Ok(_) => Err(StoreError::Cancelled),
            Err(StoreError::Cancelled) => Err(StoreError::Cancelled),
            Err(e) => Err(StoreError::Permanent(format!(
                "Multipart upload of {} aborted: {}",
                key, e
            ))),
        };

        if let Err(e) = &completed {
            warn!(key = %key, upload_id = %upload_id, error = %e, "Aborting multipart upload");
            if let Err(abort_err) = self.backend.abort_multipart(key, &upload_id).await {
                warn!(
                    key = %key,
                    upload_id = %upload_id,
                    error = %abort_err,
                    "Failed to abort multipart upload"
                );
            }
        }

        completed
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        data: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<Vec<PartReceipt>, StoreError> {
        let part_count = data.len().div_ceil(self.part_size);
        let parts = (0..part_count).map(|index| {
            let start = index * self.part_size;
            let end = (start + self.part_size).min(data.len());
            (index as i32 + 1, data.slice(start..end))
        });

        let mut receipts: Vec<PartReceipt> = stream::iter(parts)
            .map(|(part_number, body)| async move {
                let (result, attempts) = retry_transient(&self.part_retry, cancel, |_| {
                    self.run_transfer(
                        cancel,
                        self.backend
                            .upload_part(key, upload_id, part_number, body.clone()),
                    )
                })
                .await;

                if attempts > 1 {
                    debug!(part_number, attempts, "Part needed retries");
                }

                result.map(|etag| PartReceipt { part_number, etag })
            })
            .buffer_unordered(MAX_PARTS_IN_FLIGHT)
            .try_collect()
            .await?;

        receipts.sort_by_key(|r| r.part_number);
        Ok(receipts)
    }
}

/// Build an exponential backoff from a retry policy
pub fn backoff_from(policy: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_delay())
        .with_max_interval(policy.max_delay())
        .with_multiplier(policy.multiplier)
        .with_max_elapsed_time(None)
        .build()
}

/// Retry `op` while it fails with a transient error, up to the policy's
/// attempt bound. Returns the final result and the number of attempts made.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> (Result<T, StoreError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = backoff_from(policy);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match op(attempt).await {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff.next_backoff().unwrap_or_else(|| policy.max_delay());
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store error, retrying"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (Err(StoreError::Cancelled), attempt),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            result => return (result, attempt),
        }
    }
}
