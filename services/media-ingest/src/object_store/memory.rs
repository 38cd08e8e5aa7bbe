//! In-process object backend for local runs and tests.

use super::{ObjectBackend, PartReceipt, PutOptions, StoreError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// An object held in memory
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub options: PutOptions,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    options: PutOptions,
    parts: BTreeMap<i32, Bytes>,
}

/// Failure for writes to keys containing `pattern`
#[derive(Debug)]
struct KeyFault {
    pattern: String,
    error: StoreError,
    /// Writes left to fail; `None` fails every write
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Faults {
    next_puts: VecDeque<StoreError>,
    next_parts: VecDeque<StoreError>,
    keys: Vec<KeyFault>,
}

/// In-memory backend with fault injection and artificial latency
#[derive(Debug)]
pub struct InMemoryBackend {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    faults: Mutex<Faults>,
    latency: Mutex<Option<Duration>>,
    put_attempts: AtomicU64,
    aborted: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(None),
            put_attempts: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Delay every write by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    /// Fail the next single-request puts with these errors, in order
    pub fn fail_next_puts(&self, errors: Vec<StoreError>) {
        self.faults.lock().next_puts.extend(errors);
    }

    /// Fail the next multipart part uploads with these errors, in order
    pub fn fail_next_parts(&self, errors: Vec<StoreError>) {
        self.faults.lock().next_parts.extend(errors);
    }

    /// Fail every write to a key containing `pattern`
    pub fn fail_key(&self, pattern: impl Into<String>, error: StoreError) {
        self.faults.lock().keys.push(KeyFault {
            pattern: pattern.into(),
            error,
            remaining: None,
        });
    }

    /// Fail the next `times` writes to keys containing `pattern`
    pub fn fail_key_times(&self, pattern: impl Into<String>, error: StoreError, times: u32) {
        self.faults.lock().keys.push(KeyFault {
            pattern: pattern.into(),
            error,
            remaining: Some(times),
        });
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|o| o.data.clone())
    }

    pub fn stored(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().get(key).cloned()
    }

    /// All stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Single-request puts attempted so far, failed ones included
    pub fn put_attempts(&self) -> u64 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    pub fn aborted_uploads(&self) -> u64 {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn key_fault(&self, key: &str) -> Option<StoreError> {
        let mut faults = self.faults.lock();
        let fault = faults
            .keys
            .iter_mut()
            .find(|f| key.contains(f.pattern.as_str()) && f.remaining != Some(0))?;

        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(fault.error.clone())
    }
}

#[async_trait]
impl ObjectBackend for InMemoryBackend {
    fn bucket(&self) -> String {
        self.bucket.clone()
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: &PutOptions,
    ) -> Result<(), StoreError> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if let Some(error) = self.faults.lock().next_puts.pop_front() {
            return Err(error);
        }
        if let Some(error) = self.key_fault(key) {
            return Err(error);
        }

        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: body,
                options: options.clone(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        self.object(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.lock().contains_key(key))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.objects
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn create_multipart(
        &self,
        key: &str,
        options: &PutOptions,
    ) -> Result<String, StoreError> {
        if let Some(error) = self.key_fault(key) {
            return Err(error);
        }

        let upload_id = Uuid::new_v4().to_string();
        self.uploads.lock().insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                options: options.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        self.simulate_latency().await;

        if let Some(error) = self.faults.lock().next_parts.pop_front() {
            return Err(error);
        }

        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {}", upload_id)))?;
        upload.parts.insert(part_number, body);

        Ok(format!("{}-{}", upload_id, part_number))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartReceipt>,
    ) -> Result<(), StoreError> {
        let upload = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {}", upload_id)))?;

        if upload.key != key {
            return Err(StoreError::Permanent(format!(
                "Upload {} belongs to {}",
                upload_id, upload.key
            )));
        }

        let mut data = BytesMut::new();
        for receipt in &parts {
            let part = upload.parts.get(&receipt.part_number).ok_or_else(|| {
                StoreError::Permanent(format!("Missing part {}", receipt.part_number))
            })?;
            data.extend_from_slice(part);
        }

        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: data.freeze(),
                options: upload.options,
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), StoreError> {
        if self.uploads.lock().remove(upload_id).is_some() {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        if !self.objects.lock().contains_key(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(format!(
            "memory://{}/{}?expires_in={}",
            self.bucket,
            key,
            expires_in.as_secs()
        ))
    }
}
