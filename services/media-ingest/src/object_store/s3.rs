use super::{ObjectBackend, PartReceipt, PutOptions, StoreError};
use crate::config::StoreConfig;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// S3 (or S3-compatible) backend
pub struct S3Backend {
    client: S3Client,
    bucket: String,
}

impl S3Backend {
    /// Create a new S3 backend
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "media-ingest-config",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 backend initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn bucket(&self) -> String {
        self.bucket.clone()
    }

    #[instrument(skip(self, body, options), fields(size_bytes = body.len()))]
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: &PutOptions,
    ) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(&options.content_type)
            .set_acl(options.acl.as_deref().map(ObjectCannedAcl::from));

        for (name, value) in &options.metadata {
            request = request.metadata(name, value);
        }

        request
            .send()
            .await
            .map_err(|e| classify_sdk_error("put_object", key, e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("get_object", key, e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to read {}: {}", key, e)))?;

        Ok(body.into_bytes())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    match classify_sdk_error("head_object", key, e) {
                        StoreError::NotFound(_) => Ok(false),
                        other => Err(other),
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("delete_object", key, e))?;

        debug!(key = %key, "Object deleted from S3");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| classify_sdk_error("list_objects_v2", prefix, e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn create_multipart(
        &self,
        key: &str,
        options: &PutOptions,
    ) -> Result<String, StoreError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&options.content_type)
            .set_acl(options.acl.as_deref().map(ObjectCannedAcl::from));

        for (name, value) in &options.metadata {
            request = request.metadata(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_sdk_error("create_multipart_upload", key, e))?;

        response
            .upload_id()
            .map(String::from)
            .ok_or_else(|| StoreError::Permanent("No upload ID in response".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error("upload_part", key, e))?;

        Ok(response.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartReceipt>,
    ) -> Result<(), StoreError> {
        let completed_parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.etag)
                    .build()
            })
            .collect();

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| classify_sdk_error("complete_multipart_upload", key, e))?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error("abort_multipart_upload", key, e))?;

        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StoreError::Permanent(format!("Invalid presign expiry: {}", e)))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| classify_sdk_error("presign_get", key, e))?;

        Ok(presigned.uri().to_string())
    }
}

/// Map an SDK error onto the store error taxonomy
fn classify_sdk_error<E>(operation: &str, key: &str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{} {}: {}", operation, key, DisplayErrorContext(&err));

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(message)
        }
        SdkError::ConstructionFailure(_) => StoreError::Permanent(message),
        _ => {
            let status = err.raw_response().map(|r| r.status().as_u16());
            classify_response(status, err.code(), message)
        }
    }
}

/// Classify a backend response by HTTP status and S3 error code
fn classify_response(status: Option<u16>, code: Option<&str>, message: String) -> StoreError {
    match code {
        Some("NoSuchKey" | "NotFound" | "NoSuchUpload") => return StoreError::NotFound(message),
        Some(
            "SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable"
            | "Throttling" | "ThrottlingException",
        ) => return StoreError::Transient(message),
        _ => {}
    }

    match status {
        Some(404) => StoreError::NotFound(message),
        Some(408 | 429) => StoreError::Transient(message),
        Some(s) if s >= 500 => StoreError::Transient(message),
        _ => StoreError::Permanent(message),
    }
}
