//! Ingestion pipeline.
//!
//! One task per job: store the original (retrying transient store errors with
//! exponential backoff), then fan out one generation task per derivative
//! spec. Generation runs on the blocking pool behind a worker semaphore; each
//! result is written back to the store and reported to the job tracker.

use crate::config::{Config, DerivativeDefaults, RetryConfig};
use crate::generator::{DerivativeGenerator, GenerationError};
use crate::models::{
    self, ArtifactError, DerivativeSpec, IngestionJob, MediaClass, MediaObject,
};
use crate::object_store::{retry_transient, PutOptions, StoreClient, StoreError};
use crate::tracker::{JobEvent, JobTracker, NewJob, TrackerError};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Pipeline errors surfaced to callers
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job {0} is not running")]
    NotRunning(Uuid),

    #[error("Job {job_id} cannot be retried: {reason}")]
    NotRetryable { job_id: Uuid, reason: String },

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// One upload to ingest
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub data: Bytes,
    pub content_type: String,
    pub filename: Option<String>,
    /// Folder placed in front of the generated media key
    pub folder: Option<String>,
    /// Canned ACL for every object written for this upload
    pub acl: Option<String>,
    /// Explicit derivatives; defaults for the media class when `None`
    pub specs: Option<Vec<DerivativeSpec>>,
}

/// Handle to a submitted job
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub media_key: String,
    done: watch::Receiver<bool>,
}

impl JobHandle {
    /// Wait until the job's task has finished
    pub async fn wait(&mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }
}

struct RunningJob {
    media_key: String,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Where a job's original comes from
enum Source {
    /// Fresh upload; store it first
    Upload { original_key: String },
    /// Already stored by an earlier job
    Stored { media: MediaObject },
}

struct JobPlan {
    job_id: Uuid,
    media_key: String,
    content_type: String,
    data: Bytes,
    acl: Option<String>,
    specs: Vec<DerivativeSpec>,
    source: Source,
}

/// Why a single derivative did not make it to the store
#[derive(Debug)]
enum DerivativeFailure {
    Generation(GenerationError),
    Store(StoreError),
}

impl DerivativeFailure {
    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            DerivativeFailure::Generation(GenerationError::Cancelled)
                | DerivativeFailure::Store(StoreError::Cancelled)
        )
    }

    fn to_artifact_error(&self) -> ArtifactError {
        match self {
            DerivativeFailure::Generation(e) => ArtifactError {
                code: e.code().to_string(),
                message: e.to_string(),
            },
            DerivativeFailure::Store(e) => ArtifactError {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// Ingestion pipeline shared by the API and background tasks
pub struct IngestPipeline {
    store: Arc<StoreClient>,
    generator: DerivativeGenerator,
    tracker: Arc<JobTracker>,
    workers: Arc<Semaphore>,
    retry: RetryConfig,
    defaults: DerivativeDefaults,
    max_preview_frames: u32,
    key_prefix: String,
    default_acl: Option<String>,
    running: Mutex<HashMap<Uuid, RunningJob>>,
    shutdown: CancellationToken,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<StoreClient>,
        generator: DerivativeGenerator,
        tracker: Arc<JobTracker>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            generator,
            tracker,
            workers: Arc::new(Semaphore::new(config.pipeline.generation_workers.max(1))),
            retry: config.pipeline.retry.clone(),
            defaults: config.derivatives.clone(),
            max_preview_frames: config.derivatives.max_preview_frames,
            key_prefix: config.store.key_prefix.clone(),
            default_acl: config.store.default_acl.clone(),
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &Arc<StoreClient> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// Snapshot of a job
    pub fn job(&self, job_id: Uuid) -> Result<IngestionJob, PipelineError> {
        Ok(self.tracker.get(job_id)?)
    }

    /// Derivatives generated for an upload when none are requested
    pub fn default_specs(&self, content_type: &str) -> Vec<DerivativeSpec> {
        self.defaults
            .specs_for(MediaClass::from_content_type(content_type))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of jobs with work in flight
    pub fn running_jobs(&self) -> usize {
        self.running.lock().len()
    }

    /// Accept an upload. Returns as soon as the job is registered; storing
    /// and generation happen in the background.
    #[instrument(skip(self, request), fields(content_type = %request.content_type, size_bytes = request.data.len()))]
    pub fn submit(self: &Arc<Self>, request: IngestRequest) -> Result<JobHandle, PipelineError> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        if request.data.is_empty() {
            return Err(PipelineError::InvalidRequest("Upload is empty".to_string()));
        }

        let specs = request
            .specs
            .unwrap_or_else(|| self.default_specs(&request.content_type));
        validate_specs(&specs, self.max_preview_frames)?;

        let job_id = Uuid::new_v4();
        let media_key = models::media_key(&self.key_prefix, request.folder.as_deref(), job_id);
        let extension = models::file_extension(&request.content_type, request.filename.as_deref());
        let original_key = models::original_key(&media_key, &extension);

        self.tracker.register(NewJob {
            job_id,
            media_key: media_key.clone(),
            content_type: request.content_type.clone(),
            size_bytes: request.data.len() as u64,
            requested: specs.clone(),
            attempt: 1,
            retry_of: None,
        });

        info!(
            job_id = %job_id,
            media_key = %media_key,
            derivatives = specs.len(),
            "Ingestion job accepted"
        );

        Ok(self.spawn(JobPlan {
            job_id,
            media_key,
            content_type: request.content_type,
            data: request.data,
            acl: request.acl.or_else(|| self.default_acl.clone()),
            specs,
            source: Source::Upload { original_key },
        }))
    }

    /// Cancel a running job. Returns once its in-flight work has stopped;
    /// nothing is written to the store for it afterwards.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<IngestionJob, PipelineError> {
        let running = self
            .running
            .lock()
            .get(&job_id)
            .map(|job| (job.cancel.clone(), job.done.clone()));

        let Some((cancel, mut done)) = running else {
            self.tracker.get(job_id)?;
            return Err(PipelineError::NotRunning(job_id));
        };

        cancel.cancel();
        let _ = done.wait_for(|done| *done).await;

        // No-op when the job reached a terminal stage first
        let job = self.tracker.record(job_id, JobEvent::Cancelled)?;
        info!(job_id = %job_id, status = ?job.status, "Job cancellation acknowledged");
        Ok(job)
    }

    /// Start a new attempt for a finished job, regenerating only the
    /// derivatives that failed or were cancelled from the stored original.
    #[instrument(skip(self))]
    pub async fn resubmit(self: &Arc<Self>, job_id: Uuid) -> Result<JobHandle, PipelineError> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }

        let previous = self.tracker.get(job_id)?;
        let not_retryable = |reason: &str| PipelineError::NotRetryable {
            job_id,
            reason: reason.to_string(),
        };

        if !previous.is_terminal() {
            return Err(not_retryable("job is still running"));
        }
        if previous.deleted_at.is_some() {
            return Err(not_retryable("media was deleted"));
        }
        let media = previous
            .media
            .clone()
            .ok_or_else(|| not_retryable("original was never stored"))?;

        let specs: Vec<DerivativeSpec> = if previous.artifacts.is_empty() {
            previous.requested.clone()
        } else {
            previous
                .artifacts
                .iter()
                .filter(|a| {
                    matches!(
                        a.status,
                        models::ArtifactStatus::Failed | models::ArtifactStatus::Cancelled
                    )
                })
                .map(|a| a.spec.clone())
                .collect()
        };

        if specs.is_empty() {
            return Err(not_retryable("no failed derivatives"));
        }

        let data = self.store.get(&media.key).await?;
        let new_job_id = Uuid::new_v4();

        self.tracker.register(NewJob {
            job_id: new_job_id,
            media_key: previous.media_key.clone(),
            content_type: previous.content_type.clone(),
            size_bytes: data.len() as u64,
            requested: specs.clone(),
            attempt: previous.attempt + 1,
            retry_of: Some(job_id),
        });

        info!(
            job_id = %new_job_id,
            retry_of = %job_id,
            attempt = previous.attempt + 1,
            derivatives = specs.len(),
            "Resubmitted ingestion job"
        );

        Ok(self.spawn(JobPlan {
            job_id: new_job_id,
            media_key: previous.media_key,
            content_type: previous.content_type,
            data,
            acl: self.default_acl.clone(),
            specs,
            source: Source::Stored { media },
        }))
    }

    /// Delete an original and all its derivatives, cancelling any job still
    /// working on them. Returns the number of objects removed.
    ///
    /// Only the original and derivative objects of `media_key` itself are
    /// removed. A folder or prefix holding other media matches nothing and
    /// fails with NotFound.
    #[instrument(skip(self))]
    pub async fn delete_media(&self, media_key: &str) -> Result<usize, PipelineError> {
        let running: Vec<Uuid> = self
            .running
            .lock()
            .iter()
            .filter(|(_, job)| job.media_key == media_key)
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in running {
            match self.cancel(job_id).await {
                Ok(_) | Err(PipelineError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let keys: Vec<String> = self
            .store
            .list(&format!("{}/", media_key))
            .await?
            .into_iter()
            .filter(|key| models::is_media_object_key(media_key, key))
            .collect();

        if !keys.iter().any(|key| models::is_original_key(media_key, key)) {
            return Err(StoreError::NotFound(media_key.to_string()).into());
        }

        let deleted = self.store.delete_many(&keys).await?;

        for job in self.tracker.jobs_for_media(media_key) {
            self.record(job.job_id, JobEvent::MediaDeleted);
        }

        info!(media_key = %media_key, deleted, "Media deleted");
        Ok(deleted)
    }

    /// Cancel every running job and wait for them to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let pending: Vec<watch::Receiver<bool>> = self
            .running
            .lock()
            .values()
            .map(|job| job.done.clone())
            .collect();

        info!(jobs = pending.len(), "Waiting for running jobs to stop");
        for mut done in pending {
            let _ = done.wait_for(|done| *done).await;
        }
    }

    fn spawn(self: &Arc<Self>, plan: JobPlan) -> JobHandle {
        let job_id = plan.job_id;
        let media_key = plan.media_key.clone();
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);

        self.running.lock().insert(
            job_id,
            RunningJob {
                media_key: media_key.clone(),
                cancel: cancel.clone(),
                done: done_rx.clone(),
            },
        );

        let pipeline = self.clone();
        let span = info_span!("ingest_job", job_id = %job_id, media_key = %media_key);
        tokio::spawn(
            async move {
                pipeline.run_job(plan, &cancel).await;
                pipeline.running.lock().remove(&job_id);
                let _ = done_tx.send(true);
            }
            .instrument(span),
        );

        JobHandle {
            job_id,
            media_key,
            done: done_rx,
        }
    }

    async fn run_job(&self, plan: JobPlan, cancel: &CancellationToken) {
        let job_id = plan.job_id;

        let stored = match &plan.source {
            Source::Upload { original_key } => {
                self.store_original(&plan, original_key, cancel).await
            }
            Source::Stored { media } => Some(media.clone()),
        };

        if let Some(media) = stored {
            self.record(job_id, JobEvent::OriginalStored { media });

            if !cancel.is_cancelled() {
                self.record(job_id, JobEvent::GenerationStarted);

                let tasks = plan
                    .specs
                    .iter()
                    .map(|spec| self.run_derivative(&plan, spec, cancel));
                futures::future::join_all(tasks).await;
            }
        }

        if cancel.is_cancelled() {
            self.record(job_id, JobEvent::Cancelled);
        }
    }

    /// Upload the original with bounded retries. `None` if it was not stored.
    async fn store_original(
        &self,
        plan: &JobPlan,
        original_key: &str,
        cancel: &CancellationToken,
    ) -> Option<MediaObject> {
        self.record(plan.job_id, JobEvent::UploadStarted);

        let options = PutOptions::new(plan.content_type.clone())
            .with_acl(plan.acl.clone())
            .with_metadata("job-id", plan.job_id.to_string())
            .with_metadata("media-key", plan.media_key.clone());

        let (result, attempts) = retry_transient(&self.retry, cancel, |attempt| {
            metrics::counter!("media.original.upload_attempts").increment(1);
            debug!(attempt, key = %original_key, "Uploading original");
            self.store
                .put(original_key, plan.data.clone(), &options, cancel)
        })
        .await;

        match result {
            Ok(location) => {
                info!(key = %original_key, attempts, "Original stored");
                Some(MediaObject {
                    key: original_key.to_string(),
                    content_type: plan.content_type.clone(),
                    size_bytes: plan.data.len() as u64,
                    uploaded_at: Utc::now(),
                    location,
                })
            }
            Err(StoreError::Cancelled) => None,
            Err(e) => {
                error!(key = %original_key, attempts, error = %e, "Original upload failed");
                self.record(
                    plan.job_id,
                    JobEvent::UploadFailed {
                        error: format!("{} (after {} attempts)", e, attempts),
                    },
                );
                None
            }
        }
    }

    async fn run_derivative(&self, plan: &JobPlan, spec: &DerivativeSpec, cancel: &CancellationToken) {
        let kind = spec.kind();

        match self.produce_derivative(plan, spec, cancel).await {
            Ok((location, size_bytes)) => {
                metrics::counter!("media.derivatives.succeeded", "kind" => kind.as_str())
                    .increment(1);
                self.record(
                    plan.job_id,
                    JobEvent::DerivativeSucceeded {
                        kind,
                        location,
                        size_bytes,
                    },
                );
            }
            Err(failure) if failure.is_cancelled() => {
                debug!(kind = %kind, "Derivative cancelled");
            }
            Err(failure) => {
                let error = failure.to_artifact_error();
                metrics::counter!(
                    "media.derivatives.failed",
                    "kind" => kind.as_str(),
                    "reason" => error.code.clone()
                )
                .increment(1);
                self.record(plan.job_id, JobEvent::DerivativeFailed { kind, error });
            }
        }
    }

    async fn produce_derivative(
        &self,
        plan: &JobPlan,
        spec: &DerivativeSpec,
        cancel: &CancellationToken,
    ) -> Result<(models::StoredLocation, u64), DerivativeFailure> {
        let kind = spec.kind();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DerivativeFailure::Generation(GenerationError::Cancelled));
            }
            permit = self.workers.clone().acquire_owned() => permit.map_err(|_| {
                DerivativeFailure::Generation(GenerationError::Generation(
                    "Worker pool closed".to_string(),
                ))
            })?,
        };

        let started = Instant::now();
        let generator = self.generator;
        let input = plan.data.clone();
        let content_type = plan.content_type.clone();
        let task_spec = spec.clone();
        let task_cancel = cancel.clone();

        let generated = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            generator.generate(&input, &content_type, &task_spec, &task_cancel)
        })
        .await;

        metrics::histogram!("media.generation.duration_seconds", "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64());

        let asset = match generated {
            Ok(Ok(asset)) => asset,
            Ok(Err(e)) => {
                if e != GenerationError::Cancelled {
                    warn!(
                        kind = %kind,
                        content_type = %plan.content_type,
                        size_bytes = plan.data.len(),
                        spec = ?spec,
                        error = %e,
                        "Derivative generation failed"
                    );
                }
                return Err(DerivativeFailure::Generation(e));
            }
            Err(join_error) => {
                error!(kind = %kind, error = %join_error, "Generation task panicked");
                return Err(DerivativeFailure::Generation(GenerationError::Generation(
                    join_error.to_string(),
                )));
            }
        };

        if cancel.is_cancelled() {
            return Err(DerivativeFailure::Generation(GenerationError::Cancelled));
        }

        let key = models::derivative_key(&plan.media_key, spec);
        let size_bytes = asset.bytes.len() as u64;
        let options = PutOptions::new(asset.content_type)
            .with_acl(plan.acl.clone())
            .with_metadata("job-id", plan.job_id.to_string())
            .with_metadata("derivative-kind", kind.as_str())
            .with_metadata("width", asset.width.to_string())
            .with_metadata("height", asset.height.to_string());

        let (result, _) = retry_transient(&self.retry, cancel, |_| {
            self.store.put(&key, asset.bytes.clone(), &options, cancel)
        })
        .await;

        let location = result.map_err(DerivativeFailure::Store)?;
        debug!(key = %key, size_bytes, "Derivative stored");

        Ok((location, size_bytes))
    }

    fn record(&self, job_id: Uuid, event: JobEvent) {
        if let Err(e) = self.tracker.record(job_id, event) {
            error!(job_id = %job_id, error = %e, "Failed to record job event");
        }
    }
}

/// At most one spec per kind, and every spec must be usable.
fn validate_specs(specs: &[DerivativeSpec], max_preview_frames: u32) -> Result<(), PipelineError> {
    for (index, spec) in specs.iter().enumerate() {
        spec.validate_with(max_preview_frames)
            .map_err(PipelineError::InvalidRequest)?;

        if specs[..index].iter().any(|s| s.kind() == spec.kind()) {
            return Err(PipelineError::InvalidRequest(format!(
                "Duplicate {} derivative",
                spec.kind()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackendKind;
    use crate::models::{
        AnimatedPreviewSpec, ArtifactStatus, DerivativeKind, JobStage, JobStatus, ThumbnailSpec,
        TranscodeSpec,
    };
    use crate::object_store::InMemoryBackend;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.store.backend = StoreBackendKind::Memory;
        config.store.bucket = "test-bucket".to_string();
        config.store.key_prefix = "media".to_string();
        config.pipeline.generation_workers = 2;
        config.pipeline.retry = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        };
        config
    }

    fn setup_with(backend: Arc<InMemoryBackend>, config: &Config) -> Arc<IngestPipeline> {
        let store = Arc::new(StoreClient::new(backend, &config.store));
        IngestPipeline::new(
            store,
            DerivativeGenerator::new(),
            Arc::new(JobTracker::new()),
            config,
        )
    }

    fn setup(backend: Arc<InMemoryBackend>) -> Arc<IngestPipeline> {
        setup_with(backend, &test_config())
    }

    fn jpeg_bytes(width: u32, height: u32) -> Bytes {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x ^ y) % 256) as u8])
        });
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
            .unwrap();
        Bytes::from(buffer)
    }

    fn thumbnail() -> DerivativeSpec {
        DerivativeSpec::Thumbnail(ThumbnailSpec {
            width: 128,
            height: 128,
            ..Default::default()
        })
    }

    fn preview(frame_count: u32) -> DerivativeSpec {
        DerivativeSpec::AnimatedPreview(AnimatedPreviewSpec {
            width: 64,
            height: 64,
            frame_count,
            ..Default::default()
        })
    }

    fn jpeg_request(data: Bytes, specs: Vec<DerivativeSpec>) -> IngestRequest {
        IngestRequest {
            data,
            content_type: "image/jpeg".to_string(),
            filename: Some("photo.jpg".to_string()),
            specs: Some(specs),
            ..Default::default()
        }
    }

    /// Appears in `stages` in this relative order
    fn is_subsequence(expected: &[JobStage], stages: &[JobStage]) -> bool {
        let mut remaining = stages.iter();
        expected
            .iter()
            .all(|stage| remaining.any(|s| s == stage))
    }

    #[tokio::test]
    async fn test_jpeg_with_thumbnail_and_preview_succeeds() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend.clone());

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(1024, 768), vec![thumbnail(), preview(3)]))
            .unwrap();
        handle.wait().await;

        let job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(job.stage, JobStage::AllSucceeded);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(is_subsequence(
            &[
                JobStage::Accepted,
                JobStage::OriginalStored,
                JobStage::GeneratingDerivatives,
                JobStage::AllSucceeded,
            ],
            &job.stages()
        ));

        let locations: Vec<_> = job
            .artifacts
            .iter()
            .filter_map(|a| a.location.as_ref().map(|l| l.key.clone()))
            .collect();
        assert_eq!(locations.len(), 2);

        let media_key = &handle.media_key;
        assert!(media_key.starts_with("media/"));
        assert!(backend.object(&format!("{}/original.jpg", media_key)).is_some());

        let thumb = backend
            .object(&format!("{}/derivatives/thumbnail.jpg", media_key))
            .unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (128, 96));

        let gif = backend
            .stored(&format!("{}/derivatives/animated_preview.gif", media_key))
            .unwrap();
        assert_eq!(gif.options.content_type, "image/gif");
    }

    #[tokio::test]
    async fn test_corrupt_jpeg_fails_all_derivatives() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend);

        let mut handle = pipeline
            .submit(jpeg_request(
                Bytes::from_static(b"\xFF\xD8\xFF\xE0 this is not a real jpeg"),
                vec![thumbnail(), preview(3)],
            ))
            .unwrap();
        handle.wait().await;

        let job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(job.stage, JobStage::AllFailed);
        assert_eq!(job.status, JobStatus::Failed);

        let thumb = job.artifact(DerivativeKind::Thumbnail).unwrap();
        assert_eq!(thumb.status, ArtifactStatus::Failed);
        assert_eq!(thumb.error.as_ref().unwrap().code, "UNSUPPORTED_FORMAT");
    }

    #[tokio::test]
    async fn test_sibling_failure_is_partial() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend);

        let mut handle = pipeline
            .submit(jpeg_request(
                jpeg_bytes(320, 240),
                vec![
                    thumbnail(),
                    DerivativeSpec::Transcode(TranscodeSpec::default()),
                ],
            ))
            .unwrap();
        handle.wait().await;

        let job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(job.stage, JobStage::PartialFailure);
        assert_eq!(
            job.artifact(DerivativeKind::Thumbnail).unwrap().status,
            ArtifactStatus::Succeeded
        );
        assert_eq!(
            job.artifact(DerivativeKind::Transcode).unwrap().status,
            ArtifactStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_transient_upload_errors_are_retried() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        backend.fail_next_puts(vec![
            StoreError::Transient("503 Slow Down".to_string()),
            StoreError::Transient("connection reset".to_string()),
        ]);
        let pipeline = setup(backend.clone());

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(64, 64), Vec::new()))
            .unwrap();
        handle.wait().await;

        let job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(backend.put_attempts(), 3);
        assert!(job.media.is_some());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_derivative_write_is_retried() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        backend.fail_key_times(
            "derivatives/thumbnail",
            StoreError::Transient("503 Slow Down".to_string()),
            1,
        );
        let pipeline = setup(backend.clone());

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(256, 192), vec![thumbnail()]))
            .unwrap();
        handle.wait().await;

        let job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(job.stage, JobStage::AllSucceeded);
        assert_eq!(
            job.artifact(DerivativeKind::Thumbnail).unwrap().status,
            ArtifactStatus::Succeeded
        );
        // Original once, thumbnail twice
        assert_eq!(backend.put_attempts(), 3);
        assert!(backend
            .object(&format!("{}/derivatives/thumbnail.jpg", handle.media_key))
            .is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_upload() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        backend.fail_next_puts(vec![StoreError::Transient("timeout".to_string()); 3]);
        let pipeline = setup(backend.clone());

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(64, 64), vec![thumbnail()]))
            .unwrap();
        handle.wait().await;

        let job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(job.stage, JobStage::UploadFailed);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.artifacts.is_empty());
        assert!(backend.keys().is_empty());
        assert_eq!(backend.put_attempts(), 3);
    }

    #[tokio::test]
    async fn test_permanent_upload_error_is_not_retried() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        backend.fail_next_puts(vec![StoreError::Permanent("AccessDenied".to_string())]);
        let pipeline = setup(backend.clone());

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(64, 64), vec![thumbnail()]))
            .unwrap();
        handle.wait().await;

        assert_eq!(
            pipeline.job(handle.job_id).unwrap().stage,
            JobStage::UploadFailed
        );
        assert_eq!(backend.put_attempts(), 1);
    }

    #[tokio::test]
    async fn test_large_original_uses_multipart() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let mut config = test_config();
        config.store.multipart_threshold_bytes = 8 * 1024;
        config.store.part_size_bytes = 4 * 1024;
        let pipeline = setup_with(backend.clone(), &config);

        let data = jpeg_bytes(640, 480);
        assert!(data.len() > 8 * 1024);

        let mut handle = pipeline
            .submit(jpeg_request(data.clone(), vec![thumbnail()]))
            .unwrap();
        handle.wait().await;

        let job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            backend
                .object(&format!("{}/original.jpg", handle.media_key))
                .unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_writes() {
        let backend = Arc::new(
            InMemoryBackend::new("test-bucket").with_latency(Duration::from_millis(200)),
        );
        let pipeline = setup(backend.clone());

        let handle = pipeline
            .submit(jpeg_request(jpeg_bytes(256, 256), vec![thumbnail(), preview(3)]))
            .unwrap();

        for _ in 0..400 {
            if pipeline.job(handle.job_id).unwrap().stage == JobStage::GeneratingDerivatives {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let job = pipeline.cancel(handle.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(pipeline.running_jobs(), 0);

        let keys_at_ack = backend.keys();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(backend.keys(), keys_at_ack);
        assert_eq!(
            keys_at_ack,
            vec![format!("{}/original.jpg", handle.media_key)]
        );

        assert!(job
            .artifacts
            .iter()
            .all(|a| a.status == ArtifactStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_not_running() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend);

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(32, 32), Vec::new()))
            .unwrap();
        handle.wait().await;

        assert!(matches!(
            pipeline.cancel(handle.job_id).await,
            Err(PipelineError::NotRunning(_))
        ));
        assert!(matches!(
            pipeline.cancel(Uuid::new_v4()).await,
            Err(PipelineError::Tracker(TrackerError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_resubmit_regenerates_failed_derivatives() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        backend.fail_key(
            "derivatives/animated_preview",
            StoreError::Permanent("quota exceeded".to_string()),
        );
        let pipeline = setup(backend.clone());

        let mut first = pipeline
            .submit(jpeg_request(jpeg_bytes(200, 100), vec![thumbnail(), preview(2)]))
            .unwrap();
        first.wait().await;
        assert_eq!(
            pipeline.job(first.job_id).unwrap().stage,
            JobStage::PartialFailure
        );

        // Still failing: a fresh attempt records its own failure
        let mut second = pipeline.resubmit(first.job_id).await.unwrap();
        second.wait().await;

        let retry = pipeline.job(second.job_id).unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.retry_of, Some(first.job_id));
        assert_eq!(retry.media_key, first.media_key);
        assert_eq!(retry.requested.len(), 1);
        assert_eq!(retry.requested[0].kind(), DerivativeKind::AnimatedPreview);
        assert_eq!(retry.stage, JobStage::AllFailed);

        // The original job is untouched by the retry
        assert_eq!(
            pipeline.job(first.job_id).unwrap().stage,
            JobStage::PartialFailure
        );
        assert_eq!(pipeline.tracker().jobs_for_media(&first.media_key).len(), 2);
    }

    #[tokio::test]
    async fn test_resubmit_rejects_completed_job() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend);

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(64, 64), vec![thumbnail()]))
            .unwrap();
        handle.wait().await;

        assert!(matches!(
            pipeline.resubmit(handle.job_id).await,
            Err(PipelineError::NotRetryable { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_media_removes_tree() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend.clone());

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(64, 64), vec![thumbnail()]))
            .unwrap();
        handle.wait().await;

        let deleted = pipeline.delete_media(&handle.media_key).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(backend.keys().is_empty());

        assert!(matches!(
            pipeline.delete_media(&handle.media_key).await,
            Err(PipelineError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_delete_parent_prefix_keeps_other_media() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend.clone());

        let mut handles = Vec::new();
        for folder in [None, Some("uploads"), Some("uploads")] {
            let mut handle = pipeline
                .submit(IngestRequest {
                    data: Bytes::from_static(b"%PDF-1.7"),
                    content_type: "application/pdf".to_string(),
                    folder: folder.map(str::to_string),
                    ..Default::default()
                })
                .unwrap();
            handle.wait().await;
            handles.push(handle);
        }
        let before = backend.keys();
        assert_eq!(before.len(), 3);

        for prefix in ["media", "media/uploads", "media/"] {
            assert!(matches!(
                pipeline.delete_media(prefix).await,
                Err(PipelineError::Store(StoreError::NotFound(_)))
            ));
        }
        assert_eq!(backend.keys(), before);

        assert_eq!(pipeline.delete_media(&handles[1].media_key).await.unwrap(), 1);
        assert_eq!(backend.keys().len(), 2);
        assert!(backend
            .object(&format!("{}/original.bin", handles[2].media_key))
            .is_some());
    }

    #[tokio::test]
    async fn test_delete_marks_jobs_and_blocks_resubmit() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        backend.fail_key(
            "derivatives/animated_preview",
            StoreError::Permanent("access denied".to_string()),
        );
        let pipeline = setup(backend);

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(64, 64), vec![thumbnail(), preview(2)]))
            .unwrap();
        handle.wait().await;
        assert_eq!(
            pipeline.job(handle.job_id).unwrap().stage,
            JobStage::PartialFailure
        );

        pipeline.delete_media(&handle.media_key).await.unwrap();

        let job = pipeline.job(handle.job_id).unwrap();
        assert!(job.deleted_at.is_some());
        assert_eq!(job.stage, JobStage::PartialFailure);
        assert!(matches!(
            pipeline.resubmit(handle.job_id).await,
            Err(PipelineError::NotRetryable { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_specs_follow_media_class() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend);

        let handle = pipeline
            .submit(IngestRequest {
                data: jpeg_bytes(64, 64),
                content_type: "image/jpeg".to_string(),
                ..Default::default()
            })
            .unwrap();
        let image_job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(image_job.requested.len(), 2);

        let handle = pipeline
            .submit(IngestRequest {
                data: Bytes::from_static(b"%PDF-1.7"),
                content_type: "application/pdf".to_string(),
                folder: Some("docs".to_string()),
                ..Default::default()
            })
            .unwrap();
        let file_job = pipeline.job(handle.job_id).unwrap();
        assert!(file_job.requested.is_empty());
        assert!(handle.media_key.starts_with("media/docs/"));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let backend = Arc::new(InMemoryBackend::new("test-bucket"));
        let pipeline = setup(backend);

        assert!(matches!(
            pipeline.submit(jpeg_request(Bytes::new(), vec![thumbnail()])),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(matches!(
            pipeline.submit(jpeg_request(jpeg_bytes(8, 8), vec![thumbnail(), thumbnail()])),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(matches!(
            pipeline.submit(jpeg_request(jpeg_bytes(8, 8), vec![preview(0)])),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(matches!(
            pipeline.submit(jpeg_request(jpeg_bytes(8, 8), vec![preview(u32::MAX)])),
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(pipeline.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_preview_frames_capped_by_config() {
        let mut config = test_config();
        config.derivatives.max_preview_frames = 4;
        let pipeline = setup_with(Arc::new(InMemoryBackend::new("test-bucket")), &config);

        assert!(matches!(
            pipeline.submit(jpeg_request(jpeg_bytes(8, 8), vec![preview(5)])),
            Err(PipelineError::InvalidRequest(_))
        ));

        let mut handle = pipeline
            .submit(jpeg_request(jpeg_bytes(8, 8), vec![preview(4)]))
            .unwrap();
        handle.wait().await;
        assert_eq!(
            pipeline.job(handle.job_id).unwrap().stage,
            JobStage::AllSucceeded
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_jobs() {
        let backend = Arc::new(
            InMemoryBackend::new("test-bucket").with_latency(Duration::from_millis(300)),
        );
        let pipeline = setup(backend);

        let handle = pipeline
            .submit(jpeg_request(jpeg_bytes(64, 64), vec![thumbnail()]))
            .unwrap();
        pipeline.shutdown().await;

        let job = pipeline.job(handle.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(matches!(
            pipeline.submit(jpeg_request(jpeg_bytes(8, 8), vec![thumbnail()])),
            Err(PipelineError::ShuttingDown)
        ));
    }
}
