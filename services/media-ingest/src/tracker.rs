//! Job tracking.
//!
//! Each job record sits behind its own mutex and every event is applied
//! wholly under that lock, so readers never see a job half-updated. Events
//! are idempotent: stages only move forward and terminal artifacts are never
//! touched again, so replaying an event has no further effect.

use crate::models::{
    ArtifactError, ArtifactStatus, DerivativeArtifact, DerivativeKind, DerivativeSpec,
    IngestionJob, JobStage, MediaObject, StageTransition, StoredLocation,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Tracker errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),
}

/// A job about to be accepted
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub media_key: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub requested: Vec<DerivativeSpec>,
    pub attempt: u32,
    pub retry_of: Option<Uuid>,
}

/// Progress events emitted by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    UploadStarted,
    OriginalStored {
        media: MediaObject,
    },
    UploadFailed {
        error: String,
    },
    /// Creates one pending artifact per requested spec
    GenerationStarted,
    DerivativeSucceeded {
        kind: DerivativeKind,
        location: StoredLocation,
        size_bytes: u64,
    },
    DerivativeFailed {
        kind: DerivativeKind,
        error: ArtifactError,
    },
    Cancelled,
    /// The original and derivatives were removed from the store
    MediaDeleted,
}

impl JobEvent {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::UploadStarted => "upload_started",
            JobEvent::OriginalStored { .. } => "original_stored",
            JobEvent::UploadFailed { .. } => "upload_failed",
            JobEvent::GenerationStarted => "generation_started",
            JobEvent::DerivativeSucceeded { .. } => "derivative_succeeded",
            JobEvent::DerivativeFailed { .. } => "derivative_failed",
            JobEvent::Cancelled => "cancelled",
            JobEvent::MediaDeleted => "media_deleted",
        }
    }
}

/// In-memory job tracker
#[derive(Default)]
pub struct JobTracker {
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<IngestionJob>>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a job. Registering an existing job id returns it unchanged.
    pub fn register(&self, new_job: NewJob) -> IngestionJob {
        let mut jobs = self.jobs.write();

        if let Some(existing) = jobs.get(&new_job.job_id) {
            return existing.lock().clone();
        }

        let now = Utc::now();
        let job = IngestionJob {
            job_id: new_job.job_id,
            media_key: new_job.media_key,
            content_type: new_job.content_type,
            size_bytes: new_job.size_bytes,
            media: None,
            requested: new_job.requested,
            artifacts: Vec::new(),
            stage: JobStage::Accepted,
            status: JobStage::Accepted.status(),
            history: vec![StageTransition {
                stage: JobStage::Accepted,
                at: now,
            }],
            error: None,
            attempt: new_job.attempt,
            retry_of: new_job.retry_of,
            created_at: now,
            completed_at: None,
            deleted_at: None,
        };

        metrics::counter!("media.jobs.accepted").increment(1);
        jobs.insert(job.job_id, Arc::new(Mutex::new(job.clone())));
        job
    }

    /// Apply an event and return the resulting snapshot.
    pub fn record(&self, job_id: Uuid, event: JobEvent) -> Result<IngestionJob, TrackerError> {
        let entry = self.entry(job_id)?;
        let mut job = entry.lock();

        let name = event.name();
        let changed = apply(&mut job, event, Utc::now());

        if changed {
            debug!(job_id = %job_id, event = name, stage = ?job.stage, "Job event applied");
        } else {
            debug!(job_id = %job_id, event = name, stage = ?job.stage, "Job event ignored");
        }

        Ok(job.clone())
    }

    /// Consistent snapshot of one job
    pub fn get(&self, job_id: Uuid) -> Result<IngestionJob, TrackerError> {
        Ok(self.entry(job_id)?.lock().clone())
    }

    /// Every job for a media key, oldest first
    pub fn jobs_for_media(&self, media_key: &str) -> Vec<IngestionJob> {
        let entries: Vec<_> = self.jobs.read().values().cloned().collect();

        let mut jobs: Vec<IngestionJob> = entries
            .iter()
            .map(|entry| entry.lock().clone())
            .filter(|job| job.media_key == media_key)
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    fn entry(&self, job_id: Uuid) -> Result<Arc<Mutex<IngestionJob>>, TrackerError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(TrackerError::NotFound(job_id))
    }
}

/// Apply one event to a job. Returns whether anything changed.
fn apply(job: &mut IngestionJob, event: JobEvent, at: DateTime<Utc>) -> bool {
    match event {
        JobEvent::UploadStarted => advance(job, JobStage::UploadingOriginal, at),

        JobEvent::OriginalStored { media } => {
            let changed = advance(job, JobStage::OriginalStored, at);
            if changed {
                job.media = Some(media);
            }
            changed
        }

        JobEvent::UploadFailed { error } => {
            let changed = advance(job, JobStage::UploadFailed, at);
            if changed {
                job.error = Some(error);
            }
            changed
        }

        JobEvent::GenerationStarted => {
            if !advance(job, JobStage::GeneratingDerivatives, at) {
                return false;
            }

            job.artifacts = job
                .requested
                .iter()
                .map(|spec| DerivativeArtifact {
                    media_key: job.media_key.clone(),
                    kind: spec.kind(),
                    spec: spec.clone(),
                    attempt: job.attempt,
                    status: ArtifactStatus::Pending,
                    location: None,
                    size_bytes: None,
                    error: None,
                    started_at: at,
                    finished_at: None,
                })
                .collect();

            aggregate(job, at);
            true
        }

        JobEvent::DerivativeSucceeded {
            kind,
            location,
            size_bytes,
        } => {
            let Some(artifact) = pending_artifact(job, kind) else {
                return false;
            };
            artifact.status = ArtifactStatus::Succeeded;
            artifact.location = Some(location);
            artifact.size_bytes = Some(size_bytes);
            artifact.finished_at = Some(at);

            aggregate(job, at);
            true
        }

        JobEvent::DerivativeFailed { kind, error } => {
            let Some(artifact) = pending_artifact(job, kind) else {
                return false;
            };
            artifact.status = ArtifactStatus::Failed;
            artifact.error = Some(error);
            artifact.finished_at = Some(at);

            aggregate(job, at);
            true
        }

        JobEvent::Cancelled => {
            if job.stage.is_terminal() {
                return false;
            }

            for artifact in job
                .artifacts
                .iter_mut()
                .filter(|a| a.status == ArtifactStatus::Pending)
            {
                artifact.status = ArtifactStatus::Cancelled;
                artifact.finished_at = Some(at);
            }

            advance(job, JobStage::Cancelled, at)
        }

        // Stage is left alone; deletion does not rewrite how the job ended
        JobEvent::MediaDeleted => {
            if job.deleted_at.is_some() {
                return false;
            }
            job.deleted_at = Some(at);
            true
        }
    }
}

/// Move the job forward to `stage`; never backwards, never out of a
/// terminal stage.
fn advance(job: &mut IngestionJob, stage: JobStage, at: DateTime<Utc>) -> bool {
    if job.stage.is_terminal() || stage.rank() <= job.stage.rank() {
        return false;
    }

    job.stage = stage;
    job.status = stage.status();
    job.history.push(StageTransition { stage, at });

    if stage.is_terminal() {
        job.completed_at = Some(at);

        let status = match stage {
            JobStage::AllSucceeded => "completed",
            JobStage::PartialFailure => "partial_failure",
            JobStage::Cancelled => "cancelled",
            _ => "failed",
        };
        metrics::counter!("media.jobs.finished", "status" => status).increment(1);
        info!(job_id = %job.job_id, media_key = %job.media_key, stage = ?stage, "Job finished");
    }

    true
}

fn pending_artifact(job: &mut IngestionJob, kind: DerivativeKind) -> Option<&mut DerivativeArtifact> {
    if job.stage != JobStage::GeneratingDerivatives {
        return None;
    }
    job.artifacts
        .iter_mut()
        .find(|a| a.kind == kind && a.status == ArtifactStatus::Pending)
}

/// Derive the terminal stage once every artifact is terminal.
fn aggregate(job: &mut IngestionJob, at: DateTime<Utc>) {
    if job.stage != JobStage::GeneratingDerivatives {
        return;
    }
    if job.artifacts.iter().any(|a| !a.status.is_terminal()) {
        return;
    }

    let succeeded = job
        .artifacts
        .iter()
        .filter(|a| a.status == ArtifactStatus::Succeeded)
        .count();
    let failed = job.artifacts.len() - succeeded;

    let stage = if failed == 0 {
        JobStage::AllSucceeded
    } else if succeeded == 0 {
        JobStage::AllFailed
    } else {
        JobStage::PartialFailure
    };

    if stage == JobStage::AllFailed {
        job.error = Some("All derivatives failed".to_string());
    }

    advance(job, stage, at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnimatedPreviewSpec, JobStatus, ThumbnailSpec};

    fn specs() -> Vec<DerivativeSpec> {
        vec![
            DerivativeSpec::Thumbnail(ThumbnailSpec::default()),
            DerivativeSpec::AnimatedPreview(AnimatedPreviewSpec::default()),
        ]
    }

    fn new_job(requested: Vec<DerivativeSpec>) -> NewJob {
        NewJob {
            job_id: Uuid::new_v4(),
            media_key: "media/abc".to_string(),
            content_type: "image/jpeg".to_string(),
            size_bytes: 1024,
            requested,
            attempt: 1,
            retry_of: None,
        }
    }

    fn media() -> MediaObject {
        MediaObject {
            key: "media/abc/original.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            size_bytes: 1024,
            uploaded_at: Utc::now(),
            location: location("media/abc/original.jpg"),
        }
    }

    fn location(key: &str) -> StoredLocation {
        StoredLocation {
            bucket: "bucket".to_string(),
            key: key.to_string(),
        }
    }

    fn failure() -> ArtifactError {
        ArtifactError {
            code: "UNSUPPORTED_FORMAT".to_string(),
            message: "bad input".to_string(),
        }
    }

    fn generating(tracker: &JobTracker, requested: Vec<DerivativeSpec>) -> Uuid {
        let job_id = tracker.register(new_job(requested)).job_id;
        tracker.record(job_id, JobEvent::UploadStarted).unwrap();
        tracker
            .record(job_id, JobEvent::OriginalStored { media: media() })
            .unwrap();
        tracker.record(job_id, JobEvent::GenerationStarted).unwrap();
        job_id
    }

    fn succeeded(kind: DerivativeKind) -> JobEvent {
        JobEvent::DerivativeSucceeded {
            kind,
            location: location("media/abc/derivatives/x"),
            size_bytes: 10,
        }
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let tracker = JobTracker::new();
        let job_id = Uuid::new_v4();

        assert_eq!(tracker.get(job_id), Err(TrackerError::NotFound(job_id)));
        assert_eq!(
            tracker.record(job_id, JobEvent::UploadStarted),
            Err(TrackerError::NotFound(job_id))
        );
    }

    #[test]
    fn test_all_succeeded() {
        let tracker = JobTracker::new();
        let job_id = generating(&tracker, specs());

        tracker.record(job_id, succeeded(DerivativeKind::Thumbnail)).unwrap();
        let job = tracker
            .record(job_id, succeeded(DerivativeKind::AnimatedPreview))
            .unwrap();

        assert_eq!(job.stage, JobStage::AllSucceeded);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(
            job.stages(),
            vec![
                JobStage::Accepted,
                JobStage::UploadingOriginal,
                JobStage::OriginalStored,
                JobStage::GeneratingDerivatives,
                JobStage::AllSucceeded,
            ]
        );
    }

    #[test]
    fn test_partial_failure() {
        let tracker = JobTracker::new();
        let job_id = generating(&tracker, specs());

        tracker.record(job_id, succeeded(DerivativeKind::Thumbnail)).unwrap();
        let job = tracker
            .record(
                job_id,
                JobEvent::DerivativeFailed {
                    kind: DerivativeKind::AnimatedPreview,
                    error: failure(),
                },
            )
            .unwrap();

        assert_eq!(job.stage, JobStage::PartialFailure);
        assert_eq!(job.status, JobStatus::PartialFailure);
        assert_eq!(
            job.artifact(DerivativeKind::AnimatedPreview).unwrap().status,
            ArtifactStatus::Failed
        );
    }

    #[test]
    fn test_all_failed() {
        let tracker = JobTracker::new();
        let job_id = generating(
            &tracker,
            vec![DerivativeSpec::Thumbnail(ThumbnailSpec::default())],
        );

        let job = tracker
            .record(
                job_id,
                JobEvent::DerivativeFailed {
                    kind: DerivativeKind::Thumbnail,
                    error: failure(),
                },
            )
            .unwrap();

        assert_eq!(job.stage, JobStage::AllFailed);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_upload_failed_is_terminal() {
        let tracker = JobTracker::new();
        let job_id = tracker.register(new_job(specs())).job_id;
        tracker.record(job_id, JobEvent::UploadStarted).unwrap();

        let job = tracker
            .record(
                job_id,
                JobEvent::UploadFailed {
                    error: "denied".to_string(),
                },
            )
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        // Nothing moves a terminal job
        let after = tracker
            .record(job_id, JobEvent::OriginalStored { media: media() })
            .unwrap();
        assert_eq!(after, job);
    }

    #[test]
    fn test_no_specs_completes_immediately() {
        let tracker = JobTracker::new();
        let job_id = generating(&tracker, Vec::new());

        let job = tracker.get(job_id).unwrap();
        assert_eq!(job.stage, JobStage::AllSucceeded);
        assert!(job.artifacts.is_empty());
    }

    #[test]
    fn test_replayed_events_are_noops() {
        let tracker = JobTracker::new();
        let job_id = generating(&tracker, specs());

        let once = tracker.record(job_id, succeeded(DerivativeKind::Thumbnail)).unwrap();
        let twice = tracker.record(job_id, succeeded(DerivativeKind::Thumbnail)).unwrap();
        assert_eq!(once, twice);

        let replayed_start = tracker.record(job_id, JobEvent::GenerationStarted).unwrap();
        assert_eq!(once, replayed_start);

        // A late failure for an already-succeeded artifact changes nothing
        let late = tracker
            .record(
                job_id,
                JobEvent::DerivativeFailed {
                    kind: DerivativeKind::Thumbnail,
                    error: failure(),
                },
            )
            .unwrap();
        assert_eq!(once, late);
    }

    #[test]
    fn test_replayed_terminal_event_is_noop() {
        let tracker = JobTracker::new();
        let job_id = generating(
            &tracker,
            vec![DerivativeSpec::Thumbnail(ThumbnailSpec::default())],
        );

        let once = tracker.record(job_id, succeeded(DerivativeKind::Thumbnail)).unwrap();
        let twice = tracker.record(job_id, succeeded(DerivativeKind::Thumbnail)).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.history.len(), 5);
    }

    #[test]
    fn test_unknown_artifact_is_ignored() {
        let tracker = JobTracker::new();
        let job_id = generating(
            &tracker,
            vec![DerivativeSpec::Thumbnail(ThumbnailSpec::default())],
        );
        let before = tracker.get(job_id).unwrap();

        let after = tracker.record(job_id, succeeded(DerivativeKind::Transcode)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_cancel_marks_pending_artifacts() {
        let tracker = JobTracker::new();
        let job_id = generating(&tracker, specs());
        tracker.record(job_id, succeeded(DerivativeKind::Thumbnail)).unwrap();

        let job = tracker.record(job_id, JobEvent::Cancelled).unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(
            job.artifact(DerivativeKind::Thumbnail).unwrap().status,
            ArtifactStatus::Succeeded
        );
        assert_eq!(
            job.artifact(DerivativeKind::AnimatedPreview).unwrap().status,
            ArtifactStatus::Cancelled
        );

        // Results arriving after cancellation are dropped
        let late = tracker
            .record(job_id, succeeded(DerivativeKind::AnimatedPreview))
            .unwrap();
        assert_eq!(late, job);
    }

    #[test]
    fn test_media_deleted_marks_finished_job_once() {
        let tracker = JobTracker::new();
        let job_id = generating(&tracker, specs());
        tracker.record(job_id, succeeded(DerivativeKind::Thumbnail)).unwrap();
        tracker
            .record(job_id, succeeded(DerivativeKind::AnimatedPreview))
            .unwrap();

        let deleted = tracker.record(job_id, JobEvent::MediaDeleted).unwrap();
        assert_eq!(deleted.stage, JobStage::AllSucceeded);
        assert!(deleted.deleted_at.is_some());

        let replayed = tracker.record(job_id, JobEvent::MediaDeleted).unwrap();
        assert_eq!(replayed, deleted);
    }

    #[test]
    fn test_register_is_idempotent() {
        let tracker = JobTracker::new();
        let new_job = new_job(specs());

        let first = tracker.register(new_job.clone());
        tracker.record(first.job_id, JobEvent::UploadStarted).unwrap();
        let again = tracker.register(new_job);

        assert_eq!(again.stage, JobStage::UploadingOriginal);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_jobs_for_media() {
        let tracker = JobTracker::new();
        let first = tracker.register(new_job(specs()));
        let mut other = new_job(specs());
        other.media_key = "media/other".to_string();
        tracker.register(other);

        let jobs = tracker.jobs_for_media("media/abc");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, first.job_id);
    }

    #[test]
    fn test_concurrent_events_are_atomic() {
        let tracker = Arc::new(JobTracker::new());
        let job_id = generating(&tracker, specs());

        let handles: Vec<_> = [DerivativeKind::Thumbnail, DerivativeKind::AnimatedPreview]
            .into_iter()
            .map(|kind| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.record(job_id, succeeded(kind)).unwrap();
                        let snapshot = tracker.get(job_id).unwrap();
                        let done = snapshot
                            .artifacts
                            .iter()
                            .all(|a| a.status == ArtifactStatus::Succeeded);
                        // Stage and artifacts always agree
                        assert_eq!(done, snapshot.stage == JobStage::AllSucceeded);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.get(job_id).unwrap().stage, JobStage::AllSucceeded);
    }
}
