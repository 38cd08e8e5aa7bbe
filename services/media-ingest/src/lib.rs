//! Media Ingest Service
//!
//! Accepts uploaded media, stores the original in object storage and derives
//! thumbnails, transcodes and animated previews from it in the background.
//!
//! ## Features
//!
//! - **Asynchronous Ingestion**: uploads are acknowledged with a job id as soon
//!   as they are accepted; progress is polled per job
//! - **Reliable Storage**: S3 (or in-memory) backend, multipart uploads for large
//!   originals, exponential-backoff retries for transient store errors
//! - **Derivative Generation**: image thumbnails and GIF previews with the
//!   `image` crate; video sampling and transcoding with GStreamer (`video`
//!   feature)
//! - **Per-Derivative Status**: partial failures are reported per artifact and
//!   can be retried from the stored original
//!
//! ## Architecture
//!
//! ```text
//!  HTTP API                 Ingestion Pipeline                Object Store
//! ┌──────────────┐  submit  ┌──────────────────┐   put       ┌──────────────┐
//! │ POST /media  │─────────▶│ store original   │────────────▶│ {key}/       │
//! │ GET /media/… │          │ (retry/backoff)  │             │   original.* │
//! │ DELETE …     │          └──────────────────┘             │   derivatives│
//! └──────────────┘                   │ fan out               └──────────────┘
//!        │                           ▼                              ▲
//!        │                  ┌──────────────────┐   put              │
//!        │                  │ Derivative       │────────────────────┘
//!        │                  │ Generator (pool) │
//!        │                  └──────────────────┘
//!        │                           │ events
//!        ▼                           ▼
//! ┌──────────────────────────────────────────┐
//! │ Job Tracker (per-job snapshots)          │
//! └──────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod generator;
pub mod models;
pub mod object_store;
pub mod pipeline;
pub mod tracker;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use generator::{DerivativeGenerator, GeneratedAsset, GenerationError};
pub use models::{
    DerivativeArtifact, DerivativeKind, DerivativeSpec, IngestionJob, JobStage, JobStatus,
    MediaObject,
};
pub use object_store::{InMemoryBackend, ObjectBackend, S3Backend, StoreClient, StoreError};
pub use pipeline::{IngestPipeline, IngestRequest, JobHandle, PipelineError};
pub use tracker::{JobEvent, JobTracker, TrackerError};
