//! Configuration management for the media ingest service.
//!
//! Configuration is layered: optional config files first, then environment
//! variables prefixed with `MEDIA` (e.g. `MEDIA__STORE__BUCKET`).

use crate::models::{
    AnimatedPreviewSpec, DerivativeKind, DerivativeSpec, MediaClass, ThumbnailSpec, TranscodeSpec,
    MAX_PREVIEW_FRAMES,
};
use config::{ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Smallest part size S3 accepts for every part but the last.
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Main configuration for the media ingest service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Object store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Ingestion pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Default derivative policy
    #[serde(default)]
    pub derivatives: DerivativeDefaults,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Install the Prometheus exporter
    #[serde(default)]
    pub metrics_enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

/// Which object store implementation to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    S3,
    Memory,
}

/// Object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend implementation
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackendKind,
    /// Bucket holding originals and derivatives
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, DigitalOcean Spaces, etc.)
    pub endpoint_url: Option<String>,
    /// Static access key; falls back to the default credential chain when unset
    pub access_key_id: Option<String>,
    /// Static secret key
    pub secret_access_key: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Prefix prepended to every media key
    #[serde(default)]
    pub key_prefix: String,
    /// Canned ACL applied when a request does not name one
    pub default_acl: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Concurrent backend transfers (shared by all jobs)
    #[serde(default = "default_transfer_concurrency")]
    pub transfer_concurrency: usize,
    /// Multipart upload threshold in bytes (8MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Retry policy for individual multipart parts
    #[serde(default)]
    pub part_retry: RetryConfig,
}

/// Exponential backoff retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on a single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of derivative generations allowed to run at once
    #[serde(default = "default_generation_workers")]
    pub generation_workers: usize,
    /// Retry policy for transient store errors
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Default derivative parameters and per-class derivative sets
#[derive(Debug, Clone, Deserialize)]
pub struct DerivativeDefaults {
    #[serde(default)]
    pub thumbnail: ThumbnailSpec,
    #[serde(default)]
    pub transcode: TranscodeSpec,
    #[serde(default)]
    pub animated_preview: AnimatedPreviewSpec,
    /// Kinds generated for image uploads
    #[serde(default = "default_image_kinds")]
    pub image: Vec<DerivativeKind>,
    /// Kinds generated for video uploads
    #[serde(default = "default_video_kinds")]
    pub video: Vec<DerivativeKind>,
    /// Most frames a requested animated preview may have
    #[serde(default = "default_max_preview_frames")]
    pub max_preview_frames: u32,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted request body
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "media-ingest".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_store_backend() -> StoreBackendKind {
    StoreBackendKind::S3
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_transfer_concurrency() -> usize {
    16
}

fn default_multipart_threshold() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_part_size() -> usize {
    S3_MIN_PART_SIZE
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_generation_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

fn default_image_kinds() -> Vec<DerivativeKind> {
    vec![DerivativeKind::Thumbnail, DerivativeKind::AnimatedPreview]
}

fn default_video_kinds() -> Vec<DerivativeKind> {
    vec![
        DerivativeKind::Thumbnail,
        DerivativeKind::Transcode,
        DerivativeKind::AnimatedPreview,
    ]
}

fn default_max_preview_frames() -> u32 {
    50
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
            metrics_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            key_prefix: String::new(),
            default_acl: None,
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            transfer_concurrency: default_transfer_concurrency(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
            part_retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation_workers: default_generation_workers(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for DerivativeDefaults {
    fn default() -> Self {
        Self {
            thumbnail: ThumbnailSpec::default(),
            transcode: TranscodeSpec::default(),
            animated_preview: AnimatedPreviewSpec::default(),
            image: default_image_kinds(),
            video: default_video_kinds(),
            max_preview_frames: default_max_preview_frames(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from config files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/media-ingest.{toml,yaml,json}`
    /// 2. `/etc/media-ingest/media-ingest.{toml,yaml,json}`
    /// 3. Environment variables (e.g. `MEDIA__STORE__BUCKET` -> `store.bucket`)
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(File::with_name("config/media-ingest").required(false))
            .add_source(File::with_name("/etc/media-ingest/media-ingest").required(false))
            .add_source(
                Environment::with_prefix("MEDIA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let store = &self.store;

        if store.backend == StoreBackendKind::S3 {
            if store.bucket.is_empty() {
                return Err(ConfigValidationError::MissingField("store.bucket".to_string()));
            }
            if store.part_size_bytes < S3_MIN_PART_SIZE {
                return Err(ConfigValidationError::InvalidValue {
                    field: "store.part_size_bytes".to_string(),
                    message: format!("S3 parts must be at least {} bytes", S3_MIN_PART_SIZE),
                });
            }
            if store.access_key_id.is_some() != store.secret_access_key.is_some() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "store.access_key_id/secret_access_key".to_string(),
                    message: "Both keys must be set together".to_string(),
                });
            }
        }

        if store.part_size_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "store.part_size_bytes".to_string(),
                message: "Part size must be greater than 0".to_string(),
            });
        }

        if store.multipart_threshold_bytes < store.part_size_bytes {
            return Err(ConfigValidationError::InvalidValue {
                field: "store.multipart_threshold_bytes".to_string(),
                message: "Threshold must not be smaller than the part size".to_string(),
            });
        }

        if store.transfer_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "store.transfer_concurrency".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.pipeline.generation_workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.generation_workers".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (field, retry) in [
            ("pipeline.retry", &self.pipeline.retry),
            ("store.part_retry", &store.part_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("{}.max_attempts", field),
                    message: "At least one attempt is required".to_string(),
                });
            }
            if retry.multiplier < 1.0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("{}.multiplier", field),
                    message: "Multiplier must be at least 1.0".to_string(),
                });
            }
        }

        let max_frames = self.derivatives.max_preview_frames;
        if max_frames == 0 || max_frames > MAX_PREVIEW_FRAMES {
            return Err(ConfigValidationError::InvalidValue {
                field: "derivatives.max_preview_frames".to_string(),
                message: format!("Must be between 1 and {}", MAX_PREVIEW_FRAMES),
            });
        }

        for kind in DerivativeKind::ALL {
            self.derivatives
                .spec_for(kind)
                .validate_with(max_frames)
                .map_err(|message| ConfigValidationError::InvalidValue {
                    field: format!("derivatives.{}", kind.as_str()),
                    message,
                })?;
        }

        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.store.presigned_url_expiry_secs)
    }
}

impl RetryConfig {
    /// Get initial retry delay as Duration.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Get maximum retry delay as Duration.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl DerivativeDefaults {
    /// The default spec for one derivative kind.
    pub fn spec_for(&self, kind: DerivativeKind) -> DerivativeSpec {
        match kind {
            DerivativeKind::Thumbnail => DerivativeSpec::Thumbnail(self.thumbnail.clone()),
            DerivativeKind::Transcode => DerivativeSpec::Transcode(self.transcode.clone()),
            DerivativeKind::AnimatedPreview => {
                DerivativeSpec::AnimatedPreview(self.animated_preview.clone())
            }
        }
    }

    /// The default spec set for an upload of the given media class.
    pub fn specs_for(&self, class: MediaClass) -> Vec<DerivativeSpec> {
        let kinds: &[DerivativeKind] = match class {
            MediaClass::Image => &self.image,
            MediaClass::Video => &self.video,
            MediaClass::Other => &[],
        };

        let mut specs: Vec<DerivativeSpec> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !specs.iter().any(|s| s.kind() == *kind) {
                specs.push(self.spec_for(*kind));
            }
        }
        specs
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
