//! Data model shared by the store, generator, pipeline and tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest width or height any derivative may ask for
pub const MAX_DIMENSION: u32 = 8192;

/// Hard ceiling on preview frames; the configured cap must not exceed it
pub const MAX_PREVIEW_FRAMES: u32 = 500;

/// Broad class of an upload, used to pick default derivatives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaClass {
    Image,
    Video,
    Other,
}

impl MediaClass {
    pub fn from_content_type(content_type: &str) -> Self {
        let main_type = content_type
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match main_type.as_str() {
            "image" => MediaClass::Image,
            "video" => MediaClass::Video,
            _ => MediaClass::Other,
        }
    }
}

/// Kind of derived asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeKind {
    Thumbnail,
    Transcode,
    AnimatedPreview,
}

impl DerivativeKind {
    pub const ALL: [DerivativeKind; 3] = [
        DerivativeKind::Thumbnail,
        DerivativeKind::Transcode,
        DerivativeKind::AnimatedPreview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivativeKind::Thumbnail => "thumbnail",
            DerivativeKind::Transcode => "transcode",
            DerivativeKind::AnimatedPreview => "animated_preview",
        }
    }
}

impl std::fmt::Display for DerivativeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Still image encodings for thumbnails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailFormat {
    #[default]
    Jpeg,
    Png,
}

/// Video containers for transcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoContainer {
    #[default]
    Mp4,
    Webm,
}

/// How often an animated preview plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPolicy {
    #[default]
    Infinite,
    Finite(u16),
}

/// Thumbnail parameters: bounding box and output encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailSpec {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: ThumbnailFormat,
}

impl Default for ThumbnailSpec {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            format: ThumbnailFormat::Jpeg,
        }
    }
}

/// Transcode parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSpec {
    pub max_width: u32,
    pub max_height: u32,
    pub bitrate_kbps: u32,
    #[serde(default)]
    pub container: VideoContainer,
}

impl Default for TranscodeSpec {
    fn default() -> Self {
        Self {
            max_width: 1280,
            max_height: 720,
            bitrate_kbps: 1500,
            container: VideoContainer::Mp4,
        }
    }
}

/// Animated preview parameters.
///
/// Frames are sampled at `start_frame`, `start_frame + frame_step`, ... until
/// `frame_count` frames are collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimatedPreviewSpec {
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    #[serde(default)]
    pub start_frame: u32,
    #[serde(default = "default_frame_step")]
    pub frame_step: u32,
    #[serde(default = "default_frame_delay_ms")]
    pub frame_delay_ms: u32,
    #[serde(default)]
    pub loop_policy: LoopPolicy,
}

fn default_frame_step() -> u32 {
    2
}

fn default_frame_delay_ms() -> u32 {
    500
}

impl Default for AnimatedPreviewSpec {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            frame_count: 2,
            start_frame: 0,
            frame_step: default_frame_step(),
            frame_delay_ms: default_frame_delay_ms(),
            loop_policy: LoopPolicy::Infinite,
        }
    }
}

/// One requested derivative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivativeSpec {
    Thumbnail(ThumbnailSpec),
    Transcode(TranscodeSpec),
    AnimatedPreview(AnimatedPreviewSpec),
}

impl DerivativeSpec {
    pub fn kind(&self) -> DerivativeKind {
        match self {
            DerivativeSpec::Thumbnail(_) => DerivativeKind::Thumbnail,
            DerivativeSpec::Transcode(_) => DerivativeKind::Transcode,
            DerivativeSpec::AnimatedPreview(_) => DerivativeKind::AnimatedPreview,
        }
    }

    /// File extension of the produced asset
    pub fn extension(&self) -> &'static str {
        match self {
            DerivativeSpec::Thumbnail(spec) => match spec.format {
                ThumbnailFormat::Jpeg => "jpg",
                ThumbnailFormat::Png => "png",
            },
            DerivativeSpec::Transcode(spec) => match spec.container {
                VideoContainer::Mp4 => "mp4",
                VideoContainer::Webm => "webm",
            },
            DerivativeSpec::AnimatedPreview(_) => "gif",
        }
    }

    /// Content type of the produced asset
    pub fn content_type(&self) -> &'static str {
        get_content_type(self.extension())
    }

    /// Reject specs that can never produce an asset, or whose output would
    /// exceed `MAX_DIMENSION` or `MAX_PREVIEW_FRAMES`.
    pub fn validate(&self) -> Result<(), String> {
        self.validate_with(MAX_PREVIEW_FRAMES)
    }

    /// Like `validate`, with previews capped at `max_preview_frames`.
    pub fn validate_with(&self, max_preview_frames: u32) -> Result<(), String> {
        match self {
            DerivativeSpec::Thumbnail(spec) => {
                check_dimensions("Thumbnail", spec.width, spec.height)?;
            }
            DerivativeSpec::Transcode(spec) => {
                check_dimensions("Transcode", spec.max_width, spec.max_height)?;
                if spec.bitrate_kbps == 0 {
                    return Err("Transcode bitrate must be greater than 0".to_string());
                }
            }
            DerivativeSpec::AnimatedPreview(spec) => {
                check_dimensions("Preview", spec.width, spec.height)?;
                if spec.frame_count == 0 {
                    return Err("Preview needs at least one frame".to_string());
                }
                let cap = max_preview_frames.min(MAX_PREVIEW_FRAMES);
                if spec.frame_count > cap {
                    return Err(format!("Preview frame count must be at most {}", cap));
                }
                if spec.frame_step == 0 {
                    return Err("Preview frame step must be greater than 0".to_string());
                }
            }
        }
        Ok(())
    }
}

fn check_dimensions(what: &str, width: u32, height: u32) -> Result<(), String> {
    if width == 0 || height == 0 {
        return Err(format!("{} dimensions must be greater than 0", what));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(format!(
            "{} dimensions must be at most {}",
            what, MAX_DIMENSION
        ));
    }
    Ok(())
}

/// Where an object lives in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLocation {
    pub bucket: String,
    pub key: String,
}

/// One uploaded original
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaObject {
    pub key: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    pub location: StoredLocation,
}

/// Generation status of a single artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl ArtifactStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ArtifactStatus::Pending)
    }
}

/// Classified reason an artifact failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactError {
    pub code: String,
    pub message: String,
}

/// One produced (or attempted) derivative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeArtifact {
    /// Key of the original this was derived from
    pub media_key: String,
    pub kind: DerivativeKind,
    pub spec: DerivativeSpec,
    pub attempt: u32,
    pub status: ArtifactStatus,
    pub location: Option<StoredLocation>,
    pub size_bytes: Option<u64>,
    pub error: Option<ArtifactError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Pipeline stage of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Accepted,
    UploadingOriginal,
    OriginalStored,
    GeneratingDerivatives,
    UploadFailed,
    PartialFailure,
    AllSucceeded,
    AllFailed,
    Cancelled,
}

impl JobStage {
    /// Position in the stage order; stages never move to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobStage::Accepted => 0,
            JobStage::UploadingOriginal => 1,
            JobStage::OriginalStored => 2,
            JobStage::GeneratingDerivatives => 3,
            JobStage::UploadFailed
            | JobStage::PartialFailure
            | JobStage::AllSucceeded
            | JobStage::AllFailed
            | JobStage::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobStage::Accepted
            | JobStage::UploadingOriginal
            | JobStage::OriginalStored
            | JobStage::GeneratingDerivatives => JobStatus::InProgress,
            JobStage::PartialFailure => JobStatus::PartialFailure,
            JobStage::AllSucceeded => JobStatus::Completed,
            JobStage::UploadFailed | JobStage::AllFailed => JobStatus::Failed,
            JobStage::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Overall job status reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    PartialFailure,
    Completed,
    Failed,
    Cancelled,
}

/// A stage change with the time it happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub stage: JobStage,
    pub at: DateTime<Utc>,
}

/// Snapshot of one ingestion job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: Uuid,
    pub media_key: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Set once the original is durably stored
    pub media: Option<MediaObject>,
    pub requested: Vec<DerivativeSpec>,
    pub artifacts: Vec<DerivativeArtifact>,
    pub stage: JobStage,
    pub status: JobStatus,
    pub history: Vec<StageTransition>,
    pub error: Option<String>,
    pub attempt: u32,
    /// The job this one retries, if any
    pub retry_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the media was deleted; stored locations are gone from then on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl IngestionJob {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn artifact(&self, kind: DerivativeKind) -> Option<&DerivativeArtifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    /// Stages this job passed through, in order
    pub fn stages(&self) -> Vec<JobStage> {
        self.history.iter().map(|t| t.stage).collect()
    }
}

/// Key of the stored original: `{media_key}/original.{ext}`
pub fn original_key(media_key: &str, extension: &str) -> String {
    format!("{}/original.{}", media_key, extension)
}

/// Key of a stored derivative: `{media_key}/derivatives/{kind}.{ext}`
pub fn derivative_key(media_key: &str, spec: &DerivativeSpec) -> String {
    format!(
        "{}/derivatives/{}.{}",
        media_key,
        spec.kind().as_str(),
        spec.extension()
    )
}

/// Whether `key` is one of the objects the layout places under `media_key`:
/// the original or a derivative, never a nested media key.
pub fn is_media_object_key(media_key: &str, key: &str) -> bool {
    let Some(rest) = key
        .strip_prefix(media_key)
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return false;
    };

    match rest.strip_prefix("derivatives/") {
        Some(name) => !name.is_empty() && !name.contains('/'),
        None => rest.starts_with("original.") && !rest.contains('/'),
    }
}

/// Whether `key` is the stored original of `media_key`
pub fn is_original_key(media_key: &str, key: &str) -> bool {
    key.strip_prefix(media_key)
        .and_then(|rest| rest.strip_prefix("/original."))
        .is_some_and(|extension| !extension.is_empty() && !extension.contains('/'))
}

/// Build a media key from an optional prefix, an optional folder and an id.
/// Every path component is sanitized.
pub fn media_key(prefix: &str, folder: Option<&str>, id: Uuid) -> String {
    let mut components: Vec<String> = Vec::new();

    for part in prefix
        .split('/')
        .chain(folder.unwrap_or_default().split('/'))
    {
        if !part.is_empty() {
            components.push(sanitize_path_component(part));
        }
    }
    components.push(id.to_string());

    components.join("/")
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Resolve the file extension of an upload.
///
/// A known content type wins; otherwise the filename extension is used.
pub fn file_extension(content_type: &str, filename: Option<&str>) -> String {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let from_type = match essence.as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/bmp" => Some("bmp"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        "video/x-matroska" => Some("mkv"),
        "video/x-msvideo" => Some("avi"),
        _ => None,
    };

    if let Some(ext) = from_type {
        return ext.to_string();
    }

    filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| sanitize_path_component(&ext.to_ascii_lowercase()))
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "bin".to_string())
}

/// Get content type for a file extension
pub fn get_content_type(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}
