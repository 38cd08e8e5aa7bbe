//! Derivative generation.
//!
//! Every derivative kind has its own transform; each is a pure function of
//! the input bytes and the spec. Long-running transforms check the
//! cancellation token between frames.

pub mod animated;
pub mod thumbnail;
pub mod video;

use crate::models::{DerivativeSpec, MediaClass};
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors that can occur while generating a derivative.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            GenerationError::Generation(_) => "GENERATION_ERROR",
            GenerationError::Cancelled => "CANCELLED",
        }
    }
}

/// Output of one generation
#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    pub bytes: Bytes,
    pub content_type: &'static str,
    pub extension: &'static str,
    pub width: u32,
    pub height: u32,
    /// 1 for stills, 0 when not counted
    pub frame_count: u32,
}

/// Stateless generator dispatching on the derivative kind
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivativeGenerator;

impl DerivativeGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Produce one derivative from `input`.
    ///
    /// Blocking and CPU-bound; run it on a blocking thread.
    pub fn generate(
        &self,
        input: &[u8],
        content_type: &str,
        spec: &DerivativeSpec,
        cancel: &CancellationToken,
    ) -> Result<GeneratedAsset, GenerationError> {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        spec.validate().map_err(GenerationError::Generation)?;

        let class = MediaClass::from_content_type(content_type);
        debug!(
            kind = %spec.kind(),
            content_type = %content_type,
            size_bytes = input.len(),
            "Generating derivative"
        );

        match spec {
            DerivativeSpec::Thumbnail(thumb) => thumbnail::generate(input, class, thumb, cancel),
            DerivativeSpec::Transcode(transcode) => match class {
                MediaClass::Video => video::transcode(input, transcode, cancel),
                _ => Err(GenerationError::UnsupportedFormat(format!(
                    "Cannot transcode {} input",
                    content_type
                ))),
            },
            DerivativeSpec::AnimatedPreview(preview) => {
                animated::generate(input, class, preview, cancel)
            }
        }
    }
}

/// Fit `(width, height)` inside a bounding box, preserving aspect ratio.
///
/// Only ever shrinks: width is fitted first, then height. Never returns a
/// zero dimension.
pub fn scaled_dimension(width: u32, height: u32, bound_width: u32, bound_height: u32) -> (u32, u32) {
    let (width, height) = (u64::from(width.max(1)), u64::from(height.max(1)));
    let (bound_width, bound_height) = (u64::from(bound_width), u64::from(bound_height));

    let mut new_width = width;
    let mut new_height = height;

    if width > bound_width {
        new_width = bound_width;
        new_height = (new_width * height) / width;
    }

    if new_height > bound_height {
        new_height = bound_height;
        new_width = (new_height * width) / height;
    }

    (new_width.max(1) as u32, new_height.max(1) as u32)
}

/// Pick source frame indices for a preview of `count` frames.
///
/// Frames are taken at `start`, `start + step`, ... When that window runs past
/// the end of the source, sampling restarts at one fifth of the source and the
/// frames are spread evenly over the rest. Short sources are cycled.
pub fn select_frames(source_len: usize, start: usize, step: usize, count: usize) -> Vec<usize> {
    if source_len == 0 || count == 0 {
        return Vec::new();
    }

    let step = step.max(1);
    let last = start.saturating_add(step.saturating_mul(count - 1));

    if last < source_len {
        return (0..count).map(|i| start + i * step).collect();
    }

    let start = source_len / 5;
    let remaining = source_len - start;
    let spread = (remaining / count).max(1);

    (0..count)
        .map(|i| start + (i * spread) % remaining)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnimatedPreviewSpec, ThumbnailSpec, TranscodeSpec};

    #[test]
    fn test_scaled_dimension_fits_width_first() {
        assert_eq!(scaled_dimension(400, 200, 128, 128), (128, 64));
        assert_eq!(scaled_dimension(200, 400, 128, 128), (64, 128));
        assert_eq!(scaled_dimension(1920, 1080, 1280, 720), (1280, 720));
    }

    #[test]
    fn test_scaled_dimension_never_upscales() {
        assert_eq!(scaled_dimension(64, 32, 128, 128), (64, 32));
        assert_eq!(scaled_dimension(128, 128, 128, 128), (128, 128));
    }

    #[test]
    fn test_scaled_dimension_never_zero() {
        assert_eq!(scaled_dimension(10_000, 1, 100, 100), (100, 1));
        assert_eq!(scaled_dimension(1, 10_000, 100, 100), (1, 100));
    }

    #[test]
    fn test_select_frames_in_window() {
        assert_eq!(select_frames(100, 0, 2, 3), vec![0, 2, 4]);
        assert_eq!(select_frames(100, 10, 5, 2), vec![10, 15]);
    }

    #[test]
    fn test_select_frames_falls_back_when_window_overruns() {
        // 10 frames, window 8..=16 overruns: restart at 2 and spread over 8
        assert_eq!(select_frames(10, 8, 4, 3), vec![2, 4, 6]);
    }

    #[test]
    fn test_select_frames_cycles_short_sources() {
        assert_eq!(select_frames(1, 0, 2, 3), vec![0, 0, 0]);
        assert_eq!(select_frames(2, 0, 2, 3), vec![0, 1, 0]);
    }

    #[test]
    fn test_select_frames_empty_source() {
        assert!(select_frames(0, 0, 2, 3).is_empty());
    }

    #[test]
    fn test_transcode_of_image_is_unsupported() {
        let generator = DerivativeGenerator::new();
        let result = generator.generate(
            b"not really a jpeg",
            "image/jpeg",
            &DerivativeSpec::Transcode(TranscodeSpec::default()),
            &CancellationToken::new(),
        );

        assert!(matches!(result, Err(GenerationError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_oversized_preview_is_rejected_before_decoding() {
        let generator = DerivativeGenerator::new();
        let spec = DerivativeSpec::AnimatedPreview(AnimatedPreviewSpec {
            frame_count: u32::MAX,
            ..AnimatedPreviewSpec::default()
        });

        let result = generator.generate(
            b"not really a gif",
            "image/gif",
            &spec,
            &CancellationToken::new(),
        );

        assert!(matches!(result, Err(GenerationError::Generation(_))));
    }

    #[test]
    fn test_cancelled_before_start() {
        let generator = DerivativeGenerator::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = generator.generate(
            b"",
            "image/png",
            &DerivativeSpec::Thumbnail(ThumbnailSpec::default()),
            &cancel,
        );

        assert_eq!(result.unwrap_err(), GenerationError::Cancelled);
    }
}
