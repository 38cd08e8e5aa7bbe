use super::{scaled_dimension, video, GeneratedAsset, GenerationError};
use crate::models::{MediaClass, ThumbnailFormat, ThumbnailSpec};
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

/// Produce a still thumbnail fitted inside the spec's bounding box.
///
/// Videos use their first decoded frame.
pub fn generate(
    input: &[u8],
    class: MediaClass,
    spec: &ThumbnailSpec,
    cancel: &CancellationToken,
) -> Result<GeneratedAsset, GenerationError> {
    let source = match class {
        MediaClass::Video => video::first_frame(input, cancel)?,
        MediaClass::Image | MediaClass::Other => decode_image(input)?,
    };

    if cancel.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }

    let (width, height) =
        scaled_dimension(source.width(), source.height(), spec.width, spec.height);
    let resized = resize(&source, width, height);

    let (bytes, extension, content_type) = match spec.format {
        ThumbnailFormat::Jpeg => (
            encode(&DynamicImage::ImageRgb8(resized.to_rgb8()), ImageFormat::Jpeg)?,
            "jpg",
            "image/jpeg",
        ),
        ThumbnailFormat::Png => (encode(&resized, ImageFormat::Png)?, "png", "image/png"),
    };

    Ok(GeneratedAsset {
        bytes,
        content_type,
        extension,
        width,
        height,
        frame_count: 1,
    })
}

/// Decode an encoded still image, rejecting anything that is not one.
pub(crate) fn decode_image(input: &[u8]) -> Result<DynamicImage, GenerationError> {
    image::load_from_memory(input).map_err(classify_image_error)
}

pub(crate) fn resize(source: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if source.width() == width && source.height() == height {
        source.clone()
    } else {
        source.resize_exact(width, height, FilterType::Triangle)
    }
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Bytes, GenerationError> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), format)
        .map_err(|e| GenerationError::Generation(format!("Failed to encode thumbnail: {}", e)))?;
    Ok(Bytes::from(buffer))
}

pub(crate) fn classify_image_error(err: ImageError) -> GenerationError {
    match err {
        ImageError::Unsupported(e) => GenerationError::UnsupportedFormat(e.to_string()),
        ImageError::Decoding(e) => GenerationError::UnsupportedFormat(e.to_string()),
        ImageError::Limits(e) => GenerationError::UnsupportedFormat(e.to_string()),
        // Truncated in-memory input surfaces as an IO error
        ImageError::IoError(e) => GenerationError::UnsupportedFormat(e.to_string()),
        other => GenerationError::Generation(other.to_string()),
    }
}
