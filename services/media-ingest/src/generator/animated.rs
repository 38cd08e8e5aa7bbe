use super::thumbnail::{classify_image_error, decode_image, resize};
use super::{scaled_dimension, select_frames, video, GeneratedAsset, GenerationError};
use crate::models::{AnimatedPreviewSpec, LoopPolicy, MediaClass};
use bytes::Bytes;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::{AnimationDecoder, Delay, DynamicImage, Frame, ImageFormat};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// GIF quantizer speed (1 = best quality, 30 = fastest)
const GIF_ENCODER_SPEED: i32 = 10;

/// Build a looping GIF preview from sampled frames of the input.
pub fn generate(
    input: &[u8],
    class: MediaClass,
    spec: &AnimatedPreviewSpec,
    cancel: &CancellationToken,
) -> Result<GeneratedAsset, GenerationError> {
    let count = spec.frame_count as usize;
    let start = spec.start_frame as usize;
    let step = spec.frame_step as usize;

    // Sampled frames, as indices into the decoded source
    let (source, selected) = match class {
        MediaClass::Video => {
            let frames =
                video::sample_frames(input, |len| select_frames(len, start, step, count), cancel)?;
            let selected: Vec<usize> = (0..frames.len()).collect();
            (frames, selected)
        }
        MediaClass::Image | MediaClass::Other => {
            let source = decode_sequence(input, cancel)?;
            let selected = select_frames(source.len(), start, step, count);
            (source, selected)
        }
    };

    let first = selected
        .first()
        .map(|&index| &source[index])
        .ok_or_else(|| GenerationError::Generation("Source has no frames".to_string()))?;
    let (width, height) =
        scaled_dimension(first.width(), first.height(), spec.width, spec.height);

    debug!(
        frames = selected.len(),
        width,
        height,
        "Encoding animated preview"
    );

    let frames = selected.iter().map(|&index| &source[index]);
    let bytes = encode_gif(frames, width, height, spec, cancel)?;

    Ok(GeneratedAsset {
        bytes,
        content_type: "image/gif",
        extension: "gif",
        width,
        height,
        frame_count: selected.len() as u32,
    })
}

/// Decode every frame of an image. Stills are a single frame.
fn decode_sequence(
    input: &[u8],
    cancel: &CancellationToken,
) -> Result<Vec<DynamicImage>, GenerationError> {
    if image::guess_format(input).ok() != Some(ImageFormat::Gif) {
        return Ok(vec![decode_image(input)?]);
    }

    let decoder = GifDecoder::new(Cursor::new(input)).map_err(classify_image_error)?;
    let mut frames = Vec::new();

    for frame in decoder.into_frames() {
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let frame = frame.map_err(classify_image_error)?;
        frames.push(DynamicImage::ImageRgba8(frame.into_buffer()));
    }

    Ok(frames)
}

fn encode_gif<'a>(
    frames: impl IntoIterator<Item = &'a DynamicImage>,
    width: u32,
    height: u32,
    spec: &AnimatedPreviewSpec,
    cancel: &CancellationToken,
) -> Result<Bytes, GenerationError> {
    let encode_err = |e: image::ImageError| {
        GenerationError::Generation(format!("Failed to encode preview: {}", e))
    };

    let mut buffer = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut buffer, GIF_ENCODER_SPEED);
        encoder
            .set_repeat(match spec.loop_policy {
                LoopPolicy::Infinite => Repeat::Infinite,
                LoopPolicy::Finite(times) => Repeat::Finite(times),
            })
            .map_err(encode_err)?;

        let delay = Delay::from_numer_denom_ms(spec.frame_delay_ms, 1);

        for frame in frames {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }

            let rgba = resize(frame, width, height).to_rgba8();
            encoder
                .encode_frame(Frame::from_parts(rgba, 0, 0, delay))
                .map_err(encode_err)?;
        }
    }

    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, _| Rgb([(x % 256) as u8, 40, 200]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn gif_bytes(frame_count: u8) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buffer);
            for i in 0..frame_count {
                let image = RgbaImage::from_pixel(16, 16, Rgba([i * 40, 0, 0, 255]));
                encoder
                    .encode_frame(Frame::from_parts(
                        image,
                        0,
                        0,
                        Delay::from_numer_denom_ms(100, 1),
                    ))
                    .unwrap();
            }
        }
        buffer
    }

    fn decoded_frame_count(gif: &[u8]) -> usize {
        GifDecoder::new(Cursor::new(gif))
            .unwrap()
            .into_frames()
            .count()
    }

    #[test]
    fn test_still_image_preview_has_requested_frames() {
        let spec = AnimatedPreviewSpec {
            width: 64,
            height: 64,
            frame_count: 3,
            ..Default::default()
        };

        let asset = generate(
            &png_bytes(200, 100),
            MediaClass::Image,
            &spec,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(asset.content_type, "image/gif");
        assert_eq!(asset.frame_count, 3);
        assert_eq!((asset.width, asset.height), (64, 32));
        assert_eq!(decoded_frame_count(&asset.bytes), 3);
    }

    #[test]
    fn test_animated_source_is_sampled() {
        let spec = AnimatedPreviewSpec {
            width: 8,
            height: 8,
            frame_count: 2,
            start_frame: 0,
            frame_step: 2,
            ..Default::default()
        };

        let asset = generate(
            &gif_bytes(5),
            MediaClass::Image,
            &spec,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(asset.frame_count, 2);
        assert_eq!((asset.width, asset.height), (8, 8));
        assert_eq!(decoded_frame_count(&asset.bytes), 2);
    }

    #[test]
    fn test_corrupt_input_is_unsupported() {
        let result = generate(
            b"definitely not an image",
            MediaClass::Image,
            &AnimatedPreviewSpec::default(),
            &CancellationToken::new(),
        );

        assert!(matches!(result, Err(GenerationError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_cancelled_between_frames() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = generate(
            &png_bytes(32, 32),
            MediaClass::Image,
            &AnimatedPreviewSpec::default(),
            &cancel,
        );

        assert_eq!(result.unwrap_err(), GenerationError::Cancelled);
    }

    #[cfg(not(feature = "video"))]
    #[test]
    fn test_video_without_feature_is_unsupported() {
        let result = generate(
            b"\x00\x00\x00\x18ftypmp42",
            MediaClass::Video,
            &AnimatedPreviewSpec::default(),
            &CancellationToken::new(),
        );

        assert!(matches!(result, Err(GenerationError::UnsupportedFormat(_))));
    }
}
