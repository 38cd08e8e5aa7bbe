//! Video decoding and transcoding.
//!
//! Backed by GStreamer when the `video` feature is enabled. Without it every
//! video input fails with [`GenerationError::UnsupportedFormat`].

use super::{GeneratedAsset, GenerationError};
use crate::models::TranscodeSpec;
use image::DynamicImage;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "video")]
pub use self::gst_video_impl::{first_frame, sample_frames, transcode};

#[cfg(not(feature = "video"))]
const VIDEO_DISABLED: &str = "Video support is not enabled in this build";

/// First decoded frame of a video
#[cfg(not(feature = "video"))]
pub fn first_frame(
    _input: &[u8],
    _cancel: &CancellationToken,
) -> Result<DynamicImage, GenerationError> {
    Err(GenerationError::UnsupportedFormat(VIDEO_DISABLED.to_string()))
}

/// Decode the frames chosen by `select`, which receives the source length
#[cfg(not(feature = "video"))]
pub fn sample_frames(
    _input: &[u8],
    _select: impl Fn(usize) -> Vec<usize>,
    _cancel: &CancellationToken,
) -> Result<Vec<DynamicImage>, GenerationError> {
    Err(GenerationError::UnsupportedFormat(VIDEO_DISABLED.to_string()))
}

/// Re-encode a video to the spec's bounding box, bitrate and container
#[cfg(not(feature = "video"))]
pub fn transcode(
    _input: &[u8],
    _spec: &TranscodeSpec,
    _cancel: &CancellationToken,
) -> Result<GeneratedAsset, GenerationError> {
    Err(GenerationError::UnsupportedFormat(VIDEO_DISABLED.to_string()))
}

#[cfg(feature = "video")]
mod gst_video_impl {
    use super::super::scaled_dimension;
    use super::*;
    use crate::models::VideoContainer;
    use bytes::Bytes;
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use gstreamer_video as gst_video;
    use image::RgbaImage;
    use std::collections::{BTreeSet, HashMap};
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing::{debug, warn};
    use uuid::Uuid;

    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();

    fn init() -> Result<(), GenerationError> {
        GST_INIT
            .get_or_init(|| gst::init().map_err(|e| e.to_string()))
            .clone()
            .map_err(|e| GenerationError::Generation(format!("GStreamer initialization failed: {}", e)))
    }

    /// Scratch file removed on drop; demuxers need a seekable source.
    struct ScratchFile {
        path: PathBuf,
    }

    impl ScratchFile {
        fn new(extension: &str) -> Self {
            Self {
                path: std::env::temp_dir()
                    .join(format!("media-ingest-{}.{}", Uuid::new_v4(), extension)),
            }
        }

        fn with_contents(contents: &[u8]) -> Result<Self, GenerationError> {
            let file = Self::new("src");
            std::fs::write(&file.path, contents).map_err(|e| {
                GenerationError::Generation(format!("Failed to stage video input: {}", e))
            })?;
            Ok(file)
        }

        fn location(&self) -> String {
            self.path.display().to_string().replace('"', "\\\"")
        }
    }

    impl Drop for ScratchFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn launch(description: &str) -> Result<gst::Pipeline, GenerationError> {
        gst::parse::launch(description)
            .map_err(|e| GenerationError::Generation(format!("Pipeline creation failed: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| GenerationError::Generation("Failed to cast to Pipeline".to_string()))
    }

    /// Sequential RGBA frame reader over a video file
    struct FrameReader {
        pipeline: gst::Pipeline,
        appsink: gst_app::AppSink,
        bus: gst::Bus,
        frames_read: usize,
        fps: Option<(u64, u64)>,
    }

    impl FrameReader {
        fn open(path: &Path) -> Result<Self, GenerationError> {
            init()?;

            let description = format!(
                "filesrc location=\"{}\" ! decodebin ! videoconvert \
                 ! video/x-raw,format=RGBA \
                 ! appsink name=sink sync=false max-buffers=4",
                path.display().to_string().replace('"', "\\\"")
            );
            let pipeline = launch(&description)?;

            let appsink = pipeline
                .by_name("sink")
                .ok_or_else(|| GenerationError::Generation("appsink not found".to_string()))?
                .downcast::<gst_app::AppSink>()
                .map_err(|_| GenerationError::Generation("Could not cast to AppSink".to_string()))?;

            let bus = pipeline
                .bus()
                .ok_or_else(|| GenerationError::Generation("Pipeline has no bus".to_string()))?;

            pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| GenerationError::UnsupportedFormat(e.to_string()))?;

            Ok(Self {
                pipeline,
                appsink,
                bus,
                frames_read: 0,
                fps: None,
            })
        }

        /// Next decoded frame, or `None` at end of stream
        fn next_frame(
            &mut self,
            cancel: &CancellationToken,
        ) -> Result<Option<DynamicImage>, GenerationError> {
            loop {
                if cancel.is_cancelled() {
                    return Err(GenerationError::Cancelled);
                }

                if let Some(msg) = self.bus.pop_filtered(&[gst::MessageType::Error]) {
                    if let gst::MessageView::Error(err) = msg.view() {
                        let message = err.error().to_string();
                        return Err(if self.frames_read == 0 {
                            GenerationError::UnsupportedFormat(message)
                        } else {
                            GenerationError::Generation(message)
                        });
                    }
                }

                match self
                    .appsink
                    .try_pull_sample(gst::ClockTime::from_mseconds(100))
                {
                    Some(sample) => {
                        let (frame, fps) = sample_to_image(&sample)?;
                        if self.fps.is_none() {
                            self.fps = fps;
                        }
                        self.frames_read += 1;
                        return Ok(Some(frame));
                    }
                    None if self.appsink.is_eos() => return Ok(None),
                    None => continue,
                }
            }
        }

        /// Frame count estimated from duration and frame rate
        fn estimated_frames(&self) -> Option<usize> {
            let (numer, denom) = self.fps?;
            let duration = self.pipeline.query_duration::<gst::ClockTime>()?;
            let frames = u128::from(duration.nseconds()) * u128::from(numer)
                / (u128::from(denom) * 1_000_000_000);
            usize::try_from(frames).ok().filter(|n| *n > 0)
        }
    }

    impl Drop for FrameReader {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }

    fn sample_to_image(
        sample: &gst::Sample,
    ) -> Result<(DynamicImage, Option<(u64, u64)>), GenerationError> {
        let frame_err = |what: &str| GenerationError::Generation(format!("Frame extraction failed: {}", what));

        let caps = sample.caps().ok_or_else(|| frame_err("sample has no caps"))?;
        let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| frame_err("invalid caps"))?;
        let buffer = sample.buffer().ok_or_else(|| frame_err("sample has no buffer"))?;
        let map = buffer.map_readable().map_err(|_| frame_err("buffer not readable"))?;

        let width = info.width();
        let height = info.height();
        let stride = usize::try_from(info.stride()[0]).map_err(|_| frame_err("negative stride"))?;
        let row_bytes = width as usize * 4;
        let base = info.offset()[0];

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = base + row * stride;
            let line = map
                .as_slice()
                .get(start..start + row_bytes)
                .ok_or_else(|| frame_err("buffer shorter than frame"))?;
            pixels.extend_from_slice(line);
        }

        let image = RgbaImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| frame_err("pixel buffer size mismatch"))?;

        let fps = info.fps();
        let fps = (fps.numer() > 0 && fps.denom() > 0)
            .then(|| (fps.numer() as u64, fps.denom() as u64));

        Ok((image, fps))
    }

    pub fn first_frame(
        input: &[u8],
        cancel: &CancellationToken,
    ) -> Result<DynamicImage, GenerationError> {
        let source = ScratchFile::with_contents(input)?;
        let mut reader = FrameReader::open(&source.path)?;
        reader
            .next_frame(cancel)?
            .ok_or_else(|| GenerationError::UnsupportedFormat("No video frames".to_string()))
    }

    pub fn sample_frames(
        input: &[u8],
        select: impl Fn(usize) -> Vec<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DynamicImage>, GenerationError> {
        let source = ScratchFile::with_contents(input)?;
        let mut reader = FrameReader::open(&source.path)?;
        let first = reader
            .next_frame(cancel)?
            .ok_or_else(|| GenerationError::UnsupportedFormat("No video frames".to_string()))?;

        if let Some(estimate) = reader.estimated_frames() {
            if let Some(frames) = collect_frames(&mut reader, first, &select(estimate), cancel)? {
                return Ok(frames);
            }
            debug!(estimate, "Video shorter than estimated, counting frames");
        }

        // Unknown or wrong length: count exactly, then sample again
        let total = count_frames(&source.path, cancel)?;
        let mut reader = FrameReader::open(&source.path)?;
        let first = reader
            .next_frame(cancel)?
            .ok_or_else(|| GenerationError::UnsupportedFormat("No video frames".to_string()))?;

        collect_frames(&mut reader, first, &select(total), cancel)?
            .ok_or_else(|| GenerationError::Generation("Video ended early on re-read".to_string()))
    }

    /// Decode up to the highest wanted index. `None` if the stream ends first.
    fn collect_frames(
        reader: &mut FrameReader,
        first: DynamicImage,
        wanted: &[usize],
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<DynamicImage>>, GenerationError> {
        let needed: BTreeSet<usize> = wanted.iter().copied().collect();
        let Some(&last) = needed.last() else {
            return Ok(Some(Vec::new()));
        };

        let mut kept: HashMap<usize, DynamicImage> = HashMap::new();
        if needed.contains(&0) {
            kept.insert(0, first);
        }

        let mut index = 0;
        while index < last {
            match reader.next_frame(cancel)? {
                Some(frame) => {
                    index += 1;
                    if needed.contains(&index) {
                        kept.insert(index, frame);
                    }
                }
                None => return Ok(None),
            }
        }

        Ok(Some(
            wanted
                .iter()
                .filter_map(|i| kept.get(i).cloned())
                .collect(),
        ))
    }

    fn count_frames(path: &Path, cancel: &CancellationToken) -> Result<usize, GenerationError> {
        let mut reader = FrameReader::open(path)?;
        let mut count = 0;
        while reader.next_frame(cancel)?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    pub fn transcode(
        input: &[u8],
        spec: &TranscodeSpec,
        cancel: &CancellationToken,
    ) -> Result<GeneratedAsset, GenerationError> {
        let source = ScratchFile::with_contents(input)?;

        let (width, height) = {
            let mut reader = FrameReader::open(&source.path)?;
            let frame = reader
                .next_frame(cancel)?
                .ok_or_else(|| GenerationError::UnsupportedFormat("No video frames".to_string()))?;
            scaled_dimension(frame.width(), frame.height(), spec.max_width, spec.max_height)
        };

        // 4:2:0 encoders need even dimensions
        let width = (width & !1).max(2);
        let height = (height & !1).max(2);

        let (encoder, muxer, extension, content_type) = match spec.container {
            VideoContainer::Mp4 => (
                format!("x264enc bitrate={} speed-preset=veryfast", spec.bitrate_kbps),
                "mp4mux faststart=true",
                "mp4",
                "video/mp4",
            ),
            VideoContainer::Webm => (
                format!(
                    "vp8enc target-bitrate={} deadline=1",
                    u64::from(spec.bitrate_kbps) * 1000
                ),
                "webmmux",
                "webm",
                "video/webm",
            ),
        };

        let output = ScratchFile::new(extension);
        let description = format!(
            "filesrc location=\"{src}\" ! decodebin ! videoconvert ! videoscale \
             ! video/x-raw,width={width},height={height},pixel-aspect-ratio=1/1 \
             ! videoconvert ! {encoder} ! {muxer} ! filesink location=\"{out}\"",
            src = source.location(),
            out = output.location(),
            width = width,
            height = height,
            encoder = encoder,
            muxer = muxer,
        );

        debug!(pipeline = %description, "Starting transcode");
        let pipeline = launch(&description)?;
        let result = run_to_completion(&pipeline, cancel);
        let _ = pipeline.set_state(gst::State::Null);
        result?;

        let bytes = std::fs::read(&output.path).map_err(|e| {
            GenerationError::Generation(format!("Failed to read transcoded output: {}", e))
        })?;

        Ok(GeneratedAsset {
            bytes: Bytes::from(bytes),
            content_type,
            extension,
            width,
            height,
            frame_count: 0,
        })
    }

    fn run_to_completion(
        pipeline: &gst::Pipeline,
        cancel: &CancellationToken,
    ) -> Result<(), GenerationError> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| GenerationError::Generation("Pipeline has no bus".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| GenerationError::UnsupportedFormat(e.to_string()))?;

        loop {
            if cancel.is_cancelled() {
                warn!("Transcode cancelled");
                return Err(GenerationError::Cancelled);
            }

            let Some(msg) = bus.timed_pop_filtered(
                gst::ClockTime::from_mseconds(100),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            ) else {
                continue;
            };

            match msg.view() {
                gst::MessageView::Eos(_) => return Ok(()),
                gst::MessageView::Error(err) => {
                    return Err(GenerationError::Generation(format!(
                        "Transcode failed: {} ({:?})",
                        err.error(),
                        err.debug()
                    )))
                }
                _ => {}
            }
        }
    }
}
