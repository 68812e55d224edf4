// SPDX-License-Identifier: GPL-2.0-or-later

mod encode;
mod extract;

pub use encode::{FrameEncoder, FrameEncoderError};
pub use extract::{convert_to_h264, extract_frame, ConvertVideoError};

use common::{DynError, VideoMetadata, DEFAULT_FPS};
use image::RgbImage;
use std::{
    path::{Path, PathBuf},
    sync::Once,
};
use thiserror::Error;

static FFMPEG_INIT: Once = Once::new();

fn init_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        ffmpeg::init().expect("libav initialization should not fail");
        ffmpeg::log::set_level(ffmpeg::log::Level::Error);
    });
}

/// Hardware decoder names probed before falling back to the stream's default
/// software decoder.
fn hardware_decoder_name(id: ffmpeg::codec::Id) -> Option<&'static str> {
    use ffmpeg::codec::Id;
    match id {
        Id::H264 => Some("h264_cuvid"),
        Id::HEVC => Some("hevc_cuvid"),
        Id::VP9 => Some("vp9_cuvid"),
        Id::AV1 => Some("av1_cuvid"),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum OpenVideoError {
    #[error("open input: {0}")]
    OpenInput(ffmpeg::Error),

    #[error("no video stream")]
    NoVideoStream,

    #[error("create decoder: {0}")]
    CreateDecoder(ffmpeg::Error),

    #[error("invalid step: {0}")]
    InvalidStep(u32),
}

/// Step-wise frame supplier. Implemented by `VideoSource` and by scripted
/// stand-ins in tests.
pub trait FrameSource: Send {
    fn fps(&self) -> f64;
    fn total_frames(&self) -> u64;
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Next `step`-aligned frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<(u64, f64, RgbImage)>, DynError>;
}

#[derive(Debug, Error)]
pub enum ReadFrameError {
    #[error("read packet: {0}")]
    ReadPacket(ffmpeg::Error),

    #[error("send packet: {0}")]
    SendPacket(ffmpeg::Error),

    #[error("receive frame: {0}")]
    ReceiveFrame(ffmpeg::Error),

    #[error("scale frame: {0}")]
    Scale(ffmpeg::Error),

    #[error("frame buffer size mismatch")]
    BufferSize,
}

/// Sequential frame reader. Yields every `step`-th decoded frame together
/// with its index and timestamp. Must be driven by a single consumer; the
/// decoder is released on drop.
pub struct VideoSource {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    step: u32,
    fps: f64,
    total_frames: u64,
    width: u32,
    height: u32,
    next_index: u64,
    input_done: bool,
    path: PathBuf,
}

impl VideoSource {
    pub fn open(path: &Path, step: u32) -> Result<Self, OpenVideoError> {
        use OpenVideoError::*;
        if step == 0 {
            return Err(InvalidStep(step));
        }
        init_ffmpeg();

        let input = ffmpeg::format::input(&path).map_err(OpenInput)?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(NoVideoStream)?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let parameters = stream.parameters();

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
            f64::from(rate.numerator()) / f64::from(rate.denominator())
        } else {
            DEFAULT_FPS
        };

        let reported_frames = stream.frames();
        let total_frames = if reported_frames > 0 {
            u64::try_from(reported_frames).unwrap_or(0)
        } else {
            // Estimate from the container duration.
            let duration = input.duration();
            if duration > 0 {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let estimate =
                    (duration as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE) * fps) as u64;
                estimate
            } else {
                0
            }
        };

        let decoder = new_decoder(parameters).map_err(CreateDecoder)?;
        let width = decoder.width();
        let height = decoder.height();

        Ok(Self {
            input,
            decoder,
            scaler: None,
            stream_index,
            time_base,
            step,
            fps,
            total_frames,
            width,
            height,
            next_index: 0,
            input_done: false,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn metadata(&self) -> VideoMetadata {
        let filename = self
            .path
            .file_name()
            .map(|v| v.to_string_lossy().to_string())
            .unwrap_or_default();
        VideoMetadata {
            filename,
            width: self.width,
            height: self.height,
            fps: self.fps,
            total_frames: self.total_frames,
            duration: if self.fps > 0.0 {
                #[allow(clippy::cast_precision_loss)]
                let duration = self.total_frames as f64 / self.fps;
                duration
            } else {
                0.0
            },
        }
    }

    /// Returns the next `step`-aligned frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<(u64, f64, RgbImage)>, ReadFrameError> {
        use ReadFrameError::*;
        loop {
            let mut decoded = ffmpeg::frame::Video::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let index = self.next_index;
                    self.next_index += 1;
                    if index % u64::from(self.step) != 0 {
                        continue;
                    }
                    let timestamp = self.frame_timestamp(&decoded, index);
                    let image = self.to_rgb(&decoded)?;
                    return Ok(Some((index, timestamp, image)));
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    self.feed_decoder()?;
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(ReceiveFrame(e)),
            }
        }
    }

    /// Reads packets until one is sent to the decoder or the input is
    /// exhausted, at which point the decoder is flushed.
    fn feed_decoder(&mut self) -> Result<(), ReadFrameError> {
        use ReadFrameError::*;
        loop {
            if self.input_done {
                return Ok(());
            }
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder.send_packet(&packet).map_err(SendPacket)?;
                    return Ok(());
                }
                Err(ffmpeg::Error::Eof) => {
                    self.input_done = true;
                    self.decoder.send_eof().map_err(SendPacket)?;
                    return Ok(());
                }
                Err(e) => return Err(ReadPacket(e)),
            }
        }
    }

    fn frame_timestamp(&self, frame: &ffmpeg::frame::Video, index: u64) -> f64 {
        let pts = frame.timestamp().or_else(|| frame.pts());
        match pts {
            Some(pts) if pts >= 0 && self.time_base.denominator() > 0 => {
                #[allow(clippy::cast_precision_loss)]
                let secs = pts as f64 * f64::from(self.time_base.numerator())
                    / f64::from(self.time_base.denominator());
                secs
            }
            _ => {
                #[allow(clippy::cast_precision_loss)]
                let secs = index as f64 / self.fps.max(1.0);
                secs
            }
        }
    }

    fn to_rgb(&mut self, frame: &ffmpeg::frame::Video) -> Result<RgbImage, ReadFrameError> {
        use ReadFrameError::*;
        if self.scaler.is_none() {
            let scaler = ffmpeg::software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg::format::Pixel::RGB24,
                frame.width(),
                frame.height(),
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(Scale)?;
            self.scaler = Some(scaler);
        }
        let scaler = self.scaler.as_mut().expect("scaler was just created");

        let mut rgb = ffmpeg::frame::Video::empty();
        scaler.run(frame, &mut rgb).map_err(Scale)?;
        rgb_frame_to_image(&rgb).ok_or(BufferSize)
    }
}

impl FrameSource for VideoSource {
    fn fps(&self) -> f64 {
        self.fps
    }
    fn total_frames(&self) -> u64 {
        self.total_frames
    }
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn next_frame(&mut self) -> Result<Option<(u64, f64, RgbImage)>, DynError> {
        Ok(self.read_frame()?)
    }
}

/// Copies a RGB24 libav frame into an owned image buffer, respecting the
/// line stride.
pub(crate) fn rgb_frame_to_image(frame: &ffmpeg::frame::Video) -> Option<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_len = usize::try_from(width).ok()? * 3;

    let mut buf = Vec::with_capacity(row_len * usize::try_from(height).ok()?);
    for y in 0..usize::try_from(height).ok()? {
        let start = y * stride;
        buf.extend_from_slice(data.get(start..start + row_len)?);
    }
    RgbImage::from_raw(width, height, buf)
}

fn new_decoder(
    parameters: ffmpeg::codec::Parameters,
) -> Result<ffmpeg::decoder::Video, ffmpeg::Error> {
    let codec_id = parameters.id();

    // Hardware decoder first, software on any failure.
    if let Some(name) = hardware_decoder_name(codec_id) {
        if let Some(codec) = ffmpeg::codec::decoder::find_by_name(name) {
            let ctx = ffmpeg::codec::context::Context::from_parameters(parameters.clone())?;
            if let Ok(opened) = ctx.decoder().open_as(codec) {
                if let Ok(video) = opened.video() {
                    return Ok(video);
                }
            }
        }
    }

    let ctx = ffmpeg::codec::context::Context::from_parameters(parameters)?;
    ctx.decoder().video()
}

/// Probes container metadata without decoding.
pub fn probe(path: &Path) -> Result<VideoMetadata, OpenVideoError> {
    let source = VideoSource::open(path, 1)?;
    Ok(source.metadata())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn open_missing_file() {
        assert!(matches!(
            VideoSource::open(Path::new("/nonexistent/clip.mp4"), 1),
            Err(OpenVideoError::OpenInput(_))
        ));
    }

    #[test]
    fn zero_step_rejected() {
        assert!(matches!(
            VideoSource::open(Path::new("x.mp4"), 0),
            Err(OpenVideoError::InvalidStep(0))
        ));
    }

    #[test]
    fn hardware_names() {
        assert_eq!(
            Some("h264_cuvid"),
            hardware_decoder_name(ffmpeg::codec::Id::H264)
        );
        assert_eq!(None, hardware_decoder_name(ffmpeg::codec::Id::MJPEG));
    }
}
