// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{init_ffmpeg, new_decoder, rgb_frame_to_image, FrameSource, VideoSource};
use image::RgbImage;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use thiserror::Error;

/// How many frames past the seek point the in-process extractor is willing
/// to decode before giving up.
const MAX_DECODE_AHEAD: u64 = 512;

/// Extracts a single frame. Retry chain: in-process decode (hardware first,
/// then software via the shared decoder selection), then the external tool
/// seeking by timestamp. Every failure path collapses to `None`.
#[must_use]
pub fn extract_frame(path: &Path, frame_index: u64) -> Option<RgbImage> {
    if let Some(frame) = extract_frame_decode(path, frame_index) {
        return Some(frame);
    }
    extract_frame_tool(path, frame_index)
}

fn extract_frame_decode(path: &Path, frame_index: u64) -> Option<RgbImage> {
    init_ffmpeg();

    let mut input = ffmpeg::format::input(&path).ok()?;
    let stream = input.streams().best(ffmpeg::media::Type::Video)?;
    let stream_index = stream.index();
    let time_base = stream.time_base();
    let parameters = stream.parameters();

    let rate = stream.avg_frame_rate();
    let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
        f64::from(rate.numerator()) / f64::from(rate.denominator())
    } else {
        common::DEFAULT_FPS
    };

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let target_av = (frame_index as f64 / fps * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
    // Land on a keyframe at or before the target, then decode forward.
    input.seek(target_av, ..target_av).ok()?;

    let mut decoder = new_decoder(parameters).ok()?;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let target_pts = if time_base.numerator() > 0 {
        (frame_index as f64 / fps * f64::from(time_base.denominator())
            / f64::from(time_base.numerator())) as i64
    } else {
        0
    };

    let mut decoded_ahead = 0;
    let mut packet = ffmpeg::Packet::empty();
    loop {
        let mut frame = ffmpeg::frame::Video::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let pts = frame.timestamp().or_else(|| frame.pts()).unwrap_or(0);
                if pts >= target_pts {
                    return to_rgb(&mut frame);
                }
                decoded_ahead += 1;
                if decoded_ahead > MAX_DECODE_AHEAD {
                    return None;
                }
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                loop {
                    match packet.read(&mut input) {
                        Ok(()) if packet.stream() == stream_index => {
                            decoder.send_packet(&packet).ok()?;
                            break;
                        }
                        Ok(()) => {}
                        Err(ffmpeg::Error::Eof) => {
                            decoder.send_eof().ok()?;
                            break;
                        }
                        Err(_) => return None,
                    }
                }
            }
            Err(_) => return None,
        }
    }
}

fn to_rgb(frame: &mut ffmpeg::frame::Video) -> Option<RgbImage> {
    let mut scaler = ffmpeg::software::scaling::Context::get(
        frame.format(),
        frame.width(),
        frame.height(),
        ffmpeg::format::Pixel::RGB24,
        frame.width(),
        frame.height(),
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
    .ok()?;
    let mut rgb = ffmpeg::frame::Video::empty();
    scaler.run(frame, &mut rgb).ok()?;
    rgb_frame_to_image(&rgb)
}

/// Out-of-process fallback: seek by timestamp and emit one JPEG.
fn extract_frame_tool(path: &Path, frame_index: u64) -> Option<RgbImage> {
    let fps = VideoSource::open(path, 1).map(|v| v.fps()).unwrap_or(common::DEFAULT_FPS);
    #[allow(clippy::cast_precision_loss)]
    let seconds = frame_index as f64 / fps.max(1.0);

    let dir = tempfile_dir()?;
    let out = dir.join("frame.jpg");

    let status = std::process::Command::new("ffmpeg")
        .arg("-y")
        .arg("-ss")
        .arg(format!("{seconds:.3}"))
        .arg("-i")
        .arg(path)
        .arg("-frames:v")
        .arg("1")
        .arg("-f")
        .arg("image2")
        .arg(&out)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .ok()?;
    if !status.success() {
        let _ = std::fs::remove_dir_all(&dir);
        return None;
    }

    let image = image::open(&out).ok().map(|v| v.to_rgb8());
    let _ = std::fs::remove_dir_all(&dir);
    image
}

fn tempfile_dir() -> Option<PathBuf> {
    let dir = std::env::temp_dir().join(format!("subscrub-frame-{}", std::process::id()));
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

#[derive(Debug, Error)]
pub enum ConvertVideoError {
    #[error("spawn ffmpeg: {0}")]
    Spawn(std::io::Error),

    #[error("ffmpeg exited with {0}")]
    ExitStatus(std::process::ExitStatus),
}

/// Re-encodes an undecodable upload to H.264 + AAC with the external tool.
/// Returns the path of the converted file next to the input.
pub async fn convert_to_h264(path: &Path) -> Result<PathBuf, ConvertVideoError> {
    use ConvertVideoError::*;
    let mut out = path.to_path_buf();
    let stem = out
        .file_stem()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_default();
    out.set_file_name(format!("{stem}_h264.mp4"));

    let status = tokio::process::Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(path)
        .args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "23"])
        .args(["-pix_fmt", "yuv420p", "-c:a", "aac"])
        .arg(&out)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(Spawn)?;

    if !status.success() {
        let _ = tokio::fs::remove_file(&out).await;
        return Err(ExitStatus(status));
    }
    Ok(out)
}
