// SPDX-License-Identifier: GPL-2.0-or-later

use image::RgbImage;
use std::{
    io::Write,
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameEncoderError {
    #[error("spawn ffmpeg: {0}")]
    Spawn(std::io::Error),

    #[error("ffmpeg stdin unavailable")]
    Stdin,

    #[error("write frame: {0}")]
    WriteFrame(std::io::Error),

    #[error("frame size changed: expected {0}x{1}, got {2}x{3}")]
    FrameSize(u32, u32, u32, u32),

    #[error("wait for ffmpeg: {0}")]
    Wait(std::io::Error),

    #[error("ffmpeg exited with {0}")]
    ExitStatus(std::process::ExitStatus),
}

/// Streams raw RGB frames into an external encoder producing the
/// intermediate MP4. Uses a generic codec; the final transcode pass handles
/// H.264 and audio.
pub struct FrameEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl FrameEncoder {
    pub fn new(output: &Path, width: u32, height: u32, fps: f64) -> Result<Self, FrameEncoderError> {
        use FrameEncoderError::*;
        let mut child = Command::new("ffmpeg")
            .arg("-y")
            .args(["-f", "rawvideo"])
            .args(["-pix_fmt", "rgb24"])
            .args(["-s", &format!("{width}x{height}")])
            .args(["-r", &format!("{fps}")])
            .args(["-i", "-"])
            .args(["-an"])
            .args(["-c:v", "mpeg4", "-q:v", "5"])
            .args(["-pix_fmt", "yuv420p"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(Spawn)?;

        let stdin = child.stdin.take().ok_or(Stdin)?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            width,
            height,
        })
    }

    pub fn write(&mut self, frame: &RgbImage) -> Result<(), FrameEncoderError> {
        use FrameEncoderError::*;
        if frame.width() != self.width || frame.height() != self.height {
            return Err(FrameSize(
                self.width,
                self.height,
                frame.width(),
                frame.height(),
            ));
        }
        let stdin = self.stdin.as_mut().ok_or(Stdin)?;
        stdin.write_all(frame.as_raw()).map_err(WriteFrame)
    }

    /// Closes the pipe and waits for the encoder to flush.
    pub fn finish(mut self) -> Result<(), FrameEncoderError> {
        use FrameEncoderError::*;
        // Dropping stdin signals EOF.
        self.stdin.take();
        let status = self.child.wait().map_err(Wait)?;
        if !status.success() {
            return Err(ExitStatus(status));
        }
        Ok(())
    }

    /// Kills the encoder and discards the partial output.
    pub fn abort(mut self) {
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for FrameEncoder {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
