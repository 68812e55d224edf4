// SPDX-License-Identifier: GPL-2.0-or-later

use std::{path::Path, process::Stdio, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How often a running encoder child is polled for the stop signal.
const CHILD_POLL: Duration = Duration::from_millis(500);

/// Grace period between terminate and kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("cancelled")]
    Cancelled,

    #[error("spawn ffmpeg: {0}")]
    Spawn(std::io::Error),

    #[error("all encoder attempts failed, last: {0}")]
    AllAttemptsFailed(String),
}

/// Muxes the original audio onto the processed video stream, re-encoding to
/// H.264. Fallback chain: hardware encoder with audio copy, hardware
/// encoder with AAC, software encoder with AAC. A non-zero exit falls
/// through to the next attempt; cancellation aborts the chain.
pub async fn transcode_with_audio(
    processed_video: &Path,
    original_video: &Path,
    output: &Path,
    token: &CancellationToken,
) -> Result<(), TranscodeError> {
    const NVENC: &[&str] = &["-c:v", "h264_nvenc", "-preset", "p4", "-cq", "23", "-pix_fmt", "yuv420p"];
    const X264: &[&str] = &["-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-pix_fmt", "yuv420p"];

    let attempts: [(&[&str], &str); 3] = [
        (NVENC, "copy"),
        (NVENC, "aac"),
        (X264, "aac"),
    ];

    let mut last_failure = String::new();
    for (video_args, audio_codec) in attempts {
        let mut cmd = tokio::process::Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(processed_video)
            .arg("-i")
            .arg(original_video)
            .args(["-map", "0:v:0", "-map", "1:a:0?", "-shortest"])
            .args(video_args)
            .args(["-c:a", audio_codec])
            .arg(output);

        match run_cancellable(cmd, token).await {
            Ok(()) => return Ok(()),
            Err(e @ TranscodeError::Cancelled) => return Err(e),
            Err(e) => last_failure = e.to_string(),
        }
    }
    Err(TranscodeError::AllAttemptsFailed(last_failure))
}

#[derive(Debug, Error)]
enum RunChildError {
    #[error("exit status: {0}")]
    ExitStatus(std::process::ExitStatus),

    #[error("wait: {0}")]
    Wait(std::io::Error),
}

/// Runs the child to completion, polling the stop signal. On cancellation
/// the child gets a terminate, a grace period, then a kill.
async fn run_cancellable(
    mut cmd: tokio::process::Command,
    token: &CancellationToken,
) -> Result<(), TranscodeError> {
    use TranscodeError::*;
    let mut child = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(Spawn)?;

    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(AllAttemptsFailed(RunChildError::ExitStatus(status).to_string())),
                    Err(e) => Err(AllAttemptsFailed(RunChildError::Wait(e).to_string())),
                };
            }
            () = tokio::time::sleep(CHILD_POLL) => {
                if token.is_cancelled() {
                    terminate(&child);
                    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
                        let _ = child.kill().await;
                    }
                    return Err(Cancelled);
                }
            }
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
fn terminate(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling our own child process.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_child_reports_cancelled() {
        let token = CancellationToken::new();
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30");

        token.cancel();
        let started = std::time::Instant::now();
        let result = run_cancellable(cmd, &token).await;
        assert!(matches!(result, Err(TranscodeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn failing_child_reports_status() {
        let token = CancellationToken::new();
        let mut cmd = tokio::process::Command::new("false");
        cmd.arg("");
        let result = run_cancellable(cmd, &token).await;
        assert!(matches!(result, Err(TranscodeError::AllAttemptsFailed(_))));
    }

    #[tokio::test]
    async fn succeeding_child_ok() {
        let token = CancellationToken::new();
        let cmd = tokio::process::Command::new("true");
        assert!(run_cancellable(cmd, &token).await.is_ok());
    }
}
