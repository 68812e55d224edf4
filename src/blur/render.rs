// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    effects,
    plan::{self, RenderPlan},
    transcode::{transcode_with_audio, TranscodeError},
};
use common::{
    config::BlurSettings, subtitle::SubtitleItem, ArcEventSink, ArcMsgLogger, DynError, Event,
    EventSink, LogLevel, MsgLogger,
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use filters::SelectiveBackend;
use image::{GrayImage, RgbImage};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use video::{extract_frame, FrameEncoder, FrameSource, OpenVideoError, VideoSource};

const CHANNEL_CAP: usize = 30;

/// Frames between two progress reports.
const PROGRESS_INTERVAL: u64 = 25;

/// Reader poll interval on a full channel.
const FULL_CHANNEL_POLL: Duration = Duration::from_secs(1);

/// Processor/writer poll interval on an empty channel.
const EMPTY_CHANNEL_POLL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct RenderParams {
    pub video_path: PathBuf,
    pub output_path: PathBuf,
    pub download_url: String,
    pub subtitles: Vec<SubtitleItem>,
    pub settings: BlurSettings,
}

/// Sink for finished frames. Implemented by the external-encoder pipe and
/// by in-memory collectors in tests.
pub trait FrameWriter: Send {
    fn write(&mut self, frame: &RgbImage) -> Result<(), DynError>;
    fn finish(self: Box<Self>) -> Result<(), DynError>;
    fn abort(self: Box<Self>);
}

impl FrameWriter for FrameEncoder {
    fn write(&mut self, frame: &RgbImage) -> Result<(), DynError> {
        Ok(FrameEncoder::write(self, frame)?)
    }
    fn finish(self: Box<Self>) -> Result<(), DynError> {
        Ok(FrameEncoder::finish(*self)?)
    }
    fn abort(self: Box<Self>) {
        FrameEncoder::abort(*self);
    }
}

/// Spawns the blur render worker. The returned channel closes when the
/// worker has fully exited; exactly one terminal `finish` event is
/// published before that.
pub fn start_render_worker(
    token: CancellationToken,
    logger: ArcMsgLogger,
    sink: ArcEventSink,
    params: RenderParams,
) -> mpsc::Receiver<()> {
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let _shutdown_complete = shutdown_complete_tx;
        let outcome = run(token, &logger, &sink, params.clone()).await;
        match outcome {
            Ok(Outcome::Completed) => {
                logger.log(LogLevel::Info, "render finished");
                sink.send(Event::Finish {
                    success: true,
                    download_url: Some(params.download_url),
                    error: None,
                })
                .await;
            }
            Ok(Outcome::Cancelled) => {
                logger.log(LogLevel::Info, "render stopped by user");
                sink.send(Event::cancelled()).await;
            }
            Err(e) => {
                logger.log(LogLevel::Error, &format!("render failed: {e}"));
                sink.send(Event::failed(e.to_string())).await;
            }
        }
    });
    shutdown_complete_rx
}

enum Outcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Error)]
enum RenderError {
    #[error("open video: {0}")]
    OpenVideo(#[from] OpenVideoError),

    #[error("create encoder: {0}")]
    NewEncoder(#[from] video::FrameEncoderError),

    #[error("join task: {0}")]
    Join(tokio::task::JoinError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("transcode: {0}")]
    Transcode(TranscodeError),
}

async fn run(
    token: CancellationToken,
    logger: &ArcMsgLogger,
    sink: &ArcEventSink,
    params: RenderParams,
) -> Result<Outcome, RenderError> {
    logger.log(LogLevel::Info, "starting render job");

    let video_path = params.video_path.clone();
    let source = tokio::task::spawn_blocking(move || VideoSource::open(&video_path, 1))
        .await
        .map_err(RenderError::Join)??;

    let (width, height) = (source.width(), source.height());
    let fps = source.fps();
    let total_frames = source.total_frames();

    let temp_path = temp_video_path(&params.output_path);
    let _ = tokio::fs::remove_file(&temp_path).await;

    let render_plan = plan::build_render_plan(
        &params.subtitles,
        &params.settings,
        width,
        height,
        fps,
        total_frames,
    );

    // The best-mask sweep decodes sample frames, keep it off the runtime.
    let masks = {
        let subtitles = params.subtitles.clone();
        let settings = params.settings;
        let video_path = params.video_path.clone();
        tokio::task::spawn_blocking(move || {
            let frame_at = |index: u64| extract_frame(&video_path, index);
            plan::precompute_best_masks(
                &frame_at, &subtitles, &settings, width, height, fps, total_frames,
            )
        })
        .await
        .map_err(RenderError::Join)?
    };

    let writer = FrameEncoder::new(&temp_path, width, height, fps)?;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u64>();
    let progress_forwarder = {
        let sink = sink.clone();
        tokio::spawn(async move {
            while let Some(current) = progress_rx.recv().await {
                sink.send(Event::Progress {
                    current,
                    total: total_frames,
                    eta: percent_eta(current, total_frames),
                })
                .await;
            }
        })
    };

    let pipeline_token = token.clone();
    let settings = params.settings;
    let outcome = tokio::task::spawn_blocking(move || {
        run_pipeline(
            &pipeline_token,
            Box::new(source),
            &render_plan,
            &masks,
            &settings,
            Box::new(writer),
            &progress_tx,
        )
    })
    .await
    .map_err(RenderError::Join)?;
    progress_forwarder.await.ok();

    match outcome? {
        PipelineOutcome::Cancelled => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Ok(Outcome::Cancelled);
        }
        PipelineOutcome::Completed => {}
    }

    sink.send(Event::Progress {
        current: total_frames,
        total: total_frames,
        eta: "100%".to_owned(),
    })
    .await;

    match transcode_with_audio(&temp_path, &params.video_path, &params.output_path, &token).await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Ok(Outcome::Completed)
        }
        Err(TranscodeError::Cancelled) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            let _ = tokio::fs::remove_file(&params.output_path).await;
            Ok(Outcome::Cancelled)
        }
        Err(e) => {
            // Every encoder attempt failed; the intermediate becomes the
            // output so the work isn't lost.
            let _ = tokio::fs::remove_file(&params.output_path).await;
            let _ = tokio::fs::rename(&temp_path, &params.output_path).await;
            Err(RenderError::Transcode(e))
        }
    }
}

fn temp_video_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = output
        .extension()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_owned());
    output.with_file_name(format!("{stem}_temp.{ext}"))
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent_eta(current: u64, total: u64) -> String {
    let total = total.max(1);
    let pct = ((current as f64 / total as f64) * 100.0).min(100.0) as u64;
    format!("{pct}%")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("read frames: {0}")]
    Reader(String),

    #[error("write frames: {0}")]
    Writer(String),
}

/// Three-thread read/process/write pipeline over two bounded channels.
/// Blocking; run on a dedicated thread. On cancellation all stages drain
/// and the partial output is discarded by the caller.
pub fn run_pipeline(
    token: &CancellationToken,
    source: Box<dyn FrameSource>,
    render_plan: &RenderPlan,
    masks: &HashMap<u32, GrayImage>,
    settings: &BlurSettings,
    writer: Box<dyn FrameWriter>,
    progress_tx: &mpsc::UnboundedSender<u64>,
) -> Result<PipelineOutcome, PipelineError> {
    let (read_tx, read_rx) = bounded::<(u64, RgbImage)>(CHANNEL_CAP);
    let (write_tx, write_rx) = bounded::<RgbImage>(CHANNEL_CAP);
    let backend = SelectiveBackend::cpu_only();

    std::thread::scope(|s| {
        let backend = &backend;
        let reader = s.spawn(move || reader_loop(token, source, read_tx));
        let processor = s.spawn(move || {
            processor_loop(
                token,
                &read_rx,
                write_tx,
                render_plan,
                masks,
                settings,
                backend,
                progress_tx,
            );
        });
        let writer_thread = s.spawn(move || writer_loop(token, &write_rx, writer));

        let read_result = reader.join().expect("reader thread should not panic");
        processor.join().expect("processor thread should not panic");
        let write_result = writer_thread.join().expect("writer thread should not panic");

        if token.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }
        read_result.map_err(PipelineError::Reader)?;
        write_result.map_err(PipelineError::Writer)?;
        Ok(PipelineOutcome::Completed)
    })
}

fn reader_loop(
    token: &CancellationToken,
    mut source: Box<dyn FrameSource>,
    tx: Sender<(u64, RgbImage)>,
) -> Result<(), String> {
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        let frame = source.next_frame().map_err(|e| e.to_string())?;
        let Some((index, _, frame)) = frame else {
            // Dropping the sender is the close marker.
            return Ok(());
        };
        let mut item = (index, frame);
        loop {
            match tx.send_timeout(item, FULL_CHANNEL_POLL) {
                Ok(()) => break,
                Err(crossbeam::channel::SendTimeoutError::Timeout(v)) => {
                    if token.is_cancelled() {
                        return Ok(());
                    }
                    item = v;
                }
                Err(crossbeam::channel::SendTimeoutError::Disconnected(_)) => return Ok(()),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn processor_loop(
    token: &CancellationToken,
    rx: &Receiver<(u64, RgbImage)>,
    tx: Sender<RgbImage>,
    render_plan: &RenderPlan,
    masks: &HashMap<u32, GrayImage>,
    settings: &BlurSettings,
    backend: &SelectiveBackend,
    progress_tx: &mpsc::UnboundedSender<u64>,
) {
    loop {
        let (index, mut frame) = match rx.recv_timeout(EMPTY_CHANNEL_POLL) {
            Ok(v) => v,
            Err(RecvTimeoutError::Timeout) => {
                if token.is_cancelled() {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if token.is_cancelled() {
            return;
        }

        if let Some(entry) = render_plan.get(&index) {
            effects::apply_blur_to_frame(
                &mut frame,
                entry.roi,
                settings,
                masks.get(&entry.subtitle_id),
                backend,
            );
        }

        if index % PROGRESS_INTERVAL == 0 {
            let _ = progress_tx.send(index);
        }

        let mut item = frame;
        loop {
            match tx.send_timeout(item, FULL_CHANNEL_POLL) {
                Ok(()) => break,
                Err(crossbeam::channel::SendTimeoutError::Timeout(v)) => {
                    if token.is_cancelled() {
                        return;
                    }
                    item = v;
                }
                Err(crossbeam::channel::SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

fn writer_loop(
    token: &CancellationToken,
    rx: &Receiver<RgbImage>,
    mut writer: Box<dyn FrameWriter>,
) -> Result<(), String> {
    loop {
        match rx.recv_timeout(EMPTY_CHANNEL_POLL) {
            Ok(frame) => {
                if token.is_cancelled() {
                    writer.abort();
                    return Ok(());
                }
                if let Err(e) = writer.write(&frame) {
                    writer.abort();
                    return Err(e.to_string());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if token.is_cancelled() {
                    writer.abort();
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if token.is_cancelled() {
                    writer.abort();
                    return Ok(());
                }
                return writer.finish().map_err(|e| e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Roi;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    struct StubSource {
        frames: Vec<u8>,
        cursor: usize,
    }

    impl FrameSource for StubSource {
        fn fps(&self) -> f64 {
            25.0
        }
        fn total_frames(&self) -> u64 {
            self.frames.len() as u64
        }
        fn width(&self) -> u32 {
            64
        }
        fn height(&self) -> u32 {
            48
        }
        fn next_frame(&mut self) -> Result<Option<(u64, f64, RgbImage)>, DynError> {
            let Some(&value) = self.frames.get(self.cursor) else {
                return Ok(None);
            };
            let index = self.cursor as u64;
            self.cursor += 1;
            Ok(Some((
                index,
                index as f64 / 25.0,
                RgbImage::from_pixel(64, 48, image::Rgb([value, value, value])),
            )))
        }
    }

    #[derive(Default)]
    struct CollectingWriter {
        frames: Arc<Mutex<Vec<RgbImage>>>,
        finished: Arc<Mutex<bool>>,
    }

    impl FrameWriter for CollectingWriter {
        fn write(&mut self, frame: &RgbImage) -> Result<(), DynError> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
        fn finish(self: Box<Self>) -> Result<(), DynError> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }
        fn abort(self: Box<Self>) {}
    }

    fn run(
        source: StubSource,
        render_plan: &RenderPlan,
        settings: &BlurSettings,
    ) -> (Vec<RgbImage>, bool, PipelineOutcome) {
        let writer = CollectingWriter::default();
        let frames = writer.frames.clone();
        let finished = writer.finished.clone();
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();

        let outcome = run_pipeline(
            &CancellationToken::new(),
            Box::new(source),
            render_plan,
            &HashMap::new(),
            settings,
            Box::new(writer),
            &progress_tx,
        )
        .unwrap();

        let frames = frames.lock().unwrap().clone();
        let finished = *finished.lock().unwrap();
        (frames, finished, outcome)
    }

    #[test]
    fn empty_plan_passes_frames_through() {
        let source = StubSource {
            frames: vec![10, 20, 30, 40],
            cursor: 0,
        };
        let (frames, finished, outcome) = run(source, &RenderPlan::new(), &BlurSettings::default());

        assert_eq!(PipelineOutcome::Completed, outcome);
        assert!(finished);
        assert_eq!(4, frames.len());
        // No cue maps to any frame, output is byte-identical input.
        for (i, frame) in frames.iter().enumerate() {
            let value = (i as u8 + 1) * 10;
            assert_eq!(
                &RgbImage::from_pixel(64, 48, image::Rgb([value, value, value])),
                frame
            );
        }
    }

    #[test]
    fn planned_frames_are_obscured() {
        let source = StubSource {
            frames: vec![100; 10],
            cursor: 0,
        };
        let mut render_plan = RenderPlan::new();
        render_plan.insert(
            3,
            crate::plan::PlanEntry {
                roi: Roi::new(8, 8, 32, 24),
                subtitle_id: 1,
            },
        );
        let settings = BlurSettings {
            mode: common::config::BlurMode::Blur,
            alpha: 1.0,
            feather: 0,
            ..Default::default()
        };
        let (frames, _, _) = run(source, &render_plan, &settings);

        // Flat frames blur to themselves, so assert dimensions and count
        // rather than pixel change, plus the untouched neighbors.
        assert_eq!(10, frames.len());
        assert_eq!(frames[2], frames[4]);
    }

    #[test]
    fn cancellation_stops_pipeline() {
        struct SlowSource(u64);
        impl FrameSource for SlowSource {
            fn fps(&self) -> f64 {
                25.0
            }
            fn total_frames(&self) -> u64 {
                1_000_000
            }
            fn width(&self) -> u32 {
                64
            }
            fn height(&self) -> u32 {
                48
            }
            fn next_frame(&mut self) -> Result<Option<(u64, f64, RgbImage)>, DynError> {
                self.0 += 1;
                std::thread::sleep(Duration::from_millis(1));
                Ok(Some((
                    self.0,
                    self.0 as f64 / 25.0,
                    RgbImage::new(64, 48),
                )))
            }
        }

        let token = CancellationToken::new();
        let token2 = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            token2.cancel();
        });

        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let outcome = run_pipeline(
            &token,
            Box::new(SlowSource(0)),
            &RenderPlan::new(),
            &HashMap::new(),
            &BlurSettings::default(),
            Box::new(CollectingWriter::default()),
            &progress_tx,
        )
        .unwrap();
        assert_eq!(PipelineOutcome::Cancelled, outcome);
    }

    #[test]
    fn reader_error_propagates() {
        struct FailingSource;
        impl FrameSource for FailingSource {
            fn fps(&self) -> f64 {
                25.0
            }
            fn total_frames(&self) -> u64 {
                1
            }
            fn width(&self) -> u32 {
                64
            }
            fn height(&self) -> u32 {
                48
            }
            fn next_frame(&mut self) -> Result<Option<(u64, f64, RgbImage)>, DynError> {
                Err("decode error".into())
            }
        }

        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let result = run_pipeline(
            &CancellationToken::new(),
            Box::new(FailingSource {}),
            &RenderPlan::new(),
            &HashMap::new(),
            &BlurSettings::default(),
            Box::new(CollectingWriter::default()),
            &progress_tx,
        );
        assert!(matches!(result, Err(PipelineError::Reader(_))));
    }
}
