// SPDX-License-Identifier: GPL-2.0-or-later

use crate::engine::{
    parse_recognition, Device, EngineCache, EngineKey, NewRecognizerError, OcrEngine,
};
use common::{
    config::{InvalidConfigError, PipelineConfig, PipelineOverrides, Preset},
    subtitle::SubtitleItem,
    ArcEventSink, ArcMsgLogger, Event, EventSink, LogLevel, MsgLogger, Roi,
};
use filters::{ImagePipeline, SelectiveBackend};
use image::RgbImage;
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use subtitle::{srt, SubtitleAggregator};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use video::{FrameSource, OpenVideoError, VideoSource};

const FRAME_QUEUE_CAP: usize = 30;
const BATCH_SIZE: usize = 4;

/// Consumer poll interval on an empty queue.
const QUEUE_POLL: Duration = Duration::from_millis(200);

/// Producer poll interval on a full queue.
const FULL_QUEUE_POLL: Duration = Duration::from_secs(1);

/// No frame for this long fails the job.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Clone, Debug)]
pub struct OcrWorkerParams {
    pub video_path: PathBuf,
    pub output_path: PathBuf,
    pub lang: String,
    pub roi: Roi,
    pub preset: Preset,
    pub overrides: PipelineOverrides,
}

/// Spawns the OCR worker. The returned channel closes when the worker and
/// its producer have fully exited; exactly one terminal `finish` event is
/// published before that.
pub fn start_ocr_worker(
    token: CancellationToken,
    logger: ArcMsgLogger,
    sink: ArcEventSink,
    engines: Arc<EngineCache>,
    params: OcrWorkerParams,
) -> mpsc::Receiver<()> {
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let _shutdown_complete = shutdown_complete_tx;
        let outcome = run(token, &logger, &sink, engines, params).await;
        publish_outcome(&logger, &sink, outcome).await;
    });
    shutdown_complete_rx
}

/// Variant taking an already-open frame source. Production goes through
/// `start_ocr_worker`; this is the seam for driving the worker without a
/// real video file.
pub fn start_ocr_worker_with_source(
    token: CancellationToken,
    logger: ArcMsgLogger,
    sink: ArcEventSink,
    engines: Arc<EngineCache>,
    source: Box<dyn FrameSource>,
    params: OcrWorkerParams,
) -> mpsc::Receiver<()> {
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let _shutdown_complete = shutdown_complete_tx;
        let outcome = async {
            let config = params.overrides.resolve(params.preset)?;
            run_with_source(token, &logger, &sink, engines, source, config, params).await
        }
        .await;
        publish_outcome(&logger, &sink, outcome).await;
    });
    shutdown_complete_rx
}

enum Outcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Error)]
enum RunOcrError {
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] InvalidConfigError),

    #[error("open video: {0}")]
    OpenVideo(#[from] OpenVideoError),

    #[error("create ocr engine: {0}")]
    NewEngine(#[from] NewRecognizerError),

    #[error("join task: {0}")]
    Join(tokio::task::JoinError),

    #[error("frame producer: {0}")]
    Producer(String),

    #[error("watchdog timeout: decoder or processing stalled")]
    Watchdog,

    #[error("write srt: {0}")]
    WriteSrt(std::io::Error),
}

async fn publish_outcome(
    logger: &ArcMsgLogger,
    sink: &ArcEventSink,
    outcome: Result<Outcome, RunOcrError>,
) {
    match outcome {
        Ok(Outcome::Completed) => sink.send(Event::finished()).await,
        Ok(Outcome::Cancelled) => {
            logger.log(LogLevel::Info, "process stopped by user");
            sink.send(Event::Log {
                message: "Process stopped by user.".to_owned(),
            })
            .await;
            sink.send(Event::cancelled()).await;
        }
        Err(e) => {
            logger.log(LogLevel::Error, &format!("ocr job failed: {e}"));
            sink.send(Event::failed(e.to_string())).await;
        }
    }
}

async fn run(
    token: CancellationToken,
    logger: &ArcMsgLogger,
    sink: &ArcEventSink,
    engines: Arc<EngineCache>,
    params: OcrWorkerParams,
) -> Result<Outcome, RunOcrError> {
    let config = params.overrides.resolve(params.preset)?;

    let video_path = params.video_path.clone();
    let step = config.step;
    let source = tokio::task::spawn_blocking(move || VideoSource::open(&video_path, step))
        .await
        .map_err(RunOcrError::Join)??;

    run_with_source(token, logger, sink, engines, Box::new(source), config, params).await
}

#[allow(clippy::too_many_lines)]
async fn run_with_source(
    token: CancellationToken,
    logger: &ArcMsgLogger,
    sink: &ArcEventSink,
    engines: Arc<EngineCache>,
    source: Box<dyn FrameSource>,
    config: PipelineConfig,
    params: OcrWorkerParams,
) -> Result<Outcome, RunOcrError> {
    sink.send(Event::Log {
        message: "--- START OCR ---".to_owned(),
    })
    .await;
    logger.log(LogLevel::Info, "starting ocr job");

    let fps = source.fps();
    let total_frames = source.total_frames();

    let engine = engines.get(&EngineKey {
        lang: params.lang.clone(),
        device: Device::Cpu,
    })?;

    let pipeline = ImagePipeline::new(params.roi, config, SelectiveBackend::cpu_only());

    let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_QUEUE_CAP);
    let producer_token = token.clone();
    tokio::task::spawn_blocking(move || produce_frames(&producer_token, source, pipeline, &frame_tx));

    let (commit_tx, mut commit_rx) = mpsc::unbounded_channel::<SubtitleItem>();
    let mut aggregator = SubtitleAggregator::new(
        config.min_conf,
        fps,
        Box::new(move |item| {
            let _ = commit_tx.send(item.clone());
        }),
    );

    let started = Instant::now();
    let mut last_activity = Instant::now();
    let mut pending: Vec<Pending> = Vec::new();
    let mut valid_frames: Vec<RgbImage> = Vec::new();
    let mut last_result = (String::new(), 0.0f32);
    let mut skipped_count = None;

    loop {
        if token.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        match tokio::time::timeout(QUEUE_POLL, frame_rx.recv()).await {
            Ok(Some(ProducerMsg::Item(item))) => {
                last_activity = Instant::now();
                let kind = match item.image {
                    _ if item.skipped => PendingKind::Skipped,
                    Some(image) => {
                        valid_frames.push(image);
                        PendingKind::Recognized
                    }
                    None => PendingKind::Empty,
                };
                pending.push(Pending {
                    index: item.index,
                    timestamp: item.timestamp,
                    kind,
                });
                if valid_frames.len() >= BATCH_SIZE {
                    if token.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    flush_batch(FlushArgs {
                        engine: &engine,
                        pending: &mut pending,
                        valid_frames: &mut valid_frames,
                        aggregator: &mut aggregator,
                        commit_rx: &mut commit_rx,
                        last_result: &mut last_result,
                        sink,
                        conf_threshold: config.conf_threshold,
                        total_frames,
                        started,
                    })
                    .await?;
                    last_activity = Instant::now();
                }
            }
            Ok(Some(ProducerMsg::Done(result))) => {
                match result {
                    Ok(skipped) => skipped_count = Some(skipped),
                    Err(e) => return Err(RunOcrError::Producer(e)),
                }
                flush_batch(FlushArgs {
                    engine: &engine,
                    pending: &mut pending,
                    valid_frames: &mut valid_frames,
                    aggregator: &mut aggregator,
                    commit_rx: &mut commit_rx,
                    last_result: &mut last_result,
                    sink,
                    conf_threshold: config.conf_threshold,
                    total_frames,
                    started,
                })
                .await?;
                break;
            }
            // Producer hung up without a sentinel.
            Ok(None) => break,
            Err(_) => {
                if last_activity.elapsed() > WATCHDOG_TIMEOUT {
                    return Err(RunOcrError::Watchdog);
                }
                if !pending.is_empty() {
                    if token.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    flush_batch(FlushArgs {
                        engine: &engine,
                        pending: &mut pending,
                        valid_frames: &mut valid_frames,
                        aggregator: &mut aggregator,
                        commit_rx: &mut commit_rx,
                        last_result: &mut last_result,
                        sink,
                        conf_threshold: config.conf_threshold,
                        total_frames,
                        started,
                    })
                    .await?;
                    last_activity = Instant::now();
                }
            }
        }
    }

    if token.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }

    sink.send(Event::Progress {
        current: total_frames,
        total: total_frames,
        eta: "00:00".to_owned(),
    })
    .await;

    let items = aggregator.finalize();
    while let Ok(item) = commit_rx.try_recv() {
        sink.send(Event::SubtitleNew { item }).await;
    }

    if let Some(skipped) = skipped_count {
        sink.send(Event::Log {
            message: format!("Smart Skip: {skipped} frames"),
        })
        .await;
    }

    tokio::fs::write(&params.output_path, srt::format_srt(&items))
        .await
        .map_err(RunOcrError::WriteSrt)?;
    logger.log(
        LogLevel::Info,
        &format!("saved {} cues to {}", items.len(), params.output_path.display()),
    );
    sink.send(Event::Log {
        message: format!("Saved: {}", params.output_path.display()),
    })
    .await;

    Ok(Outcome::Completed)
}

struct FrameItem {
    index: u64,
    timestamp: f64,
    image: Option<RgbImage>,
    skipped: bool,
}

enum ProducerMsg {
    Item(FrameItem),
    /// End of stream. Carries the smart-skip counter or the producer error.
    Done(Result<u64, String>),
}

enum PendingKind {
    /// Reuse the previous OCR result.
    Skipped,
    /// Consumes the next slot of the batch results.
    Recognized,
    /// Empty crop, yields an empty result.
    Empty,
}

struct Pending {
    index: u64,
    timestamp: f64,
    kind: PendingKind,
}

/// Producer loop. Runs on a blocking thread: decodes, filters, and pushes
/// items into the bounded queue, polling the stop signal whenever the queue
/// is full. Always terminates with a `Done` sentinel.
fn produce_frames(
    token: &CancellationToken,
    mut source: Box<dyn FrameSource>,
    mut pipeline: ImagePipeline,
    tx: &mpsc::Sender<ProducerMsg>,
) {
    let mut run = || -> Result<(), String> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            let frame = source.next_frame().map_err(|e| e.to_string())?;
            let Some((index, timestamp, frame)) = frame else {
                return Ok(());
            };
            let (image, skipped) = pipeline.process(&frame);
            if !send_with_retry(
                token,
                tx,
                ProducerMsg::Item(FrameItem {
                    index,
                    timestamp,
                    image,
                    skipped,
                }),
                FULL_QUEUE_POLL,
            ) {
                return Ok(());
            }
        }
    };
    let result = run();
    let done = ProducerMsg::Done(result.map(|()| pipeline.skipped_count()));
    // The sentinel must not be lost; briefly outwait a full queue.
    send_with_retry(token, tx, done, Duration::from_millis(100));
}

/// Returns `false` when the stop signal set or the consumer went away.
fn send_with_retry(
    token: &CancellationToken,
    tx: &mpsc::Sender<ProducerMsg>,
    msg: ProducerMsg,
    poll: Duration,
) -> bool {
    let mut msg = msg;
    loop {
        match tx.try_send(msg) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Full(v)) => {
                if token.is_cancelled() {
                    return false;
                }
                msg = v;
                std::thread::sleep(poll);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
}

struct FlushArgs<'a> {
    engine: &'a Arc<OcrEngine>,
    pending: &'a mut Vec<Pending>,
    valid_frames: &'a mut Vec<RgbImage>,
    aggregator: &'a mut SubtitleAggregator,
    commit_rx: &'a mut mpsc::UnboundedReceiver<SubtitleItem>,
    last_result: &'a mut (String, f32),
    sink: &'a ArcEventSink,
    conf_threshold: f32,
    total_frames: u64,
    started: Instant,
}

/// Runs one inference batch and re-walks the pending items in order,
/// assigning each recognized item the next batch slot.
async fn flush_batch(args: FlushArgs<'_>) -> Result<(), RunOcrError> {
    let results = if args.valid_frames.is_empty() {
        Vec::new()
    } else {
        let engine = args.engine.clone();
        let frames = std::mem::take(args.valid_frames);
        tokio::task::spawn_blocking(move || engine.predict_batch(&frames))
            .await
            .map_err(RunOcrError::Join)?
    };

    let mut res_idx = 0;
    for item in args.pending.drain(..) {
        if item.index > 0 {
            args.sink
                .send(Event::Progress {
                    current: item.index,
                    total: args.total_frames,
                    eta: estimate_eta(args.started, item.index, args.total_frames),
                })
                .await;
        }

        let (text, conf) = match item.kind {
            PendingKind::Skipped => args.last_result.clone(),
            PendingKind::Recognized => {
                let raw = results.get(res_idx).and_then(Option::as_ref);
                res_idx += 1;
                let parsed = parse_recognition(raw, args.conf_threshold);
                *args.last_result = parsed.clone();
                parsed
            }
            PendingKind::Empty => (String::new(), 0.0),
        };

        args.aggregator.add_result(&text, conf, item.timestamp);
        while let Ok(item) = args.commit_rx.try_recv() {
            args.sink.send(Event::SubtitleNew { item }).await;
        }
    }
    Ok(())
}

/// Running-mean ETA as `MM:SS`.
fn estimate_eta(started: Instant, current: u64, total: u64) -> String {
    if current == 0 {
        return "--:--".to_owned();
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let eta_sec = {
        let avg = started.elapsed().as_secs_f64() / current as f64;
        (total.saturating_sub(current) as f64 * avg) as u64
    };
    format!("{:02}:{:02}", eta_sec / 60, eta_sec % 60)
}
