// SPDX-License-Identifier: GPL-2.0-or-later

use blur::RenderParams;
use common::{
    config::{BlurSettings, PipelineOverrides, Preset},
    subtitle::SubtitleItem,
    ArcEventSink, ArcLogger, ClientId, ILogger, LogLevel, Roi,
};
use log::SourceLogger;
use ocr::{EngineCache, OcrWorkerParams};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Teardown join budget: attempts x timeout. A worker still alive after
/// this is abandoned; it is expected to exit on its own.
const JOIN_ATTEMPTS: u32 = 3;
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy)]
enum JobKind {
    Ocr,
    Render,
}

impl JobKind {
    fn name(self) -> &'static str {
        match self {
            JobKind::Ocr => "ocr",
            JobKind::Render => "render",
        }
    }
}

struct WorkerHandle {
    token: CancellationToken,
    done: mpsc::Receiver<()>,
}

#[derive(Default)]
struct Registry {
    session_locks: HashMap<ClientId, Arc<tokio::sync::Mutex<()>>>,
    ocr: HashMap<ClientId, WorkerHandle>,
    render: HashMap<ClientId, WorkerHandle>,
}

/// Per-client registry of jobs. At most one OCR worker and one blur
/// renderer per session; starting a new job of a kind synchronously stops
/// the previous one. Different sessions never block each other.
pub struct SessionManager {
    token: CancellationToken,
    logger: ArcLogger,
    engines: Arc<EngineCache>,
    cache_dir: PathBuf,
    registry: Mutex<Registry>,
}

#[derive(Debug, Error)]
pub enum StartJobError {
    #[error("video file not found: {0}")]
    VideoNotFound(String),

    #[error("remove stale artifact: {0}")]
    RemoveArtifact(std::io::Error),
}

#[derive(Clone, Debug)]
pub struct StartOcrRequest {
    pub client_id: ClientId,
    pub filename: String,
    pub lang: String,
    pub roi: Roi,
    pub preset: Preset,
    pub overrides: PipelineOverrides,
}

#[derive(Clone, Debug)]
pub struct StartRenderRequest {
    pub client_id: ClientId,
    pub filename: String,
    pub subtitles: Vec<SubtitleItem>,
    pub settings: BlurSettings,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        token: CancellationToken,
        logger: ArcLogger,
        engines: Arc<EngineCache>,
        cache_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            logger,
            engines,
            cache_dir,
            registry: Mutex::new(Registry::default()),
        })
    }

    fn session_lock(&self, client_id: &ClientId) -> Arc<tokio::sync::Mutex<()>> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .session_locks
            .entry(client_id.clone())
            .or_default()
            .clone()
    }

    fn take_handle(&self, kind: JobKind, client_id: &ClientId) -> Option<WorkerHandle> {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match kind {
            JobKind::Ocr => registry.ocr.remove(client_id),
            JobKind::Render => registry.render.remove(client_id),
        }
    }

    fn insert_handle(&self, kind: JobKind, client_id: ClientId, handle: WorkerHandle) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match kind {
            JobKind::Ocr => registry.ocr.insert(client_id, handle),
            JobKind::Render => registry.render.insert(client_id, handle),
        };
    }

    /// Starts an OCR job, replacing any running one for this session.
    /// Returns the path the SRT artifact will be written to.
    pub async fn start_ocr(
        &self,
        req: StartOcrRequest,
        sink: ArcEventSink,
    ) -> Result<PathBuf, StartJobError> {
        let session_lock = self.session_lock(&req.client_id);
        let _guard = session_lock.lock().await;

        if let Some(handle) = self.take_handle(JobKind::Ocr, &req.client_id) {
            self.teardown(JobKind::Ocr, &req.client_id, handle).await;
        }

        let video_path = self.video_path(&req.filename)?;
        let output_path = video_path.with_extension("srt");
        remove_stale(&output_path)?;

        let worker_token = self.token.child_token();
        let logger = SourceLogger::new(self.logger.clone(), "ocr", Some(req.client_id.clone()));
        let done = ocr::start_ocr_worker(
            worker_token.clone(),
            logger,
            sink,
            self.engines.clone(),
            OcrWorkerParams {
                video_path,
                output_path: output_path.clone(),
                lang: req.lang,
                roi: req.roi,
                preset: req.preset,
                overrides: req.overrides,
            },
        );
        self.insert_handle(
            JobKind::Ocr,
            req.client_id,
            WorkerHandle {
                token: worker_token,
                done,
            },
        );
        Ok(output_path)
    }

    /// Stops the session's OCR worker. Returns whether one existed.
    pub async fn stop_ocr(&self, client_id: &ClientId) -> bool {
        let session_lock = self.session_lock(client_id);
        let _guard = session_lock.lock().await;

        let Some(handle) = self.take_handle(JobKind::Ocr, client_id) else {
            return false;
        };
        self.teardown(JobKind::Ocr, client_id, handle).await;
        true
    }

    /// Starts a render job, replacing any running one for this session.
    /// Returns the output filename.
    pub async fn start_render(
        &self,
        req: StartRenderRequest,
        sink: ArcEventSink,
    ) -> Result<String, StartJobError> {
        let session_lock = self.session_lock(&req.client_id);
        let _guard = session_lock.lock().await;

        if let Some(handle) = self.take_handle(JobKind::Render, &req.client_id) {
            self.teardown(JobKind::Render, &req.client_id, handle).await;
        }

        let video_path = self.video_path(&req.filename)?;
        let output_filename = format!(
            "blurred_{}",
            video_path
                .file_name()
                .map(|v| v.to_string_lossy().to_string())
                .unwrap_or_default()
        );
        let output_path = self.cache_dir.join(&output_filename);
        remove_stale(&output_path)?;

        let worker_token = self.token.child_token();
        let logger = SourceLogger::new(self.logger.clone(), "render", Some(req.client_id.clone()));
        let done = blur::start_render_worker(
            worker_token.clone(),
            logger,
            sink,
            RenderParams {
                video_path,
                output_path,
                download_url: format!("/video/download/{output_filename}"),
                subtitles: req.subtitles,
                settings: req.settings,
            },
        );
        self.insert_handle(
            JobKind::Render,
            req.client_id,
            WorkerHandle {
                token: worker_token,
                done,
            },
        );
        Ok(output_filename)
    }

    /// Stops the session's renderer. Returns whether one existed.
    pub async fn stop_render(&self, client_id: &ClientId) -> bool {
        let session_lock = self.session_lock(client_id);
        let _guard = session_lock.lock().await;

        let Some(handle) = self.take_handle(JobKind::Render, client_id) else {
            return false;
        };
        self.teardown(JobKind::Render, client_id, handle).await;
        true
    }

    /// Stops both job kinds. Returns `(ocr_stopped, render_stopped)`.
    pub async fn stop_all(&self, client_id: &ClientId) -> (bool, bool) {
        let ocr_stopped = self.stop_ocr(client_id).await;
        let render_stopped = self.stop_render(client_id).await;
        (ocr_stopped, render_stopped)
    }

    /// Cancels every worker and waits for each within the join budget.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let (ocr, render) = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (
                std::mem::take(&mut registry.ocr),
                std::mem::take(&mut registry.render),
            )
        };
        for (client_id, handle) in ocr {
            self.teardown(JobKind::Ocr, &client_id, handle).await;
        }
        for (client_id, handle) in render {
            self.teardown(JobKind::Render, &client_id, handle).await;
        }
    }

    fn video_path(&self, filename: &str) -> Result<PathBuf, StartJobError> {
        // Strip any path components.
        let name = Path::new(filename)
            .file_name()
            .map(|v| v.to_string_lossy().to_string())
            .unwrap_or_default();
        let path = self.cache_dir.join(name);
        if !path.is_file() {
            return Err(StartJobError::VideoNotFound(filename.to_owned()));
        }
        Ok(path)
    }

    /// Signals the worker and joins it with a bounded budget. A stuck
    /// worker is abandoned so new work on the session isn't blocked.
    async fn teardown(&self, kind: JobKind, client_id: &ClientId, mut handle: WorkerHandle) {
        handle.token.cancel();
        for _ in 0..JOIN_ATTEMPTS {
            if tokio::time::timeout(JOIN_TIMEOUT, handle.done.recv())
                .await
                .is_ok()
            {
                self.log(
                    LogLevel::Debug,
                    client_id,
                    &format!("{} worker stopped", kind.name()),
                );
                return;
            }
        }
        self.log(
            LogLevel::Error,
            client_id,
            &format!(
                "{} worker did not terminate within the join budget, abandoning it",
                kind.name()
            ),
        );
    }

    fn log(&self, level: LogLevel, client_id: &ClientId, msg: &str) {
        self.logger.log(common::LogEntry::for_client(
            level,
            "session",
            client_id.clone(),
            msg.to_owned(),
        ));
    }
}

/// Pre-existing output artifacts are deleted so runs never mix.
fn remove_stale(path: &Path) -> Result<(), StartJobError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StartJobError::RemoveArtifact(e)),
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use common::{DummyEventSink, DummyLogger};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn new_manager() -> (TempDir, Arc<SessionManager>) {
        let temp_dir = TempDir::new().unwrap();
        let manager = SessionManager::new(
            CancellationToken::new(),
            DummyLogger::new(),
            EngineCache::noop(),
            temp_dir.path().to_path_buf(),
        );
        (temp_dir, manager)
    }

    fn client(s: &str) -> ClientId {
        s.parse().unwrap()
    }

    fn ocr_request(client_id: &str, filename: &str) -> StartOcrRequest {
        StartOcrRequest {
            client_id: client(client_id),
            filename: filename.to_owned(),
            lang: "en".to_owned(),
            roi: Roi::default(),
            preset: Preset::Balance,
            overrides: PipelineOverrides::default(),
        }
    }

    #[tokio::test]
    async fn start_ocr_missing_video() {
        let (_temp_dir, manager) = new_manager();
        assert!(matches!(
            manager
                .start_ocr(ocr_request("c1", "absent.mp4"), DummyEventSink::new())
                .await,
            Err(StartJobError::VideoNotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_without_worker_returns_false() {
        let (_temp_dir, manager) = new_manager();
        assert!(!manager.stop_ocr(&client("c1")).await);
        assert!(!manager.stop_render(&client("c1")).await);
        assert_eq!((false, false), manager.stop_all(&client("c1")).await);
    }

    #[tokio::test]
    async fn start_deletes_stale_artifact_and_registers_worker() {
        let (temp_dir, manager) = new_manager();
        // Not a real video; the worker will fail to open it, which is fine
        // for lifecycle testing.
        std::fs::write(temp_dir.path().join("clip.mp4"), b"junk").unwrap();
        std::fs::write(temp_dir.path().join("clip.srt"), b"old").unwrap();

        let output = manager
            .start_ocr(ocr_request("c1", "clip.mp4"), DummyEventSink::new())
            .await
            .unwrap();
        assert_eq!(temp_dir.path().join("clip.srt"), output);
        assert!(!output.exists(), "stale artifact should be removed");

        // A worker exists now, so stop reports true.
        assert!(manager.stop_ocr(&client("c1")).await);
        // And it is gone afterwards.
        assert!(!manager.stop_ocr(&client("c1")).await);
    }

    #[tokio::test]
    async fn restart_replaces_worker() {
        let (temp_dir, manager) = new_manager();
        std::fs::write(temp_dir.path().join("clip.mp4"), b"junk").unwrap();

        manager
            .start_ocr(ocr_request("c1", "clip.mp4"), DummyEventSink::new())
            .await
            .unwrap();
        // Second start for the same session must not error and must leave
        // exactly one registered worker.
        manager
            .start_ocr(ocr_request("c1", "clip.mp4"), DummyEventSink::new())
            .await
            .unwrap();

        assert!(manager.stop_ocr(&client("c1")).await);
        assert!(!manager.stop_ocr(&client("c1")).await);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let (temp_dir, manager) = new_manager();
        std::fs::write(temp_dir.path().join("clip.mp4"), b"junk").unwrap();

        manager
            .start_ocr(ocr_request("c1", "clip.mp4"), DummyEventSink::new())
            .await
            .unwrap();
        manager
            .start_ocr(ocr_request("c2", "clip.mp4"), DummyEventSink::new())
            .await
            .unwrap();

        assert!(manager.stop_ocr(&client("c1")).await);
        assert!(manager.stop_ocr(&client("c2")).await);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let (temp_dir, manager) = new_manager();
        std::fs::write(temp_dir.path().join("clip.mp4"), b"junk").unwrap();

        manager
            .start_ocr(ocr_request("c1", "clip.mp4"), DummyEventSink::new())
            .await
            .unwrap();
        manager.shutdown().await;
        assert!(!manager.stop_ocr(&client("c1")).await);
    }

    #[tokio::test]
    async fn stop_within_join_budget() {
        let (temp_dir, manager) = new_manager();
        std::fs::write(temp_dir.path().join("clip.mp4"), b"junk").unwrap();

        manager
            .start_ocr(ocr_request("c1", "clip.mp4"), DummyEventSink::new())
            .await
            .unwrap();

        let started = std::time::Instant::now();
        assert!(manager.stop_ocr(&client("c1")).await);
        assert!(started.elapsed() < Duration::from_secs(6));
    }
}
