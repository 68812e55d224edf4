// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::unwrap_used)]

use crate::{
    download_handler, frame_handler, process_start_handler, process_stop_handler,
    render_blur_handler, upload_status_handler, ApiState, ProcessConfig, RenderConfig,
    UploadStatusQuery,
};
use axum::{
    body::to_bytes,
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use common::{config::Preset, DummyLogger};
use event_bus::EventBus;
use http::{header, StatusCode};
use ocr::EngineCache;
use pretty_assertions::assert_eq;
use session::SessionManager;
use std::sync::Arc;
use storage::new_object_store;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use upload::UploadManager;

fn new_state() -> (TempDir, ApiState) {
    let temp_dir = TempDir::new().unwrap();
    let cache_dir = temp_dir.path().to_path_buf();
    let state = ApiState {
        logger: DummyLogger::new(),
        bus: EventBus::new(DummyLogger::new()),
        sessions: SessionManager::new(
            CancellationToken::new(),
            DummyLogger::new(),
            EngineCache::noop(),
            cache_dir.clone(),
        ),
        uploads: Arc::new(UploadManager::new(&cache_dir).unwrap()),
        store: new_object_store(None, DummyLogger::new()),
        cache_dir,
    };
    (temp_dir, state)
}

#[tokio::test]
async fn upload_status_reports_missing() {
    let (_temp_dir, state) = new_state();
    state
        .uploads
        .save_chunk(&"up-1".parse().unwrap(), 1, b"x")
        .unwrap();

    let response = upload_status_handler(
        State(state),
        Path("up-1".to_owned()),
        Query(UploadStatusQuery { total_chunks: 3 }),
    )
    .await
    .into_response();

    assert_eq!(StatusCode::OK, response.status());
    assert_eq!(
        r#"{"missing_chunks":[0,2]}"#,
        to_bytes(response.into_body(), usize::MAX).await.unwrap()
    );
}

#[tokio::test]
async fn upload_status_rejects_bad_id() {
    let (_temp_dir, state) = new_state();
    let response = upload_status_handler(
        State(state),
        Path("../etc".to_owned()),
        Query(UploadStatusQuery { total_chunks: 1 }),
    )
    .await
    .into_response();
    assert_eq!(StatusCode::BAD_REQUEST, response.status());
}

#[tokio::test]
async fn process_start_missing_video_is_404() {
    let (_temp_dir, state) = new_state();
    let response = process_start_handler(
        State(state),
        Json(ProcessConfig {
            client_id: "c1".parse().unwrap(),
            filename: "absent.mp4".to_owned(),
            lang: "en".to_owned(),
            roi: common::Roi::default(),
            preset: Preset::Balance,
            overrides: common::config::PipelineOverrides::default(),
        }),
    )
    .await
    .into_response();
    assert_eq!(StatusCode::NOT_FOUND, response.status());
}

#[tokio::test]
async fn process_stop_without_workers() {
    let (_temp_dir, state) = new_state();
    let response = process_stop_handler(State(state), Path("c1".to_owned()))
        .await
        .into_response();

    assert_eq!(StatusCode::OK, response.status());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!("stopped", value["status"]);
    assert_eq!(false, value["ocr_stopped"]);
    assert_eq!(false, value["render_stopped"]);
}

#[tokio::test]
async fn process_stop_rejects_bad_id() {
    let (_temp_dir, state) = new_state();
    let response = process_stop_handler(State(state), Path("a b".to_owned()))
        .await
        .into_response();
    assert_eq!(StatusCode::BAD_REQUEST, response.status());
}

#[tokio::test]
async fn render_missing_video_is_404() {
    let (_temp_dir, state) = new_state();
    let response = render_blur_handler(
        State(state),
        Json(RenderConfig {
            client_id: "c1".parse().unwrap(),
            filename: "absent.mp4".to_owned(),
            subtitles: Vec::new(),
            blur_settings: common::config::BlurSettings::default(),
        }),
    )
    .await
    .into_response();
    assert_eq!(StatusCode::NOT_FOUND, response.status());
}

#[tokio::test]
async fn download_missing_file_is_404() {
    let (_temp_dir, state) = new_state();
    let response = download_handler(State(state), Path("nope.mp4".to_owned()))
        .await
        .into_response();
    assert_eq!(StatusCode::NOT_FOUND, response.status());
}

#[tokio::test]
async fn download_streams_local_file() {
    let (temp_dir, state) = new_state();
    std::fs::write(temp_dir.path().join("clip.mp4"), b"content").unwrap();

    let response = download_handler(State(state), Path("clip.mp4".to_owned()))
        .await
        .into_response();

    assert_eq!(StatusCode::OK, response.status());
    assert_eq!(
        "application/octet-stream",
        response.headers().get(header::CONTENT_TYPE).unwrap()
    );
    assert_eq!(
        "content",
        to_bytes(response.into_body(), usize::MAX).await.unwrap()
    );
}

#[tokio::test]
async fn download_rejects_path_traversal() {
    let (temp_dir, state) = new_state();
    std::fs::write(temp_dir.path().join("clip.mp4"), b"content").unwrap();

    // Only the basename is honored, so this resolves to the cached file
    // rather than escaping the cache directory.
    let response = download_handler(State(state), Path("../clip.mp4".to_owned()))
        .await
        .into_response();
    assert_eq!(StatusCode::OK, response.status());
}

#[tokio::test]
async fn frame_missing_video_is_404() {
    let (_temp_dir, state) = new_state();
    let response = frame_handler(State(state), Path(("nope.mp4".to_owned(), 0)))
        .await
        .into_response();
    assert_eq!(StatusCode::NOT_FOUND, response.status());
}

#[test]
fn process_config_accepts_minimal_json() {
    let config: ProcessConfig = serde_json::from_str(
        r#"{"client_id": "c1", "filename": "clip.mp4"}"#,
    )
    .unwrap();
    assert_eq!("en", config.lang);
    assert_eq!(Preset::Balance, config.preset);
}

#[test]
fn process_config_rejects_unknown_override() {
    let result = serde_json::from_str::<ProcessConfig>(
        r#"{"client_id": "c1", "filename": "clip.mp4", "overrides": {"clahe": 1.0}}"#,
    );
    assert!(result.is_err());
}
