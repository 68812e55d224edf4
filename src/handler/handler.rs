// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::unused_async)]

#[cfg(test)]
mod test;

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use common::{
    config::{BlurSettings, PipelineOverrides, Preset},
    subtitle::SubtitleItem,
    ArcLogger, ClientId, ILogger, LogEntry, LogLevel, Roi, UploadId, VideoMetadata,
    ALLOWED_VIDEO_EXTENSIONS,
};
use event_bus::{ClientSink, EventBus};
use serde::{Deserialize, Serialize};
use session::{SessionManager, StartJobError, StartOcrRequest, StartRenderRequest};
use std::{io::Cursor, path::PathBuf, sync::Arc};
use storage::ArcObjectStore;
use tokio_util::io::ReaderStream;
use upload::UploadManager;

/// Presign lifetime for download redirects.
const PRESIGN_TTL_SEC: u64 = 3600;

#[derive(Clone)]
pub struct ApiState {
    pub logger: ArcLogger,
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionManager>,
    pub uploads: Arc<UploadManager>,
    pub store: ArcObjectStore,
    pub cache_dir: PathBuf,
}

impl ApiState {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(LogEntry::new(level, "api", msg.to_owned()));
    }

    fn cached_file(&self, filename: &str) -> Option<PathBuf> {
        let name = std::path::Path::new(filename).file_name()?;
        let path = self.cache_dir.join(name);
        path.is_file().then_some(path)
    }
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, msg.into())
}

fn not_found(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, msg.into())
}

fn internal(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, msg.into())
}

fn allowed_extension(filename: &str) -> Option<String> {
    let ext = std::path::Path::new(filename)
        .extension()?
        .to_string_lossy()
        .to_lowercase();
    ALLOWED_VIDEO_EXTENSIONS
        .contains(&ext.as_str())
        .then_some(ext)
}

#[derive(Default)]
struct UploadForm {
    data: Vec<u8>,
    upload_id: Option<String>,
    chunk_index: Option<u32>,
    total_chunks: Option<u32>,
    filename: Option<String>,
    client_id: Option<String>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("read multipart: {e}")))?
    {
        let Some(name) = field.name().map(ToOwned::to_owned) else {
            continue;
        };
        match name.as_str() {
            "file" => {
                form.data = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("read chunk: {e}")))?
                    .to_vec();
            }
            "upload_id" => form.upload_id = Some(text_field(field).await?),
            "chunk_index" => form.chunk_index = Some(parse_field(field, "chunk_index").await?),
            "total_chunks" => form.total_chunks = Some(parse_field(field, "total_chunks").await?),
            "filename" => form.filename = Some(text_field(field).await?),
            "client_id" => form.client_id = Some(text_field(field).await?),
            _ => {}
        }
    }
    Ok(form)
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| bad_request(format!("read field: {e}")))
}

async fn parse_field(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<u32, ApiError> {
    text_field(field)
        .await?
        .parse()
        .map_err(|e| bad_request(format!("parse {name}: {e}")))
}

#[derive(Serialize)]
#[serde(untagged)]
enum UploadResponse {
    ChunkReceived { status: &'static str, chunk: u32 },
    Complete(VideoMetadata),
}

/// `POST /upload`. Chunked upload with validation and, on the final chunk,
/// assembly, probing, and an automatic H.264 conversion fallback for
/// containers the decoder rejects.
pub async fn upload_handler(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Response, Response> {
    let form = read_upload_form(multipart)
        .await
        .map_err(IntoResponse::into_response)?;

    let upload_id: UploadId = form
        .upload_id
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| bad_request("invalid upload_id format").into_response())?;
    let filename = form.filename.unwrap_or_default();
    let ext = allowed_extension(&filename).ok_or_else(|| {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!(
                "extension not allowed, supported: {}",
                ALLOWED_VIDEO_EXTENSIONS.join(", ")
            ),
        )
            .into_response()
    })?;
    let (Some(chunk_index), Some(total_chunks)) = (form.chunk_index, form.total_chunks) else {
        return Err(bad_request("missing chunk fields").into_response());
    };

    {
        let uploads = state.uploads.clone();
        let upload_id = upload_id.clone();
        let data = form.data;
        tokio::task::spawn_blocking(move || uploads.save_chunk(&upload_id, chunk_index, &data))
            .await
            .map_err(|e| internal(e.to_string()).into_response())?
            .map_err(|e| internal(format!("save chunk: {e}")).into_response())?;
    }

    if !state.uploads.is_complete(&upload_id, total_chunks) {
        return Ok(Json(UploadResponse::ChunkReceived {
            status: "chunk_received",
            chunk: chunk_index,
        })
        .into_response());
    }

    // Final chunk: assemble and validate.
    let final_name = format!("{upload_id}.{ext}");
    let final_path = {
        let uploads = state.uploads.clone();
        let upload_id = upload_id.clone();
        let final_name = final_name.clone();
        tokio::task::spawn_blocking(move || uploads.assemble(&upload_id, total_chunks, &final_name))
            .await
            .map_err(|e| internal(e.to_string()).into_response())?
            .map_err(|e| internal(format!("assemble: {e}")).into_response())?
    };

    let metadata = match probe_blocking(final_path.clone()).await {
        Some(metadata) => metadata,
        None => {
            // The container didn't decode; try converting before giving up.
            state.log(
                LogLevel::Warning,
                &format!("'{final_name}' failed to decode, attempting H.264 conversion"),
            );
            if let Some(client_id) = form.client_id.as_deref().and_then(|v| v.parse().ok()) {
                state
                    .bus
                    .send(
                        &client_id,
                        &common::Event::Log {
                            message: "CONVERTING_CODEC".to_owned(),
                        },
                    )
                    .await;
            }
            match convert_upload(&state, &final_path).await {
                Some(metadata) => metadata,
                None => {
                    let _ = tokio::fs::remove_file(&final_path).await;
                    return Err(bad_request(
                        "invalid video format or unsupported codec, automatic conversion failed",
                    )
                    .into_response());
                }
            }
        }
    };

    // Mirror the finished file into the object store; local mode no-ops.
    let key = metadata.filename.clone();
    let stored_path = state.cache_dir.join(&metadata.filename);
    if !state.store.upload(&stored_path, &key).await {
        state.log(
            LogLevel::Warning,
            &format!("object store upload failed for '{key}'"),
        );
    }

    Ok(Json(UploadResponse::Complete(metadata)).into_response())
}

async fn probe_blocking(path: PathBuf) -> Option<VideoMetadata> {
    tokio::task::spawn_blocking(move || video::probe(&path).ok())
        .await
        .ok()
        .flatten()
}

async fn convert_upload(state: &ApiState, path: &std::path::Path) -> Option<VideoMetadata> {
    let converted = match video::convert_to_h264(path).await {
        Ok(v) => v,
        Err(e) => {
            state.log(LogLevel::Error, &format!("conversion failed: {e}"));
            return None;
        }
    };
    let metadata = probe_blocking(converted.clone()).await?;
    let _ = tokio::fs::remove_file(path).await;
    Some(metadata)
}

#[derive(Deserialize)]
pub struct UploadStatusQuery {
    total_chunks: u32,
}

#[derive(Serialize)]
struct UploadStatusResponse {
    missing_chunks: Vec<u32>,
}

/// `GET /upload/status/{upload_id}?total_chunks=N`.
pub async fn upload_status_handler(
    State(state): State<ApiState>,
    Path(upload_id): Path<String>,
    Query(query): Query<UploadStatusQuery>,
) -> Response {
    let Ok(upload_id) = upload_id.parse::<UploadId>() else {
        return bad_request("invalid upload_id format").into_response();
    };
    let missing = state.uploads.missing_chunks(&upload_id, query.total_chunks);
    Json(UploadStatusResponse {
        missing_chunks: missing,
    })
    .into_response()
}

#[derive(Deserialize)]
pub struct ProcessConfig {
    pub client_id: ClientId,
    pub filename: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub roi: Roi,
    #[serde(default)]
    pub preset: Preset,
    #[serde(default)]
    pub overrides: PipelineOverrides,
}

fn default_lang() -> String {
    "en".to_owned()
}

/// `POST /process/start`.
pub async fn process_start_handler(
    State(state): State<ApiState>,
    Json(config): Json<ProcessConfig>,
) -> Response {
    let sink = ClientSink::new(state.bus.clone(), config.client_id.clone());
    let request = StartOcrRequest {
        client_id: config.client_id.clone(),
        filename: config.filename,
        lang: config.lang,
        roi: config.roi,
        preset: config.preset,
        overrides: config.overrides,
    };
    match state.sessions.start_ocr(request, sink).await {
        Ok(_) => Json(serde_json::json!({
            "status": "started",
            "job_id": config.client_id,
        }))
        .into_response(),
        Err(e @ StartJobError::VideoNotFound(_)) => not_found(e.to_string()).into_response(),
        Err(e) => internal(e.to_string()).into_response(),
    }
}

/// `POST /process/stop/{client_id}`.
pub async fn process_stop_handler(
    State(state): State<ApiState>,
    Path(client_id): Path<String>,
) -> Response {
    let Ok(client_id) = client_id.parse::<ClientId>() else {
        return bad_request("invalid client_id format").into_response();
    };
    let (ocr_stopped, render_stopped) = state.sessions.stop_all(&client_id).await;
    Json(serde_json::json!({
        "status": "stopped",
        "ocr_stopped": ocr_stopped,
        "render_stopped": render_stopped,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct RenderConfig {
    pub client_id: ClientId,
    pub filename: String,
    pub subtitles: Vec<SubtitleItem>,
    #[serde(default)]
    pub blur_settings: BlurSettings,
}

/// `POST /process/render_blur`.
pub async fn render_blur_handler(
    State(state): State<ApiState>,
    Json(config): Json<RenderConfig>,
) -> Response {
    let sink = ClientSink::new(state.bus.clone(), config.client_id.clone());
    let request = StartRenderRequest {
        client_id: config.client_id,
        filename: config.filename,
        subtitles: config.subtitles,
        settings: config.blur_settings,
    };
    match state.sessions.start_render(request, sink).await {
        Ok(output) => Json(serde_json::json!({
            "status": "rendering_started",
            "output": output,
        }))
        .into_response(),
        Err(e @ StartJobError::VideoNotFound(_)) => not_found(e.to_string()).into_response(),
        Err(e) => internal(e.to_string()).into_response(),
    }
}

/// `POST /process/import_srt`. Returns the parsed cues; blocks that fail
/// to parse are dropped by the parser.
pub async fn import_srt_handler(mut multipart: Multipart) -> Response {
    let mut content: Option<Vec<u8>> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => match field.bytes().await {
                Ok(bytes) => content = Some(bytes.to_vec()),
                Err(e) => return bad_request(format!("read file: {e}")).into_response(),
            },
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => return bad_request(format!("read multipart: {e}")).into_response(),
        }
    }
    let Some(content) = content else {
        return bad_request("missing file field").into_response();
    };
    let Ok(text) = String::from_utf8(content) else {
        return bad_request("invalid file encoding").into_response();
    };
    Json(subtitle::srt::parse_srt(&text)).into_response()
}

#[derive(Deserialize)]
pub struct BlurPreviewConfig {
    pub filename: String,
    pub frame_index: u64,
    #[serde(default)]
    pub blur_settings: BlurSettings,
    pub subtitle_text: String,
}

/// `POST /process/preview_blur`. One frame with the requested obscuring
/// applied, as JPEG.
pub async fn preview_blur_handler(
    State(state): State<ApiState>,
    Json(config): Json<BlurPreviewConfig>,
) -> Response {
    let Some(path) = state.cached_file(&config.filename) else {
        return not_found("video file not found").into_response();
    };

    let preview = tokio::task::spawn_blocking(move || {
        let mut frame = video::extract_frame(&path, config.frame_index)?;
        let roi = blur::calculate_blur_roi(
            &config.subtitle_text,
            frame.width(),
            frame.height(),
            &config.blur_settings,
        );
        blur::apply_blur_to_frame(
            &mut frame,
            roi,
            &config.blur_settings,
            None,
            &filters::SelectiveBackend::cpu_only(),
        );
        Some(frame)
    })
    .await;

    match preview {
        Ok(Some(frame)) => jpeg_response(&frame),
        Ok(None) => not_found("frame not found").into_response(),
        Err(e) => internal(e.to_string()).into_response(),
    }
}

/// `GET /video/frame/{filename}/{frame_index}`. Raw frame as JPEG via the
/// retry-hardened extractor.
pub async fn frame_handler(
    State(state): State<ApiState>,
    Path((filename, frame_index)): Path<(String, u64)>,
) -> Response {
    let Some(path) = state.cached_file(&filename) else {
        return not_found("video file not found").into_response();
    };
    let frame = tokio::task::spawn_blocking(move || video::extract_frame(&path, frame_index)).await;
    match frame {
        Ok(Some(frame)) => jpeg_response(&frame),
        Ok(None) => not_found("frame not found").into_response(),
        Err(e) => internal(e.to_string()).into_response(),
    }
}

fn jpeg_response(frame: &image::RgbImage) -> Response {
    let mut buf = Cursor::new(Vec::new());
    if image::DynamicImage::ImageRgb8(frame.clone())
        .write_to(&mut buf, image::ImageFormat::Jpeg)
        .is_err()
    {
        return internal("encode jpeg").into_response();
    }
    ([(header::CONTENT_TYPE, "image/jpeg")], buf.into_inner()).into_response()
}

/// `GET /video/download/{filename}`. Redirects to a presigned URL when the
/// object store can mint one, else streams the cached file.
pub async fn download_handler(
    State(state): State<ApiState>,
    Path(filename): Path<String>,
) -> Response {
    let Some(path) = state.cached_file(&filename) else {
        return not_found("file not found").into_response();
    };
    let key = path
        .file_name()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_default();

    if let Some(url) = state.store.presign(&key, PRESIGN_TTL_SEC).await {
        return Redirect::temporary(&url).into_response();
    }

    let file = match tokio::fs::File::open(&path).await {
        Ok(v) => v,
        Err(e) => return internal(format!("open file: {e}")).into_response(),
    };
    let stream = ReaderStream::new(file);
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{key}\""),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// `WS /ws/{client_id}`.
pub async fn ws_handler(
    State(state): State<ApiState>,
    Path(client_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Ok(client_id) = client_id.parse::<ClientId>() else {
        return bad_request("invalid client_id format").into_response();
    };
    let bus = state.bus.clone();
    upgrade.on_upgrade(move |socket| async move { bus.run_connection(client_id, socket).await })
}
