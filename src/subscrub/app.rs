// SPDX-License-Identifier: GPL-2.0-or-later

use crate::cleanup;
use axum::{
    routing::{get, post},
    Router,
};
use common::{ArcLogger, EnvConfig, ILogger, LogEntry, LogLevel};
use env::{EnvConf, EnvConfigNewError};
use event_bus::EventBus;
use handler::ApiState;
use http::HeaderValue;
use log::Logger;
use ocr::EngineCache;
use session::SessionManager;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    signal,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use upload::{NewUploadManagerError, UploadManager};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("create env config: {0}")]
    NewEnvConfig(#[from] EnvConfigNewError),

    #[error("create upload manager: {0}")]
    NewUploadManager(#[from] NewUploadManagerError),

    #[error("listen on sigterm: {0}")]
    SigTermListener(std::io::Error),
}

pub async fn run() -> Result<(), RunError> {
    let mut app = App::new()?;
    let router = app.setup_routes();

    // Block until the app stops.
    let mut shutdown_complete_rx = app.run(router).await?;
    shutdown_complete_rx.recv().await;

    Ok(())
}

pub struct App {
    token: CancellationToken,
    env: EnvConf,
    logger: ArcLogger,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    state: ApiState,
}

impl App {
    pub fn new() -> Result<Self, RunError> {
        let token = CancellationToken::new();
        let env = EnvConf::new()?;
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel::<()>(1);

        let logger: ArcLogger = Arc::new(Logger::new());
        let bus = EventBus::new(log::SourceLogger::new(logger.clone(), "ws", None));

        let engines = EngineCache::noop();
        let sessions = SessionManager::new(
            token.child_token(),
            logger.clone(),
            engines,
            env.cache_dir().to_path_buf(),
        );
        let uploads = Arc::new(UploadManager::new(env.cache_dir())?);
        let store = storage::new_object_store(
            env.s3(),
            log::SourceLogger::new(logger.clone(), "storage", None),
        );

        let state = ApiState {
            logger: logger.clone(),
            bus,
            sessions,
            uploads,
            store,
            cache_dir: env.cache_dir().to_path_buf(),
        };

        Ok(Self {
            token,
            env,
            logger,
            shutdown_complete_tx,
            shutdown_complete_rx,
            state,
        })
    }

    pub fn setup_routes(&mut self) -> Router {
        let router = Router::new()
            // Chunked upload.
            .route("/upload", post(handler::upload_handler))
            .route(
                "/upload/status/{upload_id}",
                get(handler::upload_status_handler),
            )
            // OCR jobs.
            .route("/process/start", post(handler::process_start_handler))
            .route(
                "/process/stop/{client_id}",
                post(handler::process_stop_handler),
            )
            .route(
                "/process/render_blur",
                post(handler::render_blur_handler),
            )
            .route("/process/import_srt", post(handler::import_srt_handler))
            .route(
                "/process/preview_blur",
                post(handler::preview_blur_handler),
            )
            // Video access.
            .route(
                "/video/frame/{filename}/{frame_index}",
                get(handler::frame_handler),
            )
            .route(
                "/video/download/{filename}",
                get(handler::download_handler),
            )
            // Event feed.
            .route("/ws/{client_id}", get(handler::ws_handler))
            .with_state(self.state.clone());

        router.layer(cors_layer(self.env.allowed_origins()))
    }

    // `App` must be dropped when this returns.
    pub async fn run(self, router: Router) -> Result<mpsc::Receiver<()>, RunError> {
        // Cache sweeper.
        {
            let token = self.token.child_token();
            let logger = self.logger.clone();
            let cache_dir = self.env.cache_dir().to_path_buf();
            let uploads = self.state.uploads.clone();
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                let _shutdown_complete = shutdown_complete_tx;
                cleanup::sweep_loop(token, logger, cache_dir, uploads).await;
            });
        }

        self.logger.log(LogEntry::new(
            LogLevel::Info,
            "app",
            format!("serving on port {}", self.env.port()),
        ));

        // Stop workers when the root token cancels.
        {
            let token = self.token.clone();
            let sessions = self.state.sessions.clone();
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                sessions.shutdown().await;
                drop(shutdown_complete_tx);
            });
        }

        let (server_exited_tx, server_exited_rx) = oneshot::channel();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), self.env.port());
        tokio::spawn(start_server(
            self.token.child_token(),
            self.shutdown_complete_tx.clone(),
            server_exited_tx,
            addr,
            router,
        ));

        // Shutdown conditions.
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(RunError::SigTermListener)?;
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    match result {
                        Ok(()) => eprintln!("\nreceived interrupt, stopping..\n"),
                        Err(e) => eprintln!("\ninterrupt error: {e}"),
                    }
                }
                _ = sigterm.recv() => eprintln!("\nreceived terminate, stopping..\n"),
                res = server_exited_rx => {
                    if let Err(e) = res {
                        eprintln!("server error: {e}");
                    }
                },
            }
            token.cancel();
        });

        Ok(self.shutdown_complete_rx)
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|v| HeaderValue::from_str(v).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

#[derive(Debug, Error)]
enum ServerError {
    #[error("bind: {0}")]
    Bind(std::io::Error),

    #[error("{0}")]
    Server(std::io::Error),
}

async fn start_server(
    token: CancellationToken,
    _shutdown_complete: mpsc::Sender<()>,
    on_exit: oneshot::Sender<Result<(), ServerError>>,
    addr: SocketAddr,
    router: Router,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(v) => v,
        Err(e) => {
            let _ = on_exit.send(Err(ServerError::Bind(e)));
            return;
        }
    };
    let graceful = axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await });
    let _ = on_exit.send(graceful.await.map_err(ServerError::Server));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_layer_tolerates_bad_origins() {
        // The layer type has no inspectable state; this guards against
        // panics in header parsing.
        let _ = cors_layer(&[]);
        let _ = cors_layer(&["http://localhost:7860".to_owned()]);
        let _ = cors_layer(&["not a header value\n".to_owned()]);
    }
}
