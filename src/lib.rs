//! ingestd — chunked file ingestion core
//!
//! Accepts large files as a sequence of chunks, resumes interrupted
//! transfers, assembles them, drives a weighted processing pipeline and
//! streams per-file progress to authenticated subscribers over WebSocket.

pub mod api;
pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod store;
pub mod types;

pub use crate::error::{Error, Result};

use crate::auth::TokenVerifier;
use crate::bus::{ProgressBus, ProgressSink};
use crate::config::Config;
use crate::pipeline::PipelineOrchestrator;
use crate::recovery::{RecoveryController, RetryCommand, RetryContext};
use crate::session::UploadSessionManager;
use crate::store::ChunkStore;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::warn;

/// Multipart bodies are capped at 10 MiB plus framing slack
const MAX_CHUNK_BODY: usize = 10 * 1024 * 1024 + 64 * 1024;

/// How often the background sweeper runs
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Shared application state, cloned into every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<ProgressBus>,
    pub sessions: Arc<UploadSessionManager>,
    pub pipeline: Arc<PipelineOrchestrator>,
    pub recovery: Arc<RecoveryController>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub shutdown: CancellationToken,
}

/// Wire the five components together.
///
/// Returns the state plus the receiving end of the retry channel; pass the
/// latter to `spawn_background_tasks` so scheduled retries are acted on.
pub fn build_state(
    config: Config,
    verifier: Arc<dyn TokenVerifier>,
) -> (AppState, mpsc::Receiver<RetryCommand>) {
    let config = Arc::new(config);
    let bus = Arc::new(ProgressBus::new());
    let sink: Arc<dyn ProgressSink> = bus.clone();
    let store = Arc::new(ChunkStore::new(&config.uploads_path));
    let pipeline = Arc::new(PipelineOrchestrator::new(Arc::clone(&sink)));
    let shutdown = CancellationToken::new();
    let (recovery, retry_rx) =
        RecoveryController::new(config.retry.clone(), Arc::clone(&sink), shutdown.clone());
    let recovery = Arc::new(recovery);
    let sessions = Arc::new(UploadSessionManager::new(
        Arc::clone(&config),
        store,
        sink,
        Arc::clone(&pipeline),
        Arc::clone(&recovery),
    ));

    (
        AppState {
            config,
            bus,
            sessions,
            pipeline,
            recovery,
            verifier,
            shutdown,
        },
        retry_rx,
    )
}

/// Build the application router: authenticated chunked-upload routes under
/// the configured prefix, the push channel, and an open health endpoint.
pub fn build_router(state: AppState) -> Router {
    let protected = api::chunked_routes().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        auth::auth_middleware,
    ));

    Router::new()
        .nest(&state.config.path_prefix, protected)
        .route("/ws/upload-progress", get(api::ws::ws_handler))
        .route("/health", get(api::handlers::health))
        .layer(DefaultBodyLimit::max(MAX_CHUNK_BODY))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the retry supervisor and the hourly sweeper.
///
/// The supervisor consumes `RetryCommand`s fired by the RecoveryController's
/// timers and routes them back into the session manager, which keeps the
/// controller decoupled from the components it recovers.
pub fn spawn_background_tasks(state: &AppState, mut retry_rx: mpsc::Receiver<RetryCommand>) {
    let sessions = Arc::clone(&state.sessions);
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = retry_rx.recv() => {
                    let Some(command) = command else { break };
                    let result = match &command.context {
                        RetryContext::ChunkUpload => sessions.retry_resume(&command.file_id).await,
                        RetryContext::Assembly => sessions.retry_complete(&command.file_id).await,
                        RetryContext::Stage(stage) => {
                            sessions.retry_stage(&command.file_id, stage).await
                        }
                    };
                    if let Err(e) = result {
                        warn!(
                            file_id = %command.file_id,
                            attempt = command.attempt,
                            error = %e,
                            "retry attempt failed"
                        );
                    }
                }
            }
        }
    });

    let state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    state.sessions.sweep().await;
                    state.bus.sweep();
                    state.recovery.sweep(state.config.session_ttl).await;
                }
            }
        }
    });
}
