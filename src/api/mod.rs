//! HTTP API for the chunked upload protocol

pub mod handlers;
pub mod ws;

use crate::AppState;
use axum::routing::{delete, get, post};
use axum::Router;

/// Routes mounted under the configured path prefix (default `/chunked`).
/// All of them sit behind the bearer-token middleware.
pub fn chunked_routes() -> Router<AppState> {
    Router::new()
        .route("/init", post(handlers::init_upload))
        .route("/upload/:file_id/:chunk_index", post(handlers::upload_chunk))
        .route("/resume/:file_id", get(handlers::resume_upload))
        .route("/complete/:file_id", post(handlers::complete_upload))
        .route("/status/:file_id", get(handlers::upload_status))
        .route("/validate/:file_id", post(handlers::validate_upload))
        .route("/:file_id", delete(handlers::cancel_upload))
}
