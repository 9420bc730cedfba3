//! ingestd — chunked file ingestion service
//!
//! Accepts resumable chunked uploads over HTTP, assembles them, runs the
//! per-file processing pipeline and pushes progress to subscribers over
//! WebSocket.

use anyhow::Result;
use clap::Parser;
use ingestd::auth::SharedSecretVerifier;
use ingestd::config::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Chunked file ingestion service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Uploads root directory (overrides UPLOADS_PATH)
    #[arg(short, long, value_name = "PATH")]
    uploads_path: Option<PathBuf>,

    /// Port to bind to (overrides INGESTD_PORT)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ingestd={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("ingestd starting...");

    // Resolution priority: CLI arg, then environment, then defaults
    let mut config = Config::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    if let Some(path) = args.uploads_path {
        config.uploads_path = path;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    std::fs::create_dir_all(&config.uploads_path)?;
    info!(
        uploads_path = %config.uploads_path.display(),
        chunk_size = config.chunk_size,
        max_chunks = config.max_chunks,
        prefix = %config.path_prefix,
        "configuration resolved"
    );

    let verifier = Arc::new(SharedSecretVerifier::new(config.jwt_secret.clone()));
    let port = config.port;
    let (state, retry_rx) = ingestd::build_state(config, verifier);
    ingestd::spawn_background_tasks(&state, retry_rx);

    let app = ingestd::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
