//! stitchd server binary.
//!
//! Clients upload a file as numbered chunks in any order. The server keeps
//! every chunk on disk, and once all of them have arrived it concatenates them
//! in index order into the final artifact. The main entry point builds the
//! Axum router, prepares the data directories, and starts the HTTP listener.

mod atomic;
mod background;
mod chunk_store;
mod config;
mod coordinator;
mod error;
mod http;
mod locking;
mod logging;
mod merge;
mod storage;
mod tracker;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::chunk_store::ChunkStore;
use crate::config::Args;
use crate::coordinator::{CoordinatorConfig, UploadCoordinator};
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::storage::Storage;
use crate::upload::UploadConfig;

shadow!(build);

/// Starts the stitchd server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let store = ChunkStore::new(args.chunk_root(), args.max_chunk_size);
    let storage = Storage::new(args.artifact_root());
    info!(
        data_dir = ?args.data_dir,
        artifacts = ?storage.root_path(),
        "using data directory"
    );
    let coordinator = Arc::new(UploadCoordinator::new(
        store,
        storage,
        CoordinatorConfig {
            max_chunks: args.max_chunks,
            lock_wait: Duration::from_secs(args.lock_wait_secs),
            chunk_ttl: Duration::from_secs(args.chunk_ttl_secs),
        },
    ));
    let upload_config = Arc::new(UploadConfig {
        staging_dir: args.staging_root(),
        max_chunk_size: args.max_chunk_size,
    });
    coordinator.ensure_roots().await?;
    tokio::fs::create_dir_all(&upload_config.staging_dir).await?;

    let coordinator_for_tasks = coordinator.clone();
    let upload_for_tasks = upload_config.clone();

    let mut app = Router::new()
        .route(
            "/upload",
            post(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/upload/chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/init", post(upload::init_upload))
        .route("/api/upload/abort", post(upload::abort_upload))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(coordinator))
        .layer(Extension(upload_config));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(
        coordinator_for_tasks,
        upload_for_tasks,
        Duration::from_secs(args.chunk_ttl_secs),
    );
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
