//! Ops HTTP surface and the long-running `run` entry point

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::FjallCatalog;
use crate::config::Config;
use crate::pipeline::{Collaborators, Pipeline};
use crate::queue::JobQueue;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Clone)]
pub struct OpsState {
    pub queue: Arc<JobQueue>,
    pub catalog: Arc<FjallCatalog>,
}

impl OpsState {
    pub fn new(pipeline: &Pipeline) -> Self {
        Self {
            queue: Arc::clone(&pipeline.queue),
            catalog: Arc::clone(&pipeline.catalog),
        }
    }
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/queues", get(queues))
        .with_state(state)
}

async fn health(State(state): State<OpsState>) -> impl IntoResponse {
    if let Err(err) = state.queue.health_check() {
        warn!(error = %err, "Queue store health check failed");
        return (StatusCode::SERVICE_UNAVAILABLE, "queue unavailable");
    }
    if let Err(err) = state.catalog.health_check() {
        warn!(error = %err, "Catalog health check failed");
        return (StatusCode::SERVICE_UNAVAILABLE, "catalog unavailable");
    }
    (StatusCode::OK, "ok")
}

async fn queues(State(state): State<OpsState>) -> impl IntoResponse {
    match state.queue.stats() {
        Ok(stats) => (StatusCode::OK, Json(json!({ "queues": stats }))),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "code": "INTERNAL_ERROR", "message": err.to_string() })),
        ),
    }
}

/// Run every worker, the scheduler, the reconciler and the ops server until
/// SIGINT or SIGTERM
pub async fn run(config: Config) -> Result<(), AnyError> {
    let shutdown = CancellationToken::new();
    let address = config.server.bind_addr;

    let collaborators = Collaborators::from_config(&config)?;
    let pipeline = Pipeline::open(config, collaborators, shutdown.clone())?;

    let mut tasks = pipeline.start_workers()?;
    tasks.push(pipeline.scheduler().spawn(shutdown.clone()));
    tasks.push(pipeline.reconciler().spawn(shutdown.clone()));

    let listener = TcpListener::bind(address).await?;
    info!(%address, "feedpipe ops server listening");

    let app = router(OpsState::new(&pipeline));
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    pipeline.shutdown(tasks).await?;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "Ops server failed"),
        Err(err) => error!(error = %err, "Ops server task failed"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
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
    info!("Shutdown signal received");
}
