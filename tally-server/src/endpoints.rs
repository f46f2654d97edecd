//! The HTTP admin surface.
//!
//! Three endpoints: `/healthcheck` (always), `/import` (batched forwarded
//! metrics) and `/quitquitquit` (only with `http_quit`). This surface is
//! plaintext; deployments that need transport security terminate it in front
//! of the daemon.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Serialize;
use tally_metrics::forward::ForwardDecodeError;
use tally_system::Controller;
use tokio::task::JoinHandle;

use crate::import::Importer;

/// Shared state of the admin endpoints.
#[derive(Clone)]
pub struct AdminState {
    /// Merges forwarded payloads into the local workers.
    pub importer: Importer,
    /// The last-resort self-metric loss counter.
    pub self_metrics_lost: Arc<AtomicU64>,
    /// Whether `/quitquitquit` is enabled.
    pub http_quit: bool,
    /// Graceful shutdown timeout handed to the controller.
    pub shutdown_timeout: Duration,
}

/// Builds the admin router.
pub fn routes(state: AdminState) -> axum::Router {
    axum::Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/import", post(import))
        .route("/quitquitquit", post(quit))
        .with_state(state)
}

/// Binds and serves the admin surface until shutdown.
pub async fn serve(
    address: &str,
    state: AdminState,
) -> Result<(SocketAddr, JoinHandle<()>), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;

    tally_log::info!("admin surface listening on http://{local_addr}/");

    let app = routes(state);
    let task = tokio::spawn(async move {
        let shutdown = async {
            Controller::shutdown_handle().notified().await;
        };

        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tally_log::error!("admin server failed: {error}");
        }
    });

    Ok((local_addr, task))
}

#[derive(Serialize)]
struct Health {
    alive: bool,
    self_metrics_lost: u64,
}

async fn healthcheck(State(state): State<AdminState>) -> impl IntoResponse {
    Json(Health {
        alive: true,
        self_metrics_lost: state.self_metrics_lost.load(Ordering::Relaxed),
    })
}

#[derive(Serialize)]
struct Imported {
    merged: usize,
}

async fn import(State(state): State<AdminState>, body: Bytes) -> Response {
    match state.importer.import(&body) {
        Ok(merged) => (StatusCode::OK, Json(Imported { merged })).into_response(),
        Err(error @ ForwardDecodeError::VersionMismatch(_)) => {
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
        Err(error) => (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
    }
}

async fn quit(State(state): State<AdminState>) -> Response {
    if !state.http_quit {
        return StatusCode::NOT_FOUND.into_response();
    }

    tally_log::info!("shutdown requested through /quitquitquit");
    Controller::trigger_shutdown(Some(state.shutdown_timeout));

    (StatusCode::OK, "terminating\n").into_response()
}
