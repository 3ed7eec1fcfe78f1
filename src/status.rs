use crate::error::Result;
use crate::manager::Counters;
use crate::store::{PoolCounts, Store};
use crate::types::Protocol;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone)]
pub struct StatusState {
    pub store: Arc<Store>,
    pub counters: Arc<Counters>,
    pub max_workers: usize,
    pub protocol: Protocol,
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    protocol: Protocol,
    pool: PoolCounts,
    active_workers: usize,
    max_workers: usize,
    tested: u64,
    discarded: u64,
    uptime_secs: u64,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/status", get(status))
        .with_state(state)
}

async fn status(
    State(state): State<StatusState>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    let pool = state.store.stats().await.map_err(|e| {
        warn!(error = %e, "status endpoint failed to query stats");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let snapshot = StatusSnapshot {
        protocol: state.protocol,
        pool,
        active_workers: state.counters.active(),
        max_workers: state.max_workers,
        tested: state.counters.tested(),
        discarded: state.counters.discarded(),
        uptime_secs: state.counters.uptime_secs(),
    };
    serde_json::to_value(&snapshot)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Serve the read-only counters until the shutdown broadcast fires. Runs
/// on its own task; never blocks the manager.
pub async fn serve(port: u16, state: StatusState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}
