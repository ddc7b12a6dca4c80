//! Local read-only status API of a node

use crate::agent::ChannelState;
use crate::reconcile::Reconciler;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use fleet_proto::{HealthSnapshot, TunnelState};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct StatusState {
    pub node_id: String,
    pub channel: watch::Receiver<ChannelState>,
    pub reconciler: Arc<Reconciler>,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub channel: ChannelState,
    pub generation: u64,
    pub health: HealthSnapshot,
    pub tunnels: Vec<TunnelState>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn status(State(state): State<StatusState>) -> Json<NodeStatus> {
    let tunnels = state.reconciler.snapshot().await;
    let generation = state.reconciler.desired().generation();
    let health =
        HealthSnapshot::from_states(&tunnels, state.started.elapsed().as_secs(), generation);

    Json(NodeStatus {
        node_id: state.node_id.clone(),
        channel: *state.channel.borrow(),
        generation,
        health,
        tunnels,
    })
}

/// Serve the status API until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, state: StatusState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Node status API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
