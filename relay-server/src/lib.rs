//! Rendezvous and relay server.
//!
//! One HTTP service: `GET /health` for liveness and `GET /ws/{code}` for
//! the signaling WebSocket that can graduate into a ciphertext relay.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

pub mod handler;
pub mod relay;
pub mod state;

pub use state::{ServerOptions, ServerState};

/// How often the TTL sweep runs.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.session_count().await,
    })
}

/// Build the router over shared state.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{code}", get(handler::ws_handler))
        .with_state(state)
}

/// Periodically evict expired sessions until the server shuts down.
pub async fn run_cleanup(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let evicted = state.cleanup_expired().await;
        if evicted > 0 {
            tracing::info!("cleanup: evicted {evicted} expired session(s)");
        }
    }
}
