//! # Relay Rendezvous Server
//!
//! Pairs two endpoints by transfer code, forwards their signaling frames,
//! and - once both peers ask - relays encrypted bytes with a per-session
//! bandwidth cap. File contents and session keys never exist here in the
//! clear; the relay phase forwards opaque ciphertext.
//!
//! The binary in `main.rs` is a thin CLI around [`router`] plus the TTL
//! sweeper; integration tests mount the same router on an ephemeral port.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod limiter;
pub mod registry;
pub mod relay;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

pub use registry::{Registry, ServerConfig};

/// How often expired sessions are swept
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Build the HTTP surface: `GET /health` and `GET /ws/{code}`.
#[must_use]
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{code}", get(ws_upgrade))
        .with_state(registry)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the background task that purges expired sessions.
pub fn spawn_sweeper(registry: Arc<Registry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the immediate first tick
        loop {
            ticker.tick().await;
            registry.sweep_expired().await;
        }
    })
}

async fn health(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": registry.active_sessions().await,
    }))
}

async fn ws_upgrade(
    State(registry): State<Arc<Registry>>,
    Path(code): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| ws::handle_connection(registry, code, remote, socket))
}
