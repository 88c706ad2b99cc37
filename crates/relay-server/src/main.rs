//! Relay rendezvous server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use relay_server::{CLEANUP_INTERVAL, Registry, ServerConfig, router, spawn_sweeper};

/// Rendezvous and relay server for Relay transfers
#[derive(Parser)]
#[command(name = "relay-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// Maximum concurrently registered codes
    #[arg(long, default_value_t = 1000)]
    max_sessions: usize,

    /// Session lifetime (e.g. "10m", "300s")
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    session_ttl: Duration,

    /// Relay bandwidth cap per session, bytes per second
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    relay_rate_limit: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_server=info,tower_http=warn".into()),
        )
        .init();

    let registry = Arc::new(Registry::new(ServerConfig {
        max_sessions: cli.max_sessions,
        session_ttl: cli.session_ttl,
        relay_rate_limit: cli.relay_rate_limit,
    }));

    spawn_sweeper(registry.clone(), CLEANUP_INTERVAL);

    let listener = tokio::net::TcpListener::bind(cli.addr).await?;
    info!("relay server listening on {}", cli.addr);

    axum::serve(
        listener,
        router(registry).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received ctrl-c, shutting down");
    }
}
