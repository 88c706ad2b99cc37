//! Shared fixtures for the Relay integration tests.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use uuid::Uuid;

use relay_core::{Event, EventReceiver};
use relay_server::{Registry, ServerConfig, router};

/// Default window for "this should happen promptly" assertions.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Start a rendezvous server on an ephemeral localhost port.
///
/// Returns the `ws://` base URL and the registry handle for direct state
/// assertions. The serving task lives until the test process exits.
pub async fn start_server(config: ServerConfig) -> (String, Arc<Registry>) {
    let registry = Arc::new(Registry::new(config));
    let app = router(registry.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("test server addr");

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("test server");
    });

    (format!("ws://{addr}"), registry)
}

/// A server with default limits.
pub async fn start_default_server() -> (String, Arc<Registry>) {
    start_server(ServerConfig::default()).await
}

/// Write `len` random bytes under `dir` and return the path.
pub fn random_file(dir: &std::path::Path, name: &str, len: usize) -> PathBuf {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    let path = dir.join(name);
    std::fs::write(&path, &data).expect("write fixture");
    path
}

/// Drain events until one matches, or give up after `limit`.
pub async fn wait_for_event<F>(
    events: &mut EventReceiver,
    limit: Duration,
    mut matches: F,
) -> Option<(Uuid, Event)>
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(limit, async {
        while let Some((session, event)) = events.recv().await {
            if matches(&event) {
                return Some((session, event));
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Fetch a path from the test server over plain HTTP/1.1.
pub async fn http_get(base_ws_url: &str, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = base_ws_url.trim_start_matches("ws://");
    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await
        .expect("send request");

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    response
}
