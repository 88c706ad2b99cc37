//! Binary relay pumps.
//!
//! In relay mode each handler runs one unidirectional pump: read a binary
//! frame from its own peer, pass the byte count through the session's
//! shared limiter, and write the frame unchanged to the counterpart. The
//! payload is ciphertext the server cannot read and never parses.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::limiter::RelayLimiter;
use crate::registry::PeerSink;

/// Forward frames from `reader` to `peer_sink` until either side closes.
///
/// Text, ping and pong frames are dropped. A close frame is forwarded and
/// cancels `shutdown`, which terminates the opposite pump as well. Returns
/// the number of payload bytes relayed.
pub async fn pump(
    mut reader: SplitStream<WebSocket>,
    peer_sink: PeerSink,
    limiter: Arc<RelayLimiter>,
    shutdown: CancellationToken,
) -> u64 {
    let mut relayed: u64 = 0;

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Message::Binary(data))) => {
                limiter.wait(data.len()).await;
                relayed += data.len() as u64;

                let mut sink = peer_sink.lock().await;
                if sink.send(Message::Binary(data)).await.is_err() {
                    debug!("counterpart write failed, relay direction down");
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let mut sink = peer_sink.lock().await;
                let _ = sink.send(Message::Close(frame)).await;
                shutdown.cancel();
                break;
            }
            // Not relayed: the relay carries only binary peer frames
            Some(Ok(Message::Text(_) | Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                debug!(error = %e, "relay read failed");
                shutdown.cancel();
                break;
            }
            None => {
                shutdown.cancel();
                break;
            }
        }
    }

    relayed
}
