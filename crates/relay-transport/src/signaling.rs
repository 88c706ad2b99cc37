//! Client side of the rendezvous signaling connection.
//!
//! One WebSocket per session, opened at `ws(s)://…/ws/{code}`. The socket
//! carries JSON signaling frames during pairing and, if the session falls
//! back to relay mode, the very same TCP connection becomes the relay
//! carrier via [`SignalingClient::into_relay`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use relay_proto::SignalMessage;

use crate::relay::{RelaySink, RelayStream};
use crate::{PeerConnection, TransportError, TransportKind};

/// A live signaling connection for one transfer code.
pub struct SignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
}

impl SignalingClient {
    /// Open the signaling WebSocket for a code.
    ///
    /// # Errors
    ///
    /// [`TransportError::WebSocket`] when the server is unreachable or the
    /// upgrade fails.
    pub async fn connect(server_url: &str, code: &str) -> Result<Self, TransportError> {
        let url = format!("{}/ws/{}", server_url.trim_end_matches('/'), code);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        debug!(url = %url, "signaling connected");
        Ok(Self { ws, url })
    }

    /// The URL this client connected to (used for the one reconnect).
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one signaling frame.
    ///
    /// # Errors
    ///
    /// [`TransportError::WebSocket`] on socket failure.
    pub async fn send(&mut self, message: &SignalMessage) -> Result<(), TransportError> {
        self.ws
            .send(WsMessage::text(message.to_json()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    /// Receive the next signaling frame, skipping transport noise.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the server hangs up,
    /// [`TransportError::Signaling`] on unparseable frames.
    pub async fn recv(&mut self) -> Result<SignalMessage, TransportError> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return SignalMessage::from_json(&text)
                        .map_err(|e| TransportError::Signaling(e.to_string()));
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                // Binary before relay mode is a server bug; skip it
                Some(Ok(WsMessage::Binary(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    }

    /// Receive with a deadline.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] past the deadline, otherwise as
    /// [`SignalingClient::recv`].
    pub async fn recv_timeout(
        &mut self,
        limit: Duration,
    ) -> Result<SignalMessage, TransportError> {
        timeout(limit, self.recv())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Politely leave the session and close the socket.
    pub async fn disconnect(mut self) {
        let _ = self.send(&SignalMessage::Disconnect).await;
        let _ = self.ws.close(None).await;
    }

    /// Convert the live socket into the relay transport. Call only after
    /// `relay_active` has been received and `relay_ready` sent; from then
    /// on every frame on this connection is binary peer-protocol bytes.
    #[must_use]
    pub fn into_relay(self) -> PeerConnection {
        let (sink, stream) = self.ws.split();
        PeerConnection::new(
            TransportKind::Relay,
            Box::new(RelaySink::new(sink)),
            Box::new(RelayStream::new(stream)),
        )
    }
}
