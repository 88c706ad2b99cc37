//! Relay transport: a framing shim over the signaling WebSocket.
//!
//! Once the rendezvous server switches the session to relay mode, each
//! encoded peer frame travels as one binary WebSocket message. The server
//! forwards the bytes without parsing them; ciphertext stays opaque
//! end-to-end. A close from either side surfaces as end-of-stream.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relay_proto::PeerMessage;

use crate::{MessageSink, MessageStream, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of the relay transport.
pub struct RelaySink {
    sink: SplitSink<WsStream, WsMessage>,
}

impl RelaySink {
    pub(crate) fn new(sink: SplitSink<WsStream, WsMessage>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageSink for RelaySink {
    async fn send(&mut self, message: &PeerMessage) -> Result<(), TransportError> {
        let frame = message.encode()?;
        self.sink
            .send(WsMessage::binary(frame))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Close(None))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let _ = self.sink.close().await;
        Ok(())
    }
}

/// Inbound half of the relay transport.
pub struct RelayStream {
    stream: SplitStream<WsStream>,
}

impl RelayStream {
    pub(crate) fn new(stream: SplitStream<WsStream>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl MessageStream for RelayStream {
    async fn recv(&mut self) -> Result<Option<PeerMessage>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    return Ok(Some(PeerMessage::decode(&data)?));
                }
                // Control frames are the socket's business, stray text is
                // not part of the relay phase
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Text(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    }
}
