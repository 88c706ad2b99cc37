//! Per-connection signaling handler and relay handoff.
//!
//! Each WebSocket is served by its own task: register, announce, forward
//! signaling frames, and - when both peers ask - hand the connection over
//! to the binary relay pumps. The receiver's handler must outlive the
//! sender's so the underlying TCP connection stays up for the whole relay;
//! the session's `relay_done` signal enforces that ordering.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use relay_proto::{PeerAddr, Role, SignalError, SignalMessage};

use crate::registry::{Peer, PeerSink, Registry, Session};
use crate::relay::pump;

/// How long a client may sit silent before its first frame
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long after `relay_active` a client may take to say `relay_ready`
const RELAY_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve one WebSocket connection from registration to teardown.
pub async fn handle_connection(
    registry: Arc<Registry>,
    code: String,
    remote: SocketAddr,
    socket: WebSocket,
) {
    let (sink, mut reader) = socket.split();
    let sink: PeerSink = Arc::new(Mutex::new(sink));

    // First frame must be a register
    let (role, addr) = match read_register(&mut reader, remote).await {
        Some(pair) => pair,
        None => {
            send_error(
                &sink,
                SignalError::InvalidMessage,
                "first frame must be register",
            )
            .await;
            return;
        }
    };

    // Claim the slot
    let session = match registry.open(&code).await {
        Ok(session) => session,
        Err(code_err) => {
            send_error(&sink, code_err, "session limit reached").await;
            return;
        }
    };

    {
        let mut session = session.lock().await;
        if session.slot(role).is_some() {
            drop(session);
            send_error(&sink, SignalError::CodeInUse, "slot already occupied").await;
            return;
        }
        *session.slot_mut(role) = Some(Peer {
            sink: sink.clone(),
            addr: addr.clone(),
        });
        info!(code = %code, %role, peer = %remote, "peer registered");

        // Both slots filled: announce each peer to the other
        if let (Some(sender), Some(receiver)) = (&session.sender, &session.receiver) {
            let to_sender = SignalMessage::PeerJoined {
                peer_info: receiver.addr.clone(),
            };
            let to_receiver = SignalMessage::PeerJoined {
                peer_info: sender.addr.clone(),
            };
            sender.send(&to_sender).await;
            receiver.send(&to_receiver).await;
            debug!(code = %code, "both peers announced");
        }
    }

    // Signaling phase
    let outcome = signaling_loop(&session, &sink, &mut reader, role, &code).await;

    match outcome {
        SignalingOutcome::Relay => relay_phase(&registry, &session, reader, role, &code).await,
        SignalingOutcome::Gone => vacate(&registry, &session, role, &code).await,
    }
}

enum SignalingOutcome {
    /// Session switched to relay mode; this handler owns a pump now
    Relay,
    /// Peer left or failed; slot must be vacated
    Gone,
}

async fn read_register(
    reader: &mut SplitStream<WebSocket>,
    remote: SocketAddr,
) -> Option<(Role, PeerAddr)> {
    let first = timeout(REGISTER_TIMEOUT, reader.next()).await.ok()??.ok()?;

    let text = match first {
        Message::Text(text) => text,
        _ => return None,
    };

    match SignalMessage::from_json(&text) {
        Ok(SignalMessage::Register { role, peer_info }) => {
            // The observed address is authoritative for the public IP; the
            // declared QUIC port replaces the useless WebSocket port.
            let addr = match peer_info {
                Some(info) => PeerAddr {
                    public_ip: remote.ip(),
                    public_port: info.local_port,
                    local_ip: info.local_ip,
                    local_port: info.local_port,
                },
                None => PeerAddr {
                    public_ip: remote.ip(),
                    public_port: 0,
                    local_ip: remote.ip(),
                    local_port: 0,
                },
            };
            Some((role, addr))
        }
        _ => None,
    }
}

async fn signaling_loop(
    session: &Arc<Mutex<Session>>,
    own_sink: &PeerSink,
    reader: &mut SplitStream<WebSocket>,
    role: Role,
    code: &str,
) -> SignalingOutcome {
    let shutdown = session.lock().await.shutdown.clone();

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => return SignalingOutcome::Gone,
            frame = reader.next() => frame,
        };

        let message = match frame {
            Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                Ok(message) => message,
                Err(e) => {
                    debug!(code, error = %e, "unparseable signaling frame");
                    send_frame_error(own_sink, SignalError::UnknownType, "unparseable frame")
                        .await;
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                return SignalingOutcome::Gone;
            }
        };

        match message {
            // Key exchange traffic passes through verbatim
            msg @ (SignalMessage::Spake2 { .. } | SignalMessage::CertFingerprint { .. }) => {
                forward_to_other(session, role, &msg).await;
            }
            SignalMessage::RelayRequest => {
                let relay_now = {
                    let mut session = session.lock().await;
                    session.request_relay(role)
                };
                forward_to_other(session, role, &SignalMessage::RelayRequest).await;

                if relay_now {
                    let session_guard = session.lock().await;
                    if let Some(peer) = &session_guard.sender {
                        peer.send(&SignalMessage::RelayActive).await;
                    }
                    if let Some(peer) = &session_guard.receiver {
                        peer.send(&SignalMessage::RelayActive).await;
                    }
                    info!(code, "relay mode active");
                    drop(session_guard);

                    // Forwarding is over; wait for this peer to drain
                    match await_relay_ready(reader).await {
                        true => return SignalingOutcome::Relay,
                        false => return SignalingOutcome::Gone,
                    }
                }
            }
            // The peer whose request arrived first is still in this loop
            // when its client acknowledges the relay switch
            SignalMessage::RelayReady => {
                if session.lock().await.relay_active {
                    return SignalingOutcome::Relay;
                }
                send_frame_error(own_sink, SignalError::UnknownType, "relay not active").await;
            }
            SignalMessage::Disconnect => {
                debug!(code, %role, "peer disconnected deliberately");
                return SignalingOutcome::Gone;
            }
            // Clients do not originate these; tell the offender only
            SignalMessage::Register { .. }
            | SignalMessage::PeerJoined { .. }
            | SignalMessage::RelayActive
            | SignalMessage::PeerDisconnected { .. }
            | SignalMessage::Error { .. } => {
                send_frame_error(own_sink, SignalError::UnknownType, "not forwardable").await;
            }
        }
    }
}

/// After `relay_active`, read until this peer acknowledges with
/// `relay_ready`.
async fn await_relay_ready(reader: &mut SplitStream<WebSocket>) -> bool {
    let deadline = timeout(RELAY_READY_TIMEOUT, async {
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    if matches!(
                        SignalMessage::from_json(&text),
                        Ok(SignalMessage::RelayReady)
                    ) {
                        return true;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return false,
            }
        }
    })
    .await;

    deadline.unwrap_or(false)
}

/// Binary forwarding: this handler pumps its own peer's frames to the
/// counterpart. The sender's handler completes `relay_done` and removes
/// the session; the receiver's waits for that signal so its socket (and
/// the TCP connection under it) survives the whole relay.
async fn relay_phase(
    registry: &Arc<Registry>,
    session: &Arc<Mutex<Session>>,
    reader: SplitStream<WebSocket>,
    role: Role,
    code: &str,
) {
    let (other_sink, limiter, shutdown, relay_done) = {
        let session = session.lock().await;
        let other = match role {
            Role::Sender => session.receiver.as_ref(),
            Role::Receiver => session.sender.as_ref(),
        };
        let Some(other) = other else {
            warn!(code, "relay phase without a counterpart");
            return;
        };
        (
            other.sink.clone(),
            session.limiter.clone(),
            session.shutdown.clone(),
            session.relay_done.clone(),
        )
    };

    let relayed = pump(reader, other_sink, limiter, shutdown).await;
    info!(code, %role, bytes = relayed, "relay direction finished");

    match role {
        Role::Sender => {
            registry.remove(code).await;
            relay_done.send_replace(true);
        }
        Role::Receiver => {
            let mut done = relay_done.subscribe();
            // Either the sender finishes and signals, or the whole watch
            // channel is gone because the session was dropped
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Vacate this peer's slot and tell the counterpart.
async fn vacate(registry: &Arc<Registry>, session: &Arc<Mutex<Session>>, role: Role, code: &str) {
    {
        let mut session = session.lock().await;
        *session.slot_mut(role) = None;

        // A peer lost after the relay switch must not strand the
        // counterpart's handler in the pump or the relay_done wait
        if session.relay_active {
            session.shutdown.cancel();
            session.relay_done.send_replace(true);
        }

        let other = match role {
            Role::Sender => session.receiver.as_ref(),
            Role::Receiver => session.sender.as_ref(),
        };
        if let Some(other) = other {
            other
                .send(&SignalMessage::PeerDisconnected {
                    message: format!("{role} left the session"),
                })
                .await;
        }
    }

    registry.remove_if_empty(code).await;
}

async fn forward_to_other(session: &Arc<Mutex<Session>>, role: Role, message: &SignalMessage) {
    let session = session.lock().await;
    let other = match role {
        Role::Sender => session.receiver.as_ref(),
        Role::Receiver => session.sender.as_ref(),
    };
    match other {
        Some(peer) => {
            peer.send(message).await;
        }
        None => debug!("no counterpart yet, frame dropped"),
    }
}

/// Error frame followed by a close: used for admission failures.
async fn send_error(sink: &PeerSink, code: SignalError, detail: &str) {
    send_frame_error(sink, code, detail).await;
    let mut sink = sink.lock().await;
    let _ = futures_util::SinkExt::send(&mut *sink, Message::Close(None)).await;
}

/// Error frame alone: the connection stays up.
async fn send_frame_error(sink: &PeerSink, code: SignalError, detail: &str) {
    use futures_util::SinkExt;
    let message = SignalMessage::Error {
        code,
        message: detail.to_string(),
    };
    let mut sink = sink.lock().await;
    let _ = sink.send(Message::Text(message.to_json().into())).await;
}
