//! The pairing phase shared by both state machines.
//!
//! Signaling registration, PAKE, encrypted fingerprint exchange and
//! transport selection are identical for sender and receiver up to the
//! role passed along; both orchestrators run [`pair`] and then diverge
//! into offer/accept and streaming.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use relay_crypto::{ChunkCipher, NONCE_SIZE, PakeExchange, PakeRole, SessionKey};
use relay_proto::{PeerAddr, PeerInfo, Role, SignalMessage, TransferCode};
use relay_transport::{DirectEndpoint, MessageStream, PeerConnection, SignalingClient, net};

use crate::error::TransferError;
use crate::event::{Event, TransferState};
use crate::{PAKE_TIMEOUT, RELAY_ACK_TIMEOUT, SIGNALING_TIMEOUT};

/// Publishes `(session_id, Event)` pairs onto the engine's stream.
#[derive(Clone)]
pub(crate) struct Emitter {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<(Uuid, Event)>,
}

impl Emitter {
    pub(crate) fn new(session_id: Uuid, tx: mpsc::UnboundedSender<(Uuid, Event)>) -> Self {
        Self { session_id, tx }
    }

    pub(crate) fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub(crate) fn emit(&self, event: Event) {
        // A shell that dropped its receiver just stops observing
        let _ = self.tx.send((self.session_id, event));
    }

    pub(crate) fn state(&self, state: TransferState) {
        self.emit(Event::StateChanged { state });
    }
}

/// Everything `pair` needs from the orchestrator.
pub(crate) struct Pairing<'a> {
    pub role: Role,
    pub code: &'a TransferCode,
    pub server_url: &'a str,
    pub endpoint: &'a mut DirectEndpoint,
    pub cancel: &'a CancellationToken,
    pub force_relay: bool,
    pub emitter: &'a Emitter,
}

/// Run the pairing phase to an established, authenticated connection.
pub(crate) async fn pair(
    pairing: Pairing<'_>,
) -> Result<(PeerConnection, SessionKey), TransferError> {
    let Pairing {
        role,
        code,
        server_url,
        endpoint,
        cancel,
        force_relay,
        emitter,
    } = pairing;

    // --- Signaling ---
    emitter.state(TransferState::Signaling);

    let mut signaling = cancellable(cancel, connect_with_retry(server_url, code)).await?;

    let local_info = PeerInfo {
        local_ip: net::local_ip(),
        local_port: endpoint.port()?,
    };
    signaling
        .send(&SignalMessage::Register {
            role,
            peer_info: Some(local_info),
        })
        .await?;

    // --- Await the counterpart ---
    emitter.state(TransferState::AwaitPeer);
    let peer_addr = cancellable(cancel, await_peer(&mut signaling)).await?;
    debug!(peer = ?peer_addr, "counterpart joined");

    // --- PAKE ---
    emitter.state(TransferState::KeyExchange);
    let pake_role = match role {
        Role::Sender => PakeRole::Sender,
        Role::Receiver => PakeRole::Receiver,
    };
    let (pake, outbound) = PakeExchange::start(pake_role, code.as_str());
    signaling
        .send(&SignalMessage::Spake2 {
            payload: BASE64.encode(&outbound),
        })
        .await?;

    let peer_pake = cancellable(cancel, async {
        loop {
            match signaling.recv_timeout(PAKE_TIMEOUT).await? {
                SignalMessage::Spake2 { payload } => {
                    return BASE64
                        .decode(payload)
                        .map_err(|_| TransferError::Protocol("bad spake2 payload".into()));
                }
                other => skip_or_fail(other)?,
            }
        }
    })
    .await?;
    let key = pake.finish(&peer_pake)?;

    // --- Fingerprint exchange ---
    emitter.state(TransferState::FingerprintExchange);
    let (nonce, sealed) = ChunkCipher::seal_detached(&key, &endpoint.fingerprint())?;
    let mut payload = nonce.to_vec();
    payload.extend_from_slice(&sealed);
    signaling
        .send(&SignalMessage::CertFingerprint {
            payload: BASE64.encode(&payload),
        })
        .await?;

    let peer_fingerprint = cancellable(cancel, async {
        loop {
            match signaling.recv_timeout(PAKE_TIMEOUT).await? {
                SignalMessage::CertFingerprint { payload } => {
                    return open_fingerprint(&key, &payload);
                }
                other => skip_or_fail(other)?,
            }
        }
    })
    .await?;
    endpoint.pin_peer(peer_fingerprint)?;

    // --- Transport selection ---
    emitter.state(TransferState::TransportSelect);

    if !force_relay {
        match cancellable(cancel, async {
            endpoint
                .establish(role, &peer_addr)
                .await
                .map_err(TransferError::from)
        })
        .await
        {
            Ok(connection) => {
                signaling.disconnect().await;
                return Ok((connection, key));
            }
            Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
            Err(e) => warn!(error = %e, "direct path failed, requesting relay"),
        }
    }

    signaling.send(&SignalMessage::RelayRequest).await?;
    cancellable(cancel, async {
        loop {
            match signaling.recv_timeout(RELAY_ACK_TIMEOUT).await? {
                SignalMessage::RelayActive => return Ok(()),
                // The peer's own request is forwarded to us; ignore it
                SignalMessage::RelayRequest => {}
                other => skip_or_fail(other)?,
            }
        }
    })
    .await?;
    signaling.send(&SignalMessage::RelayReady).await?;

    Ok((signaling.into_relay(), key))
}

/// Race a pairing step against cancellation.
async fn cancellable<T>(
    cancel: &CancellationToken,
    step: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    tokio::select! {
        () = cancel.cancelled() => Err(TransferError::Cancelled),
        result = step => result,
    }
}

/// One reconnect attempt before giving up on the rendezvous.
async fn connect_with_retry(
    server_url: &str,
    code: &TransferCode,
) -> Result<SignalingClient, TransferError> {
    match SignalingClient::connect(server_url, code.as_str()).await {
        Ok(client) => Ok(client),
        Err(first) => {
            debug!(error = %first, "signaling connect failed, retrying once");
            SignalingClient::connect(server_url, code.as_str())
                .await
                .map_err(|_| {
                    TransferError::Signaling(format!("rendezvous unreachable: {first}"))
                })
        }
    }
}

async fn await_peer(signaling: &mut SignalingClient) -> Result<PeerAddr, TransferError> {
    loop {
        match signaling.recv_timeout(SIGNALING_TIMEOUT).await? {
            SignalMessage::PeerJoined { peer_info } => return Ok(peer_info),
            other => skip_or_fail(other)?,
        }
    }
}

/// Server errors and peer loss abort the pairing; stray frames are skipped.
fn skip_or_fail(message: SignalMessage) -> Result<(), TransferError> {
    match message {
        SignalMessage::Error { code, message } => Err(TransferError::Signaling(format!(
            "{code:?}: {message}"
        ))),
        SignalMessage::PeerDisconnected { message } => {
            Err(TransferError::Signaling(format!("peer disconnected: {message}")))
        }
        other => {
            debug!(?other, "ignoring signaling frame");
            Ok(())
        }
    }
}

/// Reader task: pump transport frames into an owned channel so the
/// orchestrator can select over control traffic, disk I/O and
/// cancellation.
pub(crate) fn spawn_reader(
    mut stream: Box<dyn relay_transport::MessageStream>,
) -> mpsc::Receiver<Result<relay_proto::PeerMessage, TransferError>> {
    let (tx, rx) = mpsc::channel(crate::CHUNK_PIPELINE_DEPTH);
    tokio::spawn(async move {
        loop {
            match stream.recv().await {
                Ok(Some(message)) => {
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    break;
                }
            }
        }
    });
    rx
}

/// Next peer message, racing cancellation; channel loss means the
/// transport went away.
pub(crate) async fn next_message(
    cancel: &CancellationToken,
    incoming: &mut mpsc::Receiver<Result<relay_proto::PeerMessage, TransferError>>,
) -> Result<relay_proto::PeerMessage, TransferError> {
    tokio::select! {
        () = cancel.cancelled() => Err(TransferError::Cancelled),
        message = incoming.recv() => match message {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(e),
            None => Err(TransferError::Network("transport closed".into())),
        }
    }
}

/// Throttled progress event: at most one per
/// [`crate::PROGRESS_EVENT_INTERVAL`].
pub(crate) fn maybe_emit_progress(
    emitter: &Emitter,
    tracker: &crate::progress::ProgressTracker,
    last: &mut std::time::Instant,
    current_file: &str,
) {
    if last.elapsed() < crate::PROGRESS_EVENT_INTERVAL {
        return;
    }
    *last = std::time::Instant::now();
    emitter.emit(Event::TransferProgress {
        bytes_transferred: tracker.bytes_transferred(),
        bytes_total: tracker.bytes_total(),
        speed_bps: tracker.speed_bps(),
        eta_s: tracker.eta_s(),
        current_file: current_file.to_string(),
        percent: tracker.percent(),
    });
}

fn open_fingerprint(key: &SessionKey, payload: &str) -> Result<[u8; 32], TransferError> {
    let raw = BASE64
        .decode(payload)
        .map_err(|_| TransferError::Protocol("bad fingerprint payload".into()))?;
    if raw.len() <= NONCE_SIZE {
        return Err(TransferError::Protocol("short fingerprint payload".into()));
    }

    let nonce: [u8; NONCE_SIZE] = raw[..NONCE_SIZE].try_into().expect("sliced to size");
    let plain = ChunkCipher::open_detached(key, &nonce, &raw[NONCE_SIZE..])
        .map_err(|_| TransferError::Crypto("fingerprint rejected; codes differ".into()))?;

    plain
        .try_into()
        .map_err(|_| TransferError::Protocol("fingerprint is not 32 bytes".into()))
}
