//! Sender state machine.
//!
//! `Signaling -> AwaitPeer -> KeyExchange -> FingerprintExchange ->
//! TransportSelect -> Offering -> Streaming -> Completed`, with
//! `Cancelled` and `Errored` as the terminal side exits. File reading runs
//! on its own task, feeding the transport writer through a bounded channel
//! so at most [`crate::CHUNK_PIPELINE_DEPTH`] chunks are in flight.

use std::path::PathBuf;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use relay_crypto::{ChunkCipher, StreamingHash};
use relay_proto::{CHUNK_SIZE, FileDescriptor, PeerMessage, Role, TransferCode};
use relay_transport::{DirectEndpoint, MessageSink};

use crate::error::TransferError;
use crate::event::{Event, TransferState};
use crate::progress::ProgressTracker;
use crate::session::{Emitter, Pairing, maybe_emit_progress, next_message, pair, spawn_reader};
use crate::CHUNK_PIPELINE_DEPTH;

/// One file queued for sending.
pub(crate) struct SendFile {
    pub path: PathBuf,
    pub descriptor: FileDescriptor,
}

/// Inputs for one sender run.
pub(crate) struct SenderArgs {
    pub code: TransferCode,
    pub files: Vec<SendFile>,
    pub server_url: String,
    pub endpoint: DirectEndpoint,
    pub emitter: Emitter,
    pub cancel: CancellationToken,
    pub force_relay: bool,
}

/// Drive a whole send session; every outcome becomes a progress event.
pub(crate) async fn run(mut args: SenderArgs) {
    let result = run_inner(&mut args).await;
    args.endpoint.close();

    match result {
        Ok(()) => {}
        Err(TransferError::Cancelled) => {
            info!("send session cancelled");
            args.emitter.state(TransferState::Cancelled);
        }
        Err(e) => {
            info!(error = %e, "send session failed");
            args.emitter.emit(Event::Error {
                message: e.to_string(),
            });
            args.emitter.state(TransferState::Errored);
        }
    }
}

async fn run_inner(args: &mut SenderArgs) -> Result<(), TransferError> {
    let (connection, key) = pair(Pairing {
        role: Role::Sender,
        code: &args.code,
        server_url: &args.server_url,
        endpoint: &mut args.endpoint,
        cancel: &args.cancel,
        force_relay: args.force_relay,
        emitter: &args.emitter,
    })
    .await?;

    args.emitter.emit(Event::ConnectionTypeChanged {
        connection: connection.kind().into(),
    });

    let (mut sink, stream) = connection.split();
    let mut incoming = spawn_reader(stream);

    let outcome = drive_transfer(args, &key, &mut sink, &mut incoming).await;

    match &outcome {
        Ok(()) => {
            let _ = sink.close().await;
        }
        Err(TransferError::Cancelled) => {
            // A local cancel tells the peer; a remote one already knows
            if args.cancel.is_cancelled() {
                let _ = sink
                    .send(&PeerMessage::Cancel {
                        reason: "user".into(),
                    })
                    .await;
            }
            let _ = sink.close().await;
        }
        Err(_) => {
            let _ = sink.close().await;
        }
    }

    outcome
}

async fn drive_transfer(
    args: &SenderArgs,
    key: &relay_crypto::SessionKey,
    sink: &mut Box<dyn MessageSink>,
    incoming: &mut mpsc::Receiver<Result<PeerMessage, TransferError>>,
) -> Result<(), TransferError> {
    // --- Offer ---
    args.emitter.state(TransferState::Offering);
    let descriptors: Vec<FileDescriptor> =
        args.files.iter().map(|f| f.descriptor.clone()).collect();
    sink.send(&PeerMessage::FileOffer {
        session_id: args.emitter.session_id(),
        files: descriptors,
    })
    .await?;

    loop {
        match next_message(&args.cancel, incoming).await? {
            PeerMessage::FileAccept => break,
            PeerMessage::FileDecline => return Err(TransferError::PeerRejected),
            PeerMessage::Ping => sink.send(&PeerMessage::Pong).await?,
            PeerMessage::Cancel { reason } => {
                debug!(reason = %reason, "peer cancelled during offer");
                return Err(TransferError::Cancelled);
            }
            other => {
                return Err(TransferError::Protocol(format!(
                    "unexpected answer to offer: {other:?}"
                )));
            }
        }
    }

    // --- Streaming ---
    args.emitter.state(TransferState::Streaming);
    let total: u64 = args.files.iter().map(|f| f.descriptor.size).sum();
    let mut tracker = ProgressTracker::new(total);
    let mut cipher = ChunkCipher::new(key);
    let mut last_progress = Instant::now();

    for (file_index, file) in args.files.iter().enumerate() {
        let file_index = file_index as u16;
        stream_one_file(
            args,
            sink,
            incoming,
            &mut cipher,
            &mut tracker,
            &mut last_progress,
            file_index,
            file,
        )
        .await?;
        args.emitter.emit(Event::FileCompleted {
            name: file.descriptor.name.clone(),
        });
    }

    // --- Done ---
    sink.send(&PeerMessage::TransferComplete).await?;
    args.emitter.state(TransferState::Completed);
    args.emitter.emit(Event::TransferComplete {
        files: args.files.len(),
        bytes: tracker.bytes_transferred(),
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn stream_one_file(
    args: &SenderArgs,
    sink: &mut Box<dyn MessageSink>,
    incoming: &mut mpsc::Receiver<Result<PeerMessage, TransferError>>,
    cipher: &mut ChunkCipher,
    tracker: &mut ProgressTracker,
    last_progress: &mut Instant,
    file_index: u16,
    file: &SendFile,
) -> Result<(), TransferError> {
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(CHUNK_PIPELINE_DEPTH);
    let path = file.path.clone();

    // File reader task: disk to bounded channel
    let reader = tokio::spawn(async move {
        let mut handle = tokio::fs::File::open(&path).await?;
        let mut hash = StreamingHash::new();

        loop {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let filled = read_up_to(&mut handle, &mut buffer).await?;
            if filled == 0 {
                break;
            }
            buffer.truncate(filled);
            hash.update(&buffer);
            if chunk_tx.send(buffer).await.is_err() {
                // The transfer loop bailed; stop reading
                return Err(std::io::Error::other("transfer aborted"));
            }
        }

        Ok(hash.finalize())
    });

    // Transport writer: encrypt and ship chunks while answering control
    // traffic, in ascending chunk order
    let mut chunk_index: u32 = 0;
    loop {
        tokio::select! {
            () = args.cancel.cancelled() => {
                reader.abort();
                return Err(TransferError::Cancelled);
            }
            message = incoming.recv() => {
                handle_control(sink, message).await?;
            }
            chunk = chunk_rx.recv() => match chunk {
                Some(plaintext) => {
                    let size = plaintext.len() as u64;
                    let (nonce, ciphertext) = cipher.seal(&plaintext)?;
                    sink.send(&PeerMessage::FileChunk {
                        file_index,
                        chunk_index,
                        nonce,
                        ciphertext,
                    })
                    .await?;
                    chunk_index += 1;
                    tracker.record(size);
                    maybe_emit_progress(
                        &args.emitter,
                        tracker,
                        last_progress,
                        &file.descriptor.name,
                    );
                }
                None => break,
            }
        }
    }

    let digest = reader
        .await
        .map_err(|e| TransferError::Transfer(format!("file reader died: {e}")))?
        .map_err(|e| TransferError::Transfer(format!("reading {:?}: {e}", file.path)))?;

    sink.send(&PeerMessage::FileComplete {
        file_index,
        sha256: digest,
    })
    .await?;

    // Wait for the receiver to verify before moving to the next file
    loop {
        tokio::select! {
            () = args.cancel.cancelled() => return Err(TransferError::Cancelled),
            message = incoming.recv() => match message {
                Some(Ok(PeerMessage::FileVerified { file_index: verified })) => {
                    if verified != file_index {
                        return Err(TransferError::Protocol(format!(
                            "verification for file {verified}, expected {file_index}"
                        )));
                    }
                    return Ok(());
                }
                other => handle_control(sink, other).await?,
            }
        }
    }
}

/// Pings are answered, cancels and closures abort, data messages are a
/// protocol violation on the sending side.
async fn handle_control(
    sink: &mut Box<dyn MessageSink>,
    message: Option<Result<PeerMessage, TransferError>>,
) -> Result<(), TransferError> {
    match message {
        Some(Ok(PeerMessage::Ping)) => {
            sink.send(&PeerMessage::Pong).await?;
            Ok(())
        }
        Some(Ok(PeerMessage::Pong)) => Ok(()),
        Some(Ok(PeerMessage::Cancel { reason })) => {
            debug!(reason = %reason, "peer cancelled");
            Err(TransferError::Cancelled)
        }
        Some(Ok(other)) => Err(TransferError::Protocol(format!(
            "unexpected message while streaming: {other:?}"
        ))),
        Some(Err(e)) => Err(e),
        None => Err(TransferError::Network("transport closed".into())),
    }
}

async fn read_up_to(
    file: &mut tokio::fs::File,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
