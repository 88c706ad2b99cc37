//! Receiver state machine.
//!
//! Mirror of the sender: pairing, then `AwaitOffer -> AwaitUserDecision ->
//! Streaming -> Completed`. Chunk ordering is enforced strictly; decrypted
//! bytes flow to a per-file writer task through a bounded channel, and the
//! digest must match before `FileVerified` goes back. Partially-written
//! files are unlinked on any abort.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_crypto::{ChunkCipher, SessionKey, StreamingHash};
use relay_proto::{FileDescriptor, PeerMessage, Role, TransferCode, validate_offer};
use relay_transport::{DirectEndpoint, MessageSink};

use crate::error::TransferError;
use crate::event::{Event, TransferState};
use crate::progress::ProgressTracker;
use crate::session::{Emitter, Pairing, maybe_emit_progress, next_message, pair, spawn_reader};
use crate::CHUNK_PIPELINE_DEPTH;

/// Inputs for one receive session.
pub(crate) struct ReceiverArgs {
    pub code: TransferCode,
    pub save_dir: PathBuf,
    pub server_url: String,
    pub endpoint: DirectEndpoint,
    pub emitter: Emitter,
    pub cancel: CancellationToken,
    pub decision: oneshot::Receiver<bool>,
    pub force_relay: bool,
}

/// Drive a whole receive session; every outcome becomes a progress event.
pub(crate) async fn run(mut args: ReceiverArgs) {
    let result = run_inner(&mut args).await;
    args.endpoint.close();

    match result {
        Ok(()) => {}
        Err(TransferError::Cancelled) => {
            info!("receive session cancelled");
            args.emitter.state(TransferState::Cancelled);
        }
        Err(e) => {
            info!(error = %e, "receive session failed");
            args.emitter.emit(Event::Error {
                message: e.to_string(),
            });
            args.emitter.state(TransferState::Errored);
        }
    }
}

async fn run_inner(args: &mut ReceiverArgs) -> Result<(), TransferError> {
    let (connection, key) = pair(Pairing {
        role: Role::Receiver,
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
        Err(TransferError::Cancelled) if args.cancel.is_cancelled() => {
            let _ = sink
                .send(&PeerMessage::Cancel {
                    reason: "user".into(),
                })
                .await;
            let _ = sink.close().await;
        }
        _ => {
            let _ = sink.close().await;
        }
    }

    outcome
}

async fn drive_transfer(
    args: &mut ReceiverArgs,
    key: &SessionKey,
    sink: &mut Box<dyn MessageSink>,
    incoming: &mut mpsc::Receiver<Result<PeerMessage, TransferError>>,
) -> Result<(), TransferError> {
    // --- Offer ---
    args.emitter.state(TransferState::AwaitOffer);
    let files = loop {
        match next_message(&args.cancel, incoming).await? {
            PeerMessage::FileOffer { session_id, files } => {
                debug!(%session_id, count = files.len(), "offer received");
                break files;
            }
            PeerMessage::Ping => sink.send(&PeerMessage::Pong).await?,
            PeerMessage::Cancel { reason } => {
                debug!(reason = %reason, "peer cancelled before offering");
                return Err(TransferError::Cancelled);
            }
            other => {
                return Err(TransferError::Protocol(format!(
                    "expected an offer, got {other:?}"
                )));
            }
        }
    };

    // Reject bad paths before anything touches the disk; one bad
    // descriptor fails the whole offer
    if let Err(e) = validate_offer(&files) {
        let _ = sink.send(&PeerMessage::FileDecline).await;
        return Err(TransferError::Transfer(format!("unsafe offer: {e}")));
    }

    // --- User decision ---
    args.emitter.state(TransferState::AwaitUserDecision);
    args.emitter.emit(Event::FileOffer {
        session_id: args.emitter.session_id(),
        files: files.clone(),
    });

    let accepted = tokio::select! {
        () = args.cancel.cancelled() => return Err(TransferError::Cancelled),
        decision = &mut args.decision => decision.unwrap_or(false),
        message = incoming.recv() => {
            return match message {
                Some(Ok(PeerMessage::Cancel { .. })) => Err(TransferError::Cancelled),
                Some(Ok(other)) => Err(TransferError::Protocol(format!(
                    "unexpected message before decision: {other:?}"
                ))),
                Some(Err(e)) => Err(e),
                None => Err(TransferError::Network("transport closed".into())),
            };
        }
    };

    if !accepted {
        sink.send(&PeerMessage::FileDecline).await?;
        return Err(TransferError::Cancelled);
    }
    sink.send(&PeerMessage::FileAccept).await?;

    // --- Streaming ---
    args.emitter.state(TransferState::Streaming);
    let total: u64 = files.iter().map(|f| f.size).sum();
    let mut tracker = ProgressTracker::new(total);
    let cipher = ChunkCipher::new(key);
    let mut last_progress = Instant::now();

    for (file_index, descriptor) in files.iter().enumerate() {
        let file_index = file_index as u16;
        receive_one_file(
            args,
            sink,
            incoming,
            &cipher,
            &mut tracker,
            &mut last_progress,
            file_index,
            descriptor,
        )
        .await?;
        args.emitter.emit(Event::FileCompleted {
            name: descriptor.name.clone(),
        });
    }

    // --- Done ---
    loop {
        match next_message(&args.cancel, incoming).await? {
            PeerMessage::TransferComplete => break,
            PeerMessage::Ping => sink.send(&PeerMessage::Pong).await?,
            PeerMessage::Cancel { .. } => return Err(TransferError::Cancelled),
            other => {
                return Err(TransferError::Protocol(format!(
                    "expected transfer completion, got {other:?}"
                )));
            }
        }
    }

    args.emitter.state(TransferState::Completed);
    args.emitter.emit(Event::TransferComplete {
        files: files.len(),
        bytes: tracker.bytes_transferred(),
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn receive_one_file(
    args: &ReceiverArgs,
    sink: &mut Box<dyn MessageSink>,
    incoming: &mut mpsc::Receiver<Result<PeerMessage, TransferError>>,
    cipher: &ChunkCipher,
    tracker: &mut ProgressTracker,
    last_progress: &mut Instant,
    file_index: u16,
    descriptor: &FileDescriptor,
) -> Result<(), TransferError> {
    let dest = destination_path(&args.save_dir, descriptor);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::Transfer(format!("creating {parent:?}: {e}")))?;
    }

    let result = write_file(
        args,
        sink,
        incoming,
        cipher,
        tracker,
        last_progress,
        file_index,
        descriptor,
        &dest,
    )
    .await;

    if result.is_err() {
        // Nothing partial survives an abort
        let _ = tokio::fs::remove_file(&dest).await;
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn write_file(
    args: &ReceiverArgs,
    sink: &mut Box<dyn MessageSink>,
    incoming: &mut mpsc::Receiver<Result<PeerMessage, TransferError>>,
    cipher: &ChunkCipher,
    tracker: &mut ProgressTracker,
    last_progress: &mut Instant,
    file_index: u16,
    descriptor: &FileDescriptor,
    dest: &Path,
) -> Result<(), TransferError> {
    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(CHUNK_PIPELINE_DEPTH);
    let dest_owned = dest.to_path_buf();

    // File writer task: bounded channel to disk
    let writer = tokio::spawn(async move {
        let mut handle = tokio::fs::File::create(&dest_owned).await?;
        while let Some(chunk) = write_rx.recv().await {
            handle.write_all(&chunk).await?;
        }
        handle.flush().await?;
        Ok::<(), std::io::Error>(())
    });

    let mut hash = StreamingHash::new();
    let mut expected_chunk: u32 = 0;

    let claimed_digest = loop {
        let message = tokio::select! {
            () = args.cancel.cancelled() => {
                writer.abort();
                return Err(TransferError::Cancelled);
            }
            message = incoming.recv() => message,
        };

        match message {
            Some(Ok(PeerMessage::FileChunk {
                file_index: chunk_file,
                chunk_index,
                nonce,
                ciphertext,
            })) => {
                if chunk_file != file_index {
                    writer.abort();
                    return Err(TransferError::Protocol(format!(
                        "chunk for file {chunk_file} while receiving {file_index}"
                    )));
                }
                if chunk_index != expected_chunk {
                    writer.abort();
                    return Err(TransferError::Protocol(format!(
                        "chunk {chunk_index} out of order, expected {expected_chunk}"
                    )));
                }

                let plaintext = cipher
                    .open(&nonce, &ciphertext)
                    .map_err(|_| TransferError::Crypto("chunk failed authentication".into()))?;
                expected_chunk += 1;

                hash.update(&plaintext);
                tracker.record(plaintext.len() as u64);
                if write_tx.send(plaintext).await.is_err() {
                    break [0u8; 32]; // writer failed; surfaced below
                }
                maybe_emit_progress(&args.emitter, tracker, last_progress, &descriptor.name);
            }
            Some(Ok(PeerMessage::FileComplete {
                file_index: done_file,
                sha256,
            })) => {
                if done_file != file_index {
                    writer.abort();
                    return Err(TransferError::Protocol(format!(
                        "completion for file {done_file} while receiving {file_index}"
                    )));
                }
                break sha256;
            }
            Some(Ok(PeerMessage::Ping)) => sink.send(&PeerMessage::Pong).await?,
            Some(Ok(PeerMessage::Cancel { reason })) => {
                debug!(reason = %reason, "peer cancelled mid-file");
                writer.abort();
                return Err(TransferError::Cancelled);
            }
            Some(Ok(other)) => {
                writer.abort();
                return Err(TransferError::Protocol(format!(
                    "unexpected message mid-file: {other:?}"
                )));
            }
            Some(Err(e)) => {
                writer.abort();
                return Err(e);
            }
            None => {
                writer.abort();
                return Err(TransferError::Network("transport closed".into()));
            }
        }
    };

    // Let the writer drain, then verify what landed on disk
    drop(write_tx);
    writer
        .await
        .map_err(|e| TransferError::Transfer(format!("file writer died: {e}")))?
        .map_err(|e| TransferError::Transfer(format!("writing {dest:?}: {e}")))?;

    let digest = hash.finalize();
    if digest != claimed_digest {
        warn!(file = %descriptor.name, "digest mismatch");
        return Err(TransferError::Transfer(format!(
            "checksum mismatch for {}",
            descriptor.name
        )));
    }

    sink.send(&PeerMessage::FileVerified { file_index }).await?;
    Ok(())
}

/// Where an offered file lands under the save directory.
fn destination_path(save_dir: &Path, descriptor: &FileDescriptor) -> PathBuf {
    match &descriptor.relative_path {
        Some(rel) => {
            let mut path = save_dir.to_path_buf();
            for segment in rel.split('/') {
                path.push(segment);
            }
            path
        }
        None => save_dir.join(&descriptor.name),
    }
}

