//! The imperative command surface.
//!
//! A desktop shell drives transfers through four calls - `start_send`,
//! `start_receive`, `accept_transfer`, `cancel_transfer` - and watches one
//! event stream keyed by session id. One transfer runs at a time; the
//! session state itself lives inside the orchestrator task and is reached
//! only through the cancellation token and the accept channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use relay_proto::{FileDescriptor, TransferCode, validate_offer};
use relay_transport::DirectEndpoint;

use crate::error::TransferError;
use crate::event::Event;
use crate::receiver::{self, ReceiverArgs};
use crate::sender::{self, SendFile, SenderArgs};
use crate::session::Emitter;

/// Stream of `(session_id, event)` pairs for the shell.
pub type EventReceiver = mpsc::UnboundedReceiver<(Uuid, Event)>;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rendezvous server, e.g. `ws://relay.example.net:8080`
    pub signal_server_url: String,
    /// Skip the direct QUIC attempt; for endpoints behind firewalls that
    /// are known to eat UDP
    pub force_relay: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signal_server_url: "ws://127.0.0.1:8080".into(),
            force_relay: false,
        }
    }
}

/// What `start_send` hands back to the shell.
#[derive(Debug, Clone)]
pub struct SendStarted {
    /// The code to read to the receiving person
    pub code: String,
    /// Session id for events and commands
    pub session_id: Uuid,
    /// The QUIC port this endpoint listens on
    pub port: u16,
}

struct ActiveSession {
    session_id: Uuid,
    cancel: CancellationToken,
    accept_tx: Mutex<Option<oneshot::Sender<bool>>>,
}

/// The transfer engine. Cheap to clone; all clones share one session slot
/// and one event stream.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    events: mpsc::UnboundedSender<(Uuid, Event)>,
    active: Mutex<Option<Arc<ActiveSession>>>,
}

impl Engine {
    /// Create an engine and the event stream its sessions publish to.
    #[must_use]
    pub fn new(config: EngineConfig) -> (Self, EventReceiver) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(EngineInner {
                    config,
                    events,
                    active: Mutex::new(None),
                }),
            },
            event_rx,
        )
    }

    /// Offer files (or a folder) under a fresh transfer code.
    ///
    /// Returns as soon as the session task is running; pairing progress
    /// arrives as events.
    ///
    /// # Errors
    ///
    /// [`TransferError::Transfer`] when a path is unreadable or a session
    /// is already running.
    pub async fn start_send(
        &self,
        paths: Vec<PathBuf>,
        signal_server_url: Option<String>,
    ) -> Result<SendStarted, TransferError> {
        let files = collect_files(&paths)?;
        if files.is_empty() {
            return Err(TransferError::Transfer("nothing to send".into()));
        }
        let descriptors: Vec<FileDescriptor> =
            files.iter().map(|f| f.descriptor.clone()).collect();
        validate_offer(&descriptors)
            .map_err(|e| TransferError::Transfer(format!("unsendable file: {e}")))?;

        let endpoint = DirectEndpoint::bind()?;
        let port = endpoint.port()?;
        let code = TransferCode::generate();
        let session_id = Uuid::new_v4();

        let session = self.claim_slot(session_id).await?;
        info!(%session_id, code = %code, "send session starting");

        let args = SenderArgs {
            code: code.clone(),
            files,
            server_url: signal_server_url
                .unwrap_or_else(|| self.inner.config.signal_server_url.clone()),
            endpoint,
            emitter: Emitter::new(session_id, self.inner.events.clone()),
            cancel: session.cancel.clone(),
            force_relay: self.inner.config.force_relay,
        };
        self.spawn_session(session_id, sender::run(args));

        Ok(SendStarted {
            code: code.as_str().to_string(),
            session_id,
            port,
        })
    }

    /// Receive whatever the code's sender offers into `save_dir`.
    ///
    /// # Errors
    ///
    /// [`TransferError::Transfer`] for a malformed code or a busy engine.
    pub async fn start_receive(
        &self,
        code: &str,
        save_dir: PathBuf,
        signal_server_url: Option<String>,
    ) -> Result<Uuid, TransferError> {
        let code = TransferCode::parse(code)
            .map_err(|e| TransferError::Transfer(format!("bad transfer code: {e}")))?;

        let endpoint = DirectEndpoint::bind()?;
        let session_id = Uuid::new_v4();
        let session = self.claim_slot(session_id).await?;
        info!(%session_id, code = %code, "receive session starting");

        let (accept_tx, decision) = oneshot::channel();
        *session.accept_tx.lock().await = Some(accept_tx);

        let args = ReceiverArgs {
            code,
            save_dir,
            server_url: signal_server_url
                .unwrap_or_else(|| self.inner.config.signal_server_url.clone()),
            endpoint,
            emitter: Emitter::new(session_id, self.inner.events.clone()),
            cancel: session.cancel.clone(),
            decision,
            force_relay: self.inner.config.force_relay,
        };
        self.spawn_session(session_id, receiver::run(args));

        Ok(session_id)
    }

    /// Resolve the receiver's pending offer decision.
    ///
    /// # Errors
    ///
    /// [`TransferError::Transfer`] when the session is unknown or not
    /// waiting on a decision.
    pub async fn accept_transfer(
        &self,
        session_id: Uuid,
        accept: bool,
    ) -> Result<(), TransferError> {
        let session = self.find(session_id).await?;
        let Some(tx) = session.accept_tx.lock().await.take() else {
            return Err(TransferError::Transfer(
                "session is not awaiting a decision".into(),
            ));
        };
        let _ = tx.send(accept);
        Ok(())
    }

    /// Cancel a running session; the task tears everything down and emits
    /// the terminal state.
    ///
    /// # Errors
    ///
    /// [`TransferError::Transfer`] when the session is unknown.
    pub async fn cancel_transfer(&self, session_id: Uuid) -> Result<(), TransferError> {
        let session = self.find(session_id).await?;
        session.cancel.cancel();
        Ok(())
    }

    async fn claim_slot(&self, session_id: Uuid) -> Result<Arc<ActiveSession>, TransferError> {
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            return Err(TransferError::Transfer(
                "a transfer is already in progress".into(),
            ));
        }

        let session = Arc::new(ActiveSession {
            session_id,
            cancel: CancellationToken::new(),
            accept_tx: Mutex::new(None),
        });
        *active = Some(session.clone());
        Ok(session)
    }

    fn spawn_session(&self, session_id: Uuid, task: impl Future<Output = ()> + Send + 'static) {
        let inner = self.inner.clone();
        let session = tokio::spawn(task);
        tokio::spawn(async move {
            // Free the slot even if the session task panicked
            let _ = session.await;
            let mut active = inner.active.lock().await;
            if let Some(current) = active.as_ref() {
                if current.session_id == session_id {
                    *active = None;
                }
            }
        });
    }

    async fn find(&self, session_id: Uuid) -> Result<Arc<ActiveSession>, TransferError> {
        let active = self.inner.active.lock().await;
        match active.as_ref() {
            Some(session) if session.session_id == session_id => Ok(session.clone()),
            _ => Err(TransferError::Transfer("unknown session".into())),
        }
    }
}

/// Expand the given paths into concrete files. A directory becomes all of
/// its files with relative paths rooted at the directory's own name.
fn collect_files(paths: &[PathBuf]) -> Result<Vec<SendFile>, TransferError> {
    let mut files = Vec::new();

    for path in paths {
        let meta = std::fs::metadata(path)
            .map_err(|e| TransferError::Transfer(format!("cannot read {path:?}: {e}")))?;

        if meta.is_dir() {
            let root_name = file_name(path)?;
            walk_dir(path, &root_name, &mut files)?;
        } else {
            files.push(SendFile {
                path: path.clone(),
                descriptor: FileDescriptor {
                    name: file_name(path)?,
                    size: meta.len(),
                    relative_path: None,
                },
            });
        }
    }

    Ok(files)
}

fn walk_dir(
    dir: &Path,
    prefix: &str,
    files: &mut Vec<SendFile>,
) -> Result<(), TransferError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| TransferError::Transfer(format!("cannot read {dir:?}: {e}")))?
        .collect::<Result<_, _>>()
        .map_err(|e| TransferError::Transfer(format!("cannot read {dir:?}: {e}")))?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let name = file_name(&path)?;
        let child_prefix = format!("{prefix}/{name}");

        let meta = entry
            .metadata()
            .map_err(|e| TransferError::Transfer(format!("cannot read {path:?}: {e}")))?;

        if meta.is_dir() {
            walk_dir(&path, &child_prefix, files)?;
        } else {
            files.push(SendFile {
                path,
                descriptor: FileDescriptor {
                    name,
                    size: meta.len(),
                    relative_path: Some(child_prefix),
                },
            });
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::Transfer(format!("{path:?} has no file name")))
}
