//! # Relay Core
//!
//! The transfer orchestrator: everything between the command surface a
//! desktop shell calls and the transports that move bytes.
//!
//! - **Engine**: `start_send` / `start_receive` / `accept_transfer` /
//!   `cancel_transfer`, with progress events on a single stream keyed by
//!   session id
//! - **Sender and receiver state machines**: signaling, PAKE, fingerprint
//!   exchange, transport selection, offer/accept, chunked streaming with
//!   integrity verification
//! - **Progress tracking**: windowed speed and ETA, throttled events
//!
//! One transfer at a time per engine; a cancelled transfer is discarded,
//! not resumed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod event;
pub mod progress;
mod receiver;
mod sender;
mod session;

use std::time::Duration;

pub use engine::{Engine, EngineConfig, EventReceiver, SendStarted};
pub use error::TransferError;
pub use event::{ConnectionType, Event, TransferState};
pub use progress::ProgressTracker;

/// Deadline for the rendezvous to produce the counterpart peer
pub const SIGNALING_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the peer's PAKE and fingerprint messages
pub const PAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the server to acknowledge a relay request
pub const RELAY_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunks in flight between the file reader and the transport writer
pub const CHUNK_PIPELINE_DEPTH: usize = 32;

/// Minimum gap between two progress events
pub const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(100);
