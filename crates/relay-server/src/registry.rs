//! Session registry.
//!
//! Codes map to sessions; sessions hold at most one sender and one
//! receiver. The map sits behind a read/write mutex, each session behind
//! its own mutex, and each peer's WebSocket write half behind a write
//! mutex, so no shared state is ever touched without a lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_proto::{PeerAddr, Role, SignalError, SignalMessage};

use crate::limiter::RelayLimiter;

/// Write half of a peer's WebSocket, shared with the opposite pump.
pub type PeerSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Server configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cap on concurrently registered codes
    pub max_sessions: usize,
    /// Session lifetime from creation
    pub session_ttl: Duration,
    /// Relay bytes-per-second per session (both directions combined)
    pub relay_rate_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_ttl: Duration::from_secs(600),
            relay_rate_limit: 10 * 1024 * 1024,
        }
    }
}

/// One registered peer.
pub struct Peer {
    /// Serialized frame writer
    pub sink: PeerSink,
    /// Announcement info, public fields already rewritten
    pub addr: PeerAddr,
}

impl Peer {
    /// Send one signaling frame to this peer, serialized under its write
    /// mutex.
    pub async fn send(&self, message: &SignalMessage) -> bool {
        use futures_util::SinkExt;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(message.to_json().into()))
            .await
            .is_ok()
    }
}

/// One pairing session.
pub struct Session {
    /// The transfer code naming this session
    pub code: String,
    /// Sender slot
    pub sender: Option<Peer>,
    /// Receiver slot
    pub receiver: Option<Peer>,
    /// Relay request flag per slot; transitions are monotonic
    pub sender_wants_relay: bool,
    /// Relay request flag per slot; transitions are monotonic
    pub receiver_wants_relay: bool,
    /// Set once both flags are up; never reverts
    pub relay_active: bool,
    /// Cancelled on expiry or when the relay phase ends
    pub shutdown: CancellationToken,
    /// Completed by the sender's handler after its pump drains
    pub relay_done: watch::Sender<bool>,
    /// Shared bandwidth budget for both pump directions
    pub limiter: Arc<RelayLimiter>,
    expires_at: Instant,
}

impl Session {
    fn new(code: String, config: &ServerConfig) -> Self {
        let (relay_done, _) = watch::channel(false);
        Self {
            code,
            sender: None,
            receiver: None,
            sender_wants_relay: false,
            receiver_wants_relay: false,
            relay_active: false,
            shutdown: CancellationToken::new(),
            relay_done,
            limiter: Arc::new(RelayLimiter::new(config.relay_rate_limit)),
            expires_at: Instant::now() + config.session_ttl,
        }
    }

    /// Slot accessor by role.
    #[must_use]
    pub fn slot(&self, role: Role) -> &Option<Peer> {
        match role {
            Role::Sender => &self.sender,
            Role::Receiver => &self.receiver,
        }
    }

    /// Mutable slot accessor by role.
    pub fn slot_mut(&mut self, role: Role) -> &mut Option<Peer> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    /// Both slots vacated?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sender.is_none() && self.receiver.is_none()
    }

    /// Record one peer's relay request; true once both have asked.
    pub fn request_relay(&mut self, role: Role) -> bool {
        match role {
            Role::Sender => self.sender_wants_relay = true,
            Role::Receiver => self.receiver_wants_relay = true,
        }
        if self.sender_wants_relay && self.receiver_wants_relay {
            self.relay_active = true;
        }
        self.relay_active
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// The code-to-session map.
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    config: ServerConfig,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Fetch or create the session for a code.
    ///
    /// # Errors
    ///
    /// `CodeInUse` when creating would exceed `max_sessions`; the same code
    /// covers slot conflicts, which the caller checks under the session
    /// mutex.
    pub async fn open(&self, code: &str) -> Result<Arc<Mutex<Session>>, SignalError> {
        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get(code) {
            return Ok(session.clone());
        }

        if sessions.len() >= self.config.max_sessions {
            warn!(code, "session cap reached");
            return Err(SignalError::CodeInUse);
        }

        let session = Arc::new(Mutex::new(Session::new(code.to_string(), &self.config)));
        sessions.insert(code.to_string(), session.clone());
        info!(code, "session created");
        Ok(session)
    }

    /// Remove a session unconditionally.
    pub async fn remove(&self, code: &str) {
        if self.sessions.write().await.remove(code).is_some() {
            info!(code, "session removed");
        }
    }

    /// Remove the session if both slots are empty.
    pub async fn remove_if_empty(&self, code: &str) {
        let mut sessions = self.sessions.write().await;
        let empty = match sessions.get(code) {
            Some(session) => session.lock().await.is_empty(),
            None => return,
        };
        if empty {
            sessions.remove(code);
            info!(code, "session removed (both slots empty)");
        }
    }

    /// Number of live sessions, as reported by `/health`.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop every session past its TTL, cancelling its connections.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        let mut expired = Vec::new();
        for (code, session) in sessions.iter() {
            let session = session.lock().await;
            if session.is_expired(now) {
                session.shutdown.cancel();
                expired.push(code.clone());
            }
        }

        for code in expired {
            sessions.remove(&code);
            info!(code, "session expired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize, ttl: Duration) -> ServerConfig {
        ServerConfig {
            max_sessions: max,
            session_ttl: ttl,
            relay_rate_limit: 1024,
        }
    }

    #[tokio::test]
    async fn open_is_idempotent_per_code() {
        let registry = Registry::new(config(10, Duration::from_secs(60)));

        let first = registry.open("3-apple-river").await.unwrap();
        let second = registry.open("3-apple-river").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let registry = Registry::new(config(2, Duration::from_secs(60)));

        registry.open("1-acorn-anvil").await.unwrap();
        registry.open("2-bison-cedar").await.unwrap();
        assert_eq!(
            registry.open("3-apple-river").await.unwrap_err(),
            SignalError::CodeInUse
        );

        // Existing codes still resolve at the cap
        assert!(registry.open("1-acorn-anvil").await.is_ok());
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let registry = Registry::new(config(10, Duration::from_millis(10)));

        let session = registry.open("7-guitar-palace").await.unwrap();
        let shutdown = session.lock().await.shutdown.clone();

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.sweep_expired().await;

        assert_eq!(registry.active_sessions().await, 0);
        assert!(shutdown.is_cancelled());

        // The code is free again
        assert!(registry.open("7-guitar-palace").await.is_ok());
    }

    #[tokio::test]
    async fn relay_flags_are_monotonic() {
        let registry = Registry::new(config(10, Duration::from_secs(60)));
        let session = registry.open("5-delta-echo").await.unwrap();

        let mut session = session.lock().await;
        assert!(!session.request_relay(Role::Sender));
        assert!(!session.relay_active);
        assert!(session.request_relay(Role::Receiver));
        assert!(session.relay_active);

        // Asking again changes nothing
        assert!(session.request_relay(Role::Sender));
        assert!(session.relay_active);
    }

    #[tokio::test]
    async fn remove_if_empty_drops_vacated_sessions() {
        let registry = Registry::new(config(10, Duration::from_secs(60)));
        registry.open("4-frost-lily").await.unwrap();

        registry.remove_if_empty("4-frost-lily").await;
        assert_eq!(registry.active_sessions().await, 0);
    }
}
