//! Session registry and per-connection state.
//!
//! The map of live sessions sits behind a read-write lock; each session
//! guards its slots with its own mutex, and every peer serializes writes to
//! its socket with a write mutex. Nothing shared is touched without one of
//! those three.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Server tunables, straight from the CLI.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_sessions: usize,
    pub session_ttl: Duration,
    /// Relay bandwidth budget per session, bytes per second.
    pub relay_rate_limit: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_ttl: Duration::from_secs(600),
            relay_rate_limit: 10 * 1024 * 1024,
        }
    }
}

/// Network info a peer declares at registration, echoed to the other side
/// with the public fields rewritten from what the server observes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerNetInfo {
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub public_port: u16,
    #[serde(default)]
    pub local_ip: String,
    #[serde(default)]
    pub local_port: u16,
}

/// Envelope for every signaling frame.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SignalFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_info: Option<PeerNetInfo>,
}

impl SignalFrame {
    pub fn of_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.to_string()),
            message: Some(message.into()),
            ..Self::of_kind("error")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sender" => Some(Role::Sender),
            "receiver" => Some(Role::Receiver),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

/// One side of a session.
pub struct Peer {
    pub role: Role,
    pub info: Option<PeerNetInfo>,
    /// Address observed on the WebSocket connection.
    pub remote: SocketAddr,
    /// Write half; the mutex keeps the signaling loop and the relay pumps
    /// from interleaving frames.
    tx: Mutex<SplitSink<WebSocket, Message>>,
    /// Read half parked here between the signaling loop and the relay.
    pub parked_rx: Mutex<Option<SplitStream<WebSocket>>>,
    /// Fires when this peer's signaling loop has exited.
    pub done: CancellationToken,
}

impl Peer {
    pub fn new(
        role: Role,
        info: Option<PeerNetInfo>,
        remote: SocketAddr,
        tx: SplitSink<WebSocket, Message>,
    ) -> Self {
        Self {
            role,
            info,
            remote,
            tx: Mutex::new(tx),
            parked_rx: Mutex::new(None),
            done: CancellationToken::new(),
        }
    }

    pub async fn send_frame(&self, frame: &SignalFrame) -> Result<(), axum::Error> {
        let json = serde_json::to_string(frame).expect("signal frames always serialize");
        self.send_raw(Message::Text(json.into())).await
    }

    /// Forward an already-serialized frame verbatim.
    pub async fn send_text(&self, text: String) -> Result<(), axum::Error> {
        self.send_raw(Message::Text(text.into())).await
    }

    pub async fn send_raw(&self, msg: Message) -> Result<(), axum::Error> {
        self.tx.lock().await.send(msg).await
    }

    pub async fn send_close(&self) {
        let _ = self.send_raw(Message::Close(None)).await;
    }
}

/// Slot state guarded by the session mutex. The relay flags only ever move
/// forward: requested stays requested, active stays active.
#[derive(Default)]
pub struct SessionSlots {
    pub sender: Option<Arc<Peer>>,
    pub receiver: Option<Arc<Peer>>,
    pub sender_wants_relay: bool,
    pub receiver_wants_relay: bool,
    pub relay_active: bool,
}

impl SessionSlots {
    pub fn slot(&mut self, role: Role) -> &mut Option<Arc<Peer>> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    pub fn other(&self, role: Role) -> Option<Arc<Peer>> {
        match role {
            Role::Sender => self.receiver.clone(),
            Role::Receiver => self.sender.clone(),
        }
    }

    pub fn both_connected(&self) -> bool {
        self.sender.is_some() && self.receiver.is_some()
    }

    pub fn both_empty(&self) -> bool {
        self.sender.is_none() && self.receiver.is_none()
    }
}

/// A signaling session keyed by transfer code.
pub struct Session {
    pub code: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub slots: Mutex<SessionSlots>,
    /// Fires when the TTL sweep evicts this session.
    pub expired: CancellationToken,
    /// Completed by the sender's handler once relay forwarding ends; the
    /// receiver's handler must outlive the relay or its socket dies.
    pub relay_done: CancellationToken,
    /// Bytes pumped through the relay, for observability.
    pub relayed_bytes: AtomicU64,
}

impl Session {
    fn new(code: String, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            code,
            created_at: now,
            expires_at: now + ttl,
            slots: Mutex::new(SessionSlots::default()),
            expired: CancellationToken::new(),
            relay_done: CancellationToken::new(),
            relayed_bytes: AtomicU64::new(0),
        }
    }

    pub async fn other_peer(&self, role: Role) -> Option<Arc<Peer>> {
        self.slots.lock().await.other(role)
    }
}

pub enum JoinError {
    /// The requested role slot is already occupied.
    SlotTaken(Role),
    /// The server is at its session cap.
    Capacity(usize),
}

impl JoinError {
    pub fn message(&self) -> String {
        match self {
            JoinError::SlotTaken(role) => {
                format!("{} already connected for this code", role.as_str())
            }
            JoinError::Capacity(max) => format!("max sessions reached ({max})"),
        }
    }
}

/// Everything the handlers share.
pub struct ServerState {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    pub opts: ServerOptions,
}

impl ServerState {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            opts,
        }
    }

    /// Install a peer into the session for `code`, creating the session if
    /// this is the first registration. Returns the session and, when this
    /// join filled the second slot, both peers for announcement.
    pub async fn join(
        &self,
        code: &str,
        peer: Arc<Peer>,
    ) -> Result<(Arc<Session>, Option<(Arc<Peer>, Arc<Peer>)>), JoinError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(code) {
                Some(existing) => existing.clone(),
                None => {
                    if sessions.len() >= self.opts.max_sessions {
                        return Err(JoinError::Capacity(self.opts.max_sessions));
                    }
                    let created = Arc::new(Session::new(code.to_string(), self.opts.session_ttl));
                    sessions.insert(code.to_string(), created.clone());
                    created
                }
            }
        };

        let mut slots = session.slots.lock().await;
        let slot = slots.slot(peer.role);
        if slot.is_some() {
            return Err(JoinError::SlotTaken(peer.role));
        }
        *slot = Some(peer);

        let announce = if slots.both_connected() {
            Some((
                slots.sender.clone().expect("both connected"),
                slots.receiver.clone().expect("both connected"),
            ))
        } else {
            None
        };
        drop(slots);

        Ok((session, announce))
    }

    /// Remove a session, but only if the map still holds this exact one.
    /// A TTL sweep may already have evicted it and let the code be reused;
    /// a stale handler must not take the newcomer down.
    pub async fn remove_session(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(&session.code) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(&session.code);
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, code: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(code).cloned()
    }

    /// Drop every session past its deadline, waking anything blocked on
    /// them. Returns how many were evicted.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let codes: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| now > s.expires_at)
                .map(|(code, _)| code.clone())
                .collect();
            codes
                .iter()
                .filter_map(|code| sessions.remove(code))
                .collect()
        };

        for session in &expired {
            info!("cleaning up expired session {}", session.code);
            session.expired.cancel();
            let slots = session.slots.lock().await;
            for peer in [slots.sender.clone(), slots.receiver.clone()].into_iter().flatten() {
                peer.send_close().await;
            }
        }

        expired.len()
    }
}
