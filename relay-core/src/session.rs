use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::code::TransferCode;
use crate::quic::DirectOptions;

/// Default rendezvous server.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

/// Tunables shared by both pipelines. Defaults are the production policy;
/// tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub server_url: String,
    pub direct: DirectOptions,
    /// Budget for each signaling stage (waiting for the peer, the key
    /// exchange, the fingerprint exchange).
    pub signaling_timeout: Duration,
    /// How long to wait for the server to activate relay mode.
    pub relay_ack_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            direct: DirectOptions::default(),
            signaling_timeout: Duration::from_secs(30),
            relay_ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Which end of the transfer this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
    Receiver,
}

impl TransferRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferRole::Sender => "sender",
            TransferRole::Receiver => "receiver",
        }
    }
}

/// Phases of the client-side state machine. The graph is acyclic; the only
/// loop is Streaming over successive chunks, driven by explicit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Signaling,
    AwaitPeer,
    KeyExchange,
    FingerprintExchange,
    TransportSelect,
    Offering,
    AwaitOffer,
    AwaitUserDecision,
    Streaming,
    Completed,
    Cancelled,
    Errored,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Signaling => "signaling",
            SessionPhase::AwaitPeer => "await_peer",
            SessionPhase::KeyExchange => "key_exchange",
            SessionPhase::FingerprintExchange => "fingerprint_exchange",
            SessionPhase::TransportSelect => "transport_select",
            SessionPhase::Offering => "offering",
            SessionPhase::AwaitOffer => "await_offer",
            SessionPhase::AwaitUserDecision => "await_user_decision",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Completed => "completed",
            SessionPhase::Cancelled => "cancelled",
            SessionPhase::Errored => "errored",
        }
    }
}

/// One live transfer, sending or receiving.
///
/// The session owns the cancellation token checked at every suspension
/// point; the derived key and transports live inside the pipeline and die
/// with it.
pub struct TransferSession {
    pub id: String,
    pub role: TransferRole,
    pub code: TransferCode,
    phase: Arc<RwLock<SessionPhase>>,
    pub cancel: CancellationToken,
}

impl TransferSession {
    pub fn new(role: TransferRole, code: TransferCode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            code,
            phase: Arc::new(RwLock::new(SessionPhase::Idle)),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn set_phase(&self, phase: SessionPhase) {
        *self.phase.write().await = phase;
    }

    pub async fn phase(&self) -> SessionPhase {
        *self.phase.read().await
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }
}
