//! The one seam both pipelines bind to: a transport is anything that can
//! move whole peer-protocol messages in order. The direct QUIC path and
//! the server relay are interchangeable behind it.

use std::time::Duration;

use quinn::{Connection, RecvStream, SendStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::quic::{DirectEndpoint, DirectOptions};
use crate::relay::RelayTransport;
use crate::signaling::{PeerNetInfo, SignalingClient};
use crate::wire::{self, PeerMessage};

pub enum Transport {
    /// Mutually authenticated QUIC connection, one bidirectional stream.
    Direct {
        conn: Connection,
        send: SendStream,
        recv: RecvStream,
    },
    /// Ciphertext pipe through the rendezvous server.
    Relay(RelayTransport),
}

impl Transport {
    pub async fn send_message(&mut self, msg: &PeerMessage) -> CoreResult<()> {
        match self {
            Transport::Direct { send, .. } => wire::write_frame(send, msg).await,
            Transport::Relay(ws) => ws.send_message(msg).await,
        }
    }

    pub async fn recv_message(&mut self) -> CoreResult<PeerMessage> {
        match self {
            Transport::Direct { recv, .. } => wire::read_frame(recv).await,
            Transport::Relay(ws) => ws.recv_message().await,
        }
    }

    /// Flush and close the sending side. The QUIC connection lingers just
    /// long enough for in-flight data to drain.
    pub async fn close(&mut self) -> CoreResult<()> {
        match self {
            Transport::Direct { conn, send, .. } => {
                send.finish()
                    .map_err(|e| CoreError::Network(format!("finish stream: {e}")))?;
                // Give the peer a moment to read the tail before teardown.
                tokio::time::sleep(Duration::from_millis(100)).await;
                conn.close(0u32.into(), b"done");
                Ok(())
            }
            Transport::Relay(ws) => {
                ws.close().await;
                Ok(())
            }
        }
    }

    pub fn is_relay(&self) -> bool {
        matches!(self, Transport::Relay(_))
    }
}

/// What transport negotiation settled on.
pub enum NegotiatedPath {
    Direct(Connection),
    Relay(RelayTransport),
}

/// Race the direct QUIC attempt against the peer asking for relay, falling
/// back to relay when the direct phase fails. On a direct win the signaling
/// socket is dismissed; on relay it becomes the transport.
pub async fn negotiate_path(
    mut signaling: SignalingClient,
    quic: &DirectEndpoint,
    peer: &PeerNetInfo,
    opts: &DirectOptions,
    dial_delay: Duration,
    relay_ack_timeout: Duration,
    cancel: &CancellationToken,
) -> CoreResult<NegotiatedPath> {
    enum Race {
        Direct(CoreResult<Connection>),
        PeerWantsRelay,
        SignalingDied,
        Cancelled,
    }

    let race = if opts.enabled {
        // Biased: a completed direct connection must win over signaling
        // chatter that may land in the same poll.
        tokio::select! {
            biased;
            res = quic.establish_direct(peer, opts, dial_delay) => Race::Direct(res),
            req = signaling.wait_relay_request() => match req {
                Ok(()) => Race::PeerWantsRelay,
                Err(e) => {
                    debug!("transport: signaling ended while racing direct: {e}");
                    Race::SignalingDied
                }
            },
            _ = cancel.cancelled() => Race::Cancelled,
        }
    } else {
        info!("transport: direct path disabled, going straight to relay");
        Race::PeerWantsRelay
    };

    let direct_result = match race {
        Race::Cancelled => {
            signaling.disconnect().await;
            return Err(CoreError::Cancelled);
        }
        Race::Direct(res) => Some(res),
        Race::PeerWantsRelay => {
            info!("transport: falling back to relay");
            None
        }
        // Signaling may die because the peer already went direct and hung
        // up; give the direct path its full budget before failing.
        Race::SignalingDied => Some(quic.establish_direct(peer, opts, dial_delay).await),
    };

    match direct_result {
        Some(Ok(conn)) => {
            info!("transport: direct QUIC path established");
            signaling.disconnect().await;
            Ok(NegotiatedPath::Direct(conn))
        }
        Some(Err(e)) => {
            debug!("transport: direct path failed ({e}), requesting relay");
            signaling.enter_relay(relay_ack_timeout).await?;
            Ok(NegotiatedPath::Relay(RelayTransport::new(
                signaling.into_inner(),
            )))
        }
        None => {
            signaling.enter_relay(relay_ack_timeout).await?;
            Ok(NegotiatedPath::Relay(RelayTransport::new(
                signaling.into_inner(),
            )))
        }
    }
}

/// Receive the next message unless the session is cancelled first.
/// `Ok(None)` means cancellation won the race.
pub async fn recv_or_cancel(
    transport: &mut Transport,
    cancel: &CancellationToken,
) -> CoreResult<Option<PeerMessage>> {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        msg = transport.recv_message() => Some(msg),
    };
    match outcome {
        None => Ok(None),
        Some(msg) => msg.map(Some),
    }
}
