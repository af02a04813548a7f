//! The `/ws/{code}` handler: registration, peer announcement, signaling
//! forwarding, and the handoff into relay mode.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::relay::run_relay;
use crate::state::{Peer, PeerNetInfo, Role, ServerState, Session, SignalFrame};

/// Deadline for the register frame after the upgrade.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, code, remote))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, code: String, remote: SocketAddr) {
    let (mut tx, mut rx) = socket.split();

    // First frame must be a register with a valid role.
    let register = match tokio::time::timeout(REGISTER_TIMEOUT, read_signal_frame(&mut rx)).await {
        Ok(Some(frame)) if frame.kind == "register" => frame,
        Ok(_) | Err(_) => {
            let reply = SignalFrame::error(
                "INVALID_MESSAGE",
                "first message must be register with role sender or receiver",
            );
            let _ = tx
                .send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
                .await;
            let _ = tx.send(Message::Close(None)).await;
            return;
        }
    };

    let role = match register.role.as_deref().and_then(Role::parse) {
        Some(role) => role,
        None => {
            let reply = SignalFrame::error(
                "INVALID_MESSAGE",
                "first message must be register with role sender or receiver",
            );
            let _ = tx
                .send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
                .await;
            let _ = tx.send(Message::Close(None)).await;
            return;
        }
    };

    let peer = Arc::new(Peer::new(role, register.peer_info, remote, tx));

    let (session, announce) = match state.join(&code, peer.clone()).await {
        Ok(joined) => joined,
        Err(e) => {
            let _ = peer
                .send_frame(&SignalFrame::error("CODE_IN_USE", e.message()))
                .await;
            peer.send_close().await;
            return;
        }
    };

    info!(
        "session {code}: {} registered from {remote}",
        role.as_str()
    );

    // Second slot just filled: tell each peer about the other.
    if let Some((sender, receiver)) = announce {
        announce_peers(&sender, &receiver).await;
    }

    signal_loop(&session, &peer, &mut rx, &code).await;

    // Park the read half for the relay pumps and mark this loop finished.
    *peer.parked_rx.lock().await = Some(rx);
    peer.done.cancel();

    let relay_active = session.slots.lock().await.relay_active;
    if relay_active {
        relay_handoff(&state, &session, &peer, &code).await;
    } else {
        signaling_cleanup(&state, &session, &peer, &code).await;
    }
}

/// After both read loops exit, the sender's handler owns the relay; the
/// receiver's handler blocks until forwarding ends so the HTTP server does
/// not tear down its half of the TCP connection.
async fn relay_handoff(state: &Arc<ServerState>, session: &Arc<Session>, peer: &Arc<Peer>, code: &str) {
    if peer.role == Role::Sender {
        let receiver = session.slots.lock().await.receiver.clone();
        if let Some(receiver) = receiver {
            receiver.done.cancelled().await;
            run_relay(session, peer.clone(), receiver, state.opts.relay_rate_limit).await;
        }

        {
            let mut slots = session.slots.lock().await;
            slots.sender = None;
            slots.receiver = None;
        }
        state.remove_session(session).await;
        session.relay_done.cancel();
        info!("session {code}: relay finished");
    } else {
        tokio::select! {
            _ = session.relay_done.cancelled() => {}
            _ = session.expired.cancelled() => {}
        }
    }
}

async fn signaling_cleanup(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    peer: &Arc<Peer>,
    code: &str,
) {
    let (other, empty) = {
        let mut slots = session.slots.lock().await;
        *slots.slot(peer.role) = None;
        (slots.other(peer.role), slots.both_empty())
    };

    peer.send_close().await;

    if let Some(other) = other {
        let _ = other
            .send_frame(&SignalFrame {
                message: Some(format!("{} disconnected", peer.role.as_str())),
                ..SignalFrame::of_kind("peer_disconnected")
            })
            .await;
    }

    if empty {
        state.remove_session(session).await;
        info!("session {code}: removed (both slots empty)");
    }
}

/// Read and dispatch signaling frames until the peer disconnects, asks to,
/// or acknowledges relay activation with `relay_ready`.
async fn signal_loop(
    session: &Arc<Session>,
    peer: &Arc<Peer>,
    rx: &mut SplitStream<WebSocket>,
    code: &str,
) {
    loop {
        let msg = tokio::select! {
            _ = session.expired.cancelled() => {
                peer.send_close().await;
                return;
            }
            msg = rx.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(Message::Binary(_))) => {
                warn!("session {code}: binary frame before relay mode");
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("session {code}: read error: {e}");
                return;
            }
        };

        let frame: SignalFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let _ = peer
                    .send_frame(&SignalFrame::error("INVALID_MESSAGE", "malformed frame"))
                    .await;
                continue;
            }
        };

        match frame.kind.as_str() {
            "disconnect" => return,

            // The client's framing layer is drained; hand the socket to
            // the relay pumps.
            "relay_ready" => return,

            "spake2" | "cert_fingerprint" => {
                if let Some(other) = session.other_peer(peer.role).await {
                    if other.send_text(text.to_string()).await.is_err() {
                        warn!("session {code}: forward failed");
                        return;
                    }
                }
            }

            "relay_request" => {
                let (both_want, other) = {
                    let mut slots = session.slots.lock().await;
                    match peer.role {
                        Role::Sender => slots.sender_wants_relay = true,
                        Role::Receiver => slots.receiver_wants_relay = true,
                    }
                    let both = slots.sender_wants_relay && slots.receiver_wants_relay;
                    if both {
                        slots.relay_active = true;
                    }
                    (both, slots.other(peer.role))
                };

                if both_want {
                    info!("session {code}: both peers requested relay");
                    let (sender, receiver) = {
                        let slots = session.slots.lock().await;
                        (slots.sender.clone(), slots.receiver.clone())
                    };
                    for p in [sender, receiver].into_iter().flatten() {
                        let _ = p.send_frame(&SignalFrame::of_kind("relay_active")).await;
                    }
                } else if let Some(other) = other {
                    let _ = other.send_text(text.to_string()).await;
                }
            }

            other_kind => {
                let _ = peer
                    .send_frame(&SignalFrame::error(
                        "UNKNOWN_TYPE",
                        format!("unsupported message type: {other_kind}"),
                    ))
                    .await;
            }
        }
    }
}

async fn announce_peers(sender: &Arc<Peer>, receiver: &Arc<Peer>) {
    let _ = sender
        .send_frame(&SignalFrame {
            peer_info: Some(announced_info(receiver)),
            ..SignalFrame::of_kind("peer_joined")
        })
        .await;
    let _ = receiver
        .send_frame(&SignalFrame {
            peer_info: Some(announced_info(sender)),
            ..SignalFrame::of_kind("peer_joined")
        })
        .await;
}

/// Merge declared local info with the observed public address. The public
/// port is the peer's declared QUIC port; its WebSocket source port is
/// useless to the other side.
fn announced_info(peer: &Peer) -> PeerNetInfo {
    match &peer.info {
        Some(info) => PeerNetInfo {
            public_ip: peer.remote.ip().to_string(),
            public_port: info.local_port,
            local_ip: info.local_ip.clone(),
            local_port: info.local_port,
        },
        None => PeerNetInfo {
            public_ip: peer.remote.ip().to_string(),
            public_port: peer.remote.port(),
            ..Default::default()
        },
    }
}

async fn read_signal_frame(rx: &mut SplitStream<WebSocket>) -> Option<SignalFrame> {
    loop {
        match rx.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}
