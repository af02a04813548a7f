//! WebSocket client for the rendezvous server.
//!
//! One connection carries the whole signaling conversation: register, wait
//! for the peer, forward the key-exchange and fingerprint payloads, and
//! optionally flip into relay mode. In relay mode the same socket becomes
//! the byte carrier, so the client never reconnects mid-session.

use std::net::SocketAddr;
use std::time::Duration;

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::crypto::{self, KEY_LEN, NONCE_LEN};
use crate::error::{CoreError, CoreResult};
use crate::session::TransferRole;

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Delay before the single reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Network addresses a peer can be reached at. The server fills in the
/// public fields from what it observes; clients only declare local ones.
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

/// Envelope for every signaling frame, both directions.
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
    fn of_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }
}

pub struct SignalingClient {
    ws: WsStream,
}

impl SignalingClient {
    /// Connect to the rendezvous server for the given transfer code,
    /// retrying once before giving up.
    pub async fn connect(server_url: &str, code: &str) -> CoreResult<Self> {
        let base = server_url.trim_end_matches('/');
        let url = format!("{base}/ws/{code}");
        info!("signaling: connecting to {url}");

        let ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(first) => {
                warn!("signaling: connect failed ({first}), retrying once");
                tokio::time::sleep(RECONNECT_DELAY).await;
                let (ws, _) = connect_async(url.as_str()).await.map_err(|e| {
                    CoreError::Signaling(format!("failed to connect to {url}: {e}"))
                })?;
                ws
            }
        };

        Ok(Self { ws })
    }

    /// Register as sender or receiver, declaring our QUIC listen address.
    pub async fn register(
        &mut self,
        role: TransferRole,
        quic_addr: Option<SocketAddr>,
    ) -> CoreResult<()> {
        let peer_info = quic_addr.map(|addr| {
            let ip = addr.ip();
            let local_ip = if ip.is_unspecified() {
                local_ip().unwrap_or_else(|| "127.0.0.1".to_string())
            } else {
                ip.to_string()
            };
            PeerNetInfo {
                local_ip,
                local_port: addr.port(),
                ..Default::default()
            }
        });

        let frame = SignalFrame {
            role: Some(role.as_str().to_string()),
            peer_info,
            ..SignalFrame::of_kind("register")
        };
        self.send(&frame).await?;
        info!("signaling: registered as {}", role.as_str());
        Ok(())
    }

    /// Block until the other peer joins. Returns its network info.
    pub async fn wait_for_peer(&mut self) -> CoreResult<PeerNetInfo> {
        loop {
            let frame = self.recv().await?;
            match frame.kind.as_str() {
                "peer_joined" => {
                    let info = frame.peer_info.ok_or_else(|| {
                        CoreError::Signaling("peer_joined without peer_info".into())
                    })?;
                    info!(
                        "signaling: peer joined (public {}:{}, local {}:{})",
                        info.public_ip, info.public_port, info.local_ip, info.local_port
                    );
                    return Ok(info);
                }
                "error" => return Err(server_error(frame)),
                "peer_disconnected" => {
                    return Err(CoreError::Signaling("peer disconnected".into()));
                }
                other => debug!("signaling: ignoring '{other}' while waiting for peer"),
            }
        }
    }

    /// Send our key-exchange message and return the peer's.
    pub async fn exchange_key_material(&mut self, outbound: &[u8]) -> CoreResult<Vec<u8>> {
        let frame = SignalFrame {
            payload: Some(BASE64_STANDARD.encode(outbound)),
            ..SignalFrame::of_kind("spake2")
        };
        self.send(&frame).await?;
        debug!("signaling: sent key-exchange message ({} bytes)", outbound.len());

        loop {
            let frame = self.recv().await?;
            match frame.kind.as_str() {
                "spake2" => {
                    let encoded = frame.payload.ok_or_else(|| {
                        CoreError::Signaling("spake2 frame without payload".into())
                    })?;
                    let decoded = BASE64_STANDARD
                        .decode(&encoded)
                        .map_err(|e| CoreError::Signaling(format!("bad base64: {e}")))?;
                    debug!("signaling: received key-exchange message ({} bytes)", decoded.len());
                    return Ok(decoded);
                }
                "error" => return Err(server_error(frame)),
                "peer_disconnected" => {
                    return Err(CoreError::Signaling("peer disconnected".into()));
                }
                other => debug!("signaling: ignoring '{other}' during key exchange"),
            }
        }
    }

    /// Exchange certificate fingerprints, sealed under the session key.
    ///
    /// This is where a code mismatch actually surfaces: the peer's payload
    /// will not open under our key and the session dies with `Crypto`.
    pub async fn exchange_fingerprint(
        &mut self,
        ours: &[u8; 32],
        key: &[u8; KEY_LEN],
    ) -> CoreResult<[u8; 32]> {
        let (ciphertext, nonce) = crypto::seal_once(key, ours)?;
        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&ciphertext);

        let frame = SignalFrame {
            payload: Some(BASE64_STANDARD.encode(&packed)),
            ..SignalFrame::of_kind("cert_fingerprint")
        };
        self.send(&frame).await?;
        debug!("signaling: sent certificate fingerprint");

        loop {
            let frame = self.recv().await?;
            match frame.kind.as_str() {
                "cert_fingerprint" => {
                    let encoded = frame.payload.ok_or_else(|| {
                        CoreError::Signaling("cert_fingerprint frame without payload".into())
                    })?;
                    let packed = BASE64_STANDARD
                        .decode(&encoded)
                        .map_err(|e| CoreError::Signaling(format!("bad base64: {e}")))?;
                    if packed.len() < NONCE_LEN {
                        return Err(CoreError::Signaling("cert_fingerprint too short".into()));
                    }

                    let nonce: [u8; NONCE_LEN] = packed[..NONCE_LEN].try_into().unwrap();
                    let plaintext = crypto::open_once(key, &packed[NONCE_LEN..], &nonce)?;
                    let fingerprint: [u8; 32] = plaintext.as_slice().try_into().map_err(|_| {
                        CoreError::Crypto(format!(
                            "fingerprint has wrong size: {} bytes",
                            plaintext.len()
                        ))
                    })?;
                    debug!("signaling: received peer certificate fingerprint");
                    return Ok(fingerprint);
                }
                "error" => return Err(server_error(frame)),
                "peer_disconnected" => {
                    return Err(CoreError::Signaling("peer disconnected".into()));
                }
                other => debug!("signaling: ignoring '{other}' during fingerprint exchange"),
            }
        }
    }

    /// Resolve when the peer asks for relay mode. Used to race against the
    /// direct connection attempt.
    pub async fn wait_relay_request(&mut self) -> CoreResult<()> {
        loop {
            let frame = self.recv().await?;
            match frame.kind.as_str() {
                "relay_request" => return Ok(()),
                "error" => return Err(server_error(frame)),
                "peer_disconnected" => {
                    return Err(CoreError::Signaling("peer disconnected".into()));
                }
                other => debug!("signaling: ignoring '{other}' while racing direct"),
            }
        }
    }

    /// Ask the server for relay mode and acknowledge activation. After this
    /// returns the socket carries only binary peer-protocol frames.
    pub async fn enter_relay(&mut self, ack_timeout: Duration) -> CoreResult<()> {
        self.send(&SignalFrame::of_kind("relay_request")).await?;

        let wait = async {
            loop {
                let frame = self.recv().await?;
                match frame.kind.as_str() {
                    "relay_active" => return Ok(()),
                    // Our own request forwarded back from the peer's side.
                    "relay_request" => continue,
                    "error" => return Err(server_error(frame)),
                    "peer_disconnected" => {
                        return Err(CoreError::Signaling("peer disconnected".into()));
                    }
                    other => debug!("signaling: ignoring '{other}' while entering relay"),
                }
            }
        };
        tokio::time::timeout(ack_timeout, wait)
            .await
            .map_err(|_| CoreError::Signaling("relay activation timed out".into()))??;

        self.send(&SignalFrame::of_kind("relay_ready")).await?;
        info!("signaling: relay active");
        Ok(())
    }

    /// Tell the server we are done and close the socket.
    pub async fn disconnect(mut self) {
        let _ = self.send(&SignalFrame::of_kind("disconnect")).await;
        let _ = self.ws.close(None).await;
        info!("signaling: disconnected");
    }

    /// Hand the raw socket over, for use as the relay transport.
    pub fn into_inner(self) -> WsStream {
        self.ws
    }

    async fn send(&mut self, frame: &SignalFrame) -> CoreResult<()> {
        let json = serde_json::to_string(frame)
            .map_err(|e| CoreError::Signaling(format!("serialize: {e}")))?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| CoreError::Signaling(format!("send: {e}")))?;
        Ok(())
    }

    async fn recv(&mut self) -> CoreResult<SignalFrame> {
        loop {
            let raw = self
                .ws
                .next()
                .await
                .ok_or_else(|| CoreError::Signaling("connection closed".into()))?
                .map_err(|e| CoreError::Signaling(format!("recv: {e}")))?;

            match raw {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| CoreError::Signaling(format!("deserialize: {e}")));
                }
                Message::Close(_) => {
                    return Err(CoreError::Signaling("server closed connection".into()));
                }
                Message::Binary(_) => {
                    debug!("signaling: ignoring binary frame");
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

fn server_error(frame: SignalFrame) -> CoreError {
    let code = frame.code.unwrap_or_else(|| "UNKNOWN".into());
    let message = frame.message.unwrap_or_else(|| "server error".into());
    CoreError::Signaling(format!("{code}: {message}"))
}

/// Find the LAN address by probing the default route. No packets are sent;
/// connecting a UDP socket just makes the OS pick the outbound interface.
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
