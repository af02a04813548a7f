//! Relay transport: a framing shim over the signaling WebSocket.
//!
//! After `relay_active` the rendezvous server stops parsing and pumps
//! binary messages between the peers, so each peer-protocol frame travels
//! as exactly one binary WebSocket message. The server never sees inside;
//! everything it forwards is ciphertext or framing.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::signaling::WsStream;
use crate::wire::{self, PeerMessage};

pub struct RelayTransport {
    ws: WsStream,
}

impl RelayTransport {
    /// Wrap a WebSocket that has already completed relay negotiation.
    pub fn new(ws: WsStream) -> Self {
        Self { ws }
    }

    /// Encode one message and send it as a single binary frame.
    pub async fn send_message(&mut self, msg: &PeerMessage) -> CoreResult<()> {
        let frame = wire::encode(msg)?;
        self.ws
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| CoreError::Network(format!("relay send: {e}")))?;
        Ok(())
    }

    /// Read one binary frame and decode it. A close from either side
    /// surfaces as end-of-stream.
    pub async fn recv_message(&mut self) -> CoreResult<PeerMessage> {
        loop {
            let raw = self
                .ws
                .next()
                .await
                .ok_or_else(|| CoreError::Network("relay connection closed".into()))?
                .map_err(|e| CoreError::Network(format!("relay recv: {e}")))?;

            match raw {
                Message::Binary(data) => return wire::decode(&data),
                Message::Close(_) => {
                    return Err(CoreError::Network("relay closed by peer".into()));
                }
                Message::Text(text) => {
                    // Late signaling chatter from the server; not ours.
                    debug!("relay: ignoring text frame: {text}");
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
