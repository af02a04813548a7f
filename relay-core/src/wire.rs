//! Framed peer protocol shared by both transports.
//!
//! Every message is serialized with a compact tagged binary encoding and
//! framed with a 4-byte big-endian length prefix. Over QUIC the frames are
//! written back to back on one bidirectional stream; over the relay each
//! frame travels as one binary WebSocket message, prefix retained so the
//! codec is identical on both paths.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::NONCE_LEN;
use crate::error::{CoreError, CoreResult};

/// Plaintext bytes per chunk.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Upper bound on a frame body. Well above one encrypted chunk; anything
/// bigger means a corrupt length prefix.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One file in an offer. `relative_path` is set only for folder transfers
/// and is validated by the receiver before anything touches the disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub relative_path: Option<String>,
}

/// Messages exchanged between the two peers once a transport is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Sender to receiver: the list of files on offer.
    FileOffer {
        session_id: String,
        files: Vec<FileDescriptor>,
    },
    /// Receiver to sender: go ahead.
    FileAccept,
    /// Receiver to sender: transfer refused.
    FileDecline,
    /// Sender to receiver: one encrypted chunk.
    FileChunk {
        file_index: u16,
        chunk_index: u32,
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
    },
    /// Sender to receiver: end of one file, verify against this digest.
    FileComplete { file_index: u16, sha256: [u8; 32] },
    /// Receiver to sender: digest matched.
    FileVerified { file_index: u16 },
    /// Sender to receiver: every file went through.
    TransferComplete,
    /// Either direction: abort the session.
    Cancel { reason: String },
    Ping,
    Pong,
}

/// Serialize a message into a length-prefixed frame.
pub fn encode(msg: &PeerMessage) -> CoreResult<Vec<u8>> {
    let body =
        bincode::serialize(msg).map_err(|e| CoreError::Protocol(format!("encode: {e}")))?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Inverse of [`encode`]. The whole frame must be present; truncation,
/// trailing garbage and unknown tags each produce a distinct error.
pub fn decode(frame: &[u8]) -> CoreResult<PeerMessage> {
    if frame.len() < 4 {
        return Err(CoreError::Protocol(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }

    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if frame.len() - 4 != len {
        return Err(CoreError::Protocol(format!(
            "frame length mismatch: prefix says {len}, got {} body bytes",
            frame.len() - 4
        )));
    }

    decode_body(&frame[4..])
}

fn decode_body(body: &[u8]) -> CoreResult<PeerMessage> {
    bincode::deserialize(body).map_err(|e| CoreError::Protocol(format!("decode: {e}")))
}

/// Read one frame from a byte stream (the QUIC path).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> CoreResult<PeerMessage> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| CoreError::Network(format!("read frame length: {e}")))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CoreError::Protocol(format!("frame too large: {len} bytes")));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| CoreError::Network(format!("read frame body: {e}")))?;

    decode_body(&body)
}

/// Write one frame to a byte stream (the QUIC path).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &PeerMessage,
) -> CoreResult<()> {
    let frame = encode(msg)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| CoreError::Network(format!("write frame: {e}")))?;
    Ok(())
}
