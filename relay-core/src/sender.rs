//! Sender pipeline: signaling, key exchange, transport negotiation, then
//! the chunked streaming loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{ChunkSealer, KeyExchange, StreamingDigest};
use crate::error::{CoreError, CoreResult};
use crate::progress::{ConnectionType, EventSink, ProgressEvent, ProgressTracker};
use crate::quic::DirectEndpoint;
use crate::session::{PipelineConfig, SessionPhase, TransferRole, TransferSession};
use crate::signaling::SignalingClient;
use crate::transport::{negotiate_path, recv_or_cancel, NegotiatedPath, Transport};
use crate::wire::{FileDescriptor, PeerMessage, CHUNK_SIZE};

/// Chunks allowed in flight between the file reader and the transport
/// writer. Bounds sender memory at roughly 8 MiB.
const CHUNK_PIPELINE_DEPTH: usize = 32;

/// Directory entries never offered from folder expansion.
const SKIP_ENTRIES: &[&str] = &[".DS_Store", "Thumbs.db", "__MACOSX"];

/// The sender sits in listen mode: its own dialing is held back briefly so
/// the receiver's dial can land first and both sides settle on one
/// connection.
const SENDER_DIAL_DELAY: Duration = Duration::from_secs(1);

/// Run the full send flow. `quic` is already bound so the caller could
/// report our listen port; everything else happens here.
pub async fn run_send(
    paths: Vec<PathBuf>,
    session: Arc<TransferSession>,
    mut quic: DirectEndpoint,
    config: PipelineConfig,
    events: EventSink,
) -> CoreResult<()> {
    let code = session.code.to_string();

    session.set_phase(SessionPhase::Signaling).await;
    events.state("signaling").await;
    let mut signaling = SignalingClient::connect(&config.server_url, &code).await?;
    signaling
        .register(TransferRole::Sender, Some(quic.local_addr()?))
        .await?;

    session.set_phase(SessionPhase::AwaitPeer).await;
    events.state("await_peer").await;
    let peer_info = signaling_step(
        &session,
        config.signaling_timeout,
        signaling.wait_for_peer(),
    )
    .await?;

    session.set_phase(SessionPhase::KeyExchange).await;
    events.state("key_exchange").await;
    let exchange = KeyExchange::start(TransferRole::Sender, &code);
    let outbound = exchange.outbound_message().to_vec();
    let peer_pake = signaling_step(
        &session,
        config.signaling_timeout,
        signaling.exchange_key_material(&outbound),
    )
    .await?;
    let key = exchange.finish(&peer_pake)?;
    info!("sender: session key derived");

    session.set_phase(SessionPhase::FingerprintExchange).await;
    events.state("fingerprint_exchange").await;
    let peer_fingerprint = signaling_step(
        &session,
        config.signaling_timeout,
        signaling.exchange_fingerprint(&quic.fingerprint(), &key),
    )
    .await?;
    quic.arm(peer_fingerprint)?;

    session.set_phase(SessionPhase::TransportSelect).await;
    events.state("transport_select").await;
    let mut transport = match negotiate_path(
        signaling,
        &quic,
        &peer_info,
        &config.direct,
        SENDER_DIAL_DELAY,
        config.relay_ack_timeout,
        &session.cancel,
    )
    .await?
    {
        NegotiatedPath::Direct(conn) => {
            let (send, recv) = conn
                .open_bi()
                .await
                .map_err(|e| CoreError::Network(format!("failed to open stream: {e}")))?;
            events
                .emit(ProgressEvent::ConnectionTypeChanged {
                    connection_type: ConnectionType::Direct,
                })
                .await;
            Transport::Direct { conn, send, recv }
        }
        NegotiatedPath::Relay(ws) => {
            events
                .emit(ProgressEvent::ConnectionTypeChanged {
                    connection_type: ConnectionType::Relay,
                })
                .await;
            Transport::Relay(ws)
        }
    };

    let (files, descriptors) = expand_paths(&paths).await?;
    if files.is_empty() {
        return Err(CoreError::Transfer("nothing to send".into()));
    }

    session.set_phase(SessionPhase::Offering).await;
    events.state("offering").await;
    transport
        .send_message(&PeerMessage::FileOffer {
            session_id: session.id.clone(),
            files: descriptors.clone(),
        })
        .await?;

    loop {
        match recv_or_cancel(&mut transport, &session.cancel).await? {
            None => {
                let _ = transport
                    .send_message(&PeerMessage::Cancel {
                        reason: "cancelled by sender".into(),
                    })
                    .await;
                return Err(CoreError::Cancelled);
            }
            Some(PeerMessage::FileAccept) => {
                info!("sender: peer accepted the offer");
                break;
            }
            Some(PeerMessage::FileDecline) => {
                warn!("sender: peer declined the offer");
                return Err(CoreError::PeerRejected);
            }
            Some(PeerMessage::Ping) => transport.send_message(&PeerMessage::Pong).await?,
            Some(PeerMessage::Pong) => {}
            Some(PeerMessage::Cancel { reason }) => {
                return Err(CoreError::Transfer(format!("peer cancelled: {reason}")));
            }
            Some(other) => {
                return Err(CoreError::Protocol(format!(
                    "unexpected reply to offer: {other:?}"
                )));
            }
        }
    }

    session.set_phase(SessionPhase::Streaming).await;
    events.state("streaming").await;

    let total_bytes: u64 = descriptors.iter().map(|d| d.size).sum();
    let mut tracker = ProgressTracker::new(total_bytes);
    let mut sealer = ChunkSealer::new(&key)?;

    for (file_index, path) in files.iter().enumerate() {
        stream_one_file(
            path,
            file_index as u16,
            &descriptors[file_index].name,
            &session,
            &mut transport,
            &mut sealer,
            &mut tracker,
            &events,
        )
        .await?;
    }

    transport.send_message(&PeerMessage::TransferComplete).await?;
    transport.close().await?;

    session.set_phase(SessionPhase::Completed).await;
    events.state("completed").await;
    events
        .emit(ProgressEvent::TransferComplete {
            duration_seconds: tracker.elapsed_seconds(),
            average_speed_bps: tracker.average_speed_bps(),
            total_bytes,
            file_count: files.len() as u32,
        })
        .await;

    info!("sender: transfer complete");
    Ok(())
}

/// Stream one file: a reader task fills a bounded channel with plaintext
/// chunks while this task encrypts and writes them in order.
#[allow(clippy::too_many_arguments)]
async fn stream_one_file(
    path: &Path,
    file_index: u16,
    file_name: &str,
    session: &TransferSession,
    transport: &mut Transport,
    sealer: &mut ChunkSealer,
    tracker: &mut ProgressTracker,
    events: &EventSink,
) -> CoreResult<()> {
    info!("sender: streaming '{file_name}'");

    let (tx, mut rx) = mpsc::channel::<ReadItem>(CHUNK_PIPELINE_DEPTH);
    let reader_path = path.to_path_buf();
    tokio::spawn(async move {
        let mut reader = match FileChunkReader::open(&reader_path).await {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(ReadItem::Failed(e.to_string())).await;
                return;
            }
        };
        loop {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(ReadItem::Chunk(chunk)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(ReadItem::Done(reader.finalize())).await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(ReadItem::Failed(e.to_string())).await;
                    return;
                }
            }
        }
    });

    let mut chunk_index: u32 = 0;
    loop {
        if session.cancel.is_cancelled() {
            let _ = transport
                .send_message(&PeerMessage::Cancel {
                    reason: "cancelled by sender".into(),
                })
                .await;
            return Err(CoreError::Cancelled);
        }

        let item = rx
            .recv()
            .await
            .ok_or_else(|| CoreError::Transfer("file reader stopped unexpectedly".into()))?;

        match item {
            ReadItem::Chunk(plaintext) => {
                let plain_len = plaintext.len() as u64;
                let (ciphertext, nonce) = sealer.seal(&plaintext)?;
                transport
                    .send_message(&PeerMessage::FileChunk {
                        file_index,
                        chunk_index,
                        nonce,
                        ciphertext,
                    })
                    .await?;
                chunk_index += 1;

                tracker.update(plain_len);
                if tracker.should_emit() {
                    events.emit(tracker.snapshot(file_name)).await;
                }
            }
            ReadItem::Done(sha256) => {
                transport
                    .send_message(&PeerMessage::FileComplete { file_index, sha256 })
                    .await?;
                wait_for_verification(file_index, session, transport).await?;
                events.emit(tracker.snapshot(file_name)).await;
                events
                    .emit(ProgressEvent::FileCompleted {
                        name: file_name.to_string(),
                    })
                    .await;
                return Ok(());
            }
            ReadItem::Failed(msg) => return Err(CoreError::Transfer(msg)),
        }
    }
}

async fn wait_for_verification(
    file_index: u16,
    session: &TransferSession,
    transport: &mut Transport,
) -> CoreResult<()> {
    loop {
        match recv_or_cancel(transport, &session.cancel).await? {
            None => {
                let _ = transport
                    .send_message(&PeerMessage::Cancel {
                        reason: "cancelled by sender".into(),
                    })
                    .await;
                return Err(CoreError::Cancelled);
            }
            Some(PeerMessage::FileVerified { file_index: idx }) if idx == file_index => {
                debug!("sender: file {file_index} verified by receiver");
                return Ok(());
            }
            Some(PeerMessage::Ping) => transport.send_message(&PeerMessage::Pong).await?,
            Some(PeerMessage::Pong) => {}
            Some(PeerMessage::Cancel { reason }) => {
                return Err(CoreError::Transfer(format!("peer cancelled: {reason}")));
            }
            Some(other) => {
                return Err(CoreError::Protocol(format!(
                    "expected FileVerified, got {other:?}"
                )));
            }
        }
    }
}

enum ReadItem {
    Chunk(Vec<u8>),
    Done([u8; 32]),
    Failed(String),
}

/// Reads a file in fixed-size chunks while folding the content digest.
/// Every chunk is exactly `CHUNK_SIZE` bytes except the last.
pub struct FileChunkReader {
    file: tokio::fs::File,
    digest: StreamingDigest,
}

impl FileChunkReader {
    pub async fn open(path: &Path) -> CoreResult<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| CoreError::Transfer(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            file,
            digest: StreamingDigest::new(),
        })
    }

    /// The next plaintext chunk, or `None` at end of file.
    pub async fn next_chunk(&mut self) -> CoreResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;

        while filled < CHUNK_SIZE {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        self.digest.update(&buf);
        Ok(Some(buf))
    }

    /// SHA-256 of everything read so far.
    pub fn finalize(self) -> [u8; 32] {
        self.digest.finalize()
    }
}

/// Expand the command-line inputs: plain files pass through, directories
/// become their recursive listing with relative paths under the folder name.
pub(crate) async fn expand_paths(
    paths: &[PathBuf],
) -> CoreResult<(Vec<PathBuf>, Vec<FileDescriptor>)> {
    let mut files = Vec::new();
    let mut descriptors = Vec::new();

    for path in paths {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| CoreError::Transfer(format!("stat {}: {e}", path.display())))?;

        if meta.is_dir() {
            let folder = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "folder".into());

            for (file_path, relative) in walk_directory(path, &folder).await? {
                let size = tokio::fs::metadata(&file_path).await?.len();
                let name = file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unknown".into());
                descriptors.push(FileDescriptor {
                    name,
                    size,
                    relative_path: Some(relative),
                });
                files.push(file_path);
            }
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".into());
            descriptors.push(FileDescriptor {
                name,
                size: meta.len(),
                relative_path: None,
            });
            files.push(path.clone());
        }
    }

    Ok((files, descriptors))
}

/// Walk a directory iteratively, yielding (absolute, relative) pairs and
/// skipping dotfiles and junk entries.
async fn walk_directory(dir: &Path, prefix: &str) -> CoreResult<Vec<(PathBuf, String)>> {
    let mut result = Vec::new();
    let mut stack: Vec<(PathBuf, String)> = vec![(dir.to_path_buf(), prefix.to_string())];

    while let Some((current, current_prefix)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || SKIP_ENTRIES.contains(&name.as_str()) {
                continue;
            }

            let relative = format!("{current_prefix}/{name}");
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                stack.push((entry.path(), relative));
            } else if kind.is_file() {
                result.push((entry.path(), relative));
            }
        }
    }

    Ok(result)
}

async fn signaling_step<T>(
    session: &TransferSession,
    limit: Duration,
    fut: impl std::future::Future<Output = CoreResult<T>>,
) -> CoreResult<T> {
    tokio::select! {
        _ = session.cancel.cancelled() => Err(CoreError::Cancelled),
        res = tokio::time::timeout(limit, fut) => {
            res.map_err(|_| CoreError::Signaling("timed out waiting for peer".into()))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn chunk_count(len: usize) -> (usize, usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, vec![0xA5u8; len]).await.unwrap();

        let mut reader = FileChunkReader::open(&path).await.unwrap();
        let mut count = 0;
        let mut last_len = 0;
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            count += 1;
            last_len = chunk.len();
        }
        (count, last_len)
    }

    #[tokio::test]
    async fn zero_byte_file_yields_no_chunks() {
        let (count, _) = chunk_count(0).await;
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn exact_multiple_yields_exact_chunks() {
        let (count, last) = chunk_count(2 * CHUNK_SIZE).await;
        assert_eq!(count, 2);
        assert_eq!(last, CHUNK_SIZE);
    }

    #[tokio::test]
    async fn one_extra_byte_yields_one_extra_chunk() {
        let (count, last) = chunk_count(2 * CHUNK_SIZE + 1).await;
        assert_eq!(count, 3);
        assert_eq!(last, 1);
    }

    #[tokio::test]
    async fn reader_digest_matches_content() {
        use sha2::{Digest, Sha256};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data = vec![0x5Au8; CHUNK_SIZE + 17];
        tokio::fs::write(&path, &data).await.unwrap();

        let mut reader = FileChunkReader::open(&path).await.unwrap();
        while reader.next_chunk().await.unwrap().is_some() {}
        let expected: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(reader.finalize(), expected);
    }

    #[tokio::test]
    async fn expand_paths_walks_folders_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("album");
        tokio::fs::create_dir_all(root.join("inner")).await.unwrap();
        tokio::fs::write(root.join("a.txt"), b"aaa").await.unwrap();
        tokio::fs::write(root.join("inner/b.txt"), b"bb").await.unwrap();
        tokio::fs::write(root.join(".DS_Store"), b"junk").await.unwrap();
        tokio::fs::write(root.join(".hidden"), b"junk").await.unwrap();

        let (files, descriptors) = expand_paths(&[root.clone()]).await.unwrap();
        assert_eq!(files.len(), 2);

        let mut rels: Vec<String> = descriptors
            .iter()
            .map(|d| d.relative_path.clone().unwrap())
            .collect();
        rels.sort();
        assert_eq!(rels, vec!["album/a.txt", "album/inner/b.txt"]);
    }
}
