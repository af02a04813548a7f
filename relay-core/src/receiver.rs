//! Receiver pipeline: mirror of the sender, plus offer validation, the
//! user accept gate, ordered chunk intake and on-disk reassembly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::crypto::{ChunkOpener, KeyExchange, StreamingDigest, KEY_LEN};
use crate::error::{CoreError, CoreResult};
use crate::progress::{ConnectionType, EventSink, OfferedFile, ProgressEvent, ProgressTracker};
use crate::quic::DirectEndpoint;
use crate::session::{PipelineConfig, SessionPhase, TransferRole, TransferSession};
use crate::signaling::SignalingClient;
use crate::transport::{negotiate_path, recv_or_cancel, NegotiatedPath, Transport};
use crate::wire::{FileDescriptor, PeerMessage};

/// Decrypted chunks allowed in flight between the network loop and the
/// disk writer.
const WRITE_PIPELINE_DEPTH: usize = 32;

/// Run the full receive flow. `accept_rx` resolves when the user answers
/// the offer.
pub async fn run_receive(
    save_dir: PathBuf,
    session: Arc<TransferSession>,
    config: PipelineConfig,
    accept_rx: oneshot::Receiver<bool>,
    events: EventSink,
) -> CoreResult<()> {
    let code = session.code.to_string();
    let mut quic = DirectEndpoint::bind(0)?;

    session.set_phase(SessionPhase::Signaling).await;
    events.state("signaling").await;
    let mut signaling = SignalingClient::connect(&config.server_url, &code).await?;
    signaling
        .register(TransferRole::Receiver, Some(quic.local_addr()?))
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
    let exchange = KeyExchange::start(TransferRole::Receiver, &code);
    let outbound = exchange.outbound_message().to_vec();
    let peer_pake = signaling_step(
        &session,
        config.signaling_timeout,
        signaling.exchange_key_material(&outbound),
    )
    .await?;
    let key = exchange.finish(&peer_pake)?;
    info!("receiver: session key derived");

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
        std::time::Duration::ZERO,
        config.relay_ack_timeout,
        &session.cancel,
    )
    .await?
    {
        NegotiatedPath::Direct(conn) => {
            let (conn, send, recv) = accept_peer_stream(&quic, conn).await?;
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

    session.set_phase(SessionPhase::AwaitOffer).await;
    events.state("await_offer").await;
    let files = wait_for_offer(&session, &mut transport).await?;
    info!("receiver: offered {} file(s)", files.len());

    // Validate every descriptor before the user even sees the offer; one
    // bad path fails the whole thing.
    let mut targets = Vec::with_capacity(files.len());
    for desc in &files {
        match sanitized_target(&save_dir, desc) {
            Ok(path) => targets.push(path),
            Err(e) => {
                let _ = transport.send_message(&PeerMessage::FileDecline).await;
                return Err(e);
            }
        }
    }

    session.set_phase(SessionPhase::AwaitUserDecision).await;
    events.state("await_user_decision").await;
    events
        .emit(ProgressEvent::FileOffer {
            session_id: session.id.clone(),
            files: files
                .iter()
                .map(|f| OfferedFile {
                    name: f.name.clone(),
                    size: f.size,
                })
                .collect(),
        })
        .await;

    let accepted = tokio::select! {
        _ = session.cancel.cancelled() => false,
        answer = accept_rx => answer.unwrap_or(false),
    };
    if !accepted {
        let _ = transport.send_message(&PeerMessage::FileDecline).await;
        return Err(CoreError::Cancelled);
    }
    transport.send_message(&PeerMessage::FileAccept).await?;

    session.set_phase(SessionPhase::Streaming).await;
    events.state("streaming").await;

    let result = receive_files(&session, &mut transport, &key, &files, &targets, &events).await;

    match result {
        Ok(stats) => {
            transport.close().await.ok();
            session.set_phase(SessionPhase::Completed).await;
            events.state("completed").await;
            events
                .emit(ProgressEvent::TransferComplete {
                    duration_seconds: stats.duration_seconds,
                    average_speed_bps: stats.average_speed_bps,
                    total_bytes: stats.total_bytes,
                    file_count: files.len() as u32,
                })
                .await;
            info!("receiver: transfer complete");
            Ok(())
        }
        Err((e, cleanup_from)) => {
            // Partially written output must not survive a failed session.
            for path in &targets[cleanup_from..] {
                if tokio::fs::remove_file(path).await.is_ok() {
                    info!("receiver: removed partial file {}", path.display());
                }
            }
            Err(e)
        }
    }
}

struct ReceiveStats {
    duration_seconds: u32,
    average_speed_bps: u64,
    total_bytes: u64,
}

/// The chunk intake loop. Returns the index of the first unverified file
/// alongside the error so the caller knows what to clean up.
async fn receive_files(
    session: &TransferSession,
    transport: &mut Transport,
    key: &[u8; KEY_LEN],
    files: &[FileDescriptor],
    targets: &[PathBuf],
    events: &EventSink,
) -> Result<ReceiveStats, (CoreError, usize)> {
    let opener = ChunkOpener::new(key).map_err(|e| (e, 0))?;
    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    let mut tracker = ProgressTracker::new(total_bytes);

    let (write_tx, write_rx) = mpsc::channel::<WriteItem>(WRITE_PIPELINE_DEPTH);
    let writer = spawn_disk_writer(targets.to_vec(), write_rx);

    let mut current_file: usize = 0;
    let mut expected_chunk: u32 = 0;

    let outcome: CoreResult<()> = async {
        loop {
            let msg = match recv_or_cancel(transport, &session.cancel).await? {
                Some(msg) => msg,
                None => {
                    let _ = transport
                        .send_message(&PeerMessage::Cancel {
                            reason: "cancelled by receiver".into(),
                        })
                        .await;
                    return Err(CoreError::Cancelled);
                }
            };

            match msg {
                PeerMessage::FileChunk {
                    file_index,
                    chunk_index,
                    nonce,
                    ciphertext,
                } => {
                    if file_index as usize != current_file {
                        return Err(CoreError::Protocol(format!(
                            "chunk for file {file_index} while receiving file {current_file}"
                        )));
                    }
                    if chunk_index != expected_chunk {
                        return Err(CoreError::Protocol(format!(
                            "chunk {chunk_index} out of order, expected {expected_chunk}"
                        )));
                    }

                    let plaintext = opener.open(&ciphertext, &nonce)?;
                    expected_chunk += 1;

                    tracker.update(plaintext.len() as u64);
                    write_tx
                        .send(WriteItem::Chunk {
                            file_index: current_file,
                            plaintext,
                        })
                        .await
                        .map_err(|_| CoreError::Transfer("disk writer stopped".into()))?;

                    if tracker.should_emit() {
                        events
                            .emit(tracker.snapshot(&files[current_file].name))
                            .await;
                    }
                }
                PeerMessage::FileComplete { file_index, sha256 } => {
                    if file_index as usize != current_file {
                        return Err(CoreError::Protocol(format!(
                            "completion for file {file_index} while receiving file {current_file}"
                        )));
                    }

                    let (reply_tx, reply_rx) = oneshot::channel();
                    write_tx
                        .send(WriteItem::Finish {
                            file_index: current_file,
                            expected: sha256,
                            reply: reply_tx,
                        })
                        .await
                        .map_err(|_| CoreError::Transfer("disk writer stopped".into()))?;

                    let verified = reply_rx
                        .await
                        .map_err(|_| CoreError::Transfer("disk writer stopped".into()))?;
                    if !verified {
                        return Err(CoreError::Transfer(format!(
                            "checksum mismatch for '{}'",
                            files[current_file].name
                        )));
                    }

                    transport
                        .send_message(&PeerMessage::FileVerified { file_index })
                        .await?;
                    events.emit(tracker.snapshot(&files[current_file].name)).await;
                    events
                        .emit(ProgressEvent::FileCompleted {
                            name: files[current_file].name.clone(),
                        })
                        .await;

                    current_file += 1;
                    expected_chunk = 0;
                }
                PeerMessage::TransferComplete => {
                    if current_file != files.len() {
                        return Err(CoreError::Protocol(format!(
                            "transfer ended after {current_file} of {} files",
                            files.len()
                        )));
                    }
                    return Ok(());
                }
                PeerMessage::Ping => transport.send_message(&PeerMessage::Pong).await?,
                PeerMessage::Pong => {}
                PeerMessage::Cancel { reason } => {
                    warn!("receiver: sender cancelled: {reason}");
                    return Err(CoreError::Cancelled);
                }
                other => {
                    return Err(CoreError::Protocol(format!(
                        "unexpected message during streaming: {other:?}"
                    )));
                }
            }
        }
    }
    .await;

    // Let the writer drain and close its files before deciding the outcome.
    drop(write_tx);
    let writer_result = writer.await;

    match outcome {
        Ok(()) => {
            match writer_result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err((e, current_file)),
                Err(e) => {
                    return Err((
                        CoreError::Transfer(format!("disk writer panicked: {e}")),
                        current_file,
                    ));
                }
            }
            Ok(ReceiveStats {
                duration_seconds: tracker.elapsed_seconds(),
                average_speed_bps: tracker.average_speed_bps(),
                total_bytes: tracker.bytes_transferred(),
            })
        }
        Err(e) => {
            // A dead writer usually died for a reason worth reporting.
            let e = match writer_result {
                Ok(Err(writer_err)) => writer_err,
                _ => e,
            };
            Err((e, current_file))
        }
    }
}

enum WriteItem {
    Chunk {
        file_index: usize,
        plaintext: Vec<u8>,
    },
    Finish {
        file_index: usize,
        expected: [u8; 32],
        reply: oneshot::Sender<bool>,
    },
}

struct FileSink {
    file: tokio::fs::File,
    digest: StreamingDigest,
}

/// The disk writer owns every output file and its running digest. It
/// creates all of them up front so even zero-chunk files exist on disk.
fn spawn_disk_writer(
    targets: Vec<PathBuf>,
    mut rx: mpsc::Receiver<WriteItem>,
) -> JoinHandle<CoreResult<()>> {
    tokio::spawn(async move {
        let mut sinks: Vec<Option<FileSink>> = Vec::with_capacity(targets.len());
        for path in &targets {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::File::create(path)
                .await
                .map_err(|e| CoreError::Transfer(format!("create {}: {e}", path.display())))?;
            sinks.push(Some(FileSink {
                file,
                digest: StreamingDigest::new(),
            }));
        }

        while let Some(item) = rx.recv().await {
            match item {
                WriteItem::Chunk {
                    file_index,
                    plaintext,
                } => {
                    let sink = sinks
                        .get_mut(file_index)
                        .and_then(Option::as_mut)
                        .ok_or_else(|| {
                            CoreError::Transfer(format!("no open file at index {file_index}"))
                        })?;
                    sink.digest.update(&plaintext);
                    sink.file.write_all(&plaintext).await?;
                }
                WriteItem::Finish {
                    file_index,
                    expected,
                    reply,
                } => {
                    let sink = sinks
                        .get_mut(file_index)
                        .and_then(Option::take)
                        .ok_or_else(|| {
                            CoreError::Transfer(format!("no open file at index {file_index}"))
                        })?;
                    let mut file = sink.file;
                    file.flush().await?;
                    drop(file);

                    let matches = sink.digest.finalize() == expected;
                    let _ = reply.send(matches);
                }
            }
        }

        Ok(())
    })
}

async fn wait_for_offer(
    session: &TransferSession,
    transport: &mut Transport,
) -> CoreResult<Vec<FileDescriptor>> {
    loop {
        match recv_or_cancel(transport, &session.cancel).await? {
            None => return Err(CoreError::Cancelled),
            Some(PeerMessage::FileOffer { files, .. }) => {
                if files.is_empty() {
                    return Err(CoreError::Protocol("empty file offer".into()));
                }
                return Ok(files);
            }
            Some(PeerMessage::Ping) => transport.send_message(&PeerMessage::Pong).await?,
            Some(PeerMessage::Pong) => {}
            Some(PeerMessage::Cancel { reason }) => {
                return Err(CoreError::Transfer(format!("peer cancelled: {reason}")));
            }
            Some(other) => {
                return Err(CoreError::Protocol(format!(
                    "expected FileOffer, got {other:?}"
                )));
            }
        }
    }
}

/// Accept the sender's stream. The connection chosen during negotiation is
/// the usual carrier, but when both dials landed simultaneously the sender
/// may open its stream on the connection it dialed, which shows up here as
/// a second incoming connection.
async fn accept_peer_stream(
    quic: &DirectEndpoint,
    conn: quinn::Connection,
) -> CoreResult<(quinn::Connection, quinn::SendStream, quinn::RecvStream)> {
    let chosen = conn.clone();
    let outcome = tokio::select! {
        bi = chosen.accept_bi() => {
            bi.map(|(send, recv)| (None, send, recv))
                .map_err(|e| CoreError::Network(format!("failed to accept stream: {e}")))
        }
        alt = async {
            let other = quic.accept().await?;
            let (send, recv) = other
                .accept_bi()
                .await
                .map_err(|e| CoreError::Network(format!("failed to accept stream: {e}")))?;
            Ok::<_, CoreError>((other, send, recv))
        } => alt.map(|(c, send, recv)| (Some(c), send, recv)),
    };

    let (replacement, send, recv) = outcome?;
    Ok((replacement.unwrap_or(conn), send, recv))
}

/// Map an offered descriptor to a path under the save directory, rejecting
/// anything that could escape it.
pub(crate) fn sanitized_target(save_dir: &Path, desc: &FileDescriptor) -> CoreResult<PathBuf> {
    fn component_ok(c: &str) -> bool {
        !c.is_empty()
            && c != "."
            && c != ".."
            && !c.contains('/')
            && !c.contains('\\')
            && !c.contains(':')
            && !c.chars().any(char::is_control)
    }

    if !component_ok(&desc.name) {
        return Err(CoreError::Transfer(format!(
            "unsafe file name in offer: {:?}",
            desc.name
        )));
    }

    match &desc.relative_path {
        None => Ok(save_dir.join(&desc.name)),
        Some(rel) => {
            if rel.starts_with('/') {
                return Err(CoreError::Transfer(format!(
                    "absolute path in offer: {rel:?}"
                )));
            }
            let mut path = save_dir.to_path_buf();
            for component in rel.split('/') {
                if !component_ok(component) {
                    return Err(CoreError::Transfer(format!(
                        "unsafe path in offer: {rel:?}"
                    )));
                }
                path.push(component);
            }
            Ok(path)
        }
    }
}

async fn signaling_step<T>(
    session: &TransferSession,
    limit: std::time::Duration,
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

    fn desc(name: &str, rel: Option<&str>) -> FileDescriptor {
        FileDescriptor {
            name: name.into(),
            size: 1,
            relative_path: rel.map(String::from),
        }
    }

    #[test]
    fn plain_names_are_joined() {
        let target = sanitized_target(Path::new("/save"), &desc("notes.txt", None)).unwrap();
        assert_eq!(target, Path::new("/save/notes.txt"));
    }

    #[test]
    fn relative_paths_are_joined_per_component() {
        let target =
            sanitized_target(Path::new("/save"), &desc("b.txt", Some("album/inner/b.txt")))
                .unwrap();
        assert_eq!(target, Path::new("/save/album/inner/b.txt"));
    }

    #[test]
    fn traversal_and_absolute_paths_are_rejected() {
        let root = Path::new("/save");
        assert!(sanitized_target(root, &desc("ok.txt", Some("../etc/passwd"))).is_err());
        assert!(sanitized_target(root, &desc("ok.txt", Some("a/../../b"))).is_err());
        assert!(sanitized_target(root, &desc("ok.txt", Some("/etc/passwd"))).is_err());
        assert!(sanitized_target(root, &desc("ok.txt", Some("a//b"))).is_err());
    }

    #[test]
    fn hostile_names_are_rejected() {
        let root = Path::new("/save");
        assert!(sanitized_target(root, &desc("..", None)).is_err());
        assert!(sanitized_target(root, &desc("", None)).is_err());
        assert!(sanitized_target(root, &desc("a/b.txt", None)).is_err());
        assert!(sanitized_target(root, &desc("a\\b.txt", None)).is_err());
        assert!(sanitized_target(root, &desc("nul\0byte", None)).is_err());
        assert!(sanitized_target(root, &desc("C:evil", None)).is_err());
    }

    #[test]
    fn bad_components_inside_relative_paths_are_rejected() {
        let root = Path::new("/save");
        assert!(sanitized_target(root, &desc("b.txt", Some("album/./b.txt"))).is_err());
        assert!(sanitized_target(root, &desc("b.txt", Some("album/..\\b.txt"))).is_err());
        assert!(sanitized_target(root, &desc("b.txt", Some("album/b\0.txt"))).is_err());
    }
}
