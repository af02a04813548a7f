//! End-to-end transfers through an in-process rendezvous server: the
//! direct QUIC path, the wrong-code failure mode, relay fallback, and
//! cancellation cleanup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{mpsc, oneshot};

use relay_core::{
    ConnectionType, CoreError, DirectOptions, EngineCommand, EngineEvent, EventSink,
    PipelineConfig, ProgressEvent, TransferCode, TransferRole, TransferSession, receiver, sender,
};
use relay_server::{ServerOptions, ServerState, router};

async fn start_server(opts: ServerOptions) -> (SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::new(opts));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn test_config(server_url: String) -> PipelineConfig {
    PipelineConfig {
        server_url,
        direct: DirectOptions {
            enabled: true,
            public_timeout: Duration::from_secs(3),
            local_timeout: Duration::from_secs(2),
        },
        signaling_timeout: Duration::from_secs(15),
        relay_ack_timeout: Duration::from_secs(10),
    }
}

fn random_file(dir: &std::path::Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

async fn next_event(rx: &mut mpsc::Receiver<EngineEvent>) -> ProgressEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
        .event
}

#[tokio::test]
async fn direct_transfer_delivers_identical_bytes() {
    let (addr, _state) = start_server(ServerOptions::default()).await;
    let url = format!("ws://{addr}");

    let work = tempfile::tempdir().unwrap();
    let (file_path, sent_data) = random_file(work.path(), "payload.bin", 1024 * 1024);
    let save_dir = work.path().join("incoming");

    let (send_cmd_tx, send_cmd_rx) = mpsc::channel(8);
    let (send_event_tx, mut send_events) = mpsc::channel(256);
    tokio::spawn(relay_core::run_engine_with(
        send_cmd_rx,
        send_event_tx,
        test_config(url.clone()),
    ));

    let (recv_cmd_tx, recv_cmd_rx) = mpsc::channel(8);
    let (recv_event_tx, mut recv_events) = mpsc::channel(256);
    tokio::spawn(relay_core::run_engine_with(
        recv_cmd_rx,
        recv_event_tx,
        test_config(url.clone()),
    ));

    let (reply_tx, reply_rx) = oneshot::channel();
    send_cmd_tx
        .send(EngineCommand::StartSend {
            file_paths: vec![file_path],
            signal_server_url: None,
            reply: reply_tx,
        })
        .await
        .unwrap();
    let started = reply_rx.await.unwrap().unwrap();
    assert!(started.port > 0);

    let (reply_tx, reply_rx) = oneshot::channel();
    recv_cmd_tx
        .send(EngineCommand::StartReceive {
            code: started.code.clone(),
            save_dir: save_dir.clone(),
            signal_server_url: None,
            reply: reply_tx,
        })
        .await
        .unwrap();
    let receive_session = reply_rx.await.unwrap().unwrap();

    // Accept the offer when it shows up.
    loop {
        match next_event(&mut recv_events).await {
            ProgressEvent::FileOffer { files, .. } => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].size, sent_data.len() as u64);
                recv_cmd_tx
                    .send(EngineCommand::AcceptTransfer {
                        session_id: receive_session.clone(),
                        accept: true,
                    })
                    .await
                    .unwrap();
                break;
            }
            ProgressEvent::Error { message } => panic!("receiver failed early: {message}"),
            _ => {}
        }
    }

    // The sender must report the direct path before any progress.
    let mut saw_connection_type = false;
    loop {
        match next_event(&mut send_events).await {
            ProgressEvent::ConnectionTypeChanged { connection_type } => {
                assert_eq!(connection_type, ConnectionType::Direct);
                saw_connection_type = true;
            }
            ProgressEvent::TransferProgress { .. } => {
                assert!(
                    saw_connection_type,
                    "progress before the connection type was announced"
                );
            }
            ProgressEvent::TransferComplete { total_bytes, .. } => {
                assert_eq!(total_bytes, sent_data.len() as u64);
                break;
            }
            ProgressEvent::Error { message } => panic!("sender failed: {message}"),
            _ => {}
        }
    }

    // Receiver finishes too.
    loop {
        match next_event(&mut recv_events).await {
            ProgressEvent::TransferComplete { .. } => break,
            ProgressEvent::Error { message } => panic!("receiver failed: {message}"),
            _ => {}
        }
    }

    let received = std::fs::read(save_dir.join("payload.bin")).unwrap();
    assert_eq!(received, sent_data);
}

#[tokio::test]
async fn mismatched_codes_fail_with_a_crypto_error() {
    use relay_core::crypto::KeyExchange;
    use relay_core::signaling::SignalingClient;

    let (addr, _state) = start_server(ServerOptions::default()).await;
    let url = format!("ws://{addr}");

    // Both peers meet under the same rendezvous path, but they typed
    // different codes, so their derived keys disagree.
    let rendezvous = "7-guitar-palace";

    let url_a = url.clone();
    let sender_side = tokio::spawn(async move {
        let mut signaling = SignalingClient::connect(&url_a, rendezvous).await?;
        signaling.register(TransferRole::Sender, None).await?;
        signaling.wait_for_peer().await?;

        let exchange = KeyExchange::start(TransferRole::Sender, "7-guitar-palace");
        let outbound = exchange.outbound_message().to_vec();
        let peer_msg = signaling.exchange_key_material(&outbound).await?;
        let key = exchange.finish(&peer_msg)?;

        signaling.exchange_fingerprint(&[1u8; 32], &key).await
    });

    let url_b = url.clone();
    let receiver_side = tokio::spawn(async move {
        let mut signaling = SignalingClient::connect(&url_b, rendezvous).await?;
        signaling.register(TransferRole::Receiver, None).await?;
        signaling.wait_for_peer().await?;

        let exchange = KeyExchange::start(TransferRole::Receiver, "7-guitar-castle");
        let outbound = exchange.outbound_message().to_vec();
        let peer_msg = signaling.exchange_key_material(&outbound).await?;
        let key = exchange.finish(&peer_msg)?;

        signaling.exchange_fingerprint(&[2u8; 32], &key).await
    });

    let sender_result = tokio::time::timeout(Duration::from_secs(30), sender_side)
        .await
        .unwrap()
        .unwrap();
    let receiver_result = tokio::time::timeout(Duration::from_secs(30), receiver_side)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(sender_result, Err(CoreError::Crypto(_))));
    assert!(matches!(receiver_result, Err(CoreError::Crypto(_))));
}

#[tokio::test]
async fn relay_fallback_transfers_the_file() {
    let (addr, state) = start_server(ServerOptions::default()).await;
    let url = format!("ws://{addr}");

    let work = tempfile::tempdir().unwrap();
    let (file_path, sent_data) = random_file(work.path(), "big.bin", 4 * 1024 * 1024);
    let save_dir = work.path().join("incoming");
    std::fs::create_dir_all(&save_dir).unwrap();

    // Force both sides straight to relay, as if no direct path existed.
    let mut config = test_config(url.clone());
    config.direct.enabled = false;

    let code = TransferCode::parse("3-apple-river").unwrap();

    let send_session = Arc::new(TransferSession::new(TransferRole::Sender, code.clone()));
    let (send_event_tx, mut send_events) = mpsc::channel(256);
    let send_sink = EventSink::new(send_session.id.clone(), send_event_tx);
    let send_quic = relay_core::DirectEndpoint::bind(0).unwrap();
    let send_config = config.clone();
    let send_task = tokio::spawn(sender::run_send(
        vec![file_path],
        send_session,
        send_quic,
        send_config,
        send_sink,
    ));

    let recv_session = Arc::new(TransferSession::new(TransferRole::Receiver, code));
    let (recv_event_tx, mut recv_events) = mpsc::channel(256);
    let recv_sink = EventSink::new(recv_session.id.clone(), recv_event_tx);
    let (accept_tx, accept_rx) = oneshot::channel();
    accept_tx.send(true).unwrap();
    let recv_task = tokio::spawn(receiver::run_receive(
        save_dir.clone(),
        recv_session,
        config,
        accept_rx,
        recv_sink,
    ));

    // Grab the server-side session while it is alive so the relayed byte
    // counter survives cleanup.
    let mut session_handle = None;
    for _ in 0..100 {
        if let Some(s) = state.get("3-apple-river").await {
            session_handle = Some(s);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let session_handle = session_handle.expect("session never appeared");

    let send_result = tokio::time::timeout(Duration::from_secs(60), send_task)
        .await
        .unwrap()
        .unwrap();
    let recv_result = tokio::time::timeout(Duration::from_secs(60), recv_task)
        .await
        .unwrap()
        .unwrap();
    send_result.unwrap();
    recv_result.unwrap();

    let received = std::fs::read(save_dir.join("big.bin")).unwrap();
    assert_eq!(received, sent_data);

    // Both sides went through the relay.
    let mut saw_relay = false;
    while let Ok(event) = recv_events.try_recv() {
        if let ProgressEvent::ConnectionTypeChanged { connection_type } = event.event {
            assert_eq!(connection_type, ConnectionType::Relay);
            saw_relay = true;
        }
    }
    assert!(saw_relay, "receiver never reported the relay path");
    while let Ok(event) = send_events.try_recv() {
        if let ProgressEvent::ConnectionTypeChanged { connection_type } = event.event {
            assert_eq!(connection_type, ConnectionType::Relay);
        }
    }

    // Relayed bytes: the payload plus AEAD tags and framing, nothing like
    // double.
    let relayed = session_handle.relayed_bytes.load(Ordering::Relaxed);
    assert!(relayed as usize >= sent_data.len());
    assert!(relayed as usize <= sent_data.len() + 128 * 1024);
}

#[tokio::test]
async fn cancelling_the_sender_removes_partial_output() {
    // A small relay budget keeps the transfer slow enough to cancel.
    let (addr, _state) = start_server(ServerOptions {
        relay_rate_limit: 2 * 1024 * 1024,
        ..Default::default()
    })
    .await;
    let url = format!("ws://{addr}");

    let work = tempfile::tempdir().unwrap();
    let (file_path, _) = random_file(work.path(), "slow.bin", 16 * 1024 * 1024);
    let save_dir = work.path().join("incoming");
    std::fs::create_dir_all(&save_dir).unwrap();

    let mut config = test_config(url.clone());
    config.direct.enabled = false;

    let code = TransferCode::parse("7-guitar-palace").unwrap();

    let send_session = Arc::new(TransferSession::new(TransferRole::Sender, code.clone()));
    let send_cancel = send_session.clone();
    let (send_event_tx, _send_events) = mpsc::channel(256);
    let send_sink = EventSink::new(send_session.id.clone(), send_event_tx);
    let send_quic = relay_core::DirectEndpoint::bind(0).unwrap();
    let send_task = tokio::spawn(sender::run_send(
        vec![file_path],
        send_session,
        send_quic,
        config.clone(),
        send_sink,
    ));

    let recv_session = Arc::new(TransferSession::new(TransferRole::Receiver, code));
    let (recv_event_tx, _recv_events) = mpsc::channel(256);
    let recv_sink = EventSink::new(recv_session.id.clone(), recv_event_tx);
    let (accept_tx, accept_rx) = oneshot::channel();
    accept_tx.send(true).unwrap();
    let recv_task = tokio::spawn(receiver::run_receive(
        save_dir.clone(),
        recv_session,
        config,
        accept_rx,
        recv_sink,
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    send_cancel.request_cancel();

    let send_result = tokio::time::timeout(Duration::from_secs(20), send_task)
        .await
        .expect("sender did not stop after cancel")
        .unwrap();
    assert!(matches!(send_result, Err(CoreError::Cancelled)));

    let recv_result = tokio::time::timeout(Duration::from_secs(20), recv_task)
        .await
        .expect("receiver did not stop after cancel")
        .unwrap();
    assert!(recv_result.is_err());

    // The partial output is gone.
    assert!(!save_dir.join("slow.bin").exists());
}
