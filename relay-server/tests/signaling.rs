//! Integration tests against an in-process server: registration,
//! announcement, forwarding, relay negotiation and cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use relay_server::{ServerOptions, ServerState, router};

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

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

async fn dial(addr: SocketAddr, code: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/{code}"))
        .await
        .unwrap();
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn read_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn read_binary(ws: &mut Ws) -> Vec<u8> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Binary(data) => return data.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn register(ws: &mut Ws, role: &str, quic_port: u16) {
    send_json(
        ws,
        json!({
            "type": "register",
            "role": role,
            "peer_info": { "local_ip": "192.168.1.50", "local_port": quic_port },
        }),
    )
    .await;
}

#[tokio::test]
async fn both_peers_are_announced_with_rewritten_public_info() {
    let (addr, state) = start_server(ServerOptions::default()).await;

    let mut sender = dial(addr, "3-apple-river").await;
    let mut receiver = dial(addr, "3-apple-river").await;

    register(&mut sender, "sender", 9100).await;
    register(&mut receiver, "receiver", 9200).await;

    let to_sender = read_json(&mut sender).await;
    assert_eq!(to_sender["type"], "peer_joined");
    let info = &to_sender["peer_info"];
    assert_eq!(info["public_ip"], "127.0.0.1");
    // Public port is the declared QUIC port, not the WebSocket source port.
    assert_eq!(info["public_port"], 9200);
    assert_eq!(info["local_ip"], "192.168.1.50");
    assert_eq!(info["local_port"], 9200);

    let to_receiver = read_json(&mut receiver).await;
    assert_eq!(to_receiver["type"], "peer_joined");
    assert_eq!(to_receiver["peer_info"]["public_port"], 9100);

    assert_eq!(state.session_count().await, 1);
}

#[tokio::test]
async fn duplicate_role_is_refused() {
    let (addr, state) = start_server(ServerOptions::default()).await;

    let mut first = dial(addr, "3-apple-river").await;
    register(&mut first, "sender", 9100).await;

    // Give the first registration time to land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = dial(addr, "3-apple-river").await;
    register(&mut second, "sender", 9101).await;

    let reply = read_json(&mut second).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "CODE_IN_USE");

    assert_eq!(state.session_count().await, 1);
}

#[tokio::test]
async fn session_cap_is_enforced() {
    let (addr, _state) = start_server(ServerOptions {
        max_sessions: 1,
        ..Default::default()
    })
    .await;

    let mut first = dial(addr, "3-apple-river").await;
    register(&mut first, "sender", 9100).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut overflow = dial(addr, "7-guitar-palace").await;
    register(&mut overflow, "sender", 9101).await;

    let reply = read_json(&mut overflow).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "CODE_IN_USE");
}

#[tokio::test]
async fn invalid_first_frame_is_rejected() {
    let (addr, _state) = start_server(ServerOptions::default()).await;

    let mut ws = dial(addr, "3-apple-river").await;
    send_json(&mut ws, json!({ "type": "spake2", "payload": "AAAA" })).await;

    let reply = read_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "INVALID_MESSAGE");
}

#[tokio::test]
async fn signaling_payloads_are_forwarded_verbatim() {
    let (addr, _state) = start_server(ServerOptions::default()).await;

    let mut sender = dial(addr, "3-apple-river").await;
    let mut receiver = dial(addr, "3-apple-river").await;
    register(&mut sender, "sender", 9100).await;
    register(&mut receiver, "receiver", 9200).await;
    read_json(&mut sender).await;
    read_json(&mut receiver).await;

    send_json(&mut sender, json!({ "type": "spake2", "payload": "c2VuZGVyLXBha2U=" })).await;
    let forwarded = read_json(&mut receiver).await;
    assert_eq!(forwarded["type"], "spake2");
    assert_eq!(forwarded["payload"], "c2VuZGVyLXBha2U=");

    send_json(
        &mut receiver,
        json!({ "type": "cert_fingerprint", "payload": "ZmluZ2VycHJpbnQ=" }),
    )
    .await;
    let forwarded = read_json(&mut sender).await;
    assert_eq!(forwarded["type"], "cert_fingerprint");
    assert_eq!(forwarded["payload"], "ZmluZ2VycHJpbnQ=");
}

#[tokio::test]
async fn unknown_types_error_to_the_offender_only() {
    let (addr, _state) = start_server(ServerOptions::default()).await;

    let mut sender = dial(addr, "3-apple-river").await;
    let mut receiver = dial(addr, "3-apple-river").await;
    register(&mut sender, "sender", 9100).await;
    register(&mut receiver, "receiver", 9200).await;
    read_json(&mut sender).await;
    read_json(&mut receiver).await;

    send_json(&mut sender, json!({ "type": "teleport" })).await;
    let reply = read_json(&mut sender).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "UNKNOWN_TYPE");

    // The receiver hears nothing; the next frame it sees is a real one.
    send_json(&mut sender, json!({ "type": "spake2", "payload": "eA==" })).await;
    let next = read_json(&mut receiver).await;
    assert_eq!(next["type"], "spake2");
}

#[tokio::test]
async fn relay_negotiation_and_binary_forwarding() {
    let (addr, state) = start_server(ServerOptions::default()).await;

    let mut sender = dial(addr, "7-guitar-palace").await;
    let mut receiver = dial(addr, "7-guitar-palace").await;
    register(&mut sender, "sender", 9100).await;
    register(&mut receiver, "receiver", 9200).await;
    read_json(&mut sender).await;
    read_json(&mut receiver).await;

    let session = state.get("7-guitar-palace").await.unwrap();

    // Sender asks first; the request is forwarded to the receiver.
    send_json(&mut sender, json!({ "type": "relay_request" })).await;
    let forwarded = read_json(&mut receiver).await;
    assert_eq!(forwarded["type"], "relay_request");

    // Receiver agrees; both get relay_active.
    send_json(&mut receiver, json!({ "type": "relay_request" })).await;
    assert_eq!(read_json(&mut sender).await["type"], "relay_active");
    assert_eq!(read_json(&mut receiver).await["type"], "relay_active");

    send_json(&mut sender, json!({ "type": "relay_ready" })).await;
    send_json(&mut receiver, json!({ "type": "relay_ready" })).await;

    // Binary frames now pass through untouched, both directions.
    let payload = vec![0xA5u8; 64 * 1024];
    sender
        .send(Message::Binary(payload.clone().into()))
        .await
        .unwrap();
    assert_eq!(read_binary(&mut receiver).await, payload);

    let reply = vec![0x5Au8; 1024];
    receiver
        .send(Message::Binary(reply.clone().into()))
        .await
        .unwrap();
    assert_eq!(read_binary(&mut sender).await, reply);

    let relayed = session.relayed_bytes.load(Ordering::Relaxed);
    assert_eq!(relayed, (64 * 1024 + 1024) as u64);

    // Closing one side ends the relay and the session disappears. Drain
    // the other side so its close handshake completes too.
    sender.close(None).await.unwrap();
    let drain = async {
        loop {
            match receiver.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
    drop(receiver);

    for _ in 0..50 {
        if state.session_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("session was not removed after relay ended");
}

#[tokio::test]
async fn disconnect_empties_the_registry() {
    let (addr, state) = start_server(ServerOptions::default()).await;

    let mut sender = dial(addr, "3-apple-river").await;
    let mut receiver = dial(addr, "3-apple-river").await;
    register(&mut sender, "sender", 9100).await;
    register(&mut receiver, "receiver", 9200).await;
    read_json(&mut sender).await;
    read_json(&mut receiver).await;
    assert_eq!(state.session_count().await, 1);

    send_json(&mut sender, json!({ "type": "disconnect" })).await;
    // The surviving peer is told.
    let notice = read_json(&mut receiver).await;
    assert_eq!(notice["type"], "peer_disconnected");

    send_json(&mut receiver, json!({ "type": "disconnect" })).await;
    for _ in 0..50 {
        if state.session_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("session count did not return to zero");
}

#[tokio::test]
async fn expired_sessions_are_swept_and_codes_reusable() {
    let (addr, state) = start_server(ServerOptions {
        session_ttl: Duration::from_millis(0),
        ..Default::default()
    })
    .await;

    let mut abandoned = dial(addr, "3-apple-river").await;
    register(&mut abandoned, "sender", 9100).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.session_count().await, 1);

    assert_eq!(state.cleanup_expired().await, 1);
    assert_eq!(state.session_count().await, 0);

    // The same code registers cleanly afterwards.
    let mut fresh = dial(addr, "3-apple-river").await;
    register(&mut fresh, "sender", 9101).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.session_count().await, 1);
}

#[tokio::test]
async fn health_reports_active_sessions() {
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let state = Arc::new(ServerState::new(ServerOptions::default()));
    let app = router(state.clone());

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["status"], "ok");
    assert_eq!(parsed["active_sessions"], 0);
}
