//! Binary forwarding between the two peers, bounded by a token bucket.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::state::{Peer, Session};

/// Token bucket shared by the two pump directions of one session, so the
/// aggregate relayed throughput stays under the configured rate. Capacity
/// is twice the rate for burst absorption.
pub struct RateLimiter {
    rate: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        let capacity = bytes_per_second as f64 * 2.0;
        Self {
            rate: bytes_per_second as f64,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until `n` bytes worth of tokens are available, then consume
    /// them. Sleeps are floored at one millisecond.
    pub async fn wait(&self, n: usize) {
        let needed = n as f64;
        loop {
            let sleep_for = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(self.rate);
                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    return;
                }
                let deficit = needed - bucket.tokens;
                Duration::from_secs_f64(deficit / self.rate).max(Duration::from_millis(1))
            };
            tokio::time::sleep(sleep_for).await;
        }
    }
}

impl Bucket {
    fn refill(&mut self, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
    }
}

/// Pump bytes both ways until either side goes away. Each direction runs
/// in its own task; the shared limiter bounds their combined throughput.
pub async fn run_relay(
    session: &Arc<Session>,
    sender: Arc<Peer>,
    receiver: Arc<Peer>,
    rate_limit: u64,
) {
    let Some(sender_rx) = sender.parked_rx.lock().await.take() else {
        return;
    };
    let Some(receiver_rx) = receiver.parked_rx.lock().await.take() else {
        return;
    };

    info!("session {}: starting bidirectional relay", session.code);
    let limiter = Arc::new(RateLimiter::new(rate_limit));

    let forward = tokio::spawn(pump(
        sender_rx,
        receiver.clone(),
        limiter.clone(),
        session.clone(),
    ));
    let backward = tokio::spawn(pump(
        receiver_rx,
        sender.clone(),
        limiter.clone(),
        session.clone(),
    ));

    let _ = tokio::join!(forward, backward);

    sender.send_close().await;
    receiver.send_close().await;
    info!(
        "session {}: relay loop finished ({} bytes forwarded)",
        session.code,
        session.relayed_bytes.load(Ordering::Relaxed)
    );
}

/// One direction: read from `src`, forward binary messages to `dst`.
/// Text, ping and pong frames are dropped; a close ends the direction and
/// is passed along.
async fn pump(
    mut src: SplitStream<WebSocket>,
    dst: Arc<Peer>,
    limiter: Arc<RateLimiter>,
    session: Arc<Session>,
) {
    loop {
        let msg = tokio::select! {
            _ = session.expired.cancelled() => {
                dst.send_close().await;
                return;
            }
            msg = src.next() => msg,
        };

        match msg {
            Some(Ok(Message::Binary(data))) => {
                limiter.wait(data.len()).await;
                session
                    .relayed_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                if dst.send_raw(Message::Binary(data)).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let _ = dst.send_raw(Message::Close(frame)).await;
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("session {}: relay read error: {e}", session.code);
                dst.send_close().await;
                return;
            }
            None => {
                dst.send_close().await;
                return;
            }
        }
    }
}
