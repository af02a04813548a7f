//! Progress accounting and the event stream consumed by the frontend.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

/// Minimum spacing between `TransferProgress` events. State changes and
/// terminal events are never throttled.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// How far back the speed window reaches.
const SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Samples closer together than this are coalesced into one.
const SAMPLE_SPACING: Duration = Duration::from_millis(100);

/// Which path the peers ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Direct,
    Relay,
}

/// A file listed in an incoming offer, as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct OfferedFile {
    pub name: String,
    pub size: u64,
}

/// Events dispatched to the frontend, keyed by session id at the envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StateChanged {
        state: String,
    },
    TransferProgress {
        bytes_transferred: u64,
        bytes_total: u64,
        speed_bps: u64,
        eta_s: u32,
        current_file: String,
        percent: f32,
    },
    FileOffer {
        session_id: String,
        files: Vec<OfferedFile>,
    },
    FileCompleted {
        name: String,
    },
    TransferComplete {
        duration_seconds: u32,
        average_speed_bps: u64,
        total_bytes: u64,
        file_count: u32,
    },
    Error {
        message: String,
    },
    ConnectionTypeChanged {
        connection_type: ConnectionType,
    },
}

/// An event together with the session it belongs to. All sessions share
/// one stream.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub session_id: String,
    pub event: ProgressEvent,
}

/// Handle the pipelines use to publish events for their session.
#[derive(Clone)]
pub struct EventSink {
    session_id: String,
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(session_id: String, tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn emit(&self, event: ProgressEvent) {
        let _ = self
            .tx
            .send(EngineEvent {
                session_id: self.session_id.clone(),
                event,
            })
            .await;
    }

    pub async fn state(&self, state: &str) {
        self.emit(ProgressEvent::StateChanged {
            state: state.to_string(),
        })
        .await;
    }
}

/// Byte accounting with a sliding-window speed estimate.
pub struct ProgressTracker {
    start: Instant,
    bytes_transferred: u64,
    bytes_total: u64,
    /// (timestamp, cumulative bytes) samples covering the last few seconds.
    samples: VecDeque<(Instant, u64)>,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(bytes_total: u64) -> Self {
        let now = Instant::now();
        let mut samples = VecDeque::with_capacity(64);
        samples.push_back((now, 0));

        Self {
            start: now,
            bytes_transferred: 0,
            bytes_total,
            samples,
            last_emit: None,
        }
    }

    /// Record `bytes` more transferred bytes.
    pub fn update(&mut self, bytes: u64) {
        self.bytes_transferred += bytes;
        let now = Instant::now();

        // Coalesce bursts: replace the newest sample instead of growing the
        // window when updates land closer than the sample spacing.
        let replace = self
            .samples
            .back()
            .is_some_and(|(t, _)| now.duration_since(*t) < SAMPLE_SPACING)
            && self.samples.len() > 1;
        if replace {
            *self.samples.back_mut().unwrap() = (now, self.bytes_transferred);
        } else {
            self.samples.push_back((now, self.bytes_transferred));
        }

        let cutoff = now - SPEED_WINDOW;
        while self.samples.len() > 2 && self.samples[0].0 < cutoff {
            self.samples.pop_front();
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    /// Windowed transfer speed in bytes per second.
    pub fn speed_bps(&self) -> u64 {
        let (Some(oldest), Some(newest)) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = newest.0.duration_since(oldest.0).as_secs_f64();
        if elapsed < 0.01 {
            return 0;
        }
        (newest.1.saturating_sub(oldest.1) as f64 / elapsed) as u64
    }

    /// Estimated seconds remaining, zero when the speed is unknown.
    pub fn eta_seconds(&self) -> u32 {
        let speed = self.speed_bps();
        if speed == 0 {
            return 0;
        }
        (self.bytes_total.saturating_sub(self.bytes_transferred) / speed) as u32
    }

    pub fn percent(&self) -> f32 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.bytes_total as f64 * 100.0) as f32
    }

    pub fn elapsed_seconds(&self) -> u32 {
        self.start.elapsed().as_secs() as u32
    }

    pub fn average_speed_bps(&self) -> u64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed < 0.01 {
            return 0;
        }
        (self.bytes_transferred as f64 / elapsed) as u64
    }

    /// Whether a throttled progress event is due, marking it emitted if so.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        let due = self
            .last_emit
            .map_or(true, |t| now.duration_since(t) >= PROGRESS_INTERVAL);
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    pub fn snapshot(&self, current_file: &str) -> ProgressEvent {
        ProgressEvent::TransferProgress {
            bytes_transferred: self.bytes_transferred,
            bytes_total: self.bytes_total,
            speed_bps: self.speed_bps(),
            eta_s: self.eta_seconds(),
            current_file: current_file.to_string(),
            percent: self.percent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_total_is_complete() {
        let tracker = ProgressTracker::new(0);
        assert_eq!(tracker.percent(), 100.0);
        assert_eq!(tracker.eta_seconds(), 0);
    }

    #[test]
    fn update_accumulates() {
        let mut tracker = ProgressTracker::new(1000);
        tracker.update(250);
        tracker.update(250);
        assert_eq!(tracker.bytes_transferred(), 500);
        assert!((tracker.percent() - 50.0).abs() < 0.01);
    }

    #[test]
    fn speed_reflects_recent_window() {
        let mut tracker = ProgressTracker::new(10_000_000);
        std::thread::sleep(Duration::from_millis(120));
        tracker.update(1_000_000);
        let speed = tracker.speed_bps();
        assert!(speed > 1_000_000, "expected > 1 MB/s, got {speed}");
    }

    #[test]
    fn first_emit_is_always_due() {
        let mut tracker = ProgressTracker::new(100);
        assert!(tracker.should_emit());
        assert!(!tracker.should_emit());
    }

    #[test]
    fn burst_updates_coalesce_samples() {
        let mut tracker = ProgressTracker::new(u64::MAX);
        for _ in 0..1000 {
            tracker.update(1);
        }
        assert!(tracker.samples.len() <= 3);
    }
}
