/// Activity-based liveness for a bus hub
///
/// Answers "has anything moved on this channel recently". Only the sender and
/// receiver loops record activity; anyone may take a snapshot.
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Staleness threshold used when the caller does not pick one
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct HealthMonitor {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    last_sent: Mutex<Option<DateTime<Local>>>,
    last_received: Mutex<Option<DateTime<Local>>>,
}

/// Derived view of a hub's liveness
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub last_received: Option<DateTime<Local>>,
    pub last_sent: Option<DateTime<Local>>,
    pub seconds_since_activity: Option<f64>,
    pub messages_received: u64,
    pub messages_sent: u64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.record_sent_at(Local::now());
    }

    pub fn record_sent_at(&self, at: DateTime<Local>) {
        *self.last_sent.lock() = Some(at);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.record_received_at(Local::now());
    }

    pub fn record_received_at(&self, at: DateTime<Local>) {
        *self.last_received.lock() = Some(at);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn last_sent(&self) -> Option<DateTime<Local>> {
        *self.last_sent.lock()
    }

    pub fn last_received(&self) -> Option<DateTime<Local>> {
        *self.last_received.lock()
    }

    /// Time since the last successful write, `None` if nothing was ever sent
    pub fn idle_since_sent(&self, now: DateTime<Local>) -> Option<Duration> {
        self.last_sent()
            .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn snapshot(&self, activity_timeout: Duration) -> HealthSnapshot {
        self.snapshot_at(Local::now(), activity_timeout)
    }

    pub fn snapshot_at(&self, now: DateTime<Local>, activity_timeout: Duration) -> HealthSnapshot {
        let last_received = self.last_received();
        let last_sent = self.last_sent();

        let last_activity = match (last_received, last_sent) {
            (Some(received), Some(sent)) => Some(received.max(sent)),
            (received, sent) => received.or(sent),
        };

        let seconds_since_activity = last_activity.map(|at| {
            let elapsed = now - at;
            let micros = elapsed.num_microseconds().unwrap_or(i64::MAX);
            (micros.max(0) as f64) / 1_000_000.0
        });

        let is_healthy = seconds_since_activity
            .map(|secs| secs <= activity_timeout.as_secs_f64())
            .unwrap_or(false);

        HealthSnapshot {
            is_healthy,
            last_received,
            last_sent,
            seconds_since_activity,
            messages_received: self.messages_received(),
            messages_sent: self.messages_sent(),
        }
    }

    pub fn is_healthy(&self, activity_timeout: Duration) -> bool {
        self.snapshot(activity_timeout).is_healthy
    }
}
