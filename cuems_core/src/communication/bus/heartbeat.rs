/// Ping/pong heartbeat state
///
/// Auto-ping manufactures traffic on an idle bus so the health snapshot on the
/// other side stays meaningful; auto-pong answers pings (on by default).
/// Settings changes are picked up by the hub loops on their next tick.
use super::envelope::{self, ControlEnvelope};
use super::health::HealthMonitor;
use super::message::{JsonMap, SenderId};
use crate::error::{CuemsError, CuemsResult};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AutoPing {
    Disabled,
    Enabled {
        /// How often the auto-ping loop checks for inactivity
        interval: Duration,
        /// Outbound silence that triggers a ping
        inactivity_threshold: Duration,
    },
}

/// Outcome of running a received envelope through the heartbeat
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Application data, goes to the incoming queue
    Deliver(JsonMap),
    /// Control envelope, handled here; `reply` must be queued for sending
    Consumed { reply: Option<JsonMap> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatStats {
    pub ping_count: u64,
    pub pong_count: u64,
    pub pongs_received: u64,
    pub auto_ping: AutoPing,
    pub auto_pong: bool,
}

#[derive(Debug)]
pub struct Heartbeat {
    auto_ping: watch::Sender<AutoPing>,
    auto_pong: AtomicBool,
    ping_count: AtomicU64,
    pong_count: AtomicU64,
    pongs_received: AtomicU64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        let (auto_ping, _) = watch::channel(AutoPing::Disabled);
        Self {
            auto_ping,
            auto_pong: AtomicBool::new(true),
            ping_count: AtomicU64::new(0),
            pong_count: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
        }
    }

    pub fn enable_auto_ping(
        &self,
        interval: Duration,
        inactivity_threshold: Duration,
    ) -> CuemsResult<()> {
        if interval.is_zero() {
            return Err(CuemsError::config("auto-ping interval must be greater than zero"));
        }
        self.auto_ping.send_replace(AutoPing::Enabled {
            interval,
            inactivity_threshold,
        });
        debug!(
            "Auto-ping enabled (interval {:?}, inactivity threshold {:?})",
            interval, inactivity_threshold
        );
        Ok(())
    }

    pub fn disable_auto_ping(&self) {
        self.auto_ping.send_replace(AutoPing::Disabled);
        debug!("Auto-ping disabled");
    }

    pub fn auto_ping(&self) -> AutoPing {
        *self.auto_ping.borrow()
    }

    /// Watch auto-ping settings changes
    pub fn subscribe(&self) -> watch::Receiver<AutoPing> {
        self.auto_ping.subscribe()
    }

    /// Live settings watchers, one per running auto-ping loop
    pub fn subscriber_count(&self) -> usize {
        self.auto_ping.receiver_count()
    }

    pub fn enable_auto_pong(&self) {
        self.auto_pong.store(true, Ordering::Relaxed);
    }

    pub fn disable_auto_pong(&self) {
        self.auto_pong.store(false, Ordering::Relaxed);
    }

    pub fn auto_pong_enabled(&self) -> bool {
        self.auto_pong.load(Ordering::Relaxed)
    }

    /// Build the next ping envelope and count it
    pub fn make_ping(&self) -> JsonMap {
        self.ping_count.fetch_add(1, Ordering::Relaxed);
        envelope::ping(envelope::timestamp_now())
    }

    /// True when outbound traffic has been idle longer than `inactivity_threshold`,
    /// or nothing was ever sent
    pub fn ping_due(
        health: &HealthMonitor,
        now: DateTime<Local>,
        inactivity_threshold: Duration,
    ) -> bool {
        match health.idle_since_sent(now) {
            Some(idle) => idle > inactivity_threshold,
            None => true,
        }
    }

    /// Classify a received envelope. Pings and pongs are always consumed.
    pub fn handle_inbound(&self, data: JsonMap, sender: &SenderId) -> Inbound {
        match envelope::classify(&data) {
            Some(ControlEnvelope::Ping { timestamp }) => {
                if !self.auto_pong_enabled() {
                    debug!("Ping from {} ignored, auto-pong disabled", sender);
                    return Inbound::Consumed { reply: None };
                }
                self.pong_count.fetch_add(1, Ordering::Relaxed);
                debug!("Ping from {}, answering with pong", sender);
                Inbound::Consumed {
                    reply: Some(envelope::pong(envelope::timestamp_now(), timestamp)),
                }
            }
            Some(ControlEnvelope::Pong { ping_timestamp, .. }) => {
                self.pongs_received.fetch_add(1, Ordering::Relaxed);
                debug!("Pong from {} (ping at {})", sender, ping_timestamp);
                Inbound::Consumed { reply: None }
            }
            None => Inbound::Deliver(data),
        }
    }

    pub fn ping_count(&self) -> u64 {
        self.ping_count.load(Ordering::Relaxed)
    }

    pub fn pong_count(&self) -> u64 {
        self.pong_count.load(Ordering::Relaxed)
    }

    pub fn pongs_received(&self) -> u64 {
        self.pongs_received.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            ping_count: self.ping_count(),
            pong_count: self.pong_count(),
            pongs_received: self.pongs_received(),
            auto_ping: self.auto_ping(),
            auto_pong: self.auto_pong_enabled(),
        }
    }
}
