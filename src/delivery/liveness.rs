//! Keepalive probes and clock-skew checks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::frame::FrameBody;
use crate::core::constants::{TIME_CHECK_EVERY_PINGS, TIME_CHECK_SKEW_THRESHOLD};

/// Wall clock in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Tracks probe round trips and peer clock skew for one link.
#[derive(Debug)]
pub struct LivenessMonitor {
    probes: AtomicU32,
    last_rtt: Mutex<Option<Duration>>,
    last_skew: Mutex<Option<i64>>,
    last_activity: Mutex<Instant>,
    skew_threshold: Duration,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(TIME_CHECK_SKEW_THRESHOLD)
    }
}

impl LivenessMonitor {
    /// Monitor warning about skews beyond `skew_threshold`.
    pub fn new(skew_threshold: Duration) -> Self {
        Self {
            probes: AtomicU32::new(0),
            last_rtt: Mutex::new(None),
            last_skew: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            skew_threshold,
        }
    }

    /// Bodies to send for the next keepalive tick.
    pub fn next_probes(&self) -> Vec<FrameBody> {
        let n = self.probes.fetch_add(1, Ordering::Relaxed) + 1;
        let timestamp = now_millis();
        let mut bodies = vec![FrameBody::Ping { timestamp }];
        if n % TIME_CHECK_EVERY_PINGS == 0 {
            bodies.push(FrameBody::TimeCheck { timestamp });
        }
        bodies
    }

    /// Note that a frame arrived.
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether the peer has been silent for longer than `budget`.
    pub fn is_silent(&self, budget: Duration) -> bool {
        self.idle_for() > budget
    }

    /// Record the echo of one of our probes.
    pub fn on_ping_reply(&self, timestamp: i64) -> Option<Duration> {
        let elapsed = now_millis() - timestamp;
        if elapsed < 0 {
            return None;
        }
        let rtt = Duration::from_millis(elapsed as u64);
        trace!(rtt_ms = elapsed, "ping round trip");
        *self.last_rtt.lock() = Some(rtt);
        Some(rtt)
    }

    /// Record the peer clock; returns the skew in millis (peer minus local).
    pub fn on_time_check(&self, timestamp: i64) -> i64 {
        let skew = timestamp - now_millis();
        if skew.unsigned_abs() > self.skew_threshold.as_millis() as u64 {
            warn!(skew_ms = skew, "peer clock skew exceeds threshold");
        }
        *self.last_skew.lock() = Some(skew);
        skew
    }

    /// Latest round-trip sample.
    pub fn last_rtt(&self) -> Option<Duration> {
        *self.last_rtt.lock()
    }

    /// Latest skew sample.
    pub fn last_skew(&self) -> Option<i64> {
        *self.last_skew.lock()
    }
}
