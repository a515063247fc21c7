//! Restore-window watchdog.
//!
//! When a guaranteed stack loses its physical connection the once-and-only-once
//! layer keeps its state for a bounded time while the link is re-established.
//! [`ReconnectWatchdog`] listens to the transport, arms on an unforced
//! disconnect and, if no new connection arrives in time, tells the layer the
//! restore failed and closes the transport.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::timer::{ScheduledTask, Scheduler};
use crate::core::{NetworkLayer, TransportEvent, TransportEventListener};
use crate::identity::ConnectionId;

/// A layer that can hold its state across a connection restore.
pub trait RestorableLayer: Send + Sync {
    /// The transport is down; keep state and hide the disconnect.
    fn start_restoring_connection(&self);

    /// The restore window passed; discard state.
    fn connection_restore_failed(&self);
}

/// Closes a transport whose restore window expired.
pub struct ReconnectWatchdog {
    me: Weak<ReconnectWatchdog>,
    layer: Weak<dyn RestorableLayer>,
    transport: Weak<dyn NetworkLayer>,
    scheduler: Scheduler,
    timeout: Duration,
    armed: Mutex<Option<ScheduledTask>>,
    expired: AtomicBool,
}

impl ReconnectWatchdog {
    /// Watchdog for `layer` on top of `transport`.
    pub fn new(
        layer: Weak<dyn RestorableLayer>,
        transport: Weak<dyn NetworkLayer>,
        scheduler: Scheduler,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            layer,
            transport,
            scheduler,
            timeout,
            armed: Mutex::new(None),
            expired: AtomicBool::new(false),
        })
    }

    /// Restore window length.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a restore window is running.
    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    /// Whether the last restore window ran out.
    pub fn has_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Open a restore window for `id` unless one is running.
    pub fn arm(&self, id: &ConnectionId) {
        let mut armed = self.armed.lock();
        if armed.is_some() {
            return;
        }
        if let Some(layer) = self.layer.upgrade() {
            layer.start_restoring_connection();
        }
        self.expired.store(false, Ordering::SeqCst);
        debug!(%id, timeout = ?self.timeout, "restore window opened");
        let me = self.me.clone();
        *armed = Some(self.scheduler.schedule(self.timeout, move || {
            if let Some(watchdog) = me.upgrade() {
                watchdog.expire();
            }
        }));
    }

    fn disarm(&self) {
        if let Some(task) = self.armed.lock().take() {
            task.cancel();
        }
    }

    fn expire(&self) {
        if self.armed.lock().take().is_none() {
            return;
        }
        self.expired.store(true, Ordering::SeqCst);
        info!(timeout = ?self.timeout, "restore window expired, closing transport");
        if let Some(layer) = self.layer.upgrade() {
            layer.connection_restore_failed();
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.close();
        }
    }
}

impl TransportEventListener for ReconnectWatchdog {
    fn on_transport_event(&self, id: &ConnectionId, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected { forced: false } => self.arm(id),
            TransportEvent::Disconnected { forced: true }
            | TransportEvent::Connected
            | TransportEvent::Closed => self.disarm(),
            TransportEvent::ConnectAttempt | TransportEvent::ReconnectionRejected => {}
        }
    }
}

impl fmt::Debug for ReconnectWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectWatchdog")
            .field("timeout", &self.timeout)
            .field("armed", &self.is_armed())
            .field("expired", &self.has_expired())
            .finish()
    }
}
