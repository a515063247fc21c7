//! Client-side link re-establishment.
//!
//! After an unforced disconnect of a reconnect-enabled transport, the
//! [`ConnectionEstablisher`] retries `connect` under the same identity at a
//! fixed interval until it succeeds, the transport closes, the server
//! rejects the identity or the restore window runs out.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::{StackError, TransportEvent, TransportEventListener};
use crate::identity::ConnectionId;
use crate::transport::{MessageTransport, ReconnectWatchdog, ScheduledTask, Scheduler};

/// Reconnects a client transport in the background.
pub struct ConnectionEstablisher {
    me: Weak<ConnectionEstablisher>,
    transport: Weak<MessageTransport>,
    watchdog: Option<Weak<ReconnectWatchdog>>,
    scheduler: Scheduler,
    interval: Duration,
    active: AtomicBool,
    task: Mutex<Option<ScheduledTask>>,
}

impl ConnectionEstablisher {
    /// Establisher for `transport`, giving up when `watchdog` expires.
    pub fn new(
        transport: &Arc<MessageTransport>,
        watchdog: Option<&Arc<ReconnectWatchdog>>,
        scheduler: Scheduler,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport: Arc::downgrade(transport),
            watchdog: watchdog.map(Arc::downgrade),
            scheduler,
            interval,
            active: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Whether a retry loop is running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn window_open(&self) -> bool {
        let expired = self
            .watchdog
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|w| w.has_expired());
        let open = self
            .transport
            .upgrade()
            .is_some_and(|t| !t.is_closed());
        open && !expired
    }

    fn start(&self, id: &ConnectionId) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(%id, interval = ?self.interval, "re-establishing connection");
        let me = self.me.clone();
        let interval = self.interval;
        let task = self.scheduler.spawn(async move {
            let mut attempts = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                let Some(this) = me.upgrade() else {
                    return;
                };
                if !this.window_open() {
                    debug!(attempts, "restore window closed, giving up");
                    break;
                }
                let Some(transport) = this.transport.upgrade() else {
                    break;
                };
                attempts += 1;
                match transport.connect().await {
                    Ok(id) => {
                        info!(%id, attempts, "connection re-established");
                        break;
                    }
                    Err(e) if gives_up(&e) => {
                        warn!(error = %e, attempts, "reconnect abandoned");
                        break;
                    }
                    Err(e) => debug!(error = %e, attempts, "reconnect attempt failed"),
                }
            }
            if let Some(this) = me.upgrade() {
                this.active.store(false, Ordering::SeqCst);
            }
        });
        *self.task.lock() = Some(task);
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel();
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

fn gives_up(error: &StackError) -> bool {
    error.is_fatal()
        || matches!(
            error,
            StackError::Closed
                | StackError::ReconnectionRejected(_)
                | StackError::StackMismatch { .. }
        )
}

impl TransportEventListener for ConnectionEstablisher {
    fn on_transport_event(&self, id: &ConnectionId, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected { forced: false } => {
                let enabled = self
                    .transport
                    .upgrade()
                    .is_some_and(|t| t.options().reconnect_enabled);
                if enabled {
                    self.start(id);
                }
            }
            TransportEvent::Closed => self.stop(),
            _ => {}
        }
    }
}

impl fmt::Debug for ConnectionEstablisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEstablisher")
            .field("interval", &self.interval)
            .field("active", &self.is_active())
            .finish()
    }
}
