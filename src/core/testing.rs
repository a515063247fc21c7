//! Test doubles shared by the layer tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use bytes::Bytes;
use parking_lot::Mutex;

use super::error::{StackError, StackResult};
use super::traits::{coalesce, NetworkLayer, TransportEvent, TransportEventListener};
use crate::identity::ConnectionId;

/// Bottom layer that records what is sent through it.
pub(crate) struct LoopbackLayer {
    sent: Mutex<Vec<Bytes>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackLayer {
    pub(crate) fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn take_sent(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl NetworkLayer for LoopbackLayer {
    fn set_send_layer(&self, _layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        Err(StackError::Unsupported("loopback has no send layer"))
    }

    fn set_receive_layer(&self, _layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        Ok(())
    }

    fn send(&self, message: Bytes) -> StackResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StackError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn receive(&self, _buffers: &[Bytes]) -> StackResult<()> {
        Err(StackError::Unsupported("loopback receive"))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn open(&self) -> StackResult<ConnectionId> {
        Ok(ConnectionId::null())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Top layer that records what it receives.
pub(crate) struct SinkLayer {
    received: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl SinkLayer {
    pub(crate) fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn take_received(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl NetworkLayer for SinkLayer {
    fn set_send_layer(&self, _layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        Ok(())
    }

    fn set_receive_layer(&self, _layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        Err(StackError::Unsupported("sink has no receive layer"))
    }

    fn send(&self, _message: Bytes) -> StackResult<()> {
        Err(StackError::Unsupported("sink send"))
    }

    fn receive(&self, buffers: &[Bytes]) -> StackResult<()> {
        self.received.lock().push(coalesce(buffers));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn open(&self) -> StackResult<ConnectionId> {
        Err(StackError::Unsupported("sink open"))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Listener that records events in order.
pub(crate) struct EventLog {
    events: Mutex<Vec<TransportEvent>>,
}

impl EventLog {
    pub(crate) fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn take(&self) -> Vec<TransportEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl TransportEventListener for EventLog {
    fn on_transport_event(&self, _id: &ConnectionId, event: TransportEvent) {
        self.events.lock().push(event);
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
