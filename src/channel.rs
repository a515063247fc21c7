//! Channel layer: top of every stack.
//!
//! Applications send through a [`MessageChannel`] and read inbound messages
//! and connection events from the [`ChannelEvent`] stream returned with it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::{
    coalesce, LayerSlot, NetworkLayer, StackError, StackResult, TransportEvent,
    TransportEventListener,
};
use crate::identity::ConnectionId;

/// What a channel reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// An inbound application message.
    Message(Bytes),
    /// A connection lifecycle change.
    Transport {
        /// Identity at the time of the event.
        id: ConnectionId,
        /// What happened.
        event: TransportEvent,
    },
}

/// Application endpoint of a stack.
pub struct MessageChannel {
    send_layer: LayerSlot,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connection_id: RwLock<ConnectionId>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MessageChannel {
    /// Create a channel and the stream of its events.
    pub fn new(id: ConnectionId) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            send_layer: LayerSlot::new("send"),
            events: tx,
            connection_id: RwLock::new(id),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (channel, rx)
    }

    /// Identity of the logical connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id.read().clone()
    }

    /// Whether the channel was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn publish(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            trace!(id = %self.connection_id(), "channel events receiver gone");
        }
    }
}

impl NetworkLayer for MessageChannel {
    fn set_send_layer(&self, layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        self.send_layer.set(layer);
        Ok(())
    }

    fn set_receive_layer(&self, _layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        Err(StackError::Unsupported("channel is the top of the stack"))
    }

    fn send(&self, message: Bytes) -> StackResult<()> {
        if self.is_closed() {
            return Err(StackError::Closed);
        }
        self.send_layer.get()?.send(message)
    }

    fn receive(&self, buffers: &[Bytes]) -> StackResult<()> {
        self.publish(ChannelEvent::Message(coalesce(buffers)));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.send_layer.get().is_ok_and(|l| l.is_connected())
    }

    fn open(&self) -> StackResult<ConnectionId> {
        if self.is_closed() {
            return Err(StackError::Closed);
        }
        let id = self.send_layer.get()?.open()?;
        *self.connection_id.write() = id.clone();
        Ok(id)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = %self.connection_id(), "closing channel");
        if let Ok(send) = self.send_layer.get() {
            send.close();
        }
    }
}

impl TransportEventListener for MessageChannel {
    fn on_transport_event(&self, id: &ConnectionId, event: TransportEvent) {
        *self.connection_id.write() = id.clone();
        match event {
            TransportEvent::Connected => self.connected.store(true, Ordering::SeqCst),
            TransportEvent::Disconnected { .. } => self.connected.store(false, Ordering::SeqCst),
            TransportEvent::Closed => {
                self.connected.store(false, Ordering::SeqCst);
                self.closed.store(true, Ordering::SeqCst);
            }
            TransportEvent::ConnectAttempt | TransportEvent::ReconnectionRejected => {}
        }
        self.publish(ChannelEvent::Transport {
            id: id.clone(),
            event,
        });
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("id", &self.connection_id())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("closed", &self.is_closed())
            .finish()
    }
}
