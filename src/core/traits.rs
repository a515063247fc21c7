//! Layer contracts.
//!
//! Every stage of a stack (channel, once-and-only-once layer, transport)
//! implements [`NetworkLayer`]. Neighbors are held weakly; the harness that
//! assembled the chain owns the strong references.

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use super::error::{StackError, StackResult};
use crate::identity::ConnectionId;

/// A bidirectional stage of a network stack.
///
/// `send` travels towards the wire, `receive` travels towards the
/// application.
pub trait NetworkLayer: Send + Sync {
    /// Point this layer at the layer below it.
    fn set_send_layer(&self, layer: Weak<dyn NetworkLayer>) -> StackResult<()>;

    /// Point this layer at the layer above it.
    fn set_receive_layer(&self, layer: Weak<dyn NetworkLayer>) -> StackResult<()>;

    /// Push a message down the stack.
    ///
    /// May block the calling thread while a bounded queue is full; layers
    /// that would block a current-thread runtime fail instead.
    fn send(&self, message: Bytes) -> StackResult<()>;

    /// Push received buffers up the stack.
    ///
    /// The buffers form one logical message.
    fn receive(&self, buffers: &[Bytes]) -> StackResult<()>;

    /// Whether a usable path to the peer exists.
    fn is_connected(&self) -> bool;

    /// Open the path to the peer, returning the assigned identity.
    ///
    /// Fails with [`StackError::HostResolution`], [`StackError::Timeout`] or
    /// [`StackError::MaxConnectionsExceeded`] among others.
    fn open(&self) -> StackResult<ConnectionId>;

    /// Close this layer and everything below it.
    fn close(&self);
}

/// Connection lifecycle events raised by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// A physical connection is (again) usable.
    Connected,
    /// The physical connection was lost.
    Disconnected {
        /// Closed by the stack itself rather than by the network.
        forced: bool,
    },
    /// A (re)connect attempt is about to be made.
    ConnectAttempt,
    /// The transport is closed for good.
    Closed,
    /// The server refused to resume this identity.
    ReconnectionRejected,
}

/// Receiver of [`TransportEvent`]s.
pub trait TransportEventListener: Send + Sync {
    /// Handle an event from the transport owning `id`.
    fn on_transport_event(&self, id: &ConnectionId, event: TransportEvent);
}

/// A weakly held neighbor reference.
pub struct LayerSlot {
    name: &'static str,
    layer: RwLock<Option<Weak<dyn NetworkLayer>>>,
}

impl LayerSlot {
    /// Create an empty slot; `name` appears in [`StackError::LayerNotSet`].
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            layer: RwLock::new(None),
        }
    }

    /// Point the slot at `layer`, replacing any previous neighbor.
    pub fn set(&self, layer: Weak<dyn NetworkLayer>) {
        *self.layer.write() = Some(layer);
    }

    /// Whether a neighbor has been wired (it may since have been dropped).
    pub fn is_set(&self) -> bool {
        self.layer.read().is_some()
    }

    /// Resolve the neighbor.
    pub fn get(&self) -> StackResult<Arc<dyn NetworkLayer>> {
        self.layer
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(StackError::LayerNotSet(self.name))
    }
}

impl std::fmt::Debug for LayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerSlot")
            .field("name", &self.name)
            .field("set", &self.is_set())
            .finish()
    }
}

/// Weakly held transport event listeners.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<Weak<dyn TransportEventListener>>>,
}

impl ListenerSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add(&self, listener: Weak<dyn TransportEventListener>) {
        self.listeners.lock().push(listener);
    }

    /// Number of live listeners.
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }

    /// Whether no live listener remains.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every live listener, in registration order.
    ///
    /// Listeners run outside the registry lock and may register more listeners.
    pub fn notify(&self, id: &ConnectionId, event: TransportEvent) {
        let live: Vec<Arc<dyn TransportEventListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.on_transport_event(id, event);
        }
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet").field("len", &self.len()).finish()
    }
}

/// Join the buffers of one logical message.
pub fn coalesce(buffers: &[Bytes]) -> Bytes {
    match buffers {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let total = many.iter().map(Bytes::len).sum();
            let mut joined = BytesMut::with_capacity(total);
            for buf in many {
                joined.extend_from_slice(buf);
            }
            joined.freeze()
        }
    }
}
