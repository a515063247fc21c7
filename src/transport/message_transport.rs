//! The transport layer: bottom of every stack.
//!
//! A [`MessageTransport`] owns at most one physical [`Connection`] at a time
//! and wraps payloads from the layer above in DATA messages. A client
//! transport opens its own connections and runs the SYN / SYN_ACK exchange;
//! a server transport is handed connections whose SYN the stack provider has
//! already accepted. Connection lifecycle is published as
//! [`TransportEvent`]s to the registered listeners.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use super::connection::{Connection, ConnectionHandler};
use super::connector::Connector;
use super::timer::Scheduler;
use super::wire::{SynAck, SynAckStatus, WireMessage};
use crate::core::constants::{DEFAULT_CONNECT_TIMEOUT, MAX_DATA_PAYLOAD_SIZE, STACK_FLAG_TRANSPORT};
use crate::core::{
    LayerSlot, ListenerSet, NetworkLayer, StackError, StackResult, TransportEvent,
    TransportEventListener,
};
use crate::identity::ConnectionId;

/// Where a client transport connects to.
#[derive(Clone)]
pub struct ClientEndpoint {
    /// `host:port` of the server.
    pub addr: String,
    /// Opens physical connections.
    pub connector: Arc<dyn Connector>,
    /// Bound on connecting plus the SYN / SYN_ACK exchange.
    pub connect_timeout: Duration,
}

impl ClientEndpoint {
    /// Endpoint with the default connect timeout.
    pub fn new(addr: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            addr: addr.into(),
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl fmt::Debug for ClientEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEndpoint")
            .field("addr", &self.addr)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Settings shared by client and server transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Layers of the stack this transport belongs to.
    pub stack_flags: u16,
    /// Whether lost connections may be restored.
    pub reconnect_enabled: bool,
    /// Connection limit reported to clients (0 = unlimited).
    pub max_connections: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            stack_flags: STACK_FLAG_TRANSPORT,
            reconnect_enabled: false,
            max_connections: 0,
        }
    }
}

enum Role {
    Client {
        endpoint: ClientEndpoint,
        scheduler: Scheduler,
    },
    Server,
}

type PendingSynAck = oneshot::Sender<StackResult<ConnectionId>>;

/// Transport layer over replaceable physical connections.
pub struct MessageTransport {
    me: Weak<MessageTransport>,
    role: Role,
    options: TransportOptions,
    connection_id: RwLock<ConnectionId>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    receive_layer: LayerSlot,
    listeners: ListenerSet,
    established: AtomicBool,
    closed: AtomicBool,
    pending: Mutex<Option<PendingSynAck>>,
    connecting: tokio::sync::Mutex<()>,
}

impl MessageTransport {
    fn build(role: Role, id: ConnectionId, options: TransportOptions) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            role,
            options,
            connection_id: RwLock::new(id),
            connection: Mutex::new(None),
            receive_layer: LayerSlot::new("receive"),
            listeners: ListenerSet::new(),
            established: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        })
    }

    /// Client transport presenting `id` to the server at `endpoint`.
    pub fn client(
        endpoint: ClientEndpoint,
        id: ConnectionId,
        options: TransportOptions,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        Self::build(Role::Client { endpoint, scheduler }, id, options)
    }

    /// Server transport for an identity the provider assigned.
    pub fn server(id: ConnectionId, options: TransportOptions) -> Arc<Self> {
        Self::build(Role::Server, id, options)
    }

    /// Register a connection event listener. Listeners are notified in
    /// registration order.
    pub fn add_listener(&self, listener: Weak<dyn TransportEventListener>) {
        self.listeners.add(listener);
    }

    /// Identity of the logical connection.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id.read().clone()
    }

    /// Settings this transport was built with.
    pub fn options(&self) -> TransportOptions {
        self.options
    }

    /// Whether this is the connecting side.
    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }

    /// Whether the transport is closed for good.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The current physical connection, if any.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().clone()
    }

    /// Open a physical connection and run the SYN / SYN_ACK exchange.
    ///
    /// Concurrent calls are serialized; a call made while connected returns
    /// the current identity.
    pub async fn connect(&self) -> StackResult<ConnectionId> {
        let Role::Client { endpoint, .. } = &self.role else {
            return Err(StackError::Unsupported("connect on a server transport"));
        };
        let _serial = self.connecting.lock().await;
        if self.is_closed() {
            return Err(StackError::Closed);
        }
        if self.is_connected() {
            return Ok(self.connection_id());
        }

        let id = self.connection_id();
        self.listeners.notify(&id, TransportEvent::ConnectAttempt);
        debug!(%id, addr = %endpoint.addr, "connecting");
        let connection = endpoint
            .connector
            .connect(&endpoint.addr, endpoint.connect_timeout)
            .await?;

        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);
        self.install(connection.clone());
        let syn = WireMessage::Syn {
            stack_flags: self.options.stack_flags,
            connection_id: id,
        };
        let sent = syn
            .encode()
            .map_err(StackError::from)
            .and_then(|syn| connection.write(syn));
        if let Err(e) = sent {
            self.abandon(&connection);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(endpoint.connect_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) if self.is_closed() => Err(StackError::Closed),
            Ok(Err(_)) => Err(StackError::NotConnected),
            Err(_) => Err(StackError::Timeout(endpoint.connect_timeout)),
        };
        if outcome.is_err() {
            self.abandon(&connection);
        }
        outcome
    }

    /// Hand an accepted connection to this server transport and confirm it
    /// to the client.
    ///
    /// Must run on the connection's read path (inside the handler that saw
    /// the SYN) so nothing from the client is dispatched before the
    /// transport owns the connection.
    pub fn attach_new_connection(&self, connection: Arc<dyn Connection>) -> StackResult<()> {
        if self.is_client() {
            return Err(StackError::Unsupported("attach on a client transport"));
        }
        if self.is_closed() {
            return Err(StackError::Closed);
        }
        let replaced = self.established.swap(false, Ordering::SeqCst);
        self.install(connection.clone());

        let id = self.connection_id();
        let ack = SynAck {
            status: SynAckStatus::Ok,
            stack_flags: self.options.stack_flags,
            max_connections: self.options.max_connections,
            connection_id: id.clone(),
            error: None,
        };
        connection.write(WireMessage::SynAck(ack).encode()?)?;
        self.established.store(true, Ordering::SeqCst);
        debug!(%id, conn = connection.id(), replaced, "connection attached");
        self.listeners.notify(&id, TransportEvent::Connected);
        Ok(())
    }

    fn install(&self, connection: Arc<dyn Connection>) {
        let previous = self.connection.lock().replace(connection.clone());
        if let Some(previous) = previous {
            if previous.id() != connection.id() {
                debug!(old = previous.id(), new = connection.id(), "replacing connection");
                previous.close();
            }
        }
        let handler: Weak<dyn ConnectionHandler> = self.me.clone();
        connection.set_handler(handler);
    }

    fn abandon(&self, connection: &Arc<dyn Connection>) {
        self.pending.lock().take();
        {
            let mut current = self.connection.lock();
            if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
                current.take();
            }
        }
        connection.close();
    }

    fn is_current(&self, connection: &Arc<dyn Connection>) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.id() == connection.id())
    }

    fn on_syn_ack(&self, ack: SynAck) {
        let Some(pending) = self.pending.lock().take() else {
            warn!(id = %self.connection_id(), "unsolicited SYN_ACK ignored");
            return;
        };
        let local = self.options.stack_flags;
        let outcome = match ack.status {
            SynAckStatus::Ok if ack.stack_flags != local => Err(StackError::StackMismatch {
                local,
                remote: ack.stack_flags,
            }),
            SynAckStatus::Ok => {
                let id = ack.connection_id;
                *self.connection_id.write() = id.clone();
                self.established.store(true, Ordering::SeqCst);
                info!(%id, "connection established");
                self.listeners.notify(&id, TransportEvent::Connected);
                Ok(id)
            }
            SynAckStatus::MaxConnectionsExceeded => Err(StackError::MaxConnectionsExceeded {
                max: ack.max_connections,
            }),
            SynAckStatus::StackNotFound => {
                let id = self.connection_id();
                self.listeners
                    .notify(&id, TransportEvent::ReconnectionRejected);
                Err(StackError::ReconnectionRejected(
                    ack.error.unwrap_or_else(|| format!("no stack for {id}")),
                ))
            }
            SynAckStatus::StackMismatch => Err(StackError::StackMismatch {
                local,
                remote: ack.stack_flags,
            }),
            SynAckStatus::Error => Err(StackError::Refused(ack.error.unwrap_or_default())),
        };
        if let Err(e) = &outcome {
            warn!(id = %self.connection_id(), error = %e, "connection refused");
        }
        let _ = pending.send(outcome);
    }

    fn deliver_up(&self, connection: &Arc<dyn Connection>, payload: Bytes) {
        let result = self
            .receive_layer
            .get()
            .and_then(|layer| layer.receive(&[payload]));
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!(id = %self.connection_id(), error = %e, "fatal stack error, dropping connection");
                connection.close();
            }
            Err(e) => debug!(id = %self.connection_id(), error = %e, "inbound message not delivered"),
        }
    }

    fn block_on_connect(&self, scheduler: &Scheduler) -> StackResult<ConnectionId> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => Err(
                StackError::Unsupported("blocking open on a current-thread runtime"),
            ),
            Ok(_) => tokio::task::block_in_place(|| scheduler.handle().block_on(self.connect())),
            Err(_) => scheduler.handle().block_on(self.connect()),
        }
    }
}

impl ConnectionHandler for MessageTransport {
    fn on_message(&self, connection: &Arc<dyn Connection>, message: Bytes) {
        if !self.is_current(connection) {
            trace!(conn = connection.id(), "message from superseded connection dropped");
            return;
        }
        match WireMessage::decode(message) {
            Ok(WireMessage::Data(payload)) => self.deliver_up(connection, payload),
            Ok(WireMessage::SynAck(ack)) => self.on_syn_ack(ack),
            Ok(WireMessage::Syn { connection_id, .. }) => {
                warn!(id = %self.connection_id(), requested = %connection_id, "SYN on attached connection ignored");
            }
            Err(e) => {
                error!(id = %self.connection_id(), error = %e, "undecodable wire message, closing connection");
                connection.close();
            }
        }
    }

    fn on_closed(&self, connection: &Arc<dyn Connection>) {
        if self.is_closed() {
            return;
        }
        {
            let mut current = self.connection.lock();
            if !current.as_ref().is_some_and(|c| c.id() == connection.id()) {
                trace!(conn = connection.id(), "superseded connection closed");
                return;
            }
            current.take();
        }
        self.pending.lock().take();
        if !self.established.swap(false, Ordering::SeqCst) {
            return;
        }

        let id = self.connection_id();
        info!(%id, reconnect = self.options.reconnect_enabled, "connection lost");
        self.listeners
            .notify(&id, TransportEvent::Disconnected { forced: false });
        if !self.options.reconnect_enabled && !self.is_client() {
            self.close();
        }
    }
}

impl NetworkLayer for MessageTransport {
    fn set_send_layer(&self, _layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        Err(StackError::Unsupported("transport is the bottom of the stack"))
    }

    fn set_receive_layer(&self, layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        self.receive_layer.set(layer);
        Ok(())
    }

    fn send(&self, message: Bytes) -> StackResult<()> {
        if self.is_closed() {
            return Err(StackError::Closed);
        }
        if !self.established.load(Ordering::SeqCst) {
            return Err(StackError::NotConnected);
        }
        if message.len() > MAX_DATA_PAYLOAD_SIZE {
            return Err(StackError::MessageTooLarge {
                len: message.len(),
                max: MAX_DATA_PAYLOAD_SIZE,
            });
        }
        let connection = self.connection().ok_or(StackError::NotConnected)?;
        connection.write(WireMessage::Data(message).encode()?)
    }

    fn receive(&self, _buffers: &[Bytes]) -> StackResult<()> {
        Err(StackError::Unsupported("transport receives from the wire only"))
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
            && self.established.load(Ordering::SeqCst)
            && self.connection().is_some_and(|c| c.is_open())
    }

    fn open(&self) -> StackResult<ConnectionId> {
        match &self.role {
            Role::Client { scheduler, .. } => self.block_on_connect(scheduler),
            Role::Server if self.is_connected() => Ok(self.connection_id()),
            Role::Server => Err(StackError::Unsupported("open on a server transport")),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending.lock().take();
        let connection = self.connection.lock().take();
        let was_established = self.established.swap(false, Ordering::SeqCst);
        if let Some(connection) = connection {
            connection.close();
        }

        let id = self.connection_id();
        info!(%id, "transport closed");
        if was_established {
            self.listeners
                .notify(&id, TransportEvent::Disconnected { forced: true });
        }
        self.listeners.notify(&id, TransportEvent::Closed);
    }
}

impl fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTransport")
            .field("id", &self.connection_id())
            .field("client", &self.is_client())
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{eventually, EventLog, SinkLayer};
    use crate::identity::ProductKind;
    use crate::transport::memory::MemoryConnector;

    /// Accept-time handler: answers the SYN on behalf of a provider.
    struct Acceptor {
        server: Arc<MessageTransport>,
        refuse: Option<SynAckStatus>,
    }

    impl ConnectionHandler for Acceptor {
        fn on_message(&self, connection: &Arc<dyn Connection>, message: Bytes) {
            let Ok(WireMessage::Syn { connection_id, .. }) = WireMessage::decode(message) else {
                return;
            };
            match self.refuse {
                None => self.server.attach_new_connection(connection.clone()).unwrap(),
                Some(status) => {
                    let ack = SynAck {
                        status,
                        stack_flags: STACK_FLAG_TRANSPORT,
                        max_connections: 3,
                        connection_id,
                        error: Some("refused".into()),
                    };
                    connection.write(WireMessage::SynAck(ack).encode().unwrap()).unwrap();
                }
            }
        }

        fn on_closed(&self, _connection: &Arc<dyn Connection>) {}
    }

    struct Side {
        transport: Arc<MessageTransport>,
        sink: Arc<SinkLayer>,
        events: Arc<EventLog>,
    }

    fn wire_side(transport: Arc<MessageTransport>) -> Side {
        let sink = Arc::new(SinkLayer::new());
        let events = Arc::new(EventLog::new());
        let sink_dyn: Arc<dyn NetworkLayer> = sink.clone();
        transport.set_receive_layer(Arc::downgrade(&sink_dyn)).unwrap();
        let events_dyn: Arc<dyn TransportEventListener> = events.clone();
        transport.add_listener(Arc::downgrade(&events_dyn));
        Side {
            transport,
            sink,
            events,
        }
    }

    struct Rig {
        client: Side,
        server: Side,
        connector: Arc<MemoryConnector>,
        _acceptor: Arc<dyn ConnectionHandler>,
    }

    fn rig(refuse: Option<SynAckStatus>, reconnect_enabled: bool) -> Rig {
        let options = TransportOptions {
            reconnect_enabled,
            ..TransportOptions::default()
        };
        let assigned =
            ConnectionId::new_client("jvm-1", ProductKind::Permanent).assigned(7, "server-a");
        let server = MessageTransport::server(assigned, options);
        let acceptor: Arc<dyn ConnectionHandler> = Arc::new(Acceptor {
            server: server.clone(),
            refuse,
        });
        let weak_acceptor = Arc::downgrade(&acceptor);
        let connector = Arc::new(MemoryConnector::new(move |conn| {
            conn.set_handler(weak_acceptor.clone());
        }));
        let client = MessageTransport::client(
            ClientEndpoint::new("memory", connector.clone()),
            ConnectionId::new_client("jvm-1", ProductKind::Permanent),
            options,
            Scheduler::current(),
        );
        Rig {
            client: wire_side(client),
            server: wire_side(server),
            connector,
            _acceptor: acceptor,
        }
    }

    #[tokio::test]
    async fn test_connect_adopts_assigned_identity_and_carries_data() {
        let rig = rig(None, false);
        let id = rig.client.transport.connect().await.unwrap();
        assert_eq!(id.channel_id(), 7);
        assert_eq!(rig.client.transport.connection_id(), id);
        assert!(rig.client.transport.is_connected());
        assert_eq!(
            rig.client.events.take(),
            vec![TransportEvent::ConnectAttempt, TransportEvent::Connected]
        );
        assert_eq!(rig.server.events.take(), vec![TransportEvent::Connected]);

        rig.client.transport.send(Bytes::from_static(b"up")).unwrap();
        rig.server.transport.send(Bytes::from_static(b"down")).unwrap();
        let server_sink = rig.server.sink.clone();
        eventually("server delivery", || !server_sink.take_received().is_empty()).await;
        let client_sink = rig.client.sink.clone();
        eventually("client delivery", || !client_sink.take_received().is_empty()).await;
    }

    #[tokio::test]
    async fn test_refusals_map_to_errors() {
        let full = rig(Some(SynAckStatus::MaxConnectionsExceeded), false);
        let err = full.client.transport.connect().await.unwrap_err();
        assert!(matches!(err, StackError::MaxConnectionsExceeded { max: 3 }));
        assert!(!full.client.transport.is_connected());

        let unknown = rig(Some(SynAckStatus::StackNotFound), false);
        let err = unknown.client.transport.connect().await.unwrap_err();
        assert!(matches!(err, StackError::ReconnectionRejected(_)));
        assert!(unknown
            .client
            .events
            .take()
            .contains(&TransportEvent::ReconnectionRejected));
    }

    #[tokio::test]
    async fn test_lost_connection_closes_plain_server() {
        let rig = rig(None, false);
        rig.client.transport.connect().await.unwrap();
        rig.client.events.take();
        rig.server.events.take();

        rig.connector.sever();
        let client_events = rig.client.events.clone();
        eventually("client disconnect", || {
            !client_events.take().is_empty() && !rig.client.transport.is_connected()
        })
        .await;
        let server = rig.server.transport.clone();
        eventually("server close", || server.is_closed()).await;
        assert_eq!(
            rig.server.events.take(),
            vec![
                TransportEvent::Disconnected { forced: false },
                TransportEvent::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_reconnect_enabled_server_survives_loss() {
        let rig = rig(None, true);
        rig.client.transport.connect().await.unwrap();
        rig.connector.sever();
        let server = rig.server.transport.clone();
        eventually("server disconnect", || !server.is_connected()).await;
        assert!(!rig.server.transport.is_closed());

        rig.client.transport.connect().await.unwrap();
        eventually("server reattached", || server.is_connected()).await;
    }

    #[tokio::test]
    async fn test_oversized_payload_is_refused_and_link_survives() {
        let rig = rig(None, false);
        rig.client.transport.connect().await.unwrap();

        let huge = Bytes::from(vec![0u8; MAX_DATA_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            rig.client.transport.send(huge),
            Err(StackError::MessageTooLarge { max: MAX_DATA_PAYLOAD_SIZE, .. })
        ));
        assert!(rig.client.transport.is_connected());

        rig.client.transport.send(Bytes::from_static(b"after")).unwrap();
        let server_sink = rig.server.sink.clone();
        eventually("delivery after refusal", || !server_sink.take_received().is_empty()).await;
    }

    #[tokio::test]
    async fn test_close_is_forced_then_closed() {
        let rig = rig(None, false);
        rig.client.transport.connect().await.unwrap();
        rig.client.events.take();

        rig.client.transport.close();
        rig.client.transport.close();
        assert_eq!(
            rig.client.events.take(),
            vec![
                TransportEvent::Disconnected { forced: true },
                TransportEvent::Closed
            ]
        );
        assert!(matches!(
            rig.client.transport.send(Bytes::from_static(b"late")),
            Err(StackError::Closed)
        ));
        assert!(matches!(
            rig.client.transport.connect().await,
            Err(StackError::Closed)
        ));
    }

    #[test]
    fn test_transport_is_bottom_of_stack() {
        let transport = MessageTransport::server(ConnectionId::null(), TransportOptions::default());
        let sink: Arc<dyn NetworkLayer> = Arc::new(SinkLayer::new());
        assert!(matches!(
            transport.set_send_layer(Arc::downgrade(&sink)),
            Err(StackError::Unsupported(_))
        ));
        assert!(matches!(transport.open(), Err(StackError::Unsupported(_))));
        assert!(matches!(
            transport.send(Bytes::from_static(b"x")),
            Err(StackError::NotConnected)
        ));
    }
}
