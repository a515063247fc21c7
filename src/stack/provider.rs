//! Server-side stack lookup.
//!
//! [`ServerStackProvider`] is the accept-time handler of every inbound
//! connection. It reads the SYN, decides whether the client is new or
//! resuming, and either builds a fresh stack or hands the connection to the
//! stack it already has for that identity.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::harness::{HarnessFactory, NetworkStack, StackHarness};
use crate::channel::{ChannelEvent, MessageChannel};
use crate::core::{NetworkLayer, StackError, StackResult, TransportEvent, TransportEventListener};
use crate::identity::{ConnectionId, ConnectionIdFactory, NULL_CHANNEL_ID};
use crate::transport::{
    Connection, ConnectionHandler, MessageTransport, Scheduler, SynAck, SynAckStatus, WireMessage,
};

/// Limits concurrent clients, counted per client process.
#[derive(Debug, Default)]
pub struct ConnectionPolicy {
    max_clients: usize,
    clients: Mutex<HashMap<String, HashSet<ConnectionId>>>,
}

impl ConnectionPolicy {
    /// Policy admitting at most `max_clients` processes (0 = unlimited).
    pub fn new(max_clients: usize) -> Self {
        Self {
            max_clients,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Configured limit (0 = unlimited).
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    fn client_key(id: &ConnectionId) -> String {
        match id.jvm_id() {
            Ok(jvm) => jvm.to_string(),
            Err(_) => format!("channel-{}", id.channel_id()),
        }
    }

    /// Admit `id`; `false` when a new process would exceed the limit.
    pub fn connect(&self, id: &ConnectionId) -> bool {
        let key = Self::client_key(id);
        let mut clients = self.clients.lock();
        if let Some(ids) = clients.get_mut(&key) {
            ids.insert(id.clone());
            return true;
        }
        if self.max_clients != 0 && clients.len() >= self.max_clients {
            return false;
        }
        clients.entry(key).or_default().insert(id.clone());
        true
    }

    /// Release `id`.
    pub fn disconnect(&self, id: &ConnectionId) {
        let key = Self::client_key(id);
        let mut clients = self.clients.lock();
        if let Some(ids) = clients.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                clients.remove(&key);
            }
        }
    }

    /// Processes currently admitted.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

/// A server stack handed to the application.
#[derive(Debug)]
pub struct AcceptedChannel {
    /// The stack's channel.
    pub channel: Arc<MessageChannel>,
    /// Messages and events of the channel.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Builds, finds and retires server stacks.
pub struct ServerStackProvider {
    me: Weak<ServerStackProvider>,
    factory: Arc<dyn HarnessFactory>,
    scheduler: Scheduler,
    ids: ConnectionIdFactory,
    policy: ConnectionPolicy,
    harnesses: Mutex<HashMap<ConnectionId, Arc<StackHarness>>>,
    accepted: mpsc::UnboundedSender<AcceptedChannel>,
}

impl ServerStackProvider {
    /// Provider building stacks with `factory`. New channels are delivered
    /// on the returned receiver.
    pub fn new(
        factory: Arc<dyn HarnessFactory>,
        scheduler: Scheduler,
        ids: ConnectionIdFactory,
        policy: ConnectionPolicy,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AcceptedChannel>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            factory,
            scheduler,
            ids,
            policy,
            harnesses: Mutex::new(HashMap::new()),
            accepted: tx,
        });
        (provider, rx)
    }

    /// This server's id.
    pub fn server_id(&self) -> &str {
        self.ids.server_id()
    }

    /// Connection policy.
    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    /// Number of live stacks.
    pub fn stack_count(&self) -> usize {
        self.harnesses.lock().len()
    }

    /// The stack serving `id`.
    pub fn stack(&self, id: &ConnectionId) -> Option<Arc<NetworkStack>> {
        self.harnesses.lock().get(id).and_then(|h| h.stack())
    }

    /// Build stacks for identities that were connected before a restart, so
    /// their clients can resume. Stacks that see no client within the
    /// restore window are closed.
    pub fn prebuild(&self, ids: impl IntoIterator<Item = ConnectionId>) -> StackResult<()> {
        for id in ids {
            if id.server_id().as_str() != Some(self.server_id()) {
                warn!(%id, "not assigned by this server, skipping prebuild");
                continue;
            }
            self.ids.restore(&id);
            let harness = self.build_harness(id.clone())?;
            if let Some(watchdog) = harness.stack().as_ref().and_then(|s| s.watchdog().cloned()) {
                watchdog.arm(&id);
            }
            debug!(%id, "prebuilt stack");
        }
        Ok(())
    }

    /// Close every stack.
    pub fn shutdown(&self) {
        let harnesses: Vec<_> = self.harnesses.lock().drain().map(|(_, h)| h).collect();
        info!(stacks = harnesses.len(), "closing server stacks");
        for harness in harnesses {
            if let Some(stack) = harness.stack() {
                stack.channel().close();
            }
        }
    }

    fn build_harness(&self, id: ConnectionId) -> StackResult<Arc<StackHarness>> {
        let max = u32::try_from(self.policy.max_clients()).unwrap_or(u32::MAX);
        let transport = MessageTransport::server(id.clone(), self.factory.transport_options(max));
        let accepted = self.accepted.clone();
        let harness = Arc::new(StackHarness::server(
            self.factory.clone(),
            self.scheduler.clone(),
            transport.clone(),
            Box::new(move |id: &ConnectionId| {
                let (channel, events) = MessageChannel::new(id.clone());
                let _ = accepted.send(AcceptedChannel {
                    channel: channel.clone(),
                    events,
                });
                channel
            }),
        ));
        harness.finalize_stack()?;
        let listener: Weak<dyn TransportEventListener> = self.me.clone();
        transport.add_listener(listener);
        self.harnesses.lock().insert(id, harness.clone());
        Ok(harness)
    }

    fn refuse(
        &self,
        connection: &Arc<dyn Connection>,
        status: SynAckStatus,
        id: ConnectionId,
        reason: String,
    ) {
        info!(%id, ?status, %reason, "refusing connection");
        let ack = SynAck {
            status,
            stack_flags: self.factory.stack_flags(),
            max_connections: u32::try_from(self.policy.max_clients()).unwrap_or(u32::MAX),
            connection_id: id,
            error: Some(reason),
        };
        let sent = WireMessage::SynAck(ack)
            .encode()
            .map_err(StackError::from)
            .and_then(|ack| connection.write(ack));
        if let Err(e) = sent {
            debug!(error = %e, "refusal not sent");
        }
        connection.close();
    }

    fn on_syn(
        &self,
        connection: &Arc<dyn Connection>,
        stack_flags: u16,
        requested: ConnectionId,
    ) -> StackResult<()> {
        let local = self.factory.stack_flags();
        if stack_flags != local {
            self.refuse(
                connection,
                SynAckStatus::StackMismatch,
                requested,
                format!("client layers {stack_flags:#06x}, server layers {local:#06x}"),
            );
            return Ok(());
        }

        if requested.is_new_connection() {
            let id = if requested.channel_id() == NULL_CHANNEL_ID {
                self.ids.next(&requested)
            } else {
                self.ids.make(&requested)
            };
            if !self.policy.connect(&id) {
                self.refuse(
                    connection,
                    SynAckStatus::MaxConnectionsExceeded,
                    id,
                    "connection limit reached".into(),
                );
                return Ok(());
            }
            info!(%id, "new client");
            let harness = self.build_harness(id)?;
            return harness.attach_new_connection(connection.clone());
        }

        let harness = self.harnesses.lock().get(&requested).cloned();
        let Some(harness) = harness else {
            self.refuse(
                connection,
                SynAckStatus::StackNotFound,
                requested.clone(),
                format!("no stack for {requested}"),
            );
            return Ok(());
        };
        if !self.policy.connect(&requested) {
            self.refuse(
                connection,
                SynAckStatus::MaxConnectionsExceeded,
                requested,
                "connection limit reached".into(),
            );
            return Ok(());
        }
        info!(id = %requested, "client resuming");
        self.ids.restore(&requested);
        harness.attach_new_connection(connection.clone())
    }
}

impl ConnectionHandler for ServerStackProvider {
    fn on_message(&self, connection: &Arc<dyn Connection>, message: Bytes) {
        match WireMessage::decode(message) {
            Ok(WireMessage::Syn {
                stack_flags,
                connection_id,
            }) => {
                if let Err(e) = self.on_syn(connection, stack_flags, connection_id) {
                    warn!(conn = connection.id(), error = %e, "connection setup failed");
                    connection.close();
                }
            }
            Ok(other) => {
                warn!(conn = connection.id(), message = ?other, "expected SYN, closing");
                connection.close();
            }
            Err(e) => {
                warn!(conn = connection.id(), error = %e, "undecodable first message, closing");
                connection.close();
            }
        }
    }

    fn on_closed(&self, connection: &Arc<dyn Connection>) {
        debug!(conn = connection.id(), "connection closed before SYN");
    }
}

impl TransportEventListener for ServerStackProvider {
    fn on_transport_event(&self, id: &ConnectionId, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected { .. } => self.policy.disconnect(id),
            TransportEvent::Closed => {
                self.policy.disconnect(id);
                if self.harnesses.lock().remove(id).is_some() {
                    debug!(%id, "stack retired");
                }
            }
            TransportEvent::Connected
            | TransportEvent::ConnectAttempt
            | TransportEvent::ReconnectionRejected => {}
        }
    }
}

impl fmt::Debug for ServerStackProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStackProvider")
            .field("server_id", &self.server_id())
            .field("stacks", &self.stack_count())
            .field("clients", &self.policy.client_count())
            .finish()
    }
}
