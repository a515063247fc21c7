//! High-level client API.
//!
//! [`ClientStackBuilder`] assembles a client stack (channel, optional
//! once-and-only-once layer, transport) and hands back a [`ClientStack`]
//! plus the stream of its [`ChannelEvent`]s.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::establisher::ConnectionEstablisher;
use crate::channel::{ChannelEvent, MessageChannel};
use crate::core::constants::{DEFAULT_CONNECT_TIMEOUT, RECONNECT_RETRY_INTERVAL};
use crate::core::{
    NetworkLayer, ReconnectConfig, StackError, StackResult, TransportEventListener,
};
use crate::identity::{ConnectionId, ProductKind};
use crate::stack::{
    GuaranteedHarnessFactory, HarnessFactory, NetworkStack, PlainHarnessFactory, StackHarness,
};
use crate::transport::{
    ClientEndpoint, Connector, MessageTransport, Scheduler, TcpConnector, TransportOptions,
};

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server `host:port`.
    pub server_addr: String,

    /// Identity of this client process.
    pub jvm_id: String,

    /// Client classification.
    pub product: ProductKind,

    /// Optional credentials presented in the SYN.
    pub credentials: Option<(String, String)>,

    /// Bound on connecting plus the SYN / SYN_ACK exchange.
    pub connect_timeout: Duration,

    /// Insert the once-and-only-once layer.
    pub guaranteed: bool,

    /// Restore settings of the once-and-only-once layer.
    pub reconnect: ReconnectConfig,

    /// Keepalive probe interval, if any.
    pub keepalive: Option<Duration>,

    /// Pause between re-establishment attempts.
    pub retry_interval: Duration,

    /// Opens physical connections.
    pub connector: Arc<dyn Connector>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9510".to_string(),
            jvm_id: format!("{:016x}", rand::random::<u64>()),
            product: ProductKind::Permanent,
            credentials: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            guaranteed: true,
            reconnect: ReconnectConfig::default(),
            keepalive: None,
            retry_interval: RECONNECT_RETRY_INTERVAL,
            connector: Arc::new(TcpConnector::new()),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_addr", &self.server_addr)
            .field("jvm_id", &self.jvm_id)
            .field("product", &self.product)
            .field("guaranteed", &self.guaranteed)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`ClientStack`].
#[derive(Debug, Default)]
pub struct ClientStackBuilder {
    config: ClientConfig,
    scheduler: Option<Scheduler>,
}

impl ClientStackBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server address.
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server_addr = addr.into();
        self
    }

    /// Set the process identity.
    pub fn jvm_id(mut self, jvm_id: impl Into<String>) -> Self {
        self.config.jvm_id = jvm_id.into();
        self
    }

    /// Set the client classification.
    pub fn product(mut self, product: ProductKind) -> Self {
        self.config.product = product;
        self
    }

    /// Present credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Enable or disable the once-and-only-once layer.
    pub fn guaranteed(mut self, guaranteed: bool) -> Self {
        self.config.guaranteed = guaranteed;
        self
    }

    /// Set restore settings.
    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    /// Send keepalive probes.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.config.keepalive = Some(interval);
        self
    }

    /// Set the pause between re-establishment attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Use `connector` instead of TCP.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.config.connector = connector;
        self
    }

    /// Run timers on `scheduler` instead of the current runtime.
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Assemble the stack. Nothing is connected yet.
    pub fn build(self) -> StackResult<(ClientStack, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let config = self.config;
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Scheduler::new(
                Handle::try_current()
                    .map_err(|_| StackError::Unsupported("client stack outside a tokio runtime"))?,
            ),
        };

        let mut id = ConnectionId::new_client(config.jvm_id.clone(), config.product);
        if let Some((user, password)) = &config.credentials {
            id = id.with_credentials(user.clone(), password.clone());
        }

        let factory: Arc<dyn HarnessFactory> = if config.guaranteed {
            let mut factory = GuaranteedHarnessFactory::new(config.reconnect.clone());
            if let Some(interval) = config.keepalive {
                factory = factory.with_keepalive(interval);
            }
            Arc::new(factory)
        } else {
            Arc::new(PlainHarnessFactory::new(config.reconnect.reconnect_enabled()))
        };

        let (channel, events) = MessageChannel::new(id.clone());
        let endpoint = ClientEndpoint::new(config.server_addr.clone(), config.connector.clone())
            .with_connect_timeout(config.connect_timeout);
        let transport_scheduler = scheduler.clone();
        let harness = StackHarness::client(
            factory,
            scheduler.clone(),
            channel,
            Box::new(move |options: TransportOptions| {
                MessageTransport::client(endpoint, id, options, transport_scheduler)
            }),
        );
        let stack = harness.finalize_stack()?;

        let establisher = stack.transport().options().reconnect_enabled.then(|| {
            let establisher = ConnectionEstablisher::new(
                stack.transport(),
                stack.watchdog(),
                scheduler,
                config.retry_interval,
            );
            let listener: Arc<dyn TransportEventListener> = establisher.clone();
            stack.transport().add_listener(Arc::downgrade(&listener));
            establisher
        });

        Ok((
            ClientStack {
                _harness: harness,
                stack,
                establisher,
            },
            events,
        ))
    }
}

/// An assembled client stack.
pub struct ClientStack {
    _harness: StackHarness,
    stack: Arc<NetworkStack>,
    establisher: Option<Arc<ConnectionEstablisher>>,
}

impl ClientStack {
    /// Start building a client stack.
    pub fn builder() -> ClientStackBuilder {
        ClientStackBuilder::new()
    }

    /// Connect to the server. With the once-and-only-once layer the channel
    /// reports `Connected` after the resume handshake completes.
    pub async fn connect(&self) -> StackResult<ConnectionId> {
        self.stack.transport().connect().await
    }

    /// Send one message.
    ///
    /// In a guaranteed stack this blocks while the send queue is full. On a
    /// current-thread runtime a full queue fails with
    /// [`StackError::Unsupported`] instead, and a payload over the frame
    /// limit fails with [`StackError::MessageTooLarge`].
    pub fn send(&self, message: impl Into<Bytes>) -> StackResult<()> {
        self.stack.channel().send(message.into())
    }

    /// Identity assigned by the server (unassigned before the first connect).
    pub fn connection_id(&self) -> ConnectionId {
        self.stack.transport().connection_id()
    }

    /// Whether the channel can carry messages.
    pub fn is_connected(&self) -> bool {
        self.stack.channel().is_connected()
    }

    /// Whether a background re-establishment is running.
    pub fn is_reconnecting(&self) -> bool {
        self.establisher.as_ref().is_some_and(|e| e.is_active())
    }

    /// The layers.
    pub fn stack(&self) -> &Arc<NetworkStack> {
        &self.stack
    }

    /// Close the stack; a guaranteed client tells the server goodbye.
    pub fn close(&self) {
        self.stack.channel().close();
    }
}

impl fmt::Debug for ClientStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStack")
            .field("id", &self.connection_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;

    #[tokio::test]
    async fn test_builder_defaults_to_guaranteed_stack() {
        let (client, _events) = ClientStack::builder()
            .jvm_id("jvm-7")
            .connector(Arc::new(MemoryConnector::new(|_| {})))
            .build()
            .unwrap();
        assert!(client.stack().ooo().is_some());
        assert!(client.stack().watchdog().is_none());
        assert!(!client.is_connected());
        assert!(client.connection_id().is_new_connection());
        assert_eq!(client.connection_id().jvm_id().unwrap(), "jvm-7");
    }

    #[tokio::test]
    async fn test_reconnect_config_enables_watchdog_and_establisher() {
        let (client, _events) = ClientStack::builder()
            .reconnect(ReconnectConfig::builder().enabled(true).build())
            .credentials("user", "secret")
            .connector(Arc::new(MemoryConnector::new(|_| {})))
            .build()
            .unwrap();
        assert!(client.stack().watchdog().is_some());
        assert!(client.establisher.is_some());
        assert_eq!(client.connection_id().username(), Some("user"));
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let err = ClientStack::builder().build().unwrap_err();
        assert!(matches!(err, StackError::Unsupported(_)));
    }
}
