//! Stack assembly.
//!
//! A [`StackHarness`] wires one channel, an optional once-and-only-once
//! layer and one transport into a chain, exactly once. The layer set comes
//! from a [`HarnessFactory`]: [`PlainHarnessFactory`] puts the channel
//! directly on the transport, [`GuaranteedHarnessFactory`] inserts an
//! [`OooLayer`] with its restore watchdog and timers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::channel::MessageChannel;
use crate::core::constants::{
    DELAYED_ACK_TIMEOUT, KEEPALIVE_PROBES, STACK_FLAG_CHANNEL, STACK_FLAG_TRANSPORT,
};
use crate::core::{NetworkLayer, ReconnectConfig, StackError, StackResult, TransportEventListener};
use crate::delivery::OooLayer;
use crate::identity::ConnectionId;
use crate::transport::{
    Connection, MessageTransport, ReconnectWatchdog, RestorableLayer, ScheduledTask, Scheduler,
    TransportOptions,
};

/// Builds the transport of a client stack from the stack's settings.
pub type TransportFactory = Box<dyn FnOnce(TransportOptions) -> Arc<MessageTransport> + Send>;

/// Builds the channel of a server stack from the transport's identity.
pub type ChannelFactory = Box<dyn FnOnce(&ConnectionId) -> Arc<MessageChannel> + Send>;

/// The layers of an assembled stack. Owns every layer and its timers.
pub struct NetworkStack {
    channel: Arc<MessageChannel>,
    ooo: Option<Arc<OooLayer>>,
    transport: Arc<MessageTransport>,
    watchdog: Option<Arc<ReconnectWatchdog>>,
    timers: Vec<ScheduledTask>,
}

impl NetworkStack {
    /// Top of the stack.
    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    /// The once-and-only-once layer, in guaranteed stacks.
    pub fn ooo(&self) -> Option<&Arc<OooLayer>> {
        self.ooo.as_ref()
    }

    /// Bottom of the stack.
    pub fn transport(&self) -> &Arc<MessageTransport> {
        &self.transport
    }

    /// Restore-window watchdog, when reconnect is enabled.
    pub fn watchdog(&self) -> Option<&Arc<ReconnectWatchdog>> {
        self.watchdog.as_ref()
    }
}

impl Drop for NetworkStack {
    fn drop(&mut self) {
        for timer in &self.timers {
            timer.cancel();
        }
    }
}

impl fmt::Debug for NetworkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkStack")
            .field("transport", &self.transport)
            .field("guaranteed", &self.ooo.is_some())
            .finish()
    }
}

/// Chooses and wires the layers of a stack.
pub trait HarnessFactory: Send + Sync {
    /// Layer flags advertised in SYN / SYN_ACK.
    fn stack_flags(&self) -> u16;

    /// Whether stacks from this factory restore lost connections.
    fn reconnect_enabled(&self) -> bool;

    /// Wire `channel` and `transport` into a stack.
    fn build_stack(
        &self,
        channel: Arc<MessageChannel>,
        transport: Arc<MessageTransport>,
        scheduler: &Scheduler,
    ) -> StackResult<NetworkStack>;

    /// Transport settings for stacks from this factory.
    fn transport_options(&self, max_connections: u32) -> TransportOptions {
        TransportOptions {
            stack_flags: self.stack_flags(),
            reconnect_enabled: self.reconnect_enabled(),
            max_connections,
        }
    }
}

fn as_layer<T: NetworkLayer + 'static>(layer: &Arc<T>) -> Weak<dyn NetworkLayer> {
    let layer: Arc<dyn NetworkLayer> = layer.clone();
    Arc::downgrade(&layer)
}

fn as_listener<T: TransportEventListener + 'static>(
    listener: &Arc<T>,
) -> Weak<dyn TransportEventListener> {
    let listener: Arc<dyn TransportEventListener> = listener.clone();
    Arc::downgrade(&listener)
}

/// Channel directly on the transport.
#[derive(Debug, Clone, Default)]
pub struct PlainHarnessFactory {
    reconnect_enabled: bool,
}

impl PlainHarnessFactory {
    /// Plain stacks; `reconnect_enabled` lets a client re-establish a lost
    /// link (nothing is replayed).
    pub fn new(reconnect_enabled: bool) -> Self {
        Self { reconnect_enabled }
    }
}

impl HarnessFactory for PlainHarnessFactory {
    fn stack_flags(&self) -> u16 {
        STACK_FLAG_TRANSPORT | STACK_FLAG_CHANNEL
    }

    fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled
    }

    fn build_stack(
        &self,
        channel: Arc<MessageChannel>,
        transport: Arc<MessageTransport>,
        _scheduler: &Scheduler,
    ) -> StackResult<NetworkStack> {
        channel.set_send_layer(as_layer(&transport))?;
        transport.set_receive_layer(as_layer(&channel))?;
        transport.add_listener(as_listener(&channel));
        Ok(NetworkStack {
            channel,
            ooo: None,
            transport,
            watchdog: None,
            timers: Vec::new(),
        })
    }
}

/// Inserts the once-and-only-once layer between channel and transport.
#[derive(Debug, Clone)]
pub struct GuaranteedHarnessFactory {
    config: ReconnectConfig,
    keepalive: Option<Duration>,
    keepalive_probes: u32,
}

impl GuaranteedHarnessFactory {
    /// Guaranteed stacks with `config`.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            keepalive: None,
            keepalive_probes: KEEPALIVE_PROBES,
        }
    }

    /// Send liveness probes every `interval`.
    ///
    /// A peer that stays silent for one interval plus
    /// [`Self::with_keepalive_probes`] unanswered probes loses its physical
    /// connection; the stack then sees an ordinary link failure and restores.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    /// Unanswered probes tolerated before the link is dropped.
    pub fn with_keepalive_probes(mut self, probes: u32) -> Self {
        self.keepalive_probes = probes;
        self
    }

    /// Silence after which a keepalive-enabled link is dropped.
    pub fn silence_budget(&self) -> Option<Duration> {
        self.keepalive
            .map(|interval| interval.saturating_mul(self.keepalive_probes.saturating_add(1)))
    }

    /// Delivery settings.
    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }
}

impl HarnessFactory for GuaranteedHarnessFactory {
    fn stack_flags(&self) -> u16 {
        STACK_FLAG_TRANSPORT | OooLayer::STACK_FLAG | STACK_FLAG_CHANNEL
    }

    fn reconnect_enabled(&self) -> bool {
        self.config.reconnect_enabled()
    }

    fn build_stack(
        &self,
        channel: Arc<MessageChannel>,
        transport: Arc<MessageTransport>,
        scheduler: &Scheduler,
    ) -> StackResult<NetworkStack> {
        let ooo = Arc::new(OooLayer::new(&self.config, transport.is_client()));
        channel.set_send_layer(as_layer(&ooo))?;
        ooo.set_receive_layer(as_layer(&channel))?;
        ooo.set_send_layer(as_layer(&transport))?;
        transport.set_receive_layer(as_layer(&ooo))?;

        // The watchdog must see a disconnect before the layer does.
        let watchdog = self.config.reconnect_enabled().then(|| {
            let restorable: Arc<dyn RestorableLayer> = ooo.clone();
            let below: Arc<dyn NetworkLayer> = transport.clone();
            ReconnectWatchdog::new(
                Arc::downgrade(&restorable),
                Arc::downgrade(&below),
                scheduler.clone(),
                self.config.reconnect_timeout(),
            )
        });
        if let Some(watchdog) = &watchdog {
            transport.add_listener(as_listener(watchdog));
        }
        transport.add_listener(as_listener(&ooo));
        ooo.add_listener(as_listener(&channel));

        let mut timers = Vec::with_capacity(2);
        let weak = Arc::downgrade(&ooo);
        timers.push(scheduler.schedule_repeating(DELAYED_ACK_TIMEOUT, move || {
            match weak.upgrade() {
                Some(layer) if !layer.is_closed() => {
                    layer.flush_delayed_ack();
                    true
                }
                _ => false,
            }
        }));
        if let (Some(interval), Some(budget)) = (self.keepalive, self.silence_budget()) {
            let weak = Arc::downgrade(&ooo);
            let weak_transport = Arc::downgrade(&transport);
            timers.push(scheduler.schedule_repeating(interval, move || {
                let (Some(layer), Some(transport)) = (weak.upgrade(), weak_transport.upgrade())
                else {
                    return false;
                };
                if layer.is_closed() {
                    return false;
                }
                if transport.is_connected() && layer.liveness().is_silent(budget) {
                    if let Some(connection) = transport.connection() {
                        warn!(
                            id = %transport.connection_id(),
                            idle = ?layer.liveness().idle_for(),
                            "peer silent, dropping connection"
                        );
                        connection.close();
                    }
                } else {
                    layer.send_keepalive();
                }
                true
            }));
        }

        Ok(NetworkStack {
            channel,
            ooo: Some(ooo),
            transport,
            watchdog,
            timers,
        })
    }
}

enum Pending {
    Client {
        channel: Arc<MessageChannel>,
        transport_factory: TransportFactory,
    },
    Server {
        transport: Arc<MessageTransport>,
        channel_factory: ChannelFactory,
    },
}

/// Builds one stack, once.
pub struct StackHarness {
    factory: Arc<dyn HarnessFactory>,
    scheduler: Scheduler,
    max_connections: u32,
    pending: Mutex<Option<Pending>>,
    stack: RwLock<Option<Arc<NetworkStack>>>,
    finalized: AtomicBool,
}

impl StackHarness {
    fn with(factory: Arc<dyn HarnessFactory>, scheduler: Scheduler, pending: Pending) -> Self {
        Self {
            factory,
            scheduler,
            max_connections: 0,
            pending: Mutex::new(Some(pending)),
            stack: RwLock::new(None),
            finalized: AtomicBool::new(false),
        }
    }

    /// Client harness: `channel` is given, the transport is built on
    /// finalization.
    pub fn client(
        factory: Arc<dyn HarnessFactory>,
        scheduler: Scheduler,
        channel: Arc<MessageChannel>,
        transport_factory: TransportFactory,
    ) -> Self {
        Self::with(
            factory,
            scheduler,
            Pending::Client {
                channel,
                transport_factory,
            },
        )
    }

    /// Server harness: `transport` is given, the channel is built on
    /// finalization from the transport's identity.
    pub fn server(
        factory: Arc<dyn HarnessFactory>,
        scheduler: Scheduler,
        transport: Arc<MessageTransport>,
        channel_factory: ChannelFactory,
    ) -> Self {
        Self::with(
            factory,
            scheduler,
            Pending::Server {
                transport,
                channel_factory,
            },
        )
    }

    /// Connection limit client transports report (0 = unlimited).
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Build the chain. A second call fails with
    /// [`StackError::AlreadyFinalized`].
    pub fn finalize_stack(&self) -> StackResult<Arc<NetworkStack>> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(StackError::AlreadyFinalized);
        }
        let pending = self
            .pending
            .lock()
            .take()
            .ok_or(StackError::AlreadyFinalized)?;
        let (channel, transport) = match pending {
            Pending::Client {
                channel,
                transport_factory,
            } => {
                let options = self.factory.transport_options(self.max_connections);
                (channel, transport_factory(options))
            }
            Pending::Server {
                transport,
                channel_factory,
            } => {
                let channel = channel_factory(&transport.connection_id());
                (channel, transport)
            }
        };
        let stack = Arc::new(self.factory.build_stack(channel, transport, &self.scheduler)?);
        debug!(id = %stack.transport().connection_id(), flags = self.factory.stack_flags(), "stack finalized");
        *self.stack.write() = Some(stack.clone());
        Ok(stack)
    }

    /// Give a finalized server stack a new physical connection.
    pub fn attach_new_connection(&self, connection: Arc<dyn Connection>) -> StackResult<()> {
        let stack = self.stack().ok_or(StackError::NotFinalized)?;
        trace!(id = %stack.transport().connection_id(), conn = connection.id(), "attaching");
        stack.transport().attach_new_connection(connection)
    }

    /// Whether `finalize_stack` has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// The assembled stack.
    pub fn stack(&self) -> Option<Arc<NetworkStack>> {
        self.stack.read().clone()
    }

    /// Layer flags of the stack this harness builds.
    pub fn stack_flags(&self) -> u16 {
        self.factory.stack_flags()
    }
}

impl fmt::Debug for StackHarness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackHarness")
            .field("flags", &self.stack_flags())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::EventLog;
    use crate::core::TransportEvent;
    use crate::identity::ProductKind;
    use crate::transport::{memory_pair, ClientEndpoint, MemoryConnector};

    fn assigned() -> ConnectionId {
        ConnectionId::new_client("jvm", ProductKind::Permanent).assigned(4, "srv")
    }

    fn server_harness(factory: Arc<dyn HarnessFactory>) -> StackHarness {
        let transport = MessageTransport::server(assigned(), factory.transport_options(0));
        StackHarness::server(
            factory,
            Scheduler::current(),
            transport,
            Box::new(|id: &ConnectionId| MessageChannel::new(id.clone()).0),
        )
    }

    #[tokio::test]
    async fn test_finalize_only_once() {
        let harness = server_harness(Arc::new(PlainHarnessFactory::default()));
        let stack = harness.finalize_stack().unwrap();
        assert_eq!(stack.channel().connection_id(), assigned());
        assert!(stack.ooo().is_none());
        assert!(matches!(
            harness.finalize_stack(),
            Err(StackError::AlreadyFinalized)
        ));
        assert!(StackError::AlreadyFinalized.is_fatal());
    }

    #[tokio::test]
    async fn test_attach_before_finalize_fails() {
        let harness = server_harness(Arc::new(PlainHarnessFactory::default()));
        let (_client_end, server_end) = memory_pair();
        let err = harness.attach_new_connection(server_end).unwrap_err();
        assert!(matches!(err, StackError::NotFinalized));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_guaranteed_stack_has_ooo_and_watchdog() {
        let config = ReconnectConfig::builder().enabled(true).build();
        let factory = Arc::new(GuaranteedHarnessFactory::new(config));
        assert_eq!(factory.stack_flags(), 0x0007);
        let harness = server_harness(factory);
        let stack = harness.finalize_stack().unwrap();
        assert!(stack.ooo().is_some());
        assert!(stack.watchdog().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_loses_its_connection() {
        let config = ReconnectConfig::builder()
            .enabled(true)
            .timeout(Duration::from_secs(60))
            .build();
        let factory = GuaranteedHarnessFactory::new(config)
            .with_keepalive(Duration::from_secs(1))
            .with_keepalive_probes(2);
        assert_eq!(factory.silence_budget(), Some(Duration::from_secs(3)));
        let harness = server_harness(Arc::new(factory));
        let stack = harness.finalize_stack().unwrap();
        let events = Arc::new(EventLog::new());
        let events_dyn: Arc<dyn TransportEventListener> = events.clone();
        stack.transport().add_listener(Arc::downgrade(&events_dyn));

        // The client end never answers.
        let (_client_end, server_end) = memory_pair();
        harness.attach_new_connection(server_end).unwrap();
        assert!(stack.transport().is_connected());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(stack.transport().is_connected());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!stack.transport().is_connected());
        assert!(!stack.transport().is_closed());
        assert_eq!(
            events.take(),
            vec![
                TransportEvent::Connected,
                TransportEvent::Disconnected { forced: false }
            ]
        );
        assert!(stack.watchdog().unwrap().is_armed());
    }

    #[tokio::test]
    async fn test_client_harness_builds_transport() {
        let factory: Arc<dyn HarnessFactory> = Arc::new(PlainHarnessFactory::new(true));
        let connector = Arc::new(MemoryConnector::new(|_| {}));
        let (channel, _events) =
            MessageChannel::new(ConnectionId::new_client("jvm", ProductKind::Permanent));
        let scheduler = Scheduler::current();
        let transport_scheduler = scheduler.clone();
        let harness = StackHarness::client(
            factory,
            scheduler,
            channel.clone(),
            Box::new(move |options: TransportOptions| {
                MessageTransport::client(
                    ClientEndpoint::new("memory", connector),
                    ConnectionId::new_client("jvm", ProductKind::Permanent),
                    options,
                    transport_scheduler,
                )
            }),
        );
        let stack = harness.finalize_stack().unwrap();
        assert!(stack.transport().is_client());
        assert!(stack.transport().options().reconnect_enabled);
        assert!(Arc::ptr_eq(stack.channel(), &channel));
    }
}
