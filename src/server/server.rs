//! High-level server API.
//!
//! [`ServerBuilder`] binds a TCP listener whose accepted sockets pass through
//! the protocol switch. Native connections go to a [`ServerStackProvider`];
//! every new logical client shows up as an [`AcceptedChannel`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{ReconnectConfig, StackResult};
use crate::identity::{ConnectionId, ConnectionIdFactory};
use crate::stack::{
    AcceptedChannel, ConnectionPolicy, GuaranteedHarnessFactory, HarnessFactory,
    PlainHarnessFactory, ServerStackProvider,
};
use crate::switch::{self, HttpSink, NativeAdaptor};
use crate::transport::{Connection, ConnectionHandler, Scheduler, TcpConnection};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Fixed server id; random when unset.
    pub server_id: Option<String>,

    /// Maximum number of concurrent client processes (0 = unlimited).
    pub max_clients: usize,

    /// Insert the once-and-only-once layer.
    pub guaranteed: bool,

    /// Restore settings of the once-and-only-once layer.
    pub reconnect: ReconnectConfig,

    /// Keepalive probe interval, if any.
    pub keepalive: Option<Duration>,

    /// Identities connected before a restart; their stacks are rebuilt so
    /// the clients can resume.
    pub restore: Vec<ConnectionId>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9510)),
            server_id: None,
            max_clients: 0,
            guaranteed: true,
            reconnect: ReconnectConfig::default(),
            keepalive: None,
            restore: Vec::new(),
        }
    }
}

/// Drops HTTP connections.
#[derive(Debug, Default)]
pub struct RejectHttp;

impl HttpSink<TcpStream> for RejectHttp {
    fn hand_off(&self, probe: Bytes, stream: TcpStream) {
        debug!(
            peer = ?stream.peer_addr().ok(),
            probe = %String::from_utf8_lossy(&probe),
            "no http handler, dropping connection"
        );
    }
}

/// Wraps native sockets in a [`TcpConnection`] read by the provider.
struct ProviderAdaptor {
    provider: Weak<ServerStackProvider>,
}

impl NativeAdaptor<TcpStream> for ProviderAdaptor {
    fn attach(&self, prefix: Bytes, stream: TcpStream) {
        let connection: Arc<dyn Connection> = TcpConnection::new(stream, prefix);
        let handler: Weak<dyn ConnectionHandler> = self.provider.clone();
        connection.set_handler(handler);
    }
}

/// Builder for a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    http: Arc<dyn HttpSink<TcpStream>>,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            http: Arc::new(RejectHttp),
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Use a fixed server id.
    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.config.server_id = Some(id.into());
        self
    }

    /// Set the maximum number of client processes.
    pub fn max_clients(mut self, max: usize) -> Self {
        self.config.max_clients = max;
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

    /// Rebuild stacks for identities from a previous run.
    pub fn restore(mut self, ids: impl IntoIterator<Item = ConnectionId>) -> Self {
        self.config.restore.extend(ids);
        self
    }

    /// Hand HTTP connections to `sink`.
    pub fn http_sink(mut self, sink: Arc<dyn HttpSink<TcpStream>>) -> Self {
        self.http = sink;
        self
    }

    /// Bind the listener and start accepting.
    pub async fn bind(self) -> StackResult<(Server, mpsc::UnboundedReceiver<AcceptedChannel>)> {
        let config = self.config;
        let factory: Arc<dyn HarnessFactory> = if config.guaranteed {
            let mut factory = GuaranteedHarnessFactory::new(config.reconnect.clone());
            if let Some(interval) = config.keepalive {
                factory = factory.with_keepalive(interval);
            }
            Arc::new(factory)
        } else {
            Arc::new(PlainHarnessFactory::new(config.reconnect.reconnect_enabled()))
        };
        let ids = match &config.server_id {
            Some(id) => ConnectionIdFactory::with_server_id(id.clone()),
            None => ConnectionIdFactory::new(),
        };
        let (provider, accepted) = ServerStackProvider::new(
            factory,
            Scheduler::current(),
            ids,
            ConnectionPolicy::new(config.max_clients),
        );
        provider.prebuild(config.restore.iter().cloned())?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, server_id = provider.server_id(), "server listening");

        let adaptor = Arc::new(ProviderAdaptor {
            provider: Arc::downgrade(&provider),
        });
        let accept_task = tokio::spawn(accept_loop(listener, self.http, adaptor));

        Ok((
            Server {
                provider,
                local_addr,
                accept_task,
            },
            accepted,
        ))
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    http: Arc<dyn HttpSink<TcpStream>>,
    native: Arc<ProviderAdaptor>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "accepted socket");
        let http = http.clone();
        let native = native.clone();
        tokio::spawn(async move {
            if let Err(e) = switch::route(stream, &*http, &*native).await {
                debug!(%peer, error = %e, "socket closed while probing");
            }
        });
    }
}

/// A listening server.
pub struct Server {
    provider: Arc<ServerStackProvider>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Start building a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stack lookup and connection policy.
    pub fn provider(&self) -> &Arc<ServerStackProvider> {
        &self.provider
    }

    /// Feed an already open connection (e.g. in-memory) to the server.
    pub fn accept_connection(&self, connection: Arc<dyn Connection>) {
        let handler: Arc<dyn ConnectionHandler> = self.provider.clone();
        connection.set_handler(Arc::downgrade(&handler));
    }

    /// Stop accepting and close every stack.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.provider.shutdown();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("provider", &self.provider)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::core::testing::eventually;

    #[tokio::test]
    async fn test_http_probe_is_not_a_client() {
        let (server, mut accepted) = Server::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .bind()
            .await
            .unwrap();
        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
        socket.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(accepted.try_recv().is_err());
        assert_eq!(server.provider().stack_count(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_memory_connection_gets_a_stack() {
        let (server, mut accepted) = Server::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .guaranteed(false)
            .bind()
            .await
            .unwrap();
        let (client_end, server_end) = crate::transport::memory_pair();
        server.accept_connection(server_end);

        let syn = crate::transport::WireMessage::Syn {
            stack_flags: PlainHarnessFactory::default().stack_flags(),
            connection_id: ConnectionId::new_client("jvm-a", crate::identity::ProductKind::Permanent),
        };
        client_end.write(syn.encode().unwrap()).unwrap();

        eventually("stack built", || server.provider().stack_count() == 1).await;
        let channel = accepted.recv().await.unwrap();
        assert_eq!(channel.channel.connection_id().jvm_id().unwrap(), "jvm-a");
    }

    #[tokio::test]
    async fn test_restore_prebuilds_stacks() {
        let id = ConnectionId::new_client("jvm-r", crate::identity::ProductKind::Permanent)
            .assigned(4, "srv-1");
        let (server, _accepted) = Server::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .server_id("srv-1")
            .reconnect(ReconnectConfig::builder().enabled(true).build())
            .restore([id.clone()])
            .bind()
            .await
            .unwrap();
        assert!(server.provider().stack(&id).is_some());
    }
}
