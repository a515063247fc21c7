//! Outbound connection establishment.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use super::connection::{Connection, TcpConnection};
use crate::core::{StackError, StackResult};

/// Boxed future used by object-safe async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens physical connections for a client transport.
pub trait Connector: Send + Sync {
    /// Connect to `addr` within `timeout`.
    fn connect<'a>(
        &'a self,
        addr: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, StackResult<Arc<dyn Connection>>>;
}

/// Connects over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    /// Create a TCP connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        addr: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, StackResult<Arc<dyn Connection>>> {
        Box::pin(async move {
            let resolved = lookup_host(addr)
                .await
                .map_err(|_| StackError::HostResolution(addr.to_string()))?
                .next()
                .ok_or_else(|| StackError::HostResolution(addr.to_string()))?;

            let stream = tokio::time::timeout(timeout, TcpStream::connect(resolved))
                .await
                .map_err(|_| StackError::Timeout(timeout))??;
            debug!(%resolved, "tcp connected");
            Ok(TcpConnection::new(stream, Bytes::new()) as Arc<dyn Connection>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unresolvable_host() {
        let err = TcpConnector::new()
            .connect("no-such-host.invalid:9510", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::HostResolution(_)));
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let conn = TcpConnector::new()
            .connect(&addr, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.peer_addr().map(|a| a.to_string()), Some(addr));
    }
}
