//! In-process connections.
//!
//! Two [`MemoryConnection`] ends exchange framed messages through tokio
//! channels. Delivery is asynchronous, as with a socket, so a handler may
//! write back from inside `on_message`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::connection::{next_connection_id, Connection, ConnectionHandler, HandlerSlot};
use super::connector::{BoxFuture, Connector};
use super::wire::FrameDecoder;
use crate::core::{StackError, StackResult};

/// One end of an in-process connection.
pub struct MemoryConnection {
    id: u64,
    me: Weak<MemoryConnection>,
    slot: HandlerSlot,
    to_peer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Create a connected pair of ends.
pub fn pair() -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (MemoryConnection::new(b_tx, a_rx), MemoryConnection::new(a_tx, b_rx))
}

impl MemoryConnection {
    fn new(to_peer: mpsc::UnboundedSender<Bytes>, inbound: mpsc::UnboundedReceiver<Bytes>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: next_connection_id(),
            me: me.clone(),
            slot: HandlerSlot::new(),
            to_peer: Mutex::new(Some(to_peer)),
            inbound: Mutex::new(Some(inbound)),
            pump: Mutex::new(None),
        })
    }

    fn start_pump(&self) {
        let Some(mut inbound) = self.inbound.lock().take() else {
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            let conn: Arc<dyn Connection> = me.clone();
            let mut decoder = FrameDecoder::default();
            while let Some(chunk) = inbound.recv().await {
                decoder.push(&chunk);
                while let Ok(Some(message)) = decoder.next_frame() {
                    me.slot.dispatch(&conn, message);
                }
                if me.slot.is_closed() {
                    return;
                }
            }
            debug!(id = me.id, "memory peer closed");
            me.to_peer.lock().take();
            me.slot.close(&conn);
        });
        *self.pump.lock() = Some(task);
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, message: Bytes) -> StackResult<()> {
        if self.slot.is_closed() {
            return Err(StackError::NotConnected);
        }
        match self.to_peer.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| StackError::NotConnected),
            None => Err(StackError::NotConnected),
        }
    }

    fn is_open(&self) -> bool {
        !self.slot.is_closed()
    }

    fn close(&self) {
        self.to_peer.lock().take();
        self.inbound.lock().take();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some(me) = self.me.upgrade() {
            let conn: Arc<dyn Connection> = me;
            self.slot.close(&conn);
        }
    }

    fn set_handler(&self, handler: Weak<dyn ConnectionHandler>) {
        if self.slot.set(handler) {
            self.start_pump();
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

type AcceptFn = dyn Fn(Arc<dyn Connection>) + Send + Sync;

/// Connector that hands the far end of each new pair to an accept function.
///
/// Lets tests cut every live link ([`sever`](Self::sever)) and refuse new
/// ones ([`set_refusing`](Self::set_refusing)) to simulate network loss.
pub struct MemoryConnector {
    accept: Arc<AcceptFn>,
    live: Mutex<Vec<Weak<MemoryConnection>>>,
    refusing: AtomicBool,
}

impl MemoryConnector {
    /// Connector passing server ends to `accept`.
    pub fn new(accept: impl Fn(Arc<dyn Connection>) + Send + Sync + 'static) -> Self {
        Self {
            accept: Arc::new(accept),
            live: Mutex::new(Vec::new()),
            refusing: AtomicBool::new(false),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Close every connection made so far, from the client end.
    pub fn sever(&self) {
        let live: Vec<_> = self.live.lock().drain(..).filter_map(|w| w.upgrade()).collect();
        for conn in live {
            conn.close();
        }
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        _addr: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, StackResult<Arc<dyn Connection>>> {
        Box::pin(async move {
            if self.refusing.load(Ordering::SeqCst) {
                return Err(StackError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "memory connector refusing",
                )));
            }
            let (client, server) = pair();
            self.live.lock().push(Arc::downgrade(&client));
            (self.accept)(server as Arc<dyn Connection>);
            Ok(client as Arc<dyn Connection>)
        })
    }
}

impl fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnector").finish_non_exhaustive()
    }
}
