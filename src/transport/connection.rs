//! Physical connections.
//!
//! A [`Connection`] moves length-prefixed wire messages over one socket.
//! Inbound messages go to a [`ConnectionHandler`] that can be swapped while
//! the connection is live (the server hands a socket from its accept-time
//! handler to the transport that ends up owning it).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::wire::FrameDecoder;
use crate::core::{StackError, StackResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a physical connection.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Receiver of inbound messages and close notification.
pub trait ConnectionHandler: Send + Sync {
    /// One complete message body (length prefix removed).
    fn on_message(&self, connection: &Arc<dyn Connection>, message: Bytes);

    /// The connection is closed; called once.
    fn on_closed(&self, connection: &Arc<dyn Connection>);
}

/// One physical, message-framed connection.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Process-unique id.
    fn id(&self) -> u64;

    /// Queue an already framed message for writing.
    fn write(&self, message: Bytes) -> StackResult<()>;

    /// Whether the connection can still carry messages.
    fn is_open(&self) -> bool;

    /// Close; the handler's `on_closed` runs once.
    fn close(&self);

    /// Route inbound messages to `handler`. The first call starts reading.
    fn set_handler(&self, handler: Weak<dyn ConnectionHandler>);

    /// Local socket address.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote socket address.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// State shared by connection implementations: handler slot and close guard.
pub(crate) struct HandlerSlot {
    handler: RwLock<Option<Weak<dyn ConnectionHandler>>>,
    closed: AtomicBool,
}

impl HandlerSlot {
    pub(crate) fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the handler; returns whether this was the first one.
    pub(crate) fn set(&self, handler: Weak<dyn ConnectionHandler>) -> bool {
        self.handler.write().replace(handler).is_none()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn dispatch(&self, connection: &Arc<dyn Connection>, message: Bytes) {
        let handler = self.handler.read().as_ref().and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.on_message(connection, message),
            None => trace!(id = connection.id(), "no handler, message dropped"),
        }
    }

    /// Mark closed and notify; `false` if it was already closed.
    pub(crate) fn close(&self, connection: &Arc<dyn Connection>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let handler = self.handler.read().as_ref().and_then(Weak::upgrade);
        if let Some(handler) = handler {
            handler.on_closed(connection);
        }
        true
    }
}

/// TCP connection driven by a reader and a writer task.
pub struct TcpConnection {
    id: u64,
    me: Weak<TcpConnection>,
    slot: HandlerSlot,
    writer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending_read: Mutex<Option<(OwnedReadHalf, Bytes)>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl TcpConnection {
    /// Wrap `stream`. `prefix` holds bytes already read from it (e.g. a
    /// protocol probe); they are decoded before anything else.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(stream: TcpStream, prefix: Bytes) -> Arc<Self> {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = next_connection_id();

        tokio::spawn(write_loop(id, write_half, rx));

        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            slot: HandlerSlot::new(),
            writer: Mutex::new(Some(tx)),
            pending_read: Mutex::new(Some((read_half, prefix))),
            reader: Mutex::new(None),
            local_addr,
            peer_addr,
        })
    }

    fn as_dyn(&self) -> Option<Arc<dyn Connection>> {
        self.me.upgrade().map(|c| c as Arc<dyn Connection>)
    }

    fn start_reading(&self) {
        let Some((read_half, prefix)) = self.pending_read.lock().take() else {
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let task = tokio::spawn(read_loop(me, read_half, prefix));
        *self.reader.lock() = Some(task);
    }
}

async fn write_loop(id: u64, mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = half.write_all(&message).await {
            debug!(id, error = %e, "write failed");
            return;
        }
    }
    let _ = half.shutdown().await;
}

async fn read_loop(connection: Arc<TcpConnection>, mut half: OwnedReadHalf, prefix: Bytes) {
    let mut decoder = FrameDecoder::default();
    decoder.push(&prefix);
    let Some(conn) = connection.as_dyn() else {
        return;
    };
    loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(message)) => connection.slot.dispatch(&conn, message),
                Ok(None) => break,
                Err(e) => {
                    warn!(id = connection.id, error = %e, "bad framing, closing");
                    connection.slot.close(&conn);
                    connection.writer.lock().take();
                    return;
                }
            }
        }
        if connection.slot.is_closed() {
            return;
        }
        match half.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                debug!(id = connection.id, "peer closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(id = connection.id, error = %e, "read failed");
                break;
            }
        }
    }
    connection.writer.lock().take();
    connection.slot.close(&conn);
}

impl Connection for TcpConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, message: Bytes) -> StackResult<()> {
        if self.slot.is_closed() {
            return Err(StackError::NotConnected);
        }
        match self.writer.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| StackError::NotConnected),
            None => Err(StackError::NotConnected),
        }
    }

    fn is_open(&self) -> bool {
        !self.slot.is_closed()
    }

    fn close(&self) {
        // Dropping the sender lets the writer drain what is queued.
        self.writer.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending_read.lock().take();
        if let Some(conn) = self.as_dyn() {
            self.slot.close(&conn);
        }
    }

    fn set_handler(&self, handler: Weak<dyn ConnectionHandler>) {
        if self.slot.set(handler) {
            self.start_reading();
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}
