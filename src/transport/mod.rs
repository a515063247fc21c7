//! Transport layer.
//!
//! - **Wire framing**: [`WireMessage`] and the length-prefix [`FrameDecoder`]
//! - **Physical connections**: [`Connection`] over TCP ([`TcpConnection`]) or
//!   in-process ([`MemoryConnection`]), opened by a [`Connector`]
//! - **Transport layer**: [`MessageTransport`], the bottom of every stack,
//!   with the SYN / SYN_ACK connection exchange
//! - **Timers**: the shared [`Scheduler`]
//! - **Restore window**: [`ReconnectWatchdog`]
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Channel Layer                │
//! ├─────────────────────────────────────────┤
//! │    Once-and-only-once Layer (opt.)      │
//! ├─────────────────────────────────────────┤
//! │         MessageTransport                │  ← This module
//! │   SYN / SYN_ACK, DATA, events           │
//! ├─────────────────────────────────────────┤
//! │     Connection (TCP or in-memory)       │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod connector;
mod memory;
mod message_transport;
pub(crate) mod reconnect;
mod timer;
mod wire;

pub use connection::{next_connection_id, Connection, ConnectionHandler, TcpConnection};
pub use connector::{BoxFuture, Connector, TcpConnector};
pub use memory::{pair as memory_pair, MemoryConnection, MemoryConnector};
pub use message_transport::{ClientEndpoint, MessageTransport, TransportOptions};
pub use reconnect::{ReconnectWatchdog, RestorableLayer};
pub use timer::{ScheduledTask, Scheduler};
pub use wire::{FrameDecoder, SynAck, SynAckStatus, WireMessage};
