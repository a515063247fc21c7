//! # relink
//!
//! A layered network stack that keeps a logical connection alive across TCP
//! reconnects and delivers every application message once and only once.
//!
//! A stack is a chain of layers:
//!
//! - **Channel** ([`channel`]): the application endpoint
//! - **Once-and-only-once** ([`delivery`], optional): sequence numbers,
//!   acknowledgements and a resume handshake after reconnect
//! - **Transport** ([`transport`]): SYN / SYN_ACK setup and length-prefixed
//!   messages over TCP (or memory in tests)
//!
//! ## Feature Flags
//!
//! - `switch` (default): HTTP / native sniffing on accepted sockets
//! - `client` (default): high-level client API
//! - `server` (default): high-level server API (implies `switch`)
//!
//! ## Modules
//!
//! - [`core`]: layer contracts, constants, configuration and error types
//! - [`identity`]: connection identities and their assignment
//! - [`delivery`]: the once-and-only-once protocol
//! - [`transport`]: physical connections and the message transport
//! - [`stack`]: stack assembly and server-side lookup
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use relink::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StackError> {
//!     let (server, mut accepted) = Server::builder()
//!         .bind_addr("127.0.0.1:9510".parse().unwrap())
//!         .bind()
//!         .await?;
//!
//!     let (client, _events) = ClientStack::builder()
//!         .server_addr(server.local_addr().to_string())
//!         .build()?;
//!     client.connect().await?;
//!     client.send("hello")?;
//!
//!     if let Some(mut peer) = accepted.recv().await {
//!         while let Some(event) = peer.events.recv().await {
//!             if let ChannelEvent::Message(body) = event {
//!                 peer.channel.send(body)?;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod channel;
pub mod core;
pub mod delivery;
pub mod identity;
pub mod stack;
pub mod transport;

// Protocol switch (feature-gated)
#[cfg(feature = "switch")]
#[cfg_attr(docsrs, doc(cfg(feature = "switch")))]
pub mod switch;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{ChannelEvent, MessageChannel};
    pub use crate::core::{
        NetworkLayer, ReconnectConfig, StackError, StackResult, TransportEvent,
        TransportEventListener,
    };
    pub use crate::identity::{ConnectionId, ProductKind};
    pub use crate::stack::{AcceptedChannel, ConnectionPolicy, NetworkStack};
    pub use crate::transport::{Connection, Connector, MemoryConnector, TcpConnector};

    #[cfg(feature = "client")]
    pub use crate::client::{ClientStack, ClientStackBuilder};

    #[cfg(feature = "server")]
    pub use crate::server::{Server, ServerBuilder};
}

// Re-export commonly used items at crate root
pub use channel::{ChannelEvent, MessageChannel};
pub use core::{ReconnectConfig, StackError, StackResult, TransportEvent};
pub use identity::ConnectionId;
