//! Core contracts, constants, configuration and error types.

pub mod config;
pub mod constants;
pub mod error;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ReconnectConfig, ReconnectConfigBuilder};
pub use error::{ConfigError, FrameError, Provenance, StackError, StackResult};
pub use traits::{
    coalesce, LayerSlot, ListenerSet, NetworkLayer, TransportEvent, TransportEventListener,
};
