//! Stack assembly and server-side stack lookup.

mod harness;
mod provider;

pub use harness::{
    ChannelFactory, GuaranteedHarnessFactory, HarnessFactory, NetworkStack, PlainHarnessFactory,
    StackHarness, TransportFactory,
};
pub use provider::{AcceptedChannel, ConnectionPolicy, ServerStackProvider};
