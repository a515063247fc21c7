//! Client library.
//!
//! High-level API for building a client stack and keeping its link alive.

#[allow(clippy::module_inception)]
mod client;
mod establisher;

pub use client::*;
pub use establisher::ConnectionEstablisher;
