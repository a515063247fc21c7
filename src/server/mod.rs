//! Server library.
//!
//! High-level API for accepting clients onto server stacks.

#[allow(clippy::module_inception)]
mod server;

pub use server::*;
