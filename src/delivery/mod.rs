//! Once-and-only-once delivery.
//!
//! - [`frame`]: protocol frames and session ids
//! - [`sender`] / [`receiver`]: the paired state machines
//! - [`protocol`]: the facade routing frames between them
//! - [`layer`]: the network layer running the resume handshake
//! - [`liveness`]: keepalive and clock-skew probes

pub mod frame;
pub mod layer;
pub mod liveness;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use frame::{FrameBody, FrameKind, OooFrame, SessionId};
pub use layer::OooLayer;
pub use liveness::LivenessMonitor;
pub use protocol::{DeliveryContext, GuaranteedDelivery};
pub use receiver::{ReceiveAction, ReceiveOutcome, ReceivePhase, ReceiveStateMachine};
pub use sender::{SendPhase, SendStateMachine};
