//! Logical connection identity and its server-side assignment.

mod connection_id;
mod factory;

pub use connection_id::{ConnectionId, JvmId, ProductKind, ServerId, MAX_WIRE_STRING_LEN, NULL_CHANNEL_ID};
pub(crate) use connection_id::{get_opt_str, put_opt_str};
pub use factory::ConnectionIdFactory;
