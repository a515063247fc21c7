//! Server-side identity assignment.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::debug;

use super::connection_id::{ConnectionId, ServerId, NULL_CHANNEL_ID};

/// Hands out channel ids for one server instance.
#[derive(Debug)]
pub struct ConnectionIdFactory {
    server_id: String,
    next_channel: AtomicI64,
}

impl Default for ConnectionIdFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionIdFactory {
    /// Factory with a random server id.
    pub fn new() -> Self {
        Self::with_server_id(format!("{:032x}", rand::random::<u128>()))
    }

    /// Factory with a fixed server id (e.g. restored after restart).
    pub fn with_server_id(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            next_channel: AtomicI64::new(0),
        }
    }

    /// This server's id.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Assign the next free channel id to a new client.
    pub fn next(&self, requested: &ConnectionId) -> ConnectionId {
        let channel_id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let id = requested.assigned(channel_id, self.server_id.clone());
        debug!(%id, "assigned new connection id");
        id
    }

    /// Assign the channel id the client asked for.
    ///
    /// Used when a client already knows its channel id but this server never
    /// assigned it a server id.
    pub fn make(&self, requested: &ConnectionId) -> ConnectionId {
        if requested.channel_id() == NULL_CHANNEL_ID {
            return self.next(requested);
        }
        self.bump_past(requested.channel_id());
        requested.assigned(requested.channel_id(), self.server_id.clone())
    }

    /// Record an identity that is back in use so it is never reissued.
    pub fn restore(&self, id: &ConnectionId) {
        if id.server_id() == &ServerId::Assigned(self.server_id.clone()) {
            self.bump_past(id.channel_id());
        }
    }

    /// Next channel id that [`next`](Self::next) would hand out.
    pub fn peek_next(&self) -> i64 {
        self.next_channel.load(Ordering::SeqCst)
    }

    fn bump_past(&self, channel_id: i64) {
        self.next_channel.fetch_max(channel_id + 1, Ordering::SeqCst);
    }
}
