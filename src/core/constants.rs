//! Protocol constants for the relink stack.
//!
//! Wire tags are fixed by the protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// SEQUENCE SPACE
// =============================================================================

/// Virgin value of every sequence watermark (nothing sent, received or acked).
pub const UNSET_SEQUENCE: i64 = -1;

/// Session id size (random, regenerated per incarnation).
pub const SESSION_ID_SIZE: usize = 16;

// =============================================================================
// OOO FRAME KINDS
// =============================================================================

/// Application payload with sequence number.
pub const FRAME_KIND_SEND: u8 = 0x01;

/// Pure acknowledgment.
pub const FRAME_KIND_ACK: u8 = 0x02;

/// Client asks to resume (or start) a logical connection.
pub const FRAME_KIND_HANDSHAKE: u8 = 0x03;

/// Server accepts resumption.
pub const FRAME_KIND_HANDSHAKE_REPLY_OK: u8 = 0x04;

/// Server has no record of the session; client must start fresh.
pub const FRAME_KIND_HANDSHAKE_REPLY_FAIL: u8 = 0x05;

/// Liveness probe.
pub const FRAME_KIND_PING: u8 = 0x06;

/// Liveness probe reply.
pub const FRAME_KIND_PING_REPLY: u8 = 0x07;

/// Clock skew probe.
pub const FRAME_KIND_TIME_CHECK: u8 = 0x08;

/// Client is closing the logical connection.
pub const FRAME_KIND_GOODBYE: u8 = 0x09;

/// OOO header size (kind + session id + sequence + ack sequence).
pub const OOO_HEADER_SIZE: usize = 1 + SESSION_ID_SIZE + 8 + 8;

// =============================================================================
// TRANSPORT WIRE
// =============================================================================

/// Connection setup request.
pub const WIRE_TYPE_SYN: u8 = 0x01;

/// Connection setup reply.
pub const WIRE_TYPE_SYN_ACK: u8 = 0x02;

/// Payload for the layer above the transport.
pub const WIRE_TYPE_DATA: u8 = 0x03;

/// Length prefix size for framed wire messages.
pub const WIRE_LENGTH_PREFIX_SIZE: usize = 4;

/// Largest wire message accepted from a peer.
pub const MAX_WIRE_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload a DATA message can carry (the type byte counts against
/// [`MAX_WIRE_MESSAGE_SIZE`]).
pub const MAX_DATA_PAYLOAD_SIZE: usize = MAX_WIRE_MESSAGE_SIZE - 1;

/// Largest payload a SEND frame can carry inside one DATA message.
pub const MAX_OOO_PAYLOAD_SIZE: usize = MAX_DATA_PAYLOAD_SIZE - OOO_HEADER_SIZE;

// =============================================================================
// STACK LAYER FLAGS
// =============================================================================

/// Transport layer present.
pub const STACK_FLAG_TRANSPORT: u16 = 0x0001;

/// Once-and-only-once layer present.
pub const STACK_FLAG_OOO: u16 = 0x0002;

/// Channel layer present.
pub const STACK_FLAG_CHANNEL: u16 = 0x0004;

// =============================================================================
// PROTOCOL SWITCH
// =============================================================================

/// Longest HTTP verb ("OPTIONS"/"CONNECT") plus the separating space.
pub const HTTP_PROBE_SIZE: usize = 8;

/// Request methods that mark a connection as HTTP.
pub const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "TRACE", "CONNECT", "PATCH",
];

// =============================================================================
// TIMING
// =============================================================================

/// Default window in which a dropped peer may reconnect.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default connect + SYN_ACK timeout for client opens.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between client re-establishment attempts.
pub const RECONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum delay before batched acks are flushed.
pub const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Default keepalive period for guaranteed stacks that enable it.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Unanswered keepalive pings, after one idle interval, before the peer is
/// declared dead and the physical connection dropped.
pub const KEEPALIVE_PROBES: u32 = 3;

/// A time check is sent every this many keepalive pings.
pub const TIME_CHECK_EVERY_PINGS: u32 = 4;

/// Clock skew beyond which a time check is reported.
pub const TIME_CHECK_SKEW_THRESHOLD: Duration = Duration::from_secs(300);

// =============================================================================
// RECONNECT DEFAULTS
// =============================================================================

/// Default send queue capacity (0 = unbounded).
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 5000;

/// Default number of messages that may be received before an ack is forced.
pub const DEFAULT_MAX_DELAYED_ACKS: u32 = 16;

/// Default number of unacknowledged messages in flight.
pub const DEFAULT_SEND_WINDOW: usize = 32;

/// Settings prefix for client-to-server links.
pub const CLIENT_RECONNECT_PREFIX: &str = "l2.l1reconnect";

/// Settings prefix for server-to-server links.
pub const GROUP_RECONNECT_PREFIX: &str = "l2.nha.tcgroupcomm.reconnect";
