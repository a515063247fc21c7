//! Error types for the relink stack.

use std::io;
use std::panic::Location;

use thiserror::Error;

/// Errors that can occur when decoding wire data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Input data is shorter than required.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Declared frame length exceeds the allowed maximum.
    #[error("frame too large: {len} bytes exceeds limit of {max}")]
    TooLarge {
        /// Declared length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Unknown message or frame kind tag.
    #[error("unknown {what} tag: {tag:#04x}")]
    UnknownTag {
        /// Which tag space the value was read from.
        what: &'static str,
        /// The offending tag.
        tag: u8,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Message format is invalid or corrupted.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

/// Errors raised while reading configuration settings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Setting key.
        key: String,
        /// Raw value that failed to parse.
        value: String,
    },

    /// A setting was out of its permitted range.
    #[error("{key} out of range: {reason}")]
    OutOfRange {
        /// Setting key.
        key: String,
        /// Why the value is rejected.
        reason: &'static str,
    },
}

/// Call site where a sentinel value was constructed.
///
/// Only reported when the sentinel is used illegally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    location: &'static Location<'static>,
}

impl Provenance {
    /// Capture the caller's location.
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
        }
    }

    /// Source file of the construction site.
    pub fn file(&self) -> &'static str {
        self.location.file()
    }

    /// Source line of the construction site.
    pub fn line(&self) -> u32 {
        self.location.line()
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.location.file(), self.location.line())
    }
}

/// Top-level stack errors.
#[derive(Debug, Error)]
pub enum StackError {
    /// Remote host name could not be resolved.
    #[error("unable to resolve host {0}")]
    HostResolution(String),

    /// Connect or handshake did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Server refused the connection because it is at capacity.
    #[error("max connections exceeded (limit {max})")]
    MaxConnectionsExceeded {
        /// Server-side limit.
        max: u32,
    },

    /// Server has no stack for the identity the client tried to resume.
    #[error("reconnection rejected: {0}")]
    ReconnectionRejected(String),

    /// Server refused the connection for another reason.
    #[error("connection refused: {0}")]
    Refused(String),

    /// Client and server disagree on which layers the stack contains.
    #[error("stack mismatch: local layers {local:#06x}, remote layers {remote:#06x}")]
    StackMismatch {
        /// Local layer flags.
        local: u16,
        /// Remote layer flags.
        remote: u16,
    },

    /// Payload is larger than one message on the wire can carry.
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Payload size.
        len: usize,
        /// Largest payload this layer accepts.
        max: usize,
    },

    /// Layer is not connected to a peer.
    #[error("not connected")]
    NotConnected,

    /// Layer has been closed.
    #[error("connection closed")]
    Closed,

    /// A neighbor layer was required but never wired.
    #[error("{0} layer not set")]
    LayerNotSet(&'static str),

    /// Operation is not supported by this layer (stack miswired).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Frame sequence or kind violates the protocol state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// `finalize_stack` was called on an already finalized harness.
    #[error("network stack already finalized")]
    AlreadyFinalized,

    /// `attach_new_connection` was called before `finalize_stack`.
    #[error("network stack not finalized")]
    NotFinalized,

    /// A sentinel value was read where an assigned value is required.
    #[error("illegal use of unset {what} (created at {provenance})")]
    IllegalSentinelUse {
        /// What was read.
        what: &'static str,
        /// Where the sentinel came from.
        provenance: Provenance,
    },

    /// Wire decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl StackError {
    /// Fatal errors mean corrupted state or a miswired stack; the connection
    /// path must be torn down rather than the error absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StackError::ProtocolViolation(_)
                | StackError::Unsupported(_)
                | StackError::AlreadyFinalized
                | StackError::NotFinalized
                | StackError::IllegalSentinelUse { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type StackResult<T> = Result<T, StackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(StackError::AlreadyFinalized.is_fatal());
        assert!(StackError::NotFinalized.is_fatal());
        assert!(StackError::ProtocolViolation("ack in send slot".into()).is_fatal());
        assert!(!StackError::NotConnected.is_fatal());
        assert!(!StackError::MaxConnectionsExceeded { max: 2 }.is_fatal());
        assert!(!StackError::MessageTooLarge { len: 9, max: 8 }.is_fatal());
        assert!(!StackError::Frame(FrameError::InvalidUtf8("server id")).is_fatal());
    }

    #[test]
    fn test_provenance_points_at_caller() {
        let provenance = Provenance::capture();
        assert!(provenance.file().ends_with("error.rs"));
        assert!(provenance.to_string().contains(&provenance.line().to_string()));
    }

    #[test]
    fn test_sentinel_error_mentions_origin() {
        let err = StackError::IllegalSentinelUse {
            what: "jvm id",
            provenance: Provenance::capture(),
        };
        let text = err.to_string();
        assert!(text.contains("jvm id"));
        assert!(text.contains("error.rs"));
    }
}
