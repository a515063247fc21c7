//! Once-and-only-once protocol frames.
//!
//! Wire format (big-endian):
//! ```text
//! +0   kind          (1 byte)
//! +1   session id    (16 bytes)
//! +17  sequence      (8 bytes, i64)
//! +25  ack sequence  (8 bytes, i64)
//! +33  body          SEND: payload
//!                    HANDSHAKE*: resume from (8 bytes, i64)
//!                    PING / PING_REPLY / TIME_CHECK: timestamp millis (8 bytes, i64)
//!                    ACK / GOODBYE: empty
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::constants::{
    FRAME_KIND_ACK, FRAME_KIND_GOODBYE, FRAME_KIND_HANDSHAKE, FRAME_KIND_HANDSHAKE_REPLY_FAIL,
    FRAME_KIND_HANDSHAKE_REPLY_OK, FRAME_KIND_PING, FRAME_KIND_PING_REPLY, FRAME_KIND_SEND,
    FRAME_KIND_TIME_CHECK, OOO_HEADER_SIZE, SESSION_ID_SIZE, UNSET_SEQUENCE,
};
use crate::core::FrameError;

/// Identifies one incarnation of a logical connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// The "no session yet" value.
    pub const NULL: SessionId = SessionId([0u8; SESSION_ID_SIZE]);

    /// A fresh random session id (never [`SessionId::NULL`]).
    pub fn random() -> Self {
        loop {
            let id = SessionId(rand::random());
            if !id.is_null() {
                return id;
            }
        }
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        SessionId(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    /// Whether this is [`SessionId::NULL`].
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; SESSION_ID_SIZE]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell incarnations apart in logs.
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Frame kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Application payload.
    Send,
    /// Standalone acknowledgment.
    Ack,
    /// Resume request.
    Handshake,
    /// Resume accepted.
    HandshakeReplyOk,
    /// Resume refused.
    HandshakeReplyFail,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    PingReply,
    /// Clock skew probe.
    TimeCheck,
    /// Orderly close.
    Goodbye,
}

impl FrameKind {
    /// Wire tag.
    pub fn to_wire(self) -> u8 {
        match self {
            FrameKind::Send => FRAME_KIND_SEND,
            FrameKind::Ack => FRAME_KIND_ACK,
            FrameKind::Handshake => FRAME_KIND_HANDSHAKE,
            FrameKind::HandshakeReplyOk => FRAME_KIND_HANDSHAKE_REPLY_OK,
            FrameKind::HandshakeReplyFail => FRAME_KIND_HANDSHAKE_REPLY_FAIL,
            FrameKind::Ping => FRAME_KIND_PING,
            FrameKind::PingReply => FRAME_KIND_PING_REPLY,
            FrameKind::TimeCheck => FRAME_KIND_TIME_CHECK,
            FrameKind::Goodbye => FRAME_KIND_GOODBYE,
        }
    }

    /// Parse a wire tag.
    pub fn from_wire(tag: u8) -> Result<Self, FrameError> {
        Ok(match tag {
            FRAME_KIND_SEND => FrameKind::Send,
            FRAME_KIND_ACK => FrameKind::Ack,
            FRAME_KIND_HANDSHAKE => FrameKind::Handshake,
            FRAME_KIND_HANDSHAKE_REPLY_OK => FrameKind::HandshakeReplyOk,
            FRAME_KIND_HANDSHAKE_REPLY_FAIL => FrameKind::HandshakeReplyFail,
            FRAME_KIND_PING => FrameKind::Ping,
            FRAME_KIND_PING_REPLY => FrameKind::PingReply,
            FRAME_KIND_TIME_CHECK => FrameKind::TimeCheck,
            FRAME_KIND_GOODBYE => FrameKind::Goodbye,
            tag => return Err(FrameError::UnknownTag { what: "frame kind", tag }),
        })
    }
}

/// Kind-specific frame content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Application payload.
    Send(Bytes),
    /// Acknowledgment only; the value travels in the header.
    Ack,
    /// Client resume request carrying its receive watermark.
    Handshake {
        /// Last sequence the client delivered.
        resume_from: i64,
    },
    /// Server accepts; carries its receive watermark.
    HandshakeReplyOk {
        /// Last sequence the server delivered.
        resume_from: i64,
    },
    /// Server refuses; the client must start a new session.
    HandshakeReplyFail {
        /// Always the virgin watermark.
        resume_from: i64,
    },
    /// Liveness probe.
    Ping {
        /// Sender clock, millis since the epoch.
        timestamp: i64,
    },
    /// Echo of a probe.
    PingReply {
        /// Timestamp copied from the probe.
        timestamp: i64,
    },
    /// Clock skew probe.
    TimeCheck {
        /// Sender clock, millis since the epoch.
        timestamp: i64,
    },
    /// Orderly close by the client.
    Goodbye,
}

/// One once-and-only-once frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OooFrame {
    /// Incarnation this frame belongs to.
    pub session_id: SessionId,
    /// Sequence of a SEND (-1 for other kinds).
    pub sequence: i64,
    /// Piggy-backed acknowledgment.
    pub ack_sequence: i64,
    /// Kind-specific content.
    pub body: FrameBody,
}

impl OooFrame {
    /// Application payload frame.
    pub fn send(session_id: SessionId, sequence: i64, ack_sequence: i64, payload: Bytes) -> Self {
        Self {
            session_id,
            sequence,
            ack_sequence,
            body: FrameBody::Send(payload),
        }
    }

    /// Standalone ack.
    pub fn ack(session_id: SessionId, ack_sequence: i64) -> Self {
        Self::control(session_id, ack_sequence, FrameBody::Ack)
    }

    /// Header-only frame of any non-SEND kind.
    pub fn control(session_id: SessionId, ack_sequence: i64, body: FrameBody) -> Self {
        Self {
            session_id,
            sequence: UNSET_SEQUENCE,
            ack_sequence,
            body,
        }
    }

    /// Kind tag of the body.
    pub fn kind(&self) -> FrameKind {
        match self.body {
            FrameBody::Send(_) => FrameKind::Send,
            FrameBody::Ack => FrameKind::Ack,
            FrameBody::Handshake { .. } => FrameKind::Handshake,
            FrameBody::HandshakeReplyOk { .. } => FrameKind::HandshakeReplyOk,
            FrameBody::HandshakeReplyFail { .. } => FrameKind::HandshakeReplyFail,
            FrameBody::Ping { .. } => FrameKind::Ping,
            FrameBody::PingReply { .. } => FrameKind::PingReply,
            FrameBody::TimeCheck { .. } => FrameKind::TimeCheck,
            FrameBody::Goodbye => FrameKind::Goodbye,
        }
    }

    /// Total encoded size.
    pub fn wire_size(&self) -> usize {
        OOO_HEADER_SIZE
            + match &self.body {
                FrameBody::Send(payload) => payload.len(),
                FrameBody::Ack | FrameBody::Goodbye => 0,
                _ => 8,
            }
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        buf.put_u8(self.kind().to_wire());
        buf.put_slice(self.session_id.as_bytes());
        buf.put_i64(self.sequence);
        buf.put_i64(self.ack_sequence);
        match &self.body {
            FrameBody::Send(payload) => buf.put_slice(payload),
            FrameBody::Ack | FrameBody::Goodbye => {}
            FrameBody::Handshake { resume_from }
            | FrameBody::HandshakeReplyOk { resume_from }
            | FrameBody::HandshakeReplyFail { resume_from } => buf.put_i64(*resume_from),
            FrameBody::Ping { timestamp }
            | FrameBody::PingReply { timestamp }
            | FrameBody::TimeCheck { timestamp } => buf.put_i64(*timestamp),
        }
        buf.freeze()
    }

    /// Decode from wire format. A SEND payload shares `data`'s storage.
    pub fn decode(data: Bytes) -> Result<Self, FrameError> {
        if data.len() < OOO_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: OOO_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut header = &data[..OOO_HEADER_SIZE];
        let kind = FrameKind::from_wire(header.get_u8())?;
        let mut session = [0u8; SESSION_ID_SIZE];
        header.copy_to_slice(&mut session);
        let sequence = header.get_i64();
        let ack_sequence = header.get_i64();

        let rest = data.slice(OOO_HEADER_SIZE..);
        let body = match kind {
            FrameKind::Send => FrameBody::Send(rest),
            FrameKind::Ack => FrameBody::Ack,
            FrameKind::Goodbye => FrameBody::Goodbye,
            _ => {
                let value = read_i64(&rest)?;
                match kind {
                    FrameKind::Handshake => FrameBody::Handshake { resume_from: value },
                    FrameKind::HandshakeReplyOk => FrameBody::HandshakeReplyOk { resume_from: value },
                    FrameKind::HandshakeReplyFail => {
                        FrameBody::HandshakeReplyFail { resume_from: value }
                    }
                    FrameKind::Ping => FrameBody::Ping { timestamp: value },
                    FrameKind::PingReply => FrameBody::PingReply { timestamp: value },
                    _ => FrameBody::TimeCheck { timestamp: value },
                }
            }
        };

        Ok(Self {
            session_id: SessionId::from_bytes(session),
            sequence,
            ack_sequence,
            body,
        })
    }
}

fn read_i64(rest: &[u8]) -> Result<i64, FrameError> {
    if rest.len() < 8 {
        return Err(FrameError::TooShort {
            expected: OOO_HEADER_SIZE + 8,
            actual: OOO_HEADER_SIZE + rest.len(),
        });
    }
    let mut rest = rest;
    Ok(rest.get_i64())
}
