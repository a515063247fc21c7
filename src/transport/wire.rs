//! Transport wire messages and stream framing.
//!
//! Every message on a physical connection is length-prefixed:
//! ```text
//! +0   length   (4 bytes BE, length of what follows)
//! +4   type     (1 byte: SYN / SYN_ACK / DATA)
//! +5   body
//! ```
//! SYN:     stack flags (u16), connection id
//! SYN_ACK: status (u8), stack flags (u16), max connections (u32),
//!          connection id, error text (optional string)
//! DATA:    payload for the layer above

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::constants::{
    MAX_DATA_PAYLOAD_SIZE, MAX_WIRE_MESSAGE_SIZE, WIRE_LENGTH_PREFIX_SIZE, WIRE_TYPE_DATA, WIRE_TYPE_SYN,
    WIRE_TYPE_SYN_ACK,
};
use crate::core::FrameError;
use crate::identity::{get_opt_str, put_opt_str, ConnectionId};

/// Outcome of a connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynAckStatus {
    /// Accepted.
    Ok,
    /// Server is at its connection limit.
    MaxConnectionsExceeded,
    /// Server has no stack for the identity being resumed.
    StackNotFound,
    /// Client and server stacks have different layers.
    StackMismatch,
    /// Any other refusal; see the error text.
    Error,
}

impl SynAckStatus {
    fn to_wire(self) -> u8 {
        match self {
            SynAckStatus::Ok => 0,
            SynAckStatus::MaxConnectionsExceeded => 1,
            SynAckStatus::StackNotFound => 2,
            SynAckStatus::StackMismatch => 3,
            SynAckStatus::Error => 4,
        }
    }

    fn from_wire(tag: u8) -> Result<Self, FrameError> {
        Ok(match tag {
            0 => SynAckStatus::Ok,
            1 => SynAckStatus::MaxConnectionsExceeded,
            2 => SynAckStatus::StackNotFound,
            3 => SynAckStatus::StackMismatch,
            4 => SynAckStatus::Error,
            tag => return Err(FrameError::UnknownTag { what: "syn-ack status", tag }),
        })
    }
}

/// Server reply to a SYN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynAck {
    /// Outcome.
    pub status: SynAckStatus,
    /// Layers of the server's stack.
    pub stack_flags: u16,
    /// Server connection limit (0 = unlimited).
    pub max_connections: u32,
    /// Identity assigned or confirmed by the server.
    pub connection_id: ConnectionId,
    /// Reason for a refusal.
    pub error: Option<String>,
}

/// A message on a physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Connection request.
    Syn {
        /// Layers of the client's stack.
        stack_flags: u16,
        /// Identity the client presents.
        connection_id: ConnectionId,
    },
    /// Connection reply.
    SynAck(SynAck),
    /// Payload for the layer above the transport.
    Data(Bytes),
}

impl WireMessage {
    /// Encode including the length prefix.
    ///
    /// Fails with [`FrameError::TooLarge`] rather than produce a message the
    /// peer's [`FrameDecoder`] would refuse.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if let WireMessage::Data(payload) = self {
            if payload.len() > MAX_DATA_PAYLOAD_SIZE {
                return Err(FrameError::TooLarge {
                    len: payload.len() + 1,
                    max: MAX_WIRE_MESSAGE_SIZE,
                });
            }
        }
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        match self {
            WireMessage::Syn {
                stack_flags,
                connection_id,
            } => {
                buf.put_u8(WIRE_TYPE_SYN);
                buf.put_u16(*stack_flags);
                connection_id.encode_into(&mut buf)?;
            }
            WireMessage::SynAck(ack) => {
                buf.put_u8(WIRE_TYPE_SYN_ACK);
                buf.put_u8(ack.status.to_wire());
                buf.put_u16(ack.stack_flags);
                buf.put_u32(ack.max_connections);
                ack.connection_id.encode_into(&mut buf)?;
                put_opt_str(&mut buf, ack.error.as_deref())?;
            }
            WireMessage::Data(payload) => {
                buf.reserve(1 + payload.len());
                buf.put_u8(WIRE_TYPE_DATA);
                buf.put_slice(payload);
            }
        }
        let len = buf.len() - WIRE_LENGTH_PREFIX_SIZE;
        if len > MAX_WIRE_MESSAGE_SIZE {
            return Err(FrameError::TooLarge {
                len,
                max: MAX_WIRE_MESSAGE_SIZE,
            });
        }
        buf[..WIRE_LENGTH_PREFIX_SIZE].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(buf.freeze())
    }

    /// Decode one message body (without its length prefix).
    pub fn decode(body: Bytes) -> Result<Self, FrameError> {
        if body.is_empty() {
            return Err(FrameError::TooShort {
                expected: 1,
                actual: 0,
            });
        }
        match body[0] {
            WIRE_TYPE_DATA => Ok(WireMessage::Data(body.slice(1..))),
            WIRE_TYPE_SYN => {
                let mut rest = &body[1..];
                if rest.len() < 2 {
                    return Err(FrameError::TooShort {
                        expected: 3,
                        actual: body.len(),
                    });
                }
                let stack_flags = rest.get_u16();
                let connection_id = ConnectionId::decode(&mut rest)?;
                Ok(WireMessage::Syn {
                    stack_flags,
                    connection_id,
                })
            }
            WIRE_TYPE_SYN_ACK => {
                let mut rest = &body[1..];
                if rest.len() < 7 {
                    return Err(FrameError::TooShort {
                        expected: 8,
                        actual: body.len(),
                    });
                }
                let status = SynAckStatus::from_wire(rest.get_u8())?;
                let stack_flags = rest.get_u16();
                let max_connections = rest.get_u32();
                let connection_id = ConnectionId::decode(&mut rest)?;
                let error = get_opt_str(&mut rest, "error text")?;
                Ok(WireMessage::SynAck(SynAck {
                    status,
                    stack_flags,
                    max_connections,
                    connection_id,
                    error,
                }))
            }
            tag => Err(FrameError::UnknownTag {
                what: "wire message",
                tag,
            }),
        }
    }
}

/// Splits a byte stream into length-prefixed message bodies.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_WIRE_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    /// Decoder rejecting messages longer than `max_size`.
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_size,
        }
    }

    /// Append stream bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Buffer for direct reads.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes held but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete message body, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < WIRE_LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > self.max_size {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_size,
            });
        }
        if self.buffer.len() < WIRE_LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }
        self.buffer.advance(WIRE_LENGTH_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ProductKind;

    fn body_of(encoded: Bytes) -> Bytes {
        encoded.slice(WIRE_LENGTH_PREFIX_SIZE..)
    }

    #[test]
    fn test_data_wire_vector() {
        let msg = WireMessage::Data(Bytes::from_static(b"ok"));
        let encoded = msg.encode().unwrap();
        assert_eq!(hex::encode(&encoded), "00000003036f6b");
        assert_eq!(WireMessage::decode(body_of(encoded)).unwrap(), msg);
    }

    #[test]
    fn test_syn_ack_carries_refusal() {
        let ack = SynAck {
            status: SynAckStatus::MaxConnectionsExceeded,
            stack_flags: 0x0007,
            max_connections: 2,
            connection_id: ConnectionId::new_client("jvm", ProductKind::Permanent),
            error: Some("full".into()),
        };
        let decoded = WireMessage::decode(body_of(WireMessage::SynAck(ack.clone()).encode().unwrap())).unwrap();
        match decoded {
            WireMessage::SynAck(got) => {
                assert_eq!(got.status, SynAckStatus::MaxConnectionsExceeded);
                assert_eq!(got.max_connections, 2);
                assert_eq!(got.error.as_deref(), Some("full"));
                assert_eq!(got.connection_id.jvm_id().unwrap(), "jvm");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decoder_handles_split_and_coalesced_input() {
        let a = WireMessage::Data(Bytes::from_static(b"first")).encode().unwrap();
        let b = WireMessage::Data(Bytes::from_static(b"second")).encode().unwrap();
        let mut stream = a.to_vec();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::default();
        decoder.push(&stream[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&stream[3..]);
        let first = decoder.next_frame().unwrap().unwrap();
        let second = decoder.next_frame().unwrap().unwrap();
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(&first[1..], b"first");
        assert_eq!(&second[1..], b"second");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_rejects_oversized() {
        let mut decoder = FrameDecoder::new(4);
        decoder.push(&[0, 0, 0, 5, 1, 2, 3, 4, 5]);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { len: 5, max: 4 })
        ));
    }

    #[test]
    fn test_largest_data_payload_fits_the_decoder() {
        let payload = Bytes::from(vec![7u8; MAX_DATA_PAYLOAD_SIZE]);
        let encoded = WireMessage::Data(payload).encode().unwrap();
        let mut decoder = FrameDecoder::default();
        decoder.push(&encoded);
        let body = decoder.next_frame().unwrap().unwrap();
        assert_eq!(body.len(), MAX_WIRE_MESSAGE_SIZE);
    }

    #[test]
    fn test_oversized_data_is_not_encoded() {
        let payload = Bytes::from(vec![7u8; MAX_WIRE_MESSAGE_SIZE]);
        assert!(matches!(
            WireMessage::Data(payload).encode(),
            Err(FrameError::TooLarge {
                len,
                max: MAX_WIRE_MESSAGE_SIZE
            }) if len == MAX_WIRE_MESSAGE_SIZE + 1
        ));
    }

    #[test]
    fn test_syn_with_oversized_identity_is_not_encoded() {
        let syn = WireMessage::Syn {
            stack_flags: 0,
            connection_id: ConnectionId::new_client("j".repeat(70_000), ProductKind::Permanent),
        };
        assert!(matches!(syn.encode(), Err(FrameError::TooLarge { len: 70_000, .. })));
    }

    #[test]
    fn test_unknown_type() {
        assert!(matches!(
            WireMessage::decode(Bytes::from_static(&[0x42])),
            Err(FrameError::UnknownTag { tag: 0x42, .. })
        ));
    }
}
