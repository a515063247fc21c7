//! Logical connection identity.
//!
//! A [`ConnectionId`] outlives the physical socket: a client that loses its
//! TCP connection presents the same identity when it reconnects, and the
//! server finds the surviving stack by it.
//!
//! Wire format:
//! ```text
//! +0   channel id      (8 bytes BE, -1 = not assigned)
//! +8   server id       (optional string)
//! ...  jvm id          (optional string)
//! ...  product kind    (1 byte)
//! ...  username        (optional string)
//! ...  password        (optional string)
//! ```
//! Optional string = presence byte, then `u16` BE length and UTF-8 bytes.

use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut, BytesMut};

use crate::core::{FrameError, Provenance, StackError, StackResult};

/// Channel id of an identity the server has not assigned yet.
pub const NULL_CHANNEL_ID: i64 = -1;

/// Which server instance accepted a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerId {
    /// Not assigned yet; the connection is new.
    Unset,
    /// Assigned by the accepting server.
    Assigned(String),
}

impl ServerId {
    /// Whether the id has been assigned.
    pub fn is_assigned(&self) -> bool {
        matches!(self, ServerId::Assigned(_))
    }

    /// The assigned id, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ServerId::Unset => None,
            ServerId::Assigned(id) => Some(id),
        }
    }
}

/// Which process instance originated a connection.
///
/// Unlike [`ServerId`], an unset jvm id must never be read.
#[derive(Debug, Clone)]
pub enum JvmId {
    /// Never initialized; reading it is an error.
    Unset(Provenance),
    /// Process instance id.
    Assigned(String),
}

impl JvmId {
    /// An unset id remembering where it was made.
    #[track_caller]
    pub fn unset() -> Self {
        JvmId::Unset(Provenance::capture())
    }
}

/// Kind of client on the other end, deciding what the link may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProductKind {
    /// Regular long-lived client.
    Permanent,
    /// Member of a server stripe.
    Stripe,
    /// Server-to-server link.
    Server,
    /// Short-lived diagnostic client.
    Diagnostic,
}

impl ProductKind {
    /// Whether a dropped link of this kind may be resumed.
    pub fn is_reconnect_enabled(self) -> bool {
        !matches!(self, ProductKind::Diagnostic)
    }

    /// Whether this kind may be redirected to another server.
    pub fn is_redirect_enabled(self) -> bool {
        matches!(self, ProductKind::Permanent)
    }

    fn to_wire(self) -> u8 {
        match self {
            ProductKind::Permanent => 0,
            ProductKind::Stripe => 1,
            ProductKind::Server => 2,
            ProductKind::Diagnostic => 3,
        }
    }

    fn from_wire(tag: u8) -> Result<Self, FrameError> {
        match tag {
            0 => Ok(ProductKind::Permanent),
            1 => Ok(ProductKind::Stripe),
            2 => Ok(ProductKind::Server),
            3 => Ok(ProductKind::Diagnostic),
            tag => Err(FrameError::UnknownTag {
                what: "product kind",
                tag,
            }),
        }
    }
}

/// Identity of a logical connection.
///
/// Equality and hashing use `(channel_id, server_id)` only.
#[derive(Debug, Clone)]
pub struct ConnectionId {
    channel_id: i64,
    server_id: ServerId,
    jvm_id: JvmId,
    product: ProductKind,
    username: Option<String>,
    password: Option<String>,
    provenance: Option<Provenance>,
}

impl ConnectionId {
    /// The sentinel identity.
    #[track_caller]
    pub fn null() -> Self {
        let provenance = Provenance::capture();
        Self {
            channel_id: NULL_CHANNEL_ID,
            server_id: ServerId::Unset,
            jvm_id: JvmId::Unset(provenance),
            product: ProductKind::Permanent,
            username: None,
            password: None,
            provenance: Some(provenance),
        }
    }

    /// Identity a client presents before the server assigns one.
    pub fn new_client(jvm_id: impl Into<String>, product: ProductKind) -> Self {
        Self {
            channel_id: NULL_CHANNEL_ID,
            server_id: ServerId::Unset,
            jvm_id: JvmId::Assigned(jvm_id.into()),
            product,
            username: None,
            password: None,
            provenance: None,
        }
    }

    /// Fully specified identity.
    pub fn new(channel_id: i64, server_id: ServerId, jvm_id: JvmId, product: ProductKind) -> Self {
        Self {
            channel_id,
            server_id,
            jvm_id,
            product,
            username: None,
            password: None,
            provenance: None,
        }
    }

    /// Attach credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Copy of this identity with an assigned channel and server.
    pub fn assigned(&self, channel_id: i64, server_id: impl Into<String>) -> Self {
        Self {
            channel_id,
            server_id: ServerId::Assigned(server_id.into()),
            jvm_id: self.jvm_id.clone(),
            product: self.product,
            username: self.username.clone(),
            password: self.password.clone(),
            provenance: None,
        }
    }

    /// Channel id (-1 when unassigned).
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }

    /// Accepting server.
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Originating process id.
    ///
    /// Reading an unset id is [`StackError::IllegalSentinelUse`].
    pub fn jvm_id(&self) -> StackResult<&str> {
        match &self.jvm_id {
            JvmId::Assigned(id) => Ok(id),
            JvmId::Unset(provenance) => Err(StackError::IllegalSentinelUse {
                what: "jvm id",
                provenance: *provenance,
            }),
        }
    }

    /// Whether a jvm id was ever assigned.
    pub fn has_jvm_id(&self) -> bool {
        matches!(self.jvm_id, JvmId::Assigned(_))
    }

    /// Client kind.
    pub fn product(&self) -> ProductKind {
        self.product
    }

    /// Optional username.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Optional password.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Construction site of a sentinel identity.
    pub fn provenance(&self) -> Option<Provenance> {
        self.provenance
    }

    /// The server has not assigned this identity yet.
    pub fn is_new_connection(&self) -> bool {
        !self.server_id.is_assigned()
    }

    /// Whether this identity carries no assigned channel or server.
    ///
    /// Only channel and server take part, so an unassigned `new_client`
    /// identity also reports `true` here and compares equal to
    /// [`ConnectionId::null`]. Use [`ConnectionId::has_jvm_id`] to tell a
    /// fresh client apart from the sentinel.
    pub fn is_null(&self) -> bool {
        self.channel_id == NULL_CHANNEL_ID && !self.server_id.is_assigned()
    }

    /// Both channel and server have been assigned.
    pub fn is_valid(&self) -> bool {
        self.channel_id != NULL_CHANNEL_ID && self.server_id.is_assigned()
    }

    /// Encode into `buf`.
    ///
    /// Fails when a string field is longer than its `u16` length prefix can
    /// describe; `buf` may then hold a partial encoding.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        buf.put_i64(self.channel_id);
        put_opt_str(buf, self.server_id.as_str())?;
        let jvm = match &self.jvm_id {
            JvmId::Assigned(id) => Some(id.as_str()),
            JvmId::Unset(_) => None,
        };
        put_opt_str(buf, jvm)?;
        buf.put_u8(self.product.to_wire());
        put_opt_str(buf, self.username.as_deref())?;
        put_opt_str(buf, self.password.as_deref())
    }

    /// Decode from the front of `buf`, advancing it.
    #[track_caller]
    pub fn decode(buf: &mut &[u8]) -> Result<Self, FrameError> {
        need(buf, 8)?;
        let channel_id = buf.get_i64();
        let server_id = match get_opt_str(buf, "server id")? {
            Some(id) => ServerId::Assigned(id),
            None => ServerId::Unset,
        };
        let jvm_id = match get_opt_str(buf, "jvm id")? {
            Some(id) => JvmId::Assigned(id),
            None => JvmId::unset(),
        };
        need(buf, 1)?;
        let product = ProductKind::from_wire(buf.get_u8())?;
        let username = get_opt_str(buf, "username")?;
        let password = get_opt_str(buf, "password")?;
        Ok(Self {
            channel_id,
            server_id,
            jvm_id,
            product,
            username,
            password,
            provenance: None,
        })
    }
}

/// Channel and server only; jvm id, product and credentials are ignored.
impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.channel_id == other.channel_id && self.server_id == other.server_id
    }
}

impl Eq for ConnectionId {}

impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.channel_id.hash(state);
        self.server_id.hash(state);
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server_id {
            ServerId::Assigned(server) => write!(f, "ConnectionId({}.{server})", self.channel_id),
            ServerId::Unset => write!(f, "ConnectionId({}.unset)", self.channel_id),
        }
    }
}

fn need(buf: &[u8], n: usize) -> Result<(), FrameError> {
    if buf.len() < n {
        return Err(FrameError::TooShort {
            expected: n,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Longest string an optional-string field can carry.
pub const MAX_WIRE_STRING_LEN: usize = u16::MAX as usize;

pub(crate) fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) -> Result<(), FrameError> {
    match value {
        Some(s) => {
            let len = u16::try_from(s.len()).map_err(|_| FrameError::TooLarge {
                len: s.len(),
                max: MAX_WIRE_STRING_LEN,
            })?;
            buf.put_u8(1);
            buf.put_u16(len);
            buf.put_slice(s.as_bytes());
        }
        None => buf.put_u8(0),
    }
    Ok(())
}

pub(crate) fn get_opt_str(buf: &mut &[u8], what: &'static str) -> Result<Option<String>, FrameError> {
    need(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => {
            need(buf, 2)?;
            let len = buf.get_u16() as usize;
            need(buf, len)?;
            let text = std::str::from_utf8(&buf[..len])
                .map_err(|_| FrameError::InvalidUtf8(what))?
                .to_string();
            buf.advance(len);
            Ok(Some(text))
        }
        tag => Err(FrameError::UnknownTag {
            what: "presence",
            tag,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of(id: &ConnectionId) -> u64 {
        let mut h = DefaultHasher::new();
        id.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_equality_ignores_jvm_and_credentials() {
        let a = ConnectionId::new(
            7,
            ServerId::Assigned("srv".into()),
            JvmId::Assigned("jvm-a".into()),
            ProductKind::Permanent,
        );
        let b = ConnectionId::new(
            7,
            ServerId::Assigned("srv".into()),
            JvmId::Assigned("jvm-b".into()),
            ProductKind::Diagnostic,
        )
        .with_credentials("user", "pw");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = a.assigned(8, "srv");
        assert_ne!(a, c);
    }

    #[test]
    fn test_null_identity() {
        let null = ConnectionId::null();
        assert!(null.is_null());
        assert!(null.is_new_connection());
        assert!(!null.is_valid());

        let assigned = ConnectionId::new_client("jvm", ProductKind::Permanent).assigned(0, "srv");
        assert_ne!(null, assigned);
        assert_ne!(null, ConnectionId::new_client("jvm", ProductKind::Permanent).assigned(-1, "srv"));
    }

    #[test]
    fn test_unset_jvm_id_reports_provenance() {
        let null = ConnectionId::null();
        match null.jvm_id() {
            Err(StackError::IllegalSentinelUse { what, provenance }) => {
                assert_eq!(what, "jvm id");
                assert!(provenance.file().ends_with("connection_id.rs"));
                assert_eq!(null.provenance(), Some(provenance));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_product_kinds() {
        assert!(ProductKind::Permanent.is_reconnect_enabled());
        assert!(ProductKind::Permanent.is_redirect_enabled());
        assert!(ProductKind::Stripe.is_reconnect_enabled());
        assert!(!ProductKind::Stripe.is_redirect_enabled());
        assert!(!ProductKind::Diagnostic.is_reconnect_enabled());
    }

    #[test]
    fn test_wire_vector() {
        let id = ConnectionId::new(
            2,
            ServerId::Assigned("s1".into()),
            JvmId::unset(),
            ProductKind::Server,
        );
        let mut buf = BytesMut::new();
        id.encode_into(&mut buf).unwrap();
        assert_eq!(hex::encode(&buf), "0000000000000002010002733100020000");

        let mut slice = &buf[..];
        let decoded = ConnectionId::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded, id);
        assert!(!decoded.has_jvm_id());
        assert_eq!(decoded.product(), ProductKind::Server);
    }

    #[test]
    fn test_null_matches_unassigned_client() {
        let fresh = ConnectionId::new_client("jvm", ProductKind::Permanent);
        assert_eq!(ConnectionId::null(), fresh);
        assert!(fresh.is_null());
        assert!(fresh.has_jvm_id());
        assert!(!ConnectionId::null().has_jvm_id());
    }

    #[test]
    fn test_longest_credentials_round_trip() {
        let username = "u".repeat(MAX_WIRE_STRING_LEN);
        let id = ConnectionId::new_client("jvm", ProductKind::Permanent)
            .assigned(3, "srv")
            .with_credentials(username.clone(), "pw");
        let mut buf = BytesMut::new();
        id.encode_into(&mut buf).unwrap();

        let mut slice = &buf[..];
        let decoded = ConnectionId::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded.username(), Some(username.as_str()));
        assert_eq!(decoded.password(), Some("pw"));
    }

    #[test]
    fn test_oversized_string_is_rejected() {
        let id = ConnectionId::new_client("jvm", ProductKind::Permanent)
            .with_credentials("u".repeat(70_000), "pw");
        let mut buf = BytesMut::new();
        match id.encode_into(&mut buf) {
            Err(FrameError::TooLarge { len, max }) => {
                assert_eq!(len, 70_000);
                assert_eq!(max, MAX_WIRE_STRING_LEN);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_errors() {
        let mut short: &[u8] = &[0, 0, 0];
        assert!(matches!(
            ConnectionId::decode(&mut short),
            Err(FrameError::TooShort { .. })
        ));

        let mut bad_utf8: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 1, 1, 0, 1, 0xff];
        assert!(matches!(
            ConnectionId::decode(&mut bad_utf8),
            Err(FrameError::InvalidUtf8("server id"))
        ));
    }
}
