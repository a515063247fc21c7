//! HTTP / native protocol switch for accepted sockets.
//!
//! The first [`HTTP_PROBE_SIZE`] bytes of a connection decide, once, whether
//! it carries HTTP or native stack traffic. HTTP connections are handed, with
//! the probe bytes, to an [`HttpSink`]; native ones go to a
//! [`NativeAdaptor`] with the probe bytes replayed in front of the stream.
//!
//! [`ProtocolSwitch`] is the decision logic without I/O; [`route`] drives it
//! over an async stream.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::core::constants::{HTTP_METHODS, HTTP_PROBE_SIZE};

/// What the switch has decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    /// Probe not yet full.
    Unknown,
    /// HTTP; the connection left the native engine.
    Http,
    /// Native traffic; bytes pass through.
    NotHttp,
}

/// Result of feeding bytes to the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Switched {
    /// More probe bytes are needed.
    Pending,
    /// Hand these bytes and the connection to the HTTP sink.
    Http(Bytes),
    /// Forward these bytes to the native path.
    Native(Bytes),
}

/// Receives HTTP connections, detached from the native engine.
pub trait HttpSink<S>: Send + Sync {
    /// Take ownership of `stream`; `probe` holds the bytes already read.
    fn hand_off(&self, probe: Bytes, stream: S);
}

/// Receives native connections.
pub trait NativeAdaptor<S>: Send + Sync {
    /// Take ownership of `stream`; `prefix` must be decoded before anything
    /// read from it.
    fn attach(&self, prefix: Bytes, stream: S);
}

/// Probe state of one connection.
#[derive(Debug)]
pub struct ProtocolSwitch {
    state: SwitchState,
    probe: BytesMut,
}

impl Default for ProtocolSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolSwitch {
    /// Undecided switch.
    pub fn new() -> Self {
        Self {
            state: SwitchState::Unknown,
            probe: BytesMut::with_capacity(HTTP_PROBE_SIZE),
        }
    }

    /// Current state.
    pub fn state(&self) -> SwitchState {
        self.state
    }

    /// How many bytes a reader may read next: the rest of the probe while
    /// undecided, unbounded (`None`) once native.
    pub fn read_window(&self) -> Option<usize> {
        match self.state {
            SwitchState::Unknown => Some(HTTP_PROBE_SIZE - self.probe.len()),
            SwitchState::Http => Some(0),
            SwitchState::NotHttp => None,
        }
    }

    /// Feed bytes read from the connection.
    ///
    /// While undecided, bytes beyond the probe are kept and forwarded with it.
    pub fn feed(&mut self, data: &[u8]) -> Switched {
        match self.state {
            SwitchState::NotHttp => Switched::Native(Bytes::copy_from_slice(data)),
            SwitchState::Http => {
                trace!(len = data.len(), "bytes after http handoff ignored");
                Switched::Pending
            }
            SwitchState::Unknown => {
                self.probe.extend_from_slice(data);
                if self.probe.len() < HTTP_PROBE_SIZE {
                    return Switched::Pending;
                }
                let bytes = self.probe.split().freeze();
                if is_http(&bytes[..HTTP_PROBE_SIZE]) {
                    self.state = SwitchState::Http;
                    debug!("http request detected");
                    Switched::Http(bytes)
                } else {
                    self.state = SwitchState::NotHttp;
                    Switched::Native(bytes)
                }
            }
        }
    }

    /// End of stream. An undecided switch resolves to native so the native
    /// path sees the partial probe and the close.
    pub fn finish(&mut self) -> Switched {
        match self.state {
            SwitchState::Unknown => {
                self.state = SwitchState::NotHttp;
                Switched::Native(self.probe.split().freeze())
            }
            SwitchState::NotHttp => Switched::Native(Bytes::new()),
            SwitchState::Http => Switched::Pending,
        }
    }
}

fn is_http(probe: &[u8]) -> bool {
    let Some(space) = probe.iter().position(|&b| b == b' ') else {
        return false;
    };
    match std::str::from_utf8(&probe[..space]) {
        Ok(method) => HTTP_METHODS.contains(&method),
        Err(_) => false,
    }
}

/// Read the probe from `stream` and hand the stream to `http` or `native`.
///
/// Returns the decision; I/O errors while probing are returned and the
/// stream is dropped.
pub async fn route<S, H, N>(mut stream: S, http: &H, native: &N) -> std::io::Result<SwitchState>
where
    S: AsyncRead + Unpin,
    H: HttpSink<S> + ?Sized,
    N: NativeAdaptor<S> + ?Sized,
{
    let mut switch = ProtocolSwitch::new();
    let mut buf = [0u8; HTTP_PROBE_SIZE];
    loop {
        let window = switch.read_window().unwrap_or(HTTP_PROBE_SIZE);
        let n = stream.read(&mut buf[..window]).await?;
        let switched = if n == 0 {
            switch.finish()
        } else {
            switch.feed(&buf[..n])
        };
        match switched {
            Switched::Pending => continue,
            Switched::Http(probe) => {
                http.hand_off(probe, stream);
                return Ok(SwitchState::Http);
            }
            Switched::Native(prefix) => {
                native.attach(prefix, stream);
                return Ok(SwitchState::NotHttp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        handed: Mutex<Vec<Bytes>>,
        native: Mutex<Vec<Bytes>>,
    }

    impl HttpSink<DuplexStream> for Recorder {
        fn hand_off(&self, probe: Bytes, _stream: DuplexStream) {
            self.handed.lock().push(probe);
        }
    }

    impl NativeAdaptor<DuplexStream> for Recorder {
        fn attach(&self, prefix: Bytes, _stream: DuplexStream) {
            self.native.lock().push(prefix);
        }
    }

    #[test]
    fn test_http_request_is_handed_off() {
        let mut switch = ProtocolSwitch::new();
        assert_eq!(switch.feed(b"GET / "), Switched::Pending);
        assert_eq!(switch.read_window(), Some(2));
        assert_eq!(switch.feed(b"HT"), Switched::Http(Bytes::from_static(b"GET / HT")));
        assert_eq!(switch.state(), SwitchState::Http);
        assert_eq!(switch.read_window(), Some(0));
    }

    #[test]
    fn test_native_bytes_forwarded_once() {
        let mut switch = ProtocolSwitch::new();
        let probe = [0u8, 0, 0, 9, 1, 0, 7, 0xff];
        assert_eq!(switch.feed(&probe), Switched::Native(Bytes::copy_from_slice(&probe)));
        assert_eq!(switch.state(), SwitchState::NotHttp);
        assert_eq!(switch.read_window(), None);
        assert_eq!(switch.feed(b"rest"), Switched::Native(Bytes::from_static(b"rest")));
    }

    #[test]
    fn test_unknown_verb_and_bad_utf8_are_native() {
        let mut switch = ProtocolSwitch::new();
        assert!(matches!(switch.feed(b"FETCH / "), Switched::Native(_)));
        let mut switch = ProtocolSwitch::new();
        assert!(matches!(
            switch.feed(&[0xc3, 0x28, b' ', 0, 0, 0, 0, 0]),
            Switched::Native(_)
        ));
    }

    #[test]
    fn test_eof_before_probe_resolves_native() {
        let mut switch = ProtocolSwitch::new();
        assert_eq!(switch.feed(b"PO"), Switched::Pending);
        assert_eq!(switch.finish(), Switched::Native(Bytes::from_static(b"PO")));
        assert_eq!(switch.state(), SwitchState::NotHttp);
    }

    #[tokio::test]
    async fn test_route_http() {
        let recorder = Recorder::default();
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let state = route(server, &recorder, &recorder).await.unwrap();
        assert_eq!(state, SwitchState::Http);
        assert_eq!(recorder.handed.lock().as_slice(), &[Bytes::from_static(b"GET / HT")]);
        assert!(recorder.native.lock().is_empty());
    }

    #[tokio::test]
    async fn test_route_native() {
        let recorder = Recorder::default();
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x00\x00\x00\x04abcd").await.unwrap();
        let state = route(server, &recorder, &recorder).await.unwrap();
        assert_eq!(state, SwitchState::NotHttp);
        assert!(recorder.handed.lock().is_empty());
        assert_eq!(
            recorder.native.lock().as_slice(),
            &[Bytes::from_static(b"\x00\x00\x00\x04abcd")]
        );
    }

    #[tokio::test]
    async fn test_route_eof_is_native() {
        let recorder = Recorder::default();
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"GE").await.unwrap();
        drop(client);
        assert_eq!(
            route(server, &recorder, &recorder).await.unwrap(),
            SwitchState::NotHttp
        );
        assert_eq!(recorder.native.lock().as_slice(), &[Bytes::from_static(b"GE")]);
    }
}
