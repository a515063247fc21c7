//! Once-and-only-once network layer.
//!
//! Sits between the channel and the transport. Runs the resume handshake
//! whenever the transport (re)connects, and otherwise hands SEND and ACK
//! frames to [`GuaranteedDelivery`].
//!
//! Handshake, server side:
//! - null session: brand-new client, reply OK;
//! - same session: reply OK and replay what the client has not seen;
//! - other session: reply FAIL, drop the old channel, reset and start over.
//!
//! The client adopts the server's session from either reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::frame::{FrameBody, OooFrame, SessionId};
use super::liveness::LivenessMonitor;
use super::protocol::{DeliveryContext, GuaranteedDelivery};
use crate::core::constants::{MAX_OOO_PAYLOAD_SIZE, STACK_FLAG_OOO};
use crate::core::{
    coalesce, LayerSlot, ListenerSet, NetworkLayer, ReconnectConfig, StackError, StackResult,
    TransportEvent, TransportEventListener,
};
use crate::identity::ConnectionId;
use crate::transport::reconnect::RestorableLayer;

/// The once-and-only-once layer of a guaranteed stack.
pub struct OooLayer {
    is_client: bool,
    delivery: GuaranteedDelivery,
    session_id: Mutex<SessionId>,
    send_layer: LayerSlot,
    receive_layer: LayerSlot,
    upper: ListenerSet,
    connection_id: RwLock<ConnectionId>,
    liveness: LivenessMonitor,
    reconnect_mode: AtomicBool,
    handshake_mode: AtomicBool,
    channel_connected: AtomicBool,
    closed: AtomicBool,
}

impl OooLayer {
    /// Create the layer. Delivery starts paused until the first handshake.
    pub fn new(config: &ReconnectConfig, is_client: bool) -> Self {
        let delivery = GuaranteedDelivery::new(config);
        delivery.start();
        delivery.pause();
        Self {
            is_client,
            delivery,
            session_id: Mutex::new(if is_client {
                SessionId::NULL
            } else {
                SessionId::random()
            }),
            send_layer: LayerSlot::new("send"),
            receive_layer: LayerSlot::new("receive"),
            upper: ListenerSet::new(),
            connection_id: RwLock::new(ConnectionId::null()),
            liveness: LivenessMonitor::default(),
            reconnect_mode: AtomicBool::new(false),
            handshake_mode: AtomicBool::new(false),
            channel_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Layer flag advertised in the connection handshake.
    pub const STACK_FLAG: u16 = STACK_FLAG_OOO;

    /// Register the layer above for connection events.
    pub fn add_listener(&self, listener: Weak<dyn TransportEventListener>) {
        self.upper.add(listener);
    }

    /// Current session.
    pub fn session(&self) -> SessionId {
        *self.session_id.lock()
    }

    /// The delivery machines.
    pub fn delivery(&self) -> &GuaranteedDelivery {
        &self.delivery
    }

    /// Round-trip and skew samples.
    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    /// Whether a GOODBYE or `close` ended this layer.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the link is waiting for the peer to come back.
    pub fn is_restoring(&self) -> bool {
        self.reconnect_mode.load(Ordering::SeqCst)
    }

    /// Start a new incarnation under a fresh session id.
    pub fn set_new_session_id(&self) {
        *self.session_id.lock() = SessionId::random();
    }

    /// Send an ack for unacknowledged deliveries, if any.
    pub fn flush_delayed_ack(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.delivery.flush_ack(self)
    }

    /// Send the keepalive probes for one tick.
    pub fn send_keepalive(&self) {
        if !self.is_connected() {
            return;
        }
        let session = self.session();
        for body in self.liveness.next_probes() {
            self.transmit(OooFrame::control(session, -1, body));
        }
    }

    fn current_id(&self) -> ConnectionId {
        self.connection_id.read().clone()
    }

    fn notify_upper(&self, event: TransportEvent) {
        let id = self.current_id();
        self.upper.notify(&id, event);
    }

    fn reply(&self, body: FrameBody) {
        let frame = OooFrame::control(self.session(), self.delivery.receive_watermark(), body);
        self.transmit(frame);
    }

    /// Pretend the peer accepted a resume from `resume_from`.
    fn replay_from(&self, resume_from: i64) -> StackResult<()> {
        self.delivery.resume();
        let frame = OooFrame::control(
            self.session(),
            resume_from,
            FrameBody::HandshakeReplyOk { resume_from },
        );
        self.delivery.receive(self, &frame)
    }

    fn reset_stack(&self) {
        self.reconnect_mode.store(false, Ordering::SeqCst);
        self.delivery.pause();
        self.delivery.reset();
        self.delivery.start();
        self.delivery.pause();
    }

    fn drop_channel_connection(&self) {
        if self.channel_connected.swap(false, Ordering::SeqCst) {
            self.notify_upper(TransportEvent::Disconnected { forced: false });
        }
    }

    fn finish_handshake(&self) {
        self.handshake_mode.store(false, Ordering::SeqCst);
        if !self.channel_connected.swap(true, Ordering::SeqCst) {
            self.notify_upper(TransportEvent::Connected);
        } else {
            trace!(id = %self.current_id(), "resumed, channel already connected");
        }
        self.reconnect_mode.store(false, Ordering::SeqCst);
    }

    fn on_handshake(&self, frame: &OooFrame, client_ack: i64) -> StackResult<()> {
        if self.is_client {
            return Err(StackError::ProtocolViolation("handshake received by client".into()));
        }
        let ours = self.session();
        if frame.session_id.is_null() {
            debug!(id = %self.current_id(), "new client, handshake ok");
            self.reply(FrameBody::HandshakeReplyOk {
                resume_from: self.delivery.receive_watermark(),
            });
            self.replay_from(-1)?;
        } else if frame.session_id == ours {
            debug!(id = %self.current_id(), client_ack, "same session, handshake ok");
            self.reply(FrameBody::HandshakeReplyOk {
                resume_from: self.delivery.receive_watermark(),
            });
            self.replay_from(client_ack)?;
        } else {
            info!(
                id = %self.current_id(),
                theirs = %frame.session_id,
                %ours,
                "different session, requesting reset"
            );
            self.reply(FrameBody::HandshakeReplyFail {
                resume_from: self.delivery.receive_watermark(),
            });
            self.drop_channel_connection();
            self.reset_stack();
            self.replay_from(-1)?;
        }
        self.finish_handshake();
        Ok(())
    }

    fn on_reply_ok(&self, frame: &OooFrame) -> StackResult<()> {
        if !self.is_client || !self.handshake_mode.load(Ordering::SeqCst) {
            return Err(StackError::ProtocolViolation("unexpected handshake reply".into()));
        }
        debug!(id = %self.current_id(), session = %frame.session_id, "handshake ok");
        *self.session_id.lock() = frame.session_id;
        self.delivery.resume();
        self.delivery.receive(self, frame)?;
        self.finish_handshake();
        Ok(())
    }

    fn on_reply_fail(&self, frame: &OooFrame) -> StackResult<()> {
        if !self.is_client || !self.handshake_mode.load(Ordering::SeqCst) {
            return Err(StackError::ProtocolViolation("unexpected handshake reply".into()));
        }
        warn!(
            id = %self.current_id(),
            session = %frame.session_id,
            "server refused resume, starting new session"
        );
        self.reset_stack();
        *self.session_id.lock() = frame.session_id;
        self.replay_from(-1)?;
        self.drop_channel_connection();
        self.finish_handshake();
        Ok(())
    }

    fn on_goodbye(&self) {
        if !self.is_connected() {
            warn!(id = %self.current_id(), "goodbye before connect, ignored");
            return;
        }
        info!(id = %self.current_id(), "peer said goodbye");
        self.closed.store(true, Ordering::SeqCst);
        self.delivery.pause();
        if let Ok(send) = self.send_layer.get() {
            send.close();
        }
        if let Ok(receive) = self.receive_layer.get() {
            receive.close();
        }
    }
}

impl DeliveryContext for OooLayer {
    fn session_id(&self) -> SessionId {
        self.session()
    }

    fn transmit(&self, frame: OooFrame) -> bool {
        match self.send_layer.get() {
            Ok(send) if send.is_connected() => send.send(frame.encode()).is_ok(),
            _ => false,
        }
    }

    fn deliver(&self, message: Bytes) -> StackResult<()> {
        self.receive_layer.get()?.receive(&[message])
    }
}

impl NetworkLayer for OooLayer {
    fn set_send_layer(&self, layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        self.send_layer.set(layer);
        Ok(())
    }

    fn set_receive_layer(&self, layer: Weak<dyn NetworkLayer>) -> StackResult<()> {
        self.receive_layer.set(layer);
        Ok(())
    }

    fn send(&self, message: Bytes) -> StackResult<()> {
        if self.is_closed() {
            return Err(StackError::Closed);
        }
        // Refused before sequencing: a retained frame the peer cannot decode
        // would be replayed after every reconnect.
        if message.len() > MAX_OOO_PAYLOAD_SIZE {
            return Err(StackError::MessageTooLarge {
                len: message.len(),
                max: MAX_OOO_PAYLOAD_SIZE,
            });
        }
        self.delivery.send(self, message).map(|_| ())
    }

    fn receive(&self, buffers: &[Bytes]) -> StackResult<()> {
        let frame = OooFrame::decode(coalesce(buffers))?;
        self.liveness.record_activity();
        match &frame.body {
            FrameBody::Send(_) | FrameBody::Ack => {
                if frame.session_id != self.session() {
                    warn!(session = %frame.session_id, "dropping frame from old session");
                    return Ok(());
                }
                if self.handshake_mode.load(Ordering::SeqCst) {
                    return Err(StackError::ProtocolViolation(format!(
                        "{:?} frame while handshaking",
                        frame.kind()
                    )));
                }
                if !self.channel_connected.load(Ordering::SeqCst) {
                    warn!(id = %self.current_id(), "dropping stale frame");
                    return Ok(());
                }
                self.delivery.receive(self, &frame)
            }
            FrameBody::Handshake { resume_from } => self.on_handshake(&frame, *resume_from),
            FrameBody::HandshakeReplyOk { .. } => self.on_reply_ok(&frame),
            FrameBody::HandshakeReplyFail { .. } => self.on_reply_fail(&frame),
            FrameBody::Ping { timestamp } => {
                self.reply(FrameBody::PingReply {
                    timestamp: *timestamp,
                });
                Ok(())
            }
            FrameBody::PingReply { timestamp } => {
                self.liveness.on_ping_reply(*timestamp);
                Ok(())
            }
            FrameBody::TimeCheck { timestamp } => {
                self.liveness.on_time_check(*timestamp);
                Ok(())
            }
            FrameBody::Goodbye => {
                self.on_goodbye();
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.channel_connected.load(Ordering::SeqCst) && !self.delivery.is_paused()
    }

    fn open(&self) -> StackResult<ConnectionId> {
        self.send_layer.get()?.open()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_client {
            let goodbye = OooFrame::control(self.session(), -1, FrameBody::Goodbye);
            self.transmit(goodbye);
        }
        if let Ok(send) = self.send_layer.get() {
            send.close();
        }
        self.delivery.shutdown();
        self.delivery.reset();
    }
}

impl TransportEventListener for OooLayer {
    fn on_transport_event(&self, id: &ConnectionId, event: TransportEvent) {
        *self.connection_id.write() = id.clone();
        match event {
            TransportEvent::Connected => {
                // A new link starts its silence budget afresh.
                self.liveness.record_activity();
                self.handshake_mode.store(true, Ordering::SeqCst);
                if self.is_client {
                    let watermark = self.delivery.receive_watermark();
                    debug!(%id, watermark, "sending handshake");
                    let frame = OooFrame::control(
                        self.session(),
                        watermark,
                        FrameBody::Handshake {
                            resume_from: watermark,
                        },
                    );
                    self.transmit(frame);
                } else if !self.delivery.is_paused() {
                    // A missed disconnect; pause before the handshake arrives.
                    self.on_transport_event(id, TransportEvent::Disconnected { forced: false });
                    self.handshake_mode.store(true, Ordering::SeqCst);
                }
                self.reconnect_mode.store(false, Ordering::SeqCst);
            }
            TransportEvent::Disconnected { forced } => {
                let restoring = self.reconnect_mode.load(Ordering::SeqCst);
                debug!(%id, restoring, forced, "transport disconnected, pausing delivery");
                self.delivery.pause();
                if !restoring {
                    if self.channel_connected.swap(false, Ordering::SeqCst) {
                        self.upper.notify(id, TransportEvent::Disconnected { forced });
                    }
                }
            }
            TransportEvent::ConnectAttempt => {
                if !self.reconnect_mode.load(Ordering::SeqCst) {
                    self.upper.notify(id, event);
                }
            }
            TransportEvent::Closed => {
                self.channel_connected.store(false, Ordering::SeqCst);
                self.upper.notify(id, event);
            }
            TransportEvent::ReconnectionRejected => {
                self.upper.notify(id, event);
            }
        }
    }
}

impl RestorableLayer for OooLayer {
    fn start_restoring_connection(&self) {
        debug!(id = %self.current_id(), "entering restore mode");
        self.reconnect_mode.store(true, Ordering::SeqCst);
    }

    fn connection_restore_failed(&self) {
        info!(id = %self.current_id(), "restore window expired, resetting");
        self.drop_channel_connection();
        self.reconnect_mode.store(false, Ordering::SeqCst);
        self.delivery.pause();
        self.delivery.reset();
        self.delivery.start();
        self.delivery.pause();
        self.set_new_session_id();
    }
}

impl std::fmt::Debug for OooLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OooLayer")
            .field("is_client", &self.is_client)
            .field("session", &self.session())
            .field("connected", &self.is_connected())
            .finish()
    }
}
