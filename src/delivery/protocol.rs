//! Guaranteed-delivery facade.
//!
//! Pairs one [`SendStateMachine`] with one [`ReceiveStateMachine`] and routes
//! frames between them. The owning layer supplies a [`DeliveryContext`] on
//! each call, so the facade holds no reference back to it.

use bytes::Bytes;
use tracing::{debug, trace};

use super::frame::{FrameBody, OooFrame, SessionId};
use super::receiver::{ReceiveOutcome, ReceiveStateMachine};
use super::sender::{SendPhase, SendStateMachine};
use crate::core::{ReconnectConfig, StackError, StackResult};

/// What the delivery machines need from the layer that owns them.
pub trait DeliveryContext: Send + Sync {
    /// Session stamped on outgoing frames.
    fn session_id(&self) -> SessionId;

    /// Hand a frame to the layer below. `false` if the link is down.
    fn transmit(&self, frame: OooFrame) -> bool;

    /// Hand a payload to the layer above.
    fn deliver(&self, message: Bytes) -> StackResult<()>;
}

/// Exactly-once, in-order delivery over a resumable link.
#[derive(Debug)]
pub struct GuaranteedDelivery {
    sender: SendStateMachine,
    receiver: ReceiveStateMachine,
}

impl GuaranteedDelivery {
    /// Create both machines from the link's settings.
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            sender: SendStateMachine::new(config.send_queue_capacity(), config.send_window()),
            receiver: ReceiveStateMachine::new(config.max_delayed_acks()),
        }
    }

    /// The send machine.
    pub fn sender(&self) -> &SendStateMachine {
        &self.sender
    }

    /// The receive machine.
    pub fn receiver(&self) -> &ReceiveStateMachine {
        &self.receiver
    }

    /// Highest sequence delivered upstream.
    pub fn receive_watermark(&self) -> i64 {
        self.receiver.received_sequence()
    }

    /// Queue `message` (blocking while the queue is full) and transmit what
    /// the window allows.
    pub fn send(&self, ctx: &dyn DeliveryContext, message: Bytes) -> StackResult<i64> {
        let sequence = self.sender.put(message)?;
        self.sender.flush(ctx, &self.receiver);
        Ok(sequence)
    }

    /// Route one inbound frame.
    pub fn receive(&self, ctx: &dyn DeliveryContext, frame: &OooFrame) -> StackResult<()> {
        match &frame.body {
            FrameBody::Send(payload) => {
                if self.sender.on_ack(frame.ack_sequence)? {
                    self.sender.flush(ctx, &self.receiver);
                }
                let action = self.receiver.on_send(frame.sequence, payload.clone());
                if let Some(ack) = action.ack {
                    ctx.transmit(OooFrame::ack(ctx.session_id(), ack));
                }
                if action.outcome == ReceiveOutcome::Duplicate {
                    debug!(sequence = frame.sequence, "duplicate delivery suppressed");
                }
                if let Some(message) = action.deliver {
                    ctx.deliver(message)?;
                }
                Ok(())
            }
            FrameBody::Ack => {
                if self.sender.on_ack(frame.ack_sequence)? {
                    self.sender.flush(ctx, &self.receiver);
                }
                Ok(())
            }
            FrameBody::HandshakeReplyOk { resume_from } => {
                self.sender.handshake_ok(ctx, &self.receiver, *resume_from)
            }
            _ => Err(StackError::ProtocolViolation(format!(
                "{:?} frame routed to delivery",
                frame.kind()
            ))),
        }
    }

    /// Send an ack for deliveries not yet acknowledged. Returns whether one
    /// went out.
    pub fn flush_ack(&self, ctx: &dyn DeliveryContext) -> bool {
        if self.sender.phase() != SendPhase::Running {
            return false;
        }
        match self.receiver.pending_ack() {
            Some(ack) => {
                trace!(ack, "delayed ack flushed");
                ctx.transmit(OooFrame::ack(ctx.session_id(), ack))
            }
            None => false,
        }
    }

    /// Start both machines.
    pub fn start(&self) {
        self.sender.start();
        self.receiver.start();
    }

    /// Pause both machines.
    pub fn pause(&self) {
        self.sender.pause();
        self.receiver.pause();
    }

    /// Resume both machines.
    pub fn resume(&self) {
        self.sender.resume();
        self.receiver.resume();
    }

    /// Reset both machines; the next incarnation starts from sequence 0.
    pub fn reset(&self) {
        self.sender.reset();
        self.receiver.reset();
    }

    /// Fail pending and future sends.
    pub fn shutdown(&self) {
        self.sender.shutdown();
        self.receiver.pause();
    }

    /// Whether the send side is not transmitting.
    pub fn is_paused(&self) -> bool {
        self.sender.phase() != SendPhase::Running
    }

    /// Whether neither machine holds any state.
    pub fn is_clean(&self) -> bool {
        self.sender.is_clean() && self.receiver.is_clean()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;

    /// Records transmitted frames and delivered payloads.
    pub(crate) struct RecordingContext {
        session: SessionId,
        up: AtomicBool,
        frames: Mutex<Vec<OooFrame>>,
        delivered: Mutex<Vec<Bytes>>,
    }

    impl RecordingContext {
        pub(crate) fn new(session: SessionId) -> Self {
            Self {
                session,
                up: AtomicBool::new(true),
                frames: Mutex::new(Vec::new()),
                delivered: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn set_link_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }

        pub(crate) fn take_frames(&self) -> Vec<OooFrame> {
            std::mem::take(&mut *self.frames.lock())
        }

        pub(crate) fn take_delivered(&self) -> Vec<Bytes> {
            std::mem::take(&mut *self.delivered.lock())
        }
    }

    impl DeliveryContext for RecordingContext {
        fn session_id(&self) -> SessionId {
            self.session
        }

        fn transmit(&self, frame: OooFrame) -> bool {
            if !self.up.load(Ordering::SeqCst) {
                return false;
            }
            self.frames.lock().push(frame);
            true
        }

        fn deliver(&self, message: Bytes) -> StackResult<()> {
            self.delivered.lock().push(message);
            Ok(())
        }
    }

    fn config(max_delayed_acks: u32, window: usize) -> ReconnectConfig {
        ReconnectConfig::builder()
            .enabled(true)
            .max_delayed_acks(max_delayed_acks)
            .send_window(window)
            .send_queue_capacity(0)
            .build()
    }

    fn payload(n: usize) -> Bytes {
        Bytes::from(format!("m{n}"))
    }

    fn acks(frames: &[OooFrame]) -> Vec<i64> {
        frames
            .iter()
            .filter(|f| f.body == FrameBody::Ack)
            .map(|f| f.ack_sequence)
            .collect()
    }

    #[test]
    fn test_same_send_twice_delivers_once() {
        let session = SessionId::random();
        let ctx = RecordingContext::new(session);
        let delivery = GuaranteedDelivery::new(&config(1, 32));
        delivery.start();

        let frame = OooFrame::send(session, 0, -1, payload(0));
        delivery.receive(&ctx, &frame).unwrap();
        delivery.receive(&ctx, &frame).unwrap();

        assert_eq!(ctx.take_delivered(), vec![payload(0)]);
        assert_eq!(acks(&ctx.take_frames()), vec![0, 0]);
    }

    #[test]
    fn test_ack_batching_threshold() {
        let session = SessionId::random();
        let ctx = RecordingContext::new(session);
        let delivery = GuaranteedDelivery::new(&config(3, 32));
        delivery.start();

        for seq in 0..2 {
            delivery
                .receive(&ctx, &OooFrame::send(session, seq, -1, payload(seq as usize)))
                .unwrap();
        }
        assert!(acks(&ctx.take_frames()).is_empty());

        delivery.receive(&ctx, &OooFrame::send(session, 2, -1, payload(2))).unwrap();
        assert_eq!(acks(&ctx.take_frames()), vec![2]);
    }

    #[test]
    fn test_delayed_ack_flush() {
        let session = SessionId::random();
        let ctx = RecordingContext::new(session);
        let delivery = GuaranteedDelivery::new(&config(16, 32));
        delivery.start();
        delivery.receive(&ctx, &OooFrame::send(session, 0, -1, payload(0))).unwrap();

        assert!(delivery.flush_ack(&ctx));
        assert!(!delivery.flush_ack(&ctx));
        assert_eq!(acks(&ctx.take_frames()), vec![0]);
    }

    #[test]
    fn test_piggy_backed_ack_prunes_sender() {
        let session = SessionId::random();
        let ctx = RecordingContext::new(session);
        let delivery = GuaranteedDelivery::new(&config(16, 32));
        delivery.start();
        delivery.send(&ctx, payload(0)).unwrap();
        delivery.send(&ctx, payload(1)).unwrap();
        assert_eq!(delivery.sender().outstanding(), 2);

        delivery.receive(&ctx, &OooFrame::send(session, 0, 1, payload(9))).unwrap();
        assert_eq!(delivery.sender().outstanding(), 0);
        assert_eq!(ctx.take_delivered(), vec![payload(9)]);
    }

    #[test]
    fn test_unexpected_kinds_are_violations() {
        let ctx = RecordingContext::new(SessionId::random());
        let delivery = GuaranteedDelivery::new(&config(16, 32));
        delivery.start();
        for body in [
            FrameBody::Handshake { resume_from: -1 },
            FrameBody::HandshakeReplyFail { resume_from: -1 },
            FrameBody::Ping { timestamp: 0 },
            FrameBody::Goodbye,
        ] {
            let err = delivery
                .receive(&ctx, &OooFrame::control(SessionId::NULL, -1, body))
                .unwrap_err();
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_pause_resume_idempotent() {
        let delivery = GuaranteedDelivery::new(&config(16, 32));
        delivery.start();
        delivery.pause();
        delivery.pause();
        assert!(delivery.is_paused());
        delivery.resume();
        delivery.resume();
        assert!(!delivery.is_paused());
    }

    #[test]
    fn test_reset_is_clean() {
        let session = SessionId::random();
        let ctx = RecordingContext::new(session);
        let delivery = GuaranteedDelivery::new(&config(16, 32));
        delivery.start();
        delivery.send(&ctx, payload(0)).unwrap();
        delivery.receive(&ctx, &OooFrame::send(session, 0, -1, payload(0))).unwrap();
        assert!(!delivery.is_clean());

        delivery.reset();
        assert!(delivery.is_clean());
        assert_eq!(delivery.send(&ctx, payload(1)).unwrap(), 0);
    }

    const N: usize = 12;

    proptest! {
        #[test]
        fn test_any_arrival_order_delivers_in_sequence(
            order in Just((0..N).collect::<Vec<usize>>()).prop_shuffle()
        ) {
            let session = SessionId::random();
            let tx_ctx = RecordingContext::new(session);
            let rx_ctx = RecordingContext::new(session);
            let tx = GuaranteedDelivery::new(&config(1, N));
            let rx = GuaranteedDelivery::new(&config(1, N));
            tx.start();
            rx.start();

            for n in 0..N {
                tx.send(&tx_ctx, payload(n)).unwrap();
            }
            let first = tx_ctx.take_frames();
            prop_assert_eq!(first.len(), N);
            for idx in &order {
                rx.receive(&rx_ctx, &first[*idx]).unwrap();
            }

            for _ in 0..N {
                let watermark = rx.receive_watermark();
                if watermark == N as i64 - 1 {
                    break;
                }
                let reply = OooFrame::control(
                    session,
                    watermark,
                    FrameBody::HandshakeReplyOk { resume_from: watermark },
                );
                tx.receive(&tx_ctx, &reply).unwrap();
                for frame in tx_ctx.take_frames() {
                    rx.receive(&rx_ctx, &frame).unwrap();
                }
            }

            let expected: Vec<Bytes> = (0..N).map(payload).collect();
            prop_assert_eq!(rx_ctx.take_delivered(), expected);
        }
    }
}
