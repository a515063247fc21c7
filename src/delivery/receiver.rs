//! Receive state machine.
//!
//! Delivers SEND payloads strictly in sequence order, exactly once, and
//! decides when an acknowledgment must go back to the peer. Delivery
//! itself happens in the caller, after the machine's lock is released.

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::core::constants::UNSET_SEQUENCE;

/// Receive machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePhase {
    /// Created, not started.
    Start,
    /// Accepting SEND frames.
    MessageWait,
    /// Link down; SEND frames are ignored.
    Paused,
}

/// How a SEND frame was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Next in sequence; delivered.
    Delivered,
    /// Already delivered.
    Duplicate,
    /// Ahead of the next expected sequence; dropped.
    Gap,
    /// Machine is paused; dropped.
    Ignored,
}

/// What the caller must do after a SEND frame was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveAction {
    /// Classification of the frame.
    pub outcome: ReceiveOutcome,
    /// Payload to hand upstream.
    pub deliver: Option<Bytes>,
    /// Acknowledgment to send back.
    pub ack: Option<i64>,
}

#[derive(Debug)]
struct ReceiveState {
    phase: ReceivePhase,
    /// Highest sequence delivered (R).
    received: i64,
    /// Highest sequence acknowledged to the peer.
    last_acked: i64,
}

/// Receive side of a once-and-only-once link.
#[derive(Debug)]
pub struct ReceiveStateMachine {
    state: Mutex<ReceiveState>,
    max_delayed_acks: i64,
}

impl ReceiveStateMachine {
    /// Create a machine that acks after `max_delayed_acks` deliveries.
    pub fn new(max_delayed_acks: u32) -> Self {
        Self {
            state: Mutex::new(ReceiveState {
                phase: ReceivePhase::Start,
                received: UNSET_SEQUENCE,
                last_acked: UNSET_SEQUENCE,
            }),
            max_delayed_acks: i64::from(max_delayed_acks.max(1)),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ReceivePhase {
        self.state.lock().phase
    }

    /// Highest sequence delivered.
    pub fn received_sequence(&self) -> i64 {
        self.state.lock().received
    }

    /// Begin accepting frames.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.phase == ReceivePhase::Start {
            state.phase = ReceivePhase::MessageWait;
        }
    }

    /// Stop accepting frames.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.phase != ReceivePhase::Paused {
            debug!(received = state.received, "receiver paused");
            state.phase = ReceivePhase::Paused;
        }
    }

    /// Accept frames again.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.phase == ReceivePhase::Paused {
            debug!(received = state.received, "receiver resumed");
            state.phase = ReceivePhase::MessageWait;
        }
    }

    /// Forget everything; next expected sequence is 0.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.phase = ReceivePhase::Start;
        state.received = UNSET_SEQUENCE;
        state.last_acked = UNSET_SEQUENCE;
    }

    /// Whether nothing was ever received.
    pub fn is_clean(&self) -> bool {
        let state = self.state.lock();
        state.received == UNSET_SEQUENCE && state.last_acked == UNSET_SEQUENCE
    }

    /// Acknowledgment to piggy-back on an outgoing frame.
    ///
    /// Everything delivered counts as acknowledged afterwards.
    pub fn ack_sequence(&self) -> i64 {
        let mut state = self.state.lock();
        state.last_acked = state.received;
        state.received
    }

    /// Acknowledgment owed to the peer, if deliveries are still unacked.
    pub fn pending_ack(&self) -> Option<i64> {
        let mut state = self.state.lock();
        if state.received > state.last_acked {
            state.last_acked = state.received;
            Some(state.received)
        } else {
            None
        }
    }

    /// Process one SEND frame.
    pub fn on_send(&self, sequence: i64, payload: Bytes) -> ReceiveAction {
        let mut state = self.state.lock();
        if state.phase == ReceivePhase::Start {
            state.phase = ReceivePhase::MessageWait;
        }
        if state.phase == ReceivePhase::Paused {
            trace!(sequence, "receiver paused, frame ignored");
            return ReceiveAction {
                outcome: ReceiveOutcome::Ignored,
                deliver: None,
                ack: None,
            };
        }

        let expected = state.received + 1;
        if sequence < expected {
            trace!(sequence, received = state.received, "duplicate frame");
            state.last_acked = state.received;
            return ReceiveAction {
                outcome: ReceiveOutcome::Duplicate,
                deliver: None,
                ack: Some(state.received),
            };
        }
        if sequence > expected {
            debug!(sequence, expected, "sequence gap, frame dropped");
            state.last_acked = state.received;
            return ReceiveAction {
                outcome: ReceiveOutcome::Gap,
                deliver: None,
                ack: Some(state.received),
            };
        }

        state.received = sequence;
        let ack = if state.received - state.last_acked >= self.max_delayed_acks {
            state.last_acked = state.received;
            Some(state.received)
        } else {
            None
        };
        ReceiveAction {
            outcome: ReceiveOutcome::Delivered,
            deliver: Some(payload),
            ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: i64) -> Bytes {
        Bytes::from(n.to_be_bytes().to_vec())
    }

    #[test]
    fn test_in_order_delivery() {
        let rx = ReceiveStateMachine::new(16);
        rx.start();
        for seq in 0..3 {
            let action = rx.on_send(seq, msg(seq));
            assert_eq!(action.outcome, ReceiveOutcome::Delivered);
            assert_eq!(action.deliver, Some(msg(seq)));
        }
        assert_eq!(rx.received_sequence(), 2);
    }

    #[test]
    fn test_duplicate_is_acked_not_delivered() {
        let rx = ReceiveStateMachine::new(1);
        let first = rx.on_send(0, msg(0));
        let second = rx.on_send(0, msg(0));
        assert!(first.deliver.is_some());
        assert!(second.deliver.is_none());
        assert_eq!(second.outcome, ReceiveOutcome::Duplicate);
        assert_eq!(first.ack, Some(0));
        assert_eq!(second.ack, Some(0));
    }

    #[test]
    fn test_gap_reacks_watermark() {
        let rx = ReceiveStateMachine::new(16);
        rx.on_send(0, msg(0));
        let action = rx.on_send(2, msg(2));
        assert_eq!(action.outcome, ReceiveOutcome::Gap);
        assert_eq!(action.ack, Some(0));
        assert!(action.deliver.is_none());
        assert_eq!(rx.received_sequence(), 0);
    }

    #[test]
    fn test_ack_batching() {
        let rx = ReceiveStateMachine::new(3);
        assert_eq!(rx.on_send(0, msg(0)).ack, None);
        assert_eq!(rx.on_send(1, msg(1)).ack, None);
        assert_eq!(rx.on_send(2, msg(2)).ack, Some(2));
        assert_eq!(rx.on_send(3, msg(3)).ack, None);
        assert_eq!(rx.pending_ack(), Some(3));
        assert_eq!(rx.pending_ack(), None);
    }

    #[test]
    fn test_piggy_back_folds_pending_ack() {
        let rx = ReceiveStateMachine::new(16);
        rx.on_send(0, msg(0));
        assert_eq!(rx.ack_sequence(), 0);
        assert_eq!(rx.pending_ack(), None);
    }

    #[test]
    fn test_pause_ignores_frames() {
        let rx = ReceiveStateMachine::new(16);
        rx.start();
        rx.pause();
        rx.pause();
        assert_eq!(rx.on_send(0, msg(0)).outcome, ReceiveOutcome::Ignored);
        rx.resume();
        rx.resume();
        assert_eq!(rx.phase(), ReceivePhase::MessageWait);
        assert_eq!(rx.on_send(0, msg(0)).outcome, ReceiveOutcome::Delivered);
    }

    #[test]
    fn test_reset_round_trip() {
        let rx = ReceiveStateMachine::new(1);
        assert!(rx.is_clean());
        rx.on_send(0, msg(0));
        rx.on_send(1, msg(1));
        assert!(!rx.is_clean());
        rx.reset();
        assert!(rx.is_clean());
        assert_eq!(rx.phase(), ReceivePhase::Start);
        assert_eq!(rx.on_send(0, msg(0)).outcome, ReceiveOutcome::Delivered);
    }
}
