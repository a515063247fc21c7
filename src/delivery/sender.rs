//! Send state machine.
//!
//! Assigns sequence numbers, keeps every transmitted frame until the peer
//! acknowledges it, and replays the retained window after a successful
//! resume handshake.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, trace};

use super::frame::OooFrame;
use super::protocol::DeliveryContext;
use super::receiver::ReceiveStateMachine;
use crate::core::constants::UNSET_SEQUENCE;
use crate::core::{StackError, StackResult};

/// Send machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    /// Created, not started.
    Start,
    /// Transmitting.
    Running,
    /// Link down; messages queue up.
    Paused,
    /// Shut down; `put` fails.
    Closed,
}

#[derive(Debug)]
struct SendState {
    phase: SendPhase,
    next_sequence: i64,
    last_sent: i64,
    acked: i64,
    /// Sequenced but never transmitted.
    queue: VecDeque<(i64, Bytes)>,
    /// Transmitted, awaiting acknowledgment.
    window: VecDeque<(i64, Bytes)>,
}

impl SendState {
    fn fresh(phase: SendPhase) -> Self {
        Self {
            phase,
            next_sequence: 0,
            last_sent: UNSET_SEQUENCE,
            acked: UNSET_SEQUENCE,
            queue: VecDeque::new(),
            window: VecDeque::new(),
        }
    }

    fn prune(&mut self, ack: i64) -> StackResult<bool> {
        if ack <= self.acked {
            return Ok(false);
        }
        if ack > self.last_sent {
            return Err(StackError::ProtocolViolation(format!(
                "ack {ack} beyond last sent {}",
                self.last_sent
            )));
        }
        self.acked = ack;
        while self.window.front().is_some_and(|(seq, _)| *seq <= ack) {
            self.window.pop_front();
        }
        Ok(true)
    }
}

/// Send side of a once-and-only-once link.
#[derive(Debug)]
pub struct SendStateMachine {
    state: Mutex<SendState>,
    space: Condvar,
    queue_capacity: usize,
    window_size: usize,
}

impl SendStateMachine {
    /// Create a machine; `queue_capacity` 0 means unbounded.
    pub fn new(queue_capacity: usize, window_size: usize) -> Self {
        Self {
            state: Mutex::new(SendState::fresh(SendPhase::Start)),
            space: Condvar::new(),
            queue_capacity,
            window_size: window_size.max(1),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SendPhase {
        self.state.lock().phase
    }

    /// Highest sequence acknowledged by the peer.
    pub fn acked_sequence(&self) -> i64 {
        self.state.lock().acked
    }

    /// Messages not yet acknowledged (queued plus in flight).
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + state.window.len()
    }

    /// Whether nothing was ever sequenced.
    pub fn is_clean(&self) -> bool {
        let state = self.state.lock();
        state.next_sequence == 0 && state.queue.is_empty() && state.window.is_empty()
    }

    /// Begin transmitting.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.phase == SendPhase::Start {
            state.phase = SendPhase::Running;
        }
    }

    /// Stop transmitting; retained frames wait for the next handshake.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if matches!(state.phase, SendPhase::Running | SendPhase::Start) {
            debug!(last_sent = state.last_sent, acked = state.acked, "sender paused");
            state.phase = SendPhase::Paused;
        }
    }

    /// Allow transmission again.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.phase == SendPhase::Paused {
            debug!(last_sent = state.last_sent, acked = state.acked, "sender resumed");
            state.phase = SendPhase::Running;
        }
    }

    /// Drop everything and restart numbering at 0.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let phase = if state.phase == SendPhase::Closed {
            SendPhase::Closed
        } else {
            SendPhase::Start
        };
        *state = SendState::fresh(phase);
        self.space.notify_all();
    }

    /// Fail current and future `put` calls.
    pub fn shutdown(&self) {
        self.state.lock().phase = SendPhase::Closed;
        self.space.notify_all();
    }

    /// Sequence a message, blocking while the queue is full.
    ///
    /// A full queue on a current-thread runtime fails with
    /// [`StackError::Unsupported`]: the task that would drain it could never
    /// run. On a multi-thread runtime the wait moves off the worker.
    pub fn put(&self, message: Bytes) -> StackResult<i64> {
        let mut state = self.state.lock();
        loop {
            if state.phase == SendPhase::Closed {
                return Err(StackError::Closed);
            }
            if self.queue_capacity == 0 || state.queue.len() < self.queue_capacity {
                break;
            }
            // Woken waiters re-check; another sender may have taken the slot.
            self.wait_for_space(&mut state)?;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.queue.push_back((sequence, message));
        trace!(sequence, queued = state.queue.len(), "message queued");
        Ok(sequence)
    }

    fn wait_for_space(&self, state: &mut MutexGuard<'_, SendState>) -> StackResult<()> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => Err(
                StackError::Unsupported("blocking send on a current-thread runtime"),
            ),
            Ok(_) => {
                tokio::task::block_in_place(|| self.space.wait(state));
                Ok(())
            }
            Err(_) => {
                self.space.wait(state);
                Ok(())
            }
        }
    }

    /// Move queued messages into the window while it has room.
    ///
    /// Returns the number of frames transmitted.
    pub fn flush(&self, ctx: &dyn DeliveryContext, receiver: &ReceiveStateMachine) -> usize {
        let mut state = self.state.lock();
        if state.phase != SendPhase::Running {
            return 0;
        }
        let mut sent = 0;
        while state.window.len() < self.window_size {
            let Some((sequence, payload)) = state.queue.pop_front() else {
                break;
            };
            let frame = OooFrame::send(
                ctx.session_id(),
                sequence,
                receiver.ack_sequence(),
                payload.clone(),
            );
            state.window.push_back((sequence, payload));
            state.last_sent = sequence;
            sent += 1;
            if !ctx.transmit(frame) {
                // Retained; goes out again on the next handshake.
                break;
            }
        }
        if sent > 0 {
            self.space.notify_all();
        }
        sent
    }

    /// Apply an acknowledgment. Returns whether it advanced.
    pub fn on_ack(&self, ack: i64) -> StackResult<bool> {
        let mut state = self.state.lock();
        let advanced = state.prune(ack)?;
        if advanced {
            trace!(ack, in_flight = state.window.len(), "ack applied");
        }
        Ok(advanced)
    }

    /// Apply a successful resume: prune up to `resume_from`, replay the
    /// whole remaining window in order, then flush the queue.
    pub fn handshake_ok(
        &self,
        ctx: &dyn DeliveryContext,
        receiver: &ReceiveStateMachine,
        resume_from: i64,
    ) -> StackResult<()> {
        {
            let mut state = self.state.lock();
            state.prune(resume_from)?;
            if state.phase == SendPhase::Closed {
                return Err(StackError::Closed);
            }
            state.phase = SendPhase::Running;
            debug!(
                resume_from,
                replay = state.window.len(),
                queued = state.queue.len(),
                "replaying retained window"
            );
            let session = ctx.session_id();
            for (sequence, payload) in &state.window {
                let frame = OooFrame::send(session, *sequence, receiver.ack_sequence(), payload.clone());
                if !ctx.transmit(frame) {
                    break;
                }
            }
        }
        self.flush(ctx, receiver);
        Ok(())
    }
}
