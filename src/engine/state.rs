//! Engine-owned scheduling state
//!
//! Everything the controller, the dispatch loop and the output recognizers
//! share lives in one [`EngineState`] behind the engine mutex: the goal
//! correlator, the host's mirror of the worker's evaluation stack, open
//! callbacks, per-context mailboxes and the availability flags.

use parking_lot::Condvar;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::correlator::Correlator;
use super::protocol::{CallbackOutcomePayload, CallbackRequestPayload, GoalId, Payload};
use super::solutions::Handoff;

/// Identity of an execution context (a host thread)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(ThreadId);

impl ContextId {
    /// Context of the calling thread.
    pub fn current() -> Self {
        Self(thread::current().id())
    }
}

/// One entry of the worker's evaluation stack, as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Frame {
    Goal(GoalId),
    Callback(u64),
}

/// Callback received from the worker and not yet answered
#[derive(Debug)]
pub(crate) struct OpenCallback {
    pub(crate) seq: u64,
    pub(crate) outcome: Option<CallbackOutcomePayload>,
}

/// Callback waiting to run on a specific context
#[derive(Debug)]
pub(crate) struct CallbackJob {
    pub(crate) seq: u64,
    pub(crate) request: CallbackRequestPayload,
}

/// Per-context mailbox and bookkeeping
#[derive(Debug, Default)]
pub(crate) struct ContextSlot {
    pub(crate) condvar: Arc<Condvar>,
    pub(crate) jobs: VecDeque<CallbackJob>,
    pub(crate) callback_depth: usize,
    pub(crate) waiting: usize,
}

/// Mutable engine state, guarded by the engine mutex
#[derive(Debug, Default)]
pub struct EngineState {
    /// Worker is quiescent and can accept new input
    pub available: bool,
    /// Worker is in a nested break level
    pub paused: bool,
    /// `shutdown()` has started
    pub shutting_down: bool,
    /// Reason the engine was disabled by a transport failure
    pub failure: Option<String>,
    /// Worker's structured goal loop is listening
    pub goal_loop_started: bool,
    /// Goal-loop command sent, announcement not yet received
    pub bootstrap_pending: bool,
    /// Worker has written and now waits for exactly one object
    pub worker_waiting: bool,
    /// The running goal loop has sent something beyond its announcement
    pub loop_traffic: bool,
    /// Goal registry
    pub correlator: Correlator,
    pub(crate) stack: Vec<Frame>,
    pub(crate) callbacks: Vec<OpenCallback>,
    pub(crate) contexts: HashMap<ContextId, ContextSlot>,
    pub(crate) bare_in_flight: usize,
    pub(crate) iterator: Option<Arc<Handoff>>,
    next_callback_seq: u64,
}

/// Point-in-time view of an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    /// Worker is quiescent and can accept new input
    pub available: bool,
    /// Worker is in a nested break level
    pub paused: bool,
    /// No open goals and no open callbacks
    pub idle: bool,
    /// Goals submitted and not yet collected
    pub open_goals: usize,
    /// Goals currently in the worker's hands
    pub dispatched_goals: usize,
    /// Callbacks received and not yet answered
    pub open_callbacks: usize,
    /// Worker's goal loop is listening
    pub goal_loop_started: bool,
    /// `shutdown()` has started
    pub shutting_down: bool,
    /// Transport failure that disabled the engine
    pub failure: Option<String>,
}

impl EngineState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// No open goals and no open callbacks.
    pub fn is_idle(&self) -> bool {
        self.correlator.open_count() == 0 && self.callbacks.is_empty()
    }

    pub(crate) fn status(&self) -> EngineStatus {
        EngineStatus {
            available: self.available,
            paused: self.paused,
            idle: self.is_idle(),
            open_goals: self.correlator.open_count(),
            dispatched_goals: self.correlator.dispatched_count(),
            open_callbacks: self.callbacks.len(),
            goal_loop_started: self.goal_loop_started,
            shutting_down: self.shutting_down,
            failure: self.failure.clone(),
        }
    }

    /// Whether `context` is currently executing a callback.
    pub(crate) fn is_nested(&self, context: ContextId) -> bool {
        self.contexts
            .get(&context)
            .is_some_and(|slot| slot.callback_depth > 0)
    }

    pub(crate) fn slot(&mut self, context: ContextId) -> &mut ContextSlot {
        self.contexts.entry(context).or_default()
    }

    pub(crate) fn condvar(&mut self, context: ContextId) -> Arc<Condvar> {
        self.slot(context).condvar.clone()
    }

    /// Drop a context's slot once nothing references it.
    pub(crate) fn release_slot(&mut self, context: ContextId) {
        let unused = self.contexts.get(&context).is_some_and(|slot| {
            slot.callback_depth == 0 && slot.waiting == 0 && slot.jobs.is_empty()
        });
        if unused {
            self.contexts.remove(&context);
        }
    }

    pub(crate) fn wake(&self, context: ContextId) {
        if let Some(slot) = self.contexts.get(&context) {
            slot.condvar.notify_one();
        }
    }

    pub(crate) fn wake_all(&self) {
        for slot in self.contexts.values() {
            slot.condvar.notify_all();
        }
    }

    /// Record an incoming callback request on the worker stack.
    pub(crate) fn open_callback(&mut self) -> u64 {
        self.next_callback_seq += 1;
        let seq = self.next_callback_seq;
        self.callbacks.push(OpenCallback { seq, outcome: None });
        self.stack.push(Frame::Callback(seq));
        self.worker_waiting = true;
        self.loop_traffic = true;
        seq
    }

    /// Attach the outcome of a finished callback. Returns `false` when the
    /// callback was discarded by a cascade in the meantime.
    pub(crate) fn finish_callback(&mut self, seq: u64, outcome: CallbackOutcomePayload) -> bool {
        match self.callbacks.iter_mut().find(|open| open.seq == seq) {
            Some(open) => {
                open.outcome = Some(outcome);
                true
            }
            None => false,
        }
    }

    /// Pop a goal frame after its result arrived.
    pub(crate) fn close_goal_frame(&mut self, id: GoalId) {
        if let Some(index) = self.stack.iter().rposition(|frame| *frame == Frame::Goal(id)) {
            self.stack.remove(index);
        }
        self.worker_waiting = true;
        if self.correlator.dispatched_count() == 0 && self.goal_loop_started {
            self.available = true;
        }
    }

    /// Decide the single object owed to a waiting worker, if any.
    ///
    /// A finished callback on top of the stack is answered first; otherwise
    /// the most recently queued goal is dispatched.
    pub(crate) fn next_outbound(&mut self) -> Option<Payload> {
        if !self.worker_waiting || self.shutting_down || self.failure.is_some() {
            return None;
        }

        if let Some(Frame::Callback(seq)) = self.stack.last().copied() {
            let ready = self
                .callbacks
                .iter()
                .position(|open| open.seq == seq && open.outcome.is_some());
            if let Some(index) = ready {
                let open = self.callbacks.remove(index);
                self.stack.pop();
                self.worker_waiting = false;
                return open.outcome.map(Payload::CallbackOutcome);
            }
        }

        if !self.goal_loop_started {
            return None;
        }

        let id = self.correlator.most_recent_undispatched()?.id;
        let payload = self.correlator.dispatch(id)?;
        self.stack.push(Frame::Goal(id));
        self.worker_waiting = false;
        self.available = false;
        Some(Payload::Goal(payload))
    }

    /// Forget everything the worker was doing: stack, callbacks, mailboxes.
    pub(crate) fn reset_worker_view(&mut self) {
        self.stack.clear();
        self.callbacks.clear();
        for slot in self.contexts.values_mut() {
            slot.jobs.clear();
        }
        self.worker_waiting = false;
        self.goal_loop_started = false;
        self.bootstrap_pending = false;
        self.loop_traffic = false;
    }

    /// Abort all open goals and discard worker-side state.
    pub(crate) fn abort_all(&mut self, reason: &str) -> Vec<ContextId> {
        let woken = self.correlator.abort_all(reason);
        self.settle_cascade();
        woken
    }

    /// Interrupt all open goals and discard worker-side state.
    pub(crate) fn interrupt_all(&mut self, reason: &str) -> Vec<ContextId> {
        let woken = self.correlator.interrupt_all(reason);
        self.settle_cascade();
        woken
    }

    /// Fail all open goals after a transport failure.
    pub(crate) fn fail_all(&mut self, reason: &str) -> Vec<ContextId> {
        let woken = self.correlator.fail_all(reason);
        self.settle_cascade();
        woken
    }

    fn settle_cascade(&mut self) {
        self.reset_worker_view();
        self.wake_all();
        if let Some(handoff) = &self.iterator {
            handoff.abandon();
        }
    }
}
