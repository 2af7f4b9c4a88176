//! Goal bookkeeping and result correlation
//!
//! Assigns monotonic goal identifiers, tracks every goal from submission to
//! delivery, and matches asynchronous results back to the context waiting
//! for them. Lives inside the engine state mutex; it is not synchronised on
//! its own.

use super::error::{EngineError, EngineResult};
use super::protocol::{GoalId, GoalPayload, OutputSpec, ResultPayload};
use super::state::ContextId;
use super::term::Term;

/// Lifecycle of a goal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalState {
    /// Submitted, not yet sent to the worker
    Queued,
    /// Sent to the worker, no result yet
    Dispatched,
    /// Result attached, waiting to be collected
    Completed,
}

/// How a goal ended
#[derive(Debug, Clone, PartialEq)]
pub enum GoalOutcome {
    /// The worker answered
    Reply(ResultPayload),
    /// Cancelled by an abort cascade
    Aborted(String),
    /// Cancelled by an interrupt cascade
    Interrupted(String),
    /// The transport failed underneath the goal
    TransportFailed(String),
}

/// A unit of work submitted by the host
#[derive(Debug, Clone)]
pub struct Goal {
    /// Goal identifier
    pub id: GoalId,
    /// Worker-native code
    pub code: String,
    /// Input bindings
    pub inputs: Vec<Term>,
    /// Expected result variables
    pub output: OutputSpec,
    /// Lifecycle state
    pub state: GoalState,
    /// Outcome, once completed
    pub outcome: Option<GoalOutcome>,
    /// Context that issued the goal
    pub context: ContextId,
    /// Whether the goal holds the engine's bare-goal admission slot
    pub bare: bool,
    dispatch_seq: u64,
}

impl Goal {
    /// Create a queued goal.
    pub fn new(
        id: GoalId,
        code: String,
        inputs: Vec<Term>,
        output: OutputSpec,
        context: ContextId,
        bare: bool,
    ) -> Self {
        Self {
            id,
            code,
            inputs,
            output,
            state: GoalState::Queued,
            outcome: None,
            context,
            bare,
            dispatch_seq: 0,
        }
    }

    /// Wire form of this goal.
    pub fn to_payload(&self) -> GoalPayload {
        GoalPayload {
            id: self.id,
            code: self.code.clone(),
            inputs: self.inputs.clone(),
            output: self.output.clone(),
        }
    }
}

/// Kind of cascade applied to all open goals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cascade {
    /// Host-initiated abort (shutdown, worker back at top level)
    Abort,
    /// Host-initiated interrupt
    Interrupt,
    /// Fatal transport failure
    TransportFailure,
}

/// Goal registry keyed by id
#[derive(Debug, Default)]
pub struct Correlator {
    goals: Vec<Goal>,
    last_id: u64,
    dispatch_seq: u64,
}

impl Correlator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a correlator whose next id follows `last_id`.
    pub fn starting_after(last_id: u64) -> Self {
        Self {
            last_id,
            ..Self::default()
        }
    }

    /// Allocate the next goal id. Wraparound is fatal.
    pub fn next_id(&mut self) -> EngineResult<GoalId> {
        let next = self
            .last_id
            .checked_add(1)
            .ok_or(EngineError::IdSpaceExhausted(GoalId(self.last_id)))?;
        self.last_id = next;
        Ok(GoalId(next))
    }

    /// Record a goal as queued and discoverable by id.
    pub fn submit(&mut self, goal: Goal) {
        self.goals.push(goal);
    }

    /// Look up a live goal.
    pub fn get(&self, id: GoalId) -> Option<&Goal> {
        self.goals.iter().find(|goal| goal.id == id)
    }

    /// Mark a queued goal as sent; returns its wire form.
    pub fn dispatch(&mut self, id: GoalId) -> Option<GoalPayload> {
        self.dispatch_seq += 1;
        let seq = self.dispatch_seq;
        let goal = self
            .goals
            .iter_mut()
            .find(|goal| goal.id == id && goal.state == GoalState::Queued)?;
        goal.state = GoalState::Dispatched;
        goal.dispatch_seq = seq;
        Some(goal.to_payload())
    }

    /// Attach a result and mark the goal completed.
    ///
    /// Returns the context to wake, or `None` when the id is unknown or the
    /// goal already completed.
    pub fn complete(&mut self, id: GoalId, outcome: GoalOutcome) -> Option<ContextId> {
        let goal = self
            .goals
            .iter_mut()
            .find(|goal| goal.id == id && goal.state != GoalState::Completed)?;
        goal.state = GoalState::Completed;
        goal.outcome = Some(outcome);
        Some(goal.context)
    }

    /// Most recently submitted goal that has not been sent.
    pub fn most_recent_undispatched(&self) -> Option<&Goal> {
        self.goals
            .iter()
            .rev()
            .find(|goal| goal.state == GoalState::Queued)
    }

    /// Most recently dispatched goal that has not completed.
    pub fn most_recent_running(&self) -> Option<&Goal> {
        self.goals
            .iter()
            .filter(|goal| goal.state == GoalState::Dispatched)
            .max_by_key(|goal| goal.dispatch_seq)
    }

    /// Take the outcome of a completed goal, forgetting it.
    pub fn take_outcome(&mut self, id: GoalId) -> Option<(Goal, GoalOutcome)> {
        let mut goal = self.forget(id)?;
        let outcome = goal.outcome.take()?;
        Some((goal, outcome))
    }

    /// Remove a completed goal from the live set. Open goals stay put.
    pub fn forget(&mut self, id: GoalId) -> Option<Goal> {
        let index = self
            .goals
            .iter()
            .position(|goal| goal.id == id && goal.state == GoalState::Completed)?;
        Some(self.goals.remove(index))
    }

    /// Resolve every open goal with a synthetic outcome, most recent first.
    ///
    /// Returns the contexts to wake, in the same order.
    fn cascade(&mut self, kind: Cascade, reason: &str) -> Vec<ContextId> {
        let mut woken = Vec::new();
        for goal in self.goals.iter_mut().rev() {
            if goal.state == GoalState::Completed {
                continue;
            }
            goal.state = GoalState::Completed;
            goal.outcome = Some(match kind {
                Cascade::Abort => GoalOutcome::Aborted(reason.to_string()),
                Cascade::Interrupt => GoalOutcome::Interrupted(reason.to_string()),
                Cascade::TransportFailure => GoalOutcome::TransportFailed(reason.to_string()),
            });
            woken.push(goal.context);
        }
        woken
    }

    /// Abort all open goals.
    pub fn abort_all(&mut self, reason: &str) -> Vec<ContextId> {
        self.cascade(Cascade::Abort, reason)
    }

    /// Interrupt all open goals.
    pub fn interrupt_all(&mut self, reason: &str) -> Vec<ContextId> {
        self.cascade(Cascade::Interrupt, reason)
    }

    /// Fail all open goals after the transport broke.
    pub fn fail_all(&mut self, reason: &str) -> Vec<ContextId> {
        self.cascade(Cascade::TransportFailure, reason)
    }

    /// Abort only goals already handed to the worker.
    pub fn abort_dispatched(&mut self, reason: &str) -> Vec<ContextId> {
        let mut woken = Vec::new();
        for goal in self.goals.iter_mut().rev() {
            if goal.state == GoalState::Dispatched {
                goal.state = GoalState::Completed;
                goal.outcome = Some(GoalOutcome::Aborted(reason.to_string()));
                woken.push(goal.context);
            }
        }
        woken
    }

    /// Goals not yet completed.
    pub fn open_count(&self) -> usize {
        self.goals
            .iter()
            .filter(|goal| goal.state != GoalState::Completed)
            .count()
    }

    /// Goals currently in the worker's hands.
    pub fn dispatched_count(&self) -> usize {
        self.goals
            .iter()
            .filter(|goal| goal.state == GoalState::Dispatched)
            .count()
    }

    /// Whether any goal waits to be sent.
    pub fn has_queued(&self) -> bool {
        self.goals.iter().any(|goal| goal.state == GoalState::Queued)
    }
}
