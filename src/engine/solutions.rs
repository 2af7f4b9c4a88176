//! Lazy iteration over the solutions of a nondeterministic goal
//!
//! The user's goal is wrapped (see [`Capabilities::wrap_solutions`]) so that
//! the worker calls back into a collector object once per solution. The
//! collector's `record` handler parks the worker until the consumer pulls
//! the solution, then answers `continue` or `stop`.
//!
//! [`Capabilities::wrap_solutions`]: super::capabilities::Capabilities::wrap_solutions

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::error::{EngineError, EngineResult};
use super::protocol::{GoalId, OutputSpec};
use super::registry::{HostRegistry, ParamType, Returned};
use super::term::{ObjectId, Term};
use super::{Bindings, Engine};

/// Registered type name of solution collectors
pub const COLLECTOR_TYPE: &str = "$solution_collector";

/// Answer given to the worker after each recorded solution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Continue,
    Stop,
}

impl Decision {
    fn to_term(self) -> Term {
        match self {
            Decision::Continue => Term::atom("continue"),
            Decision::Stop => Term::atom("stop"),
        }
    }
}

#[derive(Debug, Default)]
struct HandoffSlot {
    pending: Option<Vec<Term>>,
    error: Option<Term>,
    reply: Option<Decision>,
    finished: Option<EngineResult<()>>,
    goal: Option<GoalId>,
    stop: bool,
    abandoned: bool,
}

enum HandoffEvent {
    Solution(Vec<Term>),
    Error(Term),
    Finished(EngineResult<()>),
}

/// Rendezvous between the worker's `record` callbacks and the consumer
#[derive(Debug, Default)]
pub(crate) struct Handoff {
    slot: Mutex<HandoffSlot>,
    ready: Condvar,
}

impl Handoff {
    /// Producer side: publish a solution and wait for the consumer's answer.
    fn record(&self, values: Vec<Term>) -> Decision {
        let mut slot = self.slot.lock();
        if slot.stop || slot.abandoned {
            return Decision::Stop;
        }
        slot.pending = Some(values);
        slot.reply = None;
        self.ready.notify_all();

        while slot.reply.is_none() && !slot.stop && !slot.abandoned {
            self.ready.wait(&mut slot);
        }
        if slot.stop || slot.abandoned {
            slot.pending = None;
            return Decision::Stop;
        }
        slot.reply.take().unwrap_or(Decision::Stop)
    }

    fn record_error(&self, error: Term) {
        let mut slot = self.slot.lock();
        slot.error = Some(error);
        self.ready.notify_all();
    }

    fn set_goal(&self, id: GoalId) {
        self.slot.lock().goal = Some(id);
    }

    fn goal(&self) -> GoalId {
        self.slot.lock().goal.unwrap_or(GoalId(0))
    }

    fn finish(&self, result: EngineResult<()>) {
        let mut slot = self.slot.lock();
        slot.finished = Some(result);
        self.ready.notify_all();
    }

    fn answer(&self, decision: Decision) {
        let mut slot = self.slot.lock();
        slot.reply = Some(decision);
        self.ready.notify_all();
    }

    fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.stop = true;
        self.ready.notify_all();
    }

    /// Release a parked producer after an engine-wide cascade.
    pub(crate) fn abandon(&self) {
        let mut slot = self.slot.lock();
        slot.abandoned = true;
        self.ready.notify_all();
    }

    fn next_event(&self) -> HandoffEvent {
        let mut slot = self.slot.lock();
        loop {
            if !slot.abandoned {
                if let Some(values) = slot.pending.take() {
                    return HandoffEvent::Solution(values);
                }
            }
            if let Some(error) = slot.error.take() {
                return HandoffEvent::Error(error);
            }
            if let Some(result) = slot.finished.take() {
                return HandoffEvent::Finished(result);
            }
            self.ready.wait(&mut slot);
        }
    }
}

/// Register the collector operations on a fresh registry.
pub(crate) fn register_collector(registry: &HostRegistry) {
    registry.register_operation(COLLECTOR_TYPE, "record", vec![ParamType::List], |inv| {
        let handoff = inv.receiver_as::<Handoff>()?;
        let values = inv.term(0)?.as_list().unwrap_or_default().to_vec();
        Ok(Returned::Value(handoff.record(values).to_term()))
    });
    registry.register_operation(COLLECTOR_TYPE, "record_error", vec![ParamType::Any], |inv| {
        let handoff = inv.receiver_as::<Handoff>()?;
        handoff.record_error(inv.term(0)?.clone());
        Ok(Returned::Nothing)
    });
}

/// Iterator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolutionPhase {
    /// Search goal not issued yet
    NotStarted,
    /// Worker is looking for the next solution
    Searching,
    /// A solution is buffered
    SolutionReady,
    /// No more solutions
    Exhausted,
    /// Stopped by the consumer
    Cancelled,
    /// The search raised an error
    Failed,
}

/// Pull-based sequence of solutions for one goal
///
/// Only one iterator may be active per engine; dropping it cancels the
/// search.
pub struct SolutionIterator {
    engine: Engine,
    handoff: Arc<Handoff>,
    collector: ObjectId,
    code: String,
    inputs: Vec<Term>,
    output: OutputSpec,
    phase: SolutionPhase,
    buffered: Option<Vec<Term>>,
    failure: Option<EngineError>,
    search: Option<JoinHandle<()>>,
    released: bool,
}

impl SolutionIterator {
    pub(crate) fn new(
        engine: Engine,
        handoff: Arc<Handoff>,
        collector: ObjectId,
        code: String,
        inputs: Vec<Term>,
        output: OutputSpec,
    ) -> Self {
        Self {
            engine,
            handoff,
            collector,
            code,
            inputs,
            output,
            phase: SolutionPhase::NotStarted,
            buffered: None,
            failure: None,
            search: None,
            released: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SolutionPhase {
        self.phase
    }

    fn start(&mut self) {
        let engine = self.engine.clone();
        let handoff = self.handoff.clone();
        let code = self
            .engine
            .capabilities()
            .wrap_solutions(&self.code, self.collector, &self.output);
        let inputs = std::mem::take(&mut self.inputs);

        let spawned = thread::Builder::new()
            .name("termbridge-search".to_string())
            .spawn(move || {
                let result = engine
                    .inner
                    .submit_goal(code, inputs, OutputSpec::empty(), true)
                    .and_then(|id| {
                        handoff.set_goal(id);
                        engine.inner.await_goal(id)
                    });
                handoff.finish(result.map(|_| ()));
            });

        match spawned {
            Ok(handle) => {
                self.search = Some(handle);
                self.phase = SolutionPhase::Searching;
            }
            Err(err) => {
                self.failure = Some(EngineError::Config(format!(
                    "cannot start search thread: {}",
                    err
                )));
                self.phase = SolutionPhase::Failed;
            }
        }
    }

    /// Whether another solution (or a pending error) is available. Blocks
    /// while the worker searches.
    pub fn has_next(&mut self) -> bool {
        if self.phase == SolutionPhase::NotStarted {
            self.start();
        }

        while self.phase == SolutionPhase::Searching {
            match self.handoff.next_event() {
                HandoffEvent::Solution(values) => {
                    self.buffered = Some(values);
                    self.phase = SolutionPhase::SolutionReady;
                }
                HandoffEvent::Error(error) => {
                    self.failure = Some(EngineError::Worker {
                        goal: self.handoff.goal(),
                        error,
                    });
                    self.phase = SolutionPhase::Failed;
                    self.stop_search();
                    self.release();
                }
                HandoffEvent::Finished(Ok(())) => {
                    self.join_search();
                    self.phase = SolutionPhase::Exhausted;
                    self.release();
                }
                HandoffEvent::Finished(Err(err)) => {
                    self.join_search();
                    self.failure = Some(err);
                    self.phase = SolutionPhase::Failed;
                    self.release();
                }
            }
        }

        match self.phase {
            SolutionPhase::SolutionReady => true,
            SolutionPhase::Failed => self.failure.is_some(),
            _ => false,
        }
    }

    /// Take the next solution, `Ok(None)` once exhausted.
    pub fn next_solution(&mut self) -> EngineResult<Option<Bindings>> {
        if !self.has_next() {
            return Ok(None);
        }

        if let Some(err) = self.failure.take() {
            return Err(err);
        }

        let values = self.buffered.take().unwrap_or_default();
        self.phase = SolutionPhase::Searching;
        self.handoff.answer(Decision::Continue);

        if values.len() != self.output.len() {
            self.cancel();
            return Err(EngineError::TransportFailure(format!(
                "solution carried {} values, expected {}",
                values.len(),
                self.output.len()
            )));
        }
        Ok(Some(Bindings::new(
            self.output.variables.clone(),
            values,
            false,
        )))
    }

    /// Stop the search and wait for the worker to finish the goal.
    pub fn cancel(&mut self) {
        match self.phase {
            SolutionPhase::Exhausted | SolutionPhase::Cancelled => {}
            SolutionPhase::Failed => self.stop_search(),
            _ => {
                self.stop_search();
                self.buffered = None;
                self.phase = SolutionPhase::Cancelled;
                tracing::debug!(collector = %self.collector, "solution search cancelled");
            }
        }
        self.release();
    }

    fn stop_search(&mut self) {
        self.handoff.stop();
        self.join_search();
    }

    fn join_search(&mut self) {
        if let Some(handle) = self.search.take() {
            if handle.join().is_err() {
                tracing::warn!(collector = %self.collector, "search thread panicked");
            }
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.engine.registry().unregister(self.collector);
        self.engine.inner.release_iterator(&self.handoff);
    }
}

impl Iterator for SolutionIterator {
    type Item = EngineResult<Bindings>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_solution().transpose()
    }
}

impl Drop for SolutionIterator {
    fn drop(&mut self) {
        self.cancel();
    }
}
