//! Engine controller
//!
//! An [`Engine`] drives one worker interpreter: it submits goals, blocks the
//! caller until the correlated result arrives, runs worker callbacks on the
//! right host thread, tracks availability from the worker's output, and
//! supports interrupting, shutting down and iterating over solutions.

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub mod availability;
pub mod capabilities;
pub mod correlator;
mod dispatcher;
pub mod error;
pub mod protocol;
pub mod recognizer;
pub mod registry;
pub mod solutions;
pub mod state;
pub mod term;

pub use capabilities::Capabilities;
pub use error::{
    CallbackError, CallbackResult, CodecError, ConfigError, EngineError, EngineResult,
    TransportError, TransportResult,
};
pub use protocol::{GoalId, OutputSpec};
pub use recognizer::{ListenerId, MarkerEvent, OutputScanner, OutputStream};
pub use registry::{HostRegistry, Invocation, ParamType, Returned};
pub use solutions::{SolutionIterator, SolutionPhase};
pub use state::{ContextId, EngineState, EngineStatus};
pub use term::{ObjectId, Term};

use correlator::{Goal, GoalOutcome};
use solutions::Handoff;
use crate::transport::{ProcessConfig, ProcessTransport, Transport};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admit concurrent bare goals from independent contexts
    pub allow_concurrent_goals: bool,

    /// Run every callback on a fresh thread instead of the affinity context
    pub force_callback_threads: bool,

    /// How long `interrupt()` waits for the worker to become available
    pub interrupt_timeout_ms: u64,

    /// How long `start()` waits for the worker's first prompt
    pub startup_timeout_ms: u64,

    /// Log every structured payload at debug level
    pub trace_payloads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_concurrent_goals: false,
            force_callback_threads: false,
            interrupt_timeout_ms: 5_000,
            startup_timeout_ms: 10_000,
            trace_payloads: false,
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `TERMBRIDGE_*` environment variables on this configuration.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.overlay(|var| std::env::var(var).ok())
    }

    fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TERMBRIDGE_ALLOW_CONCURRENT_GOALS") {
            self.allow_concurrent_goals = parse_flag("TERMBRIDGE_ALLOW_CONCURRENT_GOALS", value)?;
        }
        if let Some(value) = lookup("TERMBRIDGE_FORCE_CALLBACK_THREADS") {
            self.force_callback_threads = parse_flag("TERMBRIDGE_FORCE_CALLBACK_THREADS", value)?;
        }
        if let Some(value) = lookup("TERMBRIDGE_INTERRUPT_TIMEOUT_MS") {
            self.interrupt_timeout_ms = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "TERMBRIDGE_INTERRUPT_TIMEOUT_MS",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("TERMBRIDGE_STARTUP_TIMEOUT_MS") {
            self.startup_timeout_ms = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "TERMBRIDGE_STARTUP_TIMEOUT_MS",
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("TERMBRIDGE_TRACE_PAYLOADS") {
            self.trace_payloads = parse_flag("TERMBRIDGE_TRACE_PAYLOADS", value)?;
        }
        Ok(self)
    }

    /// Interrupt timeout as a duration.
    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    /// Startup timeout as a duration.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

fn parse_flag(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env { var, value }),
    }
}

/// Values bound by a successful goal, in output-spec order
#[derive(Debug, Clone, PartialEq)]
pub struct Bindings {
    names: Vec<String>,
    values: Vec<Term>,
    undefined: bool,
}

impl Bindings {
    pub(crate) fn new(names: Vec<String>, values: Vec<Term>, undefined: bool) -> Self {
        Self {
            names,
            values,
            undefined,
        }
    }

    /// Value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&Term> {
        self.names
            .iter()
            .position(|candidate| candidate == name)
            .and_then(|index| self.values.get(index))
    }

    /// Bound values in order.
    pub fn values(&self) -> &[Term] {
        &self.values
    }

    /// Variable names in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether the worker reported its "undefined" truth value.
    pub fn is_undefined(&self) -> bool {
        self.undefined
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no variables were bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Name/value pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }

    /// Consume into the bound values.
    pub fn into_values(self) -> Vec<Term> {
        self.values
    }
}

pub(crate) struct Inner {
    pub(crate) id: Uuid,
    pub(crate) config: EngineConfig,
    pub(crate) capabilities: Capabilities,
    pub(crate) state: Mutex<EngineState>,
    /// Signalled on availability and lifecycle changes
    pub(crate) changed: Condvar,
    /// Signalled when the bare-goal slot frees up
    pub(crate) admission: Condvar,
    pub(crate) output: Arc<OutputScanner>,
    pub(crate) transport: OnceLock<Arc<dyn Transport>>,
    pub(crate) registry: HostRegistry,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.get() {
            transport.destroy();
        }
    }
}

/// Handle to a running worker
///
/// Cheap to clone; all clones drive the same worker.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("dialect", &self.inner.capabilities.dialect)
            .finish()
    }
}

impl Engine {
    /// Start an engine over a transport built by `connect`.
    ///
    /// `connect` receives the scanner the transport must feed worker output
    /// into. Returns once the bootstrap type examples are sent and the worker
    /// has shown its first prompt; on timeout the engine is shut down.
    pub fn start<F>(config: EngineConfig, capabilities: Capabilities, connect: F) -> EngineResult<Self>
    where
        F: FnOnce(Arc<OutputScanner>) -> TransportResult<Arc<dyn Transport>>,
    {
        let output = OutputScanner::new();
        let registry = HostRegistry::new();
        solutions::register_collector(&registry);

        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            config,
            capabilities,
            state: Mutex::new(EngineState::new()),
            changed: Condvar::new(),
            admission: Condvar::new(),
            output: output.clone(),
            transport: OnceLock::new(),
            registry,
            dispatcher: Mutex::new(None),
        });
        availability::install(&inner);

        let transport = connect(output)?;
        if inner.transport.set(transport.clone()).is_err() {
            return Err(TransportError::Unsupported("transport connected twice".to_string()).into());
        }

        for example in protocol::type_examples() {
            transport.send_object(&example)?;
        }

        let handle = {
            let weak = Arc::downgrade(&inner);
            let transport = transport.clone();
            thread::Builder::new()
                .name("termbridge-dispatch".to_string())
                .spawn(move || dispatcher::run(weak, transport))
                .map_err(TransportError::Io)?
        };
        *inner.dispatcher.lock() = Some(handle);

        let timeout = inner.config.startup_timeout();
        let engine = Self { inner };
        if let Err(err) = engine.inner.wait_for(timeout, |state| state.available) {
            tracing::warn!(engine = %engine.inner.id, error = %err, "worker never became available");
            engine.shutdown();
            return Err(err);
        }

        tracing::info!(
            engine = %engine.inner.id,
            dialect = %engine.inner.capabilities.dialect,
            transport = %transport.describe(),
            "engine started"
        );
        Ok(engine)
    }

    /// Spawn a worker process and start an engine over it.
    ///
    /// Interrupts use the method named by `capabilities`.
    pub fn spawn(
        config: EngineConfig,
        capabilities: Capabilities,
        process: ProcessConfig,
    ) -> EngineResult<Self> {
        let interrupt = capabilities.interrupt.clone();
        Self::start(config, capabilities, move |output| {
            let transport = ProcessTransport::spawn(&process, interrupt, output)?;
            Ok(Arc::new(transport) as Arc<dyn Transport>)
        })
    }

    /// Engine identifier used in log fields.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Worker dialect descriptor.
    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    /// Objects and operations reachable from worker callbacks.
    pub fn registry(&self) -> &HostRegistry {
        &self.inner.registry
    }

    /// Output scanner fed by the transport.
    pub fn output(&self) -> &Arc<OutputScanner> {
        &self.inner.output
    }

    /// Evaluate a goal and block until its result arrives.
    ///
    /// Returns `Ok(Some(bindings))` on success and `Ok(None)` when the goal
    /// fails. Worker errors, cascades and transport failures are reported as
    /// the matching [`EngineError`] variant.
    pub fn call(
        &self,
        code: &str,
        inputs: Vec<Term>,
        output: OutputSpec,
    ) -> EngineResult<Option<Bindings>> {
        let id = self
            .inner
            .submit_goal(code.to_string(), inputs, output, false)?;
        self.inner.await_goal(id)
    }

    /// Evaluate a goal without inputs or bindings; `true` on success.
    pub fn call_bool(&self, code: &str) -> EngineResult<bool> {
        Ok(self.call(code, Vec::new(), OutputSpec::empty())?.is_some())
    }

    /// Start a lazy iteration over the solutions of `code`.
    pub fn solutions(
        &self,
        code: &str,
        inputs: Vec<Term>,
        output: OutputSpec,
    ) -> EngineResult<SolutionIterator> {
        let handoff = Arc::new(Handoff::default());
        {
            let mut state = self.inner.state.lock();
            self.inner.check_usable(&state)?;
            if state.iterator.is_some() {
                return Err(EngineError::IteratorActive);
            }
            state.iterator = Some(handoff.clone());
        }
        let collector = self
            .inner
            .registry
            .register_shared(solutions::COLLECTOR_TYPE, handoff.clone());
        Ok(SolutionIterator::new(
            self.clone(),
            handoff,
            collector,
            code.to_string(),
            inputs,
            output,
        ))
    }

    /// Write raw text to the worker's primary input.
    pub fn send_command(&self, text: &str) -> EngineResult<()> {
        let transport = self.inner.transport()?;
        transport.send_command(text)?;
        Ok(())
    }

    /// Interrupt the worker and cancel every open goal.
    ///
    /// No-op when idle. Waits up to the configured timeout for the worker to
    /// become available again, leaving a break level if it entered one.
    pub fn interrupt(&self) -> EngineResult<()> {
        let inner = &self.inner;
        let transport = inner.transport()?;
        {
            let mut state = inner.state.lock();
            inner.check_usable(&state)?;
            if state.is_idle() {
                return Ok(());
            }
            state.available = false;
            let woken = state.interrupt_all("interrupted by host");
            tracing::warn!(engine = %inner.id, goals = woken.len(), "interrupting worker");
        }
        inner.changed.notify_all();
        inner.admission.notify_all();

        transport.interrupt()?;

        let timeout = inner.config.interrupt_timeout();
        inner.wait_for(timeout, |state| state.available)?;
        let paused = inner.state.lock().paused;
        if paused {
            tracing::info!(engine = %inner.id, "leaving break level");
            transport.send_command(&inner.capabilities.abort_command)?;
            inner.wait_for(timeout, |state| state.available && !state.paused)?;
        }
        Ok(())
    }

    /// Abort every open goal, stop the worker and the dispatch loop.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.available = false;
            let woken = state.abort_all("engine shut down");
            tracing::info!(engine = %inner.id, aborted = woken.len(), "shutting down engine");
        }
        inner.changed.notify_all();
        inner.admission.notify_all();

        if let Some(transport) = inner.transport.get() {
            if let Err(err) = transport.send_command(&inner.capabilities.halt_command) {
                tracing::debug!(engine = %inner.id, error = %err, "halt command not delivered");
            }
            transport.destroy();
        }

        let handle = inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!(engine = %inner.id, "dispatch loop panicked");
            }
        }
    }

    /// Whether the worker is at a quiescent point.
    pub fn is_available(&self) -> bool {
        self.inner.state.lock().available
    }

    /// Whether no goals and no callbacks are open.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Whether the worker sits in a break level.
    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Snapshot of the engine state.
    pub fn status(&self) -> EngineStatus {
        self.inner.state.lock().status()
    }

    /// Block until the worker reports availability.
    pub fn wait_until_available(&self, timeout: Duration) -> EngineResult<()> {
        self.inner.wait_for(timeout, |state| state.available)
    }

    /// Listen for a marker on the worker's output.
    ///
    /// `name` is one of `prompt`, `break` or `error`, or the name of a
    /// recognizer attached with [`OutputScanner::attach`].
    pub fn add_output_listener<F>(&self, name: &str, listener: F) -> Option<ListenerId>
    where
        F: Fn(&MarkerEvent) + Send + Sync + 'static,
    {
        let recognizer = self.inner.output.recognizer(name)?;
        Some(recognizer.add_listener(listener))
    }

    /// Remove a listener added with [`Engine::add_output_listener`].
    pub fn remove_output_listener(&self, name: &str, id: ListenerId) -> bool {
        self.inner
            .output
            .recognizer(name)
            .is_some_and(|recognizer| recognizer.remove_listener(id))
    }
}

impl Inner {
    pub(crate) fn transport(&self) -> EngineResult<Arc<dyn Transport>> {
        self.transport
            .get()
            .cloned()
            .ok_or(EngineError::Transport(TransportError::NotConnected))
    }

    pub(crate) fn check_usable(&self, state: &EngineState) -> EngineResult<()> {
        if let Some(reason) = &state.failure {
            return Err(EngineError::TransportFailure(reason.clone()));
        }
        if state.shutting_down {
            return Err(EngineError::Aborted("engine shut down".to_string()));
        }
        Ok(())
    }

    /// Wait on `changed` until `ready` holds.
    fn wait_for<F>(&self, timeout: Duration, ready: F) -> EngineResult<()>
    where
        F: Fn(&EngineState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !ready(&state) {
            self.check_usable(&state)?;
            if self.changed.wait_until(&mut state, deadline).timed_out() && !ready(&state) {
                return Err(EngineError::Timeout(timeout));
            }
        }
        Ok(())
    }

    /// Queue a goal for the worker. `background` goals never hold the
    /// bare-goal admission slot.
    pub(crate) fn submit_goal(
        self: &Arc<Self>,
        code: String,
        inputs: Vec<Term>,
        output: OutputSpec,
        background: bool,
    ) -> EngineResult<GoalId> {
        let context = ContextId::current();
        let mut state = self.state.lock();
        self.check_usable(&state)?;

        let bare = !background && !state.is_nested(context);
        if bare && !self.config.allow_concurrent_goals {
            while state.bare_in_flight > 0 {
                self.admission.wait(&mut state);
                self.check_usable(&state)?;
            }
        }

        let id = state.correlator.next_id()?;
        tracing::debug!(engine = %self.id, goal = %id, bare, code = %code, "goal submitted");
        state
            .correlator
            .submit(Goal::new(id, code, inputs, output, context, bare));
        if bare {
            state.bare_in_flight += 1;
        }
        state.slot(context).waiting += 1;

        let bootstrap = !state.goal_loop_started && !state.bootstrap_pending;
        if bootstrap {
            state.bootstrap_pending = true;
        }
        drop(state);

        if bootstrap {
            self.start_goal_loop();
        } else {
            self.pump();
        }
        Ok(id)
    }

    /// Block until goal `id` completes, running callbacks posted to this
    /// context meanwhile.
    pub(crate) fn await_goal(self: &Arc<Self>, id: GoalId) -> EngineResult<Option<Bindings>> {
        let context = ContextId::current();
        let mut state = self.state.lock();
        let condvar = state.condvar(context);

        let (goal, outcome) = loop {
            if let Some(done) = state.correlator.take_outcome(id) {
                break done;
            }
            if let Some(job) = state.slot(context).jobs.pop_front() {
                MutexGuard::unlocked(&mut state, || self.run_callback(job.seq, job.request));
                continue;
            }
            condvar.wait(&mut state);
        };

        let slot = state.slot(context);
        slot.waiting = slot.waiting.saturating_sub(1);
        state.release_slot(context);
        if goal.bare {
            state.bare_in_flight = state.bare_in_flight.saturating_sub(1);
            self.admission.notify_all();
        }
        self.changed.notify_all();
        drop(state);

        tracing::debug!(engine = %self.id, goal = %id, "goal collected");
        self.map_outcome(goal, outcome)
    }

    fn map_outcome(&self, goal: Goal, outcome: GoalOutcome) -> EngineResult<Option<Bindings>> {
        match outcome {
            GoalOutcome::Reply(result) => {
                if let Some(error) = result.error {
                    return Err(EngineError::Worker {
                        goal: goal.id,
                        error,
                    });
                }
                if !result.succeeded {
                    return Ok(None);
                }
                if result.bindings.len() != goal.output.len() {
                    return Err(EngineError::TransportFailure(format!(
                        "goal {} returned {} bindings, expected {}",
                        goal.id,
                        result.bindings.len(),
                        goal.output.len()
                    )));
                }
                Ok(Some(Bindings::new(
                    goal.output.variables,
                    result.bindings,
                    result.undefined,
                )))
            }
            GoalOutcome::Aborted(reason) => Err(EngineError::Aborted(reason)),
            GoalOutcome::Interrupted(reason) => Err(EngineError::Interrupted(reason)),
            GoalOutcome::TransportFailed(reason) => Err(EngineError::TransportFailure(reason)),
        }
    }

    /// Type the goal-loop command at the worker's top level.
    pub(crate) fn start_goal_loop(&self) {
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(err) => {
                tracing::warn!(engine = %self.id, error = %err, "cannot start goal loop");
                return;
            }
        };
        tracing::debug!(engine = %self.id, "starting worker goal loop");
        if let Err(err) = transport.send_command(&self.capabilities.goal_loop_command) {
            self.fail(err);
        }
    }

    pub(crate) fn release_iterator(&self, handoff: &Arc<Handoff>) {
        let mut state = self.state.lock();
        if state
            .iterator
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, handoff))
        {
            state.iterator = None;
        }
    }
}
