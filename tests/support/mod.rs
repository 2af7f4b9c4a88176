//! Scripted in-process worker for engine integration tests
//!
//! The worker speaks the goal-loop protocol over a loopback transport and
//! understands a handful of goal names:
//!
//! - `true`, `fail`, `error`: succeed, fail, raise
//! - `echo`: bind the inputs back, `add`: bind the sum of the inputs
//! - `block`: wait for a `release.` command (or an interrupt)
//! - `callback`: call `inputs[1]` on target `inputs[0]` with the remaining
//!   inputs and bind the returned value
//! - `print:<text>`: write text to stdout, `die`: drop the connection
//! - `leave`: quit the goal loop without answering and print the prompt
//! - `examples`: bind the number of type examples seen at startup
//! - `bad_arity`: succeed with one binding too many
//!
//! Wrapped solution goals understand `between:N` and `raise_after:N`.
//! Interrupts are only noticed while the worker waits for input. The startup
//! prompt can be delayed, withheld or repeated with [`PromptTiming`].

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use termbridge::engine::protocol::{
    BOOTSTRAP_OPERATION, CallbackOutcomePayload, CallbackRequestPayload, GoalPayload, Payload,
    ResultPayload, Target,
};
use termbridge::engine::{
    Capabilities, Engine, EngineConfig, EngineResult, ObjectId, OutputScanner, OutputStream, Term,
};
use termbridge::transport::codec::PayloadCodec;
use termbridge::transport::loopback::{self, WorkerEnd, WorkerInput};
use termbridge::transport::Transport;

/// Command that releases a `block` goal
pub const RELEASE: &str = "release.\n";

/// How the scripted worker reacts to interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    /// Return straight to the top-level prompt
    #[default]
    TopLevel,
    /// Enter a break level and wait for the abort command
    BreakLevel,
    /// Keep running as if nothing happened
    Ignore,
}

/// When the scripted worker's startup prompt reaches the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTiming {
    /// Printed before reading any input
    #[default]
    Immediate,
    /// Printed from another thread after a pause
    Delayed(Duration),
    /// Never printed
    Withheld,
    /// Printed at startup and once more when the first goal arrives, like a
    /// prompt that sat in an output buffer
    Repeated,
}

/// Worker options
#[derive(Default, Clone)]
pub struct WorkerOptions {
    pub interrupt: InterruptMode,
    pub codec: Option<Arc<dyn PayloadCodec>>,
    pub prompt: PromptTiming,
}

/// Engine wired to a scripted worker thread
pub struct Harness {
    pub engine: Engine,
    worker: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(config: EngineConfig) -> Self {
        Self::start_with(config, WorkerOptions::default())
    }

    pub fn start_with(config: EngineConfig, options: WorkerOptions) -> Self {
        Self::try_start_with(config, options).expect("engine start")
    }

    pub fn try_start_with(config: EngineConfig, options: WorkerOptions) -> EngineResult<Self> {
        let caps = Capabilities::generic();
        let mut worker = None;
        let started = Engine::start(config, caps.clone(), |output| {
            let (transport, end) = match options.codec.clone() {
                Some(codec) => loopback::pair_with_codec(output.clone(), codec),
                None => loopback::pair(output.clone()),
            };
            let script = ScriptedWorker {
                end,
                output,
                caps,
                stale_prompt: options.prompt == PromptTiming::Repeated,
                options,
                examples: 0,
                next_callback: 1,
            };
            worker = Some(
                thread::Builder::new()
                    .name("scripted-worker".to_string())
                    .spawn(move || script.run())
                    .expect("spawn worker"),
            );
            Ok(Arc::new(transport) as Arc<dyn Transport>)
        });

        match started {
            Ok(engine) => Ok(Self { engine, worker }),
            Err(err) => {
                if let Some(worker) = worker {
                    let _ = worker.join();
                }
                Err(err)
            }
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.engine.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

enum Exit {
    Interrupted,
    Left,
    Disconnected,
}

struct ScriptedWorker {
    end: WorkerEnd,
    output: Arc<OutputScanner>,
    caps: Capabilities,
    stale_prompt: bool,
    options: WorkerOptions,
    examples: usize,
    next_callback: u64,
}

impl ScriptedWorker {
    fn run(mut self) {
        match self.options.prompt {
            PromptTiming::Immediate | PromptTiming::Repeated => {
                self.end.print(&self.caps.prompt_marker.clone())
            }
            PromptTiming::Delayed(pause) => {
                let output = self.output.clone();
                let prompt = self.caps.prompt_marker.clone();
                thread::spawn(move || {
                    thread::sleep(pause);
                    output.feed(OutputStream::Stdout, prompt.as_bytes());
                });
            }
            PromptTiming::Withheld => {}
        }
        loop {
            let Some(input) = self.end.recv() else {
                return;
            };
            match input {
                WorkerInput::Command(text) if text == self.caps.goal_loop_command => {
                    match self.goal_loop() {
                        Exit::Interrupted => self.after_interrupt(),
                        Exit::Left => self.end.print(&self.caps.prompt_marker.clone()),
                        Exit::Disconnected => return,
                    }
                }
                WorkerInput::Command(text) if text == self.caps.halt_command => return,
                WorkerInput::Command(text) if text == self.caps.abort_command => {
                    self.end.print(&self.caps.prompt_marker.clone());
                }
                WorkerInput::Object(Payload::TypeExample(_)) => self.examples += 1,
                WorkerInput::Interrupt => self.after_interrupt(),
                _ => {}
            }
        }
    }

    fn after_interrupt(&mut self) {
        match self.options.interrupt {
            InterruptMode::TopLevel => self.end.print(&self.caps.prompt_marker.clone()),
            InterruptMode::BreakLevel => self.end.print(&self.caps.break_marker.clone()),
            InterruptMode::Ignore => {}
        }
    }

    fn next_input(&mut self) -> Result<WorkerInput, Exit> {
        match self.end.recv() {
            Some(WorkerInput::Interrupt) if self.options.interrupt == InterruptMode::Ignore => {
                self.next_input()
            }
            Some(WorkerInput::Interrupt) => Err(Exit::Interrupted),
            Some(WorkerInput::Object(Payload::TypeExample(_))) => {
                self.examples += 1;
                self.next_input()
            }
            Some(input) => Ok(input),
            None => Err(Exit::Disconnected),
        }
    }

    fn send(&self, payload: Payload) -> Result<(), Exit> {
        self.end.send(payload).map_err(|_| Exit::Disconnected)
    }

    fn goal_loop(&mut self) -> Exit {
        let marker = CallbackRequestPayload {
            id: 0,
            target: Target::Value(Term::Nil),
            operation: BOOTSTRAP_OPERATION.to_string(),
            args: Vec::new(),
            want_echo: false,
        };
        if self.send(Payload::CallbackRequest(marker)).is_err() {
            return Exit::Disconnected;
        }

        loop {
            let outcome = match self.next_input() {
                Ok(WorkerInput::Object(Payload::Goal(goal))) => {
                    if std::mem::take(&mut self.stale_prompt) {
                        self.end.print(&self.caps.prompt_marker.clone());
                    }
                    self.run_goal(goal)
                }
                Ok(_) => Ok(()),
                Err(exit) => Err(exit),
            };
            if let Err(exit) = outcome {
                return exit;
            }
        }
    }

    fn call_host(
        &mut self,
        target: Target,
        operation: &str,
        args: Vec<Term>,
    ) -> Result<CallbackOutcomePayload, Exit> {
        let id = self.next_callback;
        self.next_callback += 1;
        self.send(Payload::CallbackRequest(CallbackRequestPayload {
            id,
            target,
            operation: operation.to_string(),
            args,
            want_echo: false,
        }))?;

        loop {
            match self.next_input()? {
                WorkerInput::Object(Payload::CallbackOutcome(outcome)) if outcome.id == id => {
                    return Ok(outcome);
                }
                WorkerInput::Object(Payload::Goal(nested)) => self.run_goal(nested)?,
                _ => {}
            }
        }
    }

    fn reply(&self, goal: &GoalPayload, succeeded: bool, bindings: Vec<Term>) -> Result<(), Exit> {
        self.send(Payload::Result(ResultPayload {
            id: goal.id,
            succeeded,
            bindings,
            undefined: false,
            error: None,
        }))
    }

    fn raise(&self, goal: &GoalPayload, error: Term) -> Result<(), Exit> {
        self.send(Payload::Result(ResultPayload {
            id: goal.id,
            succeeded: false,
            bindings: Vec::new(),
            undefined: false,
            error: Some(error),
        }))
    }

    fn run_goal(&mut self, goal: GoalPayload) -> Result<(), Exit> {
        if let Some((collector, inner)) = parse_wrapped(&goal.code) {
            return self.run_solutions(&goal, collector, &inner);
        }

        let code = goal.code.clone();
        match code.as_str() {
            "true" => self.reply(&goal, true, Vec::new()),
            "fail" => self.reply(&goal, false, Vec::new()),
            "error" => self.raise(&goal, Term::compound("error", vec![Term::atom("boom")])),
            "echo" => {
                let bindings = goal.inputs.iter().take(goal.output.len()).cloned().collect();
                self.reply(&goal, true, bindings)
            }
            "add" => {
                let sum = goal.inputs.iter().filter_map(Term::as_int).sum::<i64>();
                self.reply(&goal, true, vec![Term::Int(sum)])
            }
            "examples" => self.reply(&goal, true, vec![Term::Int(self.examples as i64)]),
            "bad_arity" => self.reply(&goal, true, vec![Term::Nil; goal.output.len() + 1]),
            "block" => loop {
                match self.next_input()? {
                    WorkerInput::Command(text) if text == RELEASE => {
                        return self.reply(&goal, true, Vec::new());
                    }
                    WorkerInput::Object(Payload::Goal(nested)) => self.run_goal(nested)?,
                    _ => {}
                }
            },
            "die" => Err(Exit::Disconnected),
            "leave" => Err(Exit::Left),
            "callback" => {
                let target = match goal.inputs.first() {
                    Some(Term::Object(id)) => Target::Object(*id),
                    Some(Term::Atom(type_name)) => Target::Type(type_name.clone()),
                    Some(other) => Target::Value(other.clone()),
                    None => return self.raise(&goal, Term::atom("missing_target")),
                };
                let operation = goal
                    .inputs
                    .get(1)
                    .and_then(|term| term.as_text().map(str::to_string))
                    .unwrap_or_default();
                let args = goal.inputs.iter().skip(2).cloned().collect();

                let outcome = self.call_host(target, &operation, args)?;
                match outcome.error {
                    Some(error) => self.raise(&goal, error),
                    None => {
                        let value = outcome.value.unwrap_or(Term::Nil);
                        let bindings = std::iter::once(value).take(goal.output.len()).collect();
                        self.reply(&goal, true, bindings)
                    }
                }
            }
            other => match other.strip_prefix("print:") {
                Some(text) => {
                    self.end.print(text);
                    self.reply(&goal, true, Vec::new())
                }
                None => self.raise(&goal, Term::compound("unknown_goal", vec![Term::string(other)])),
            },
        }
    }

    fn run_solutions(&mut self, goal: &GoalPayload, collector: ObjectId, inner: &str) -> Result<(), Exit> {
        let (name, count) = inner
            .split_once(':')
            .map(|(name, count)| (name, count.parse::<i64>().unwrap_or(0)))
            .unwrap_or((inner, 0));

        for value in 1..=count {
            let outcome = self.call_host(
                Target::Object(collector),
                "record",
                vec![Term::List(vec![Term::Int(value)])],
            )?;
            if outcome.value.as_ref().is_some_and(|term| term.is_atom("stop")) {
                return self.reply(goal, true, Vec::new());
            }
        }

        if name == "raise_after" {
            self.call_host(
                Target::Object(collector),
                "record_error",
                vec![Term::compound("error", vec![Term::atom("search_failed")])],
            )?;
        }
        self.reply(goal, true, Vec::new())
    }
}

/// Split `termbridge_solutions(<collector>, [<vars>], (<goal>))`.
fn parse_wrapped(code: &str) -> Option<(ObjectId, String)> {
    let rest = code.strip_prefix("termbridge_solutions(")?;
    let (collector, rest) = rest.split_once(", [")?;
    let (_, goal) = rest.split_once("], (")?;
    let goal = goal.strip_suffix("))")?;
    Some((ObjectId(collector.trim().parse().ok()?), goal.to_string()))
}
