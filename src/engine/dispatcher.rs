//! Dispatch loop: the single reader of the structured channel
//!
//! Every object the worker writes is classified here. Results complete their
//! goal; callback requests run either on the context that owns the running
//! goal or on a fresh thread. After each object the loop hands the worker the
//! one object it is now owed, if that object is ready.

use std::sync::{Arc, Weak};
use std::thread;

use super::correlator::GoalOutcome;
use super::error::{CallbackError, TransportError};
use super::protocol::{CallbackOutcomePayload, CallbackRequestPayload, Payload, ResultPayload};
use super::state::{CallbackJob, ContextId};
use super::{Engine, Inner};
use crate::transport::Transport;

/// Receive loop; exits when the transport fails or the engine is dropped.
pub(crate) fn run(inner: Weak<Inner>, transport: Arc<dyn Transport>) {
    loop {
        let received = transport.receive_object();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match received {
            Ok(payload) => inner.handle_incoming(payload),
            Err(err) => {
                inner.fail(err);
                break;
            }
        }
    }
    tracing::debug!("dispatch loop stopped");
}

impl Inner {
    fn handle_incoming(self: &Arc<Self>, payload: Payload) {
        if self.config.trace_payloads {
            tracing::debug!(engine = %self.id, payload = ?payload, "received");
        }
        match payload {
            Payload::Result(result) => self.on_result(result),
            Payload::CallbackRequest(request) if request.is_bootstrap_marker() => {
                self.on_goal_loop_ready()
            }
            Payload::CallbackRequest(request) => self.on_callback_request(request),
            other => {
                tracing::warn!(
                    engine = %self.id,
                    kind = other.kind(),
                    "unexpected payload from worker ignored"
                );
            }
        }
    }

    fn on_result(&self, result: ResultPayload) {
        let id = result.id;
        let mut state = self.state.lock();
        state.loop_traffic = true;
        match state.correlator.complete(id, GoalOutcome::Reply(result)) {
            Some(context) => {
                state.close_goal_frame(id);
                state.wake(context);
                tracing::debug!(engine = %self.id, goal = %id, "result received");
            }
            None => {
                state.worker_waiting = true;
                tracing::debug!(engine = %self.id, goal = %id, "result for unknown goal ignored");
            }
        }
        drop(state);
        self.changed.notify_all();
        self.pump();
    }

    fn on_goal_loop_ready(&self) {
        let mut state = self.state.lock();
        // A fresh loop starts with an empty stack; drop frames left by a cascade.
        state.reset_worker_view();
        state.goal_loop_started = true;
        state.paused = false;
        state.worker_waiting = true;
        drop(state);
        tracing::info!(engine = %self.id, "worker goal loop listening");
        self.changed.notify_all();
        self.pump();
    }

    fn on_callback_request(self: &Arc<Self>, request: CallbackRequestPayload) {
        let mut state = self.state.lock();
        let seq = state.open_callback();

        let affinity = if self.config.force_callback_threads {
            None
        } else {
            state
                .correlator
                .most_recent_running()
                .map(|goal| goal.context)
                .filter(|context| state.contexts.get(context).is_some_and(|slot| slot.waiting > 0))
        };

        match affinity {
            Some(context) => {
                tracing::debug!(
                    engine = %self.id,
                    callback = request.id,
                    operation = %request.operation,
                    "posting callback to waiting context"
                );
                let slot = state.slot(context);
                slot.jobs.push_back(CallbackJob { seq, request });
                slot.condvar.notify_all();
                drop(state);
            }
            None => {
                drop(state);
                self.spawn_callback(seq, request);
            }
        }

        // The worker now waits; a queued goal may run nested in this callback.
        self.pump();
    }

    fn spawn_callback(self: &Arc<Self>, seq: u64, request: CallbackRequestPayload) {
        let inner = self.clone();
        let id = request.id;
        let spawned = thread::Builder::new()
            .name(format!("termbridge-callback-{}", id))
            .spawn(move || inner.run_callback(seq, request));

        if let Err(err) = spawned {
            tracing::warn!(engine = %self.id, callback = id, error = %err, "cannot spawn callback thread");
            let failure = CallbackError::Failed(format!("cannot spawn callback thread: {}", err));
            let outcome = CallbackOutcomePayload {
                id,
                value: None,
                error: Some(failure.to_term()),
                echoed_args: None,
            };
            self.state.lock().finish_callback(seq, outcome);
            self.pump();
        }
    }

    /// Execute a callback on the current thread and queue its outcome.
    pub(crate) fn run_callback(self: &Arc<Self>, seq: u64, request: CallbackRequestPayload) {
        let context = ContextId::current();
        self.state.lock().slot(context).callback_depth += 1;

        let engine = Engine {
            inner: self.clone(),
        };
        let outcome = self.registry.invoke(Some(&engine), &request);

        let mut state = self.state.lock();
        let slot = state.slot(context);
        slot.callback_depth = slot.callback_depth.saturating_sub(1);
        state.release_slot(context);
        if !state.finish_callback(seq, outcome) {
            tracing::debug!(
                engine = %self.id,
                callback = request.id,
                "outcome of cancelled callback discarded"
            );
        }
        drop(state);
        self.pump();
    }

    /// Send the worker the single object it is owed, if one is ready.
    pub(crate) fn pump(&self) {
        let payload = self.state.lock().next_outbound();
        let Some(payload) = payload else {
            return;
        };
        let Some(transport) = self.transport.get() else {
            return;
        };

        if self.config.trace_payloads {
            tracing::debug!(engine = %self.id, payload = ?payload, "sending");
        }
        if let Err(err) = transport.send_object(&payload) {
            self.fail(err);
        }
    }

    /// Disable the engine after a transport failure.
    pub(crate) fn fail(&self, err: TransportError) {
        let mut state = self.state.lock();
        if state.shutting_down || state.failure.is_some() {
            return;
        }
        let reason = err.to_string();
        state.failure = Some(reason.clone());
        state.available = false;
        let aborted = state.fail_all(&reason);
        drop(state);

        tracing::warn!(engine = %self.id, error = %reason, aborted = aborted.len(), "transport failed");
        self.changed.notify_all();
        self.admission.notify_all();
        if let Some(transport) = self.transport.get() {
            transport.destroy();
        }
    }
}
