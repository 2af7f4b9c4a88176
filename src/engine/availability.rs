//! Availability automaton driven by output markers
//!
//! Three recognizers watch both output streams: the top-level prompt, the
//! break-level prompt and the error prefix. Listeners hold a weak reference
//! to the engine so a dropped engine is not kept alive by its own output.

use std::sync::{Arc, Weak};

use super::Inner;
use super::recognizer::{MarkerEvent, Recognizer};

/// Recognizer name of the top-level prompt
pub const PROMPT: &str = "prompt";
/// Recognizer name of the break-level prompt
pub const BREAK: &str = "break";
/// Recognizer name of the error prefix
pub const ERROR: &str = "error";

pub(crate) fn install(inner: &Arc<Inner>) {
    let caps = &inner.capabilities;

    let prompt = Recognizer::new(PROMPT, &caps.prompt_marker);
    listen(&prompt, inner, |inner, _| inner.on_prompt());

    let pause = Recognizer::new(BREAK, &caps.break_marker);
    listen(&pause, inner, |inner, _| inner.on_break());

    let error = Recognizer::new(ERROR, &caps.error_marker).collecting_trailing();
    listen(&error, inner, Inner::on_error_marker);

    for recognizer in [prompt, pause, error] {
        inner.output.attach(Arc::new(recognizer));
    }
}

fn listen<F>(recognizer: &Recognizer, inner: &Arc<Inner>, handler: F)
where
    F: Fn(&Inner, &MarkerEvent) + Send + Sync + 'static,
{
    let weak: Weak<Inner> = Arc::downgrade(inner);
    recognizer.add_listener(move |event| {
        if let Some(inner) = weak.upgrade() {
            handler(&inner, event);
        }
    });
}

impl Inner {
    /// Worker is back at its top level; any goal loop has exited.
    ///
    /// Output and the structured channel are read independently, so a prompt
    /// printed before the loop started can surface after its announcement.
    /// Such a prompt is ignored until the loop has sent a result or callback.
    fn on_prompt(&self) {
        let mut state = self.state.lock();
        if state.goal_loop_started && !state.loop_traffic {
            tracing::debug!(engine = %self.id, "prompt from before the goal loop ignored");
            return;
        }
        state.available = true;
        state.paused = false;

        let mut restart = false;
        if state.goal_loop_started {
            let aborted = state
                .correlator
                .abort_dispatched("worker returned to its top level");
            state.reset_worker_view();
            state.wake_all();
            restart = state.correlator.has_queued() && !state.shutting_down && state.failure.is_none();
            if restart {
                state.bootstrap_pending = true;
            }
            tracing::info!(
                engine = %self.id,
                aborted = aborted.len(),
                restart,
                "worker goal loop exited"
            );
        }
        drop(state);
        self.changed.notify_all();

        if restart {
            self.start_goal_loop();
        }
    }

    /// Worker entered a break level.
    fn on_break(&self) {
        let mut state = self.state.lock();
        state.available = true;
        state.paused = true;
        drop(state);
        tracing::debug!(engine = %self.id, "worker entered break level");
        self.changed.notify_all();
    }

    fn on_error_marker(&self, event: &MarkerEvent) {
        let message = event
            .trailing
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        tracing::warn!(
            engine = %self.id,
            stream = %event.stream,
            message = %message.trim_end(),
            "worker reported an error"
        );
    }
}
