//! Worker dialect descriptor
//!
//! Everything that differs between worker flavours (marker strings, the text
//! that starts the goal loop, solution wrapping, control commands) lives in a
//! single [`Capabilities`] value handed to the engine. None of it affects the
//! protocol's control logic.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::ConfigError;
use super::protocol::OutputSpec;
use super::term::ObjectId;
use crate::transport::InterruptMethod;

/// Dialect descriptor for one worker flavour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Human-readable dialect name
    pub dialect: String,

    /// Marker printed when the worker is idle at its top level
    pub prompt_marker: String,

    /// Marker printed when the worker enters a nested break level
    pub break_marker: String,

    /// Marker prefixing worker-reported errors on its output streams
    pub error_marker: String,

    /// Command typed at the top level to start the structured goal loop
    pub goal_loop_command: String,

    /// Template wrapping a nondeterministic goal for the solution iterator.
    ///
    /// Placeholders: `{goal}`, `{collector}` (object id), `{vars}`
    /// (comma-separated output variable names).
    pub solution_wrapper: String,

    /// Command that leaves a break level back to the top level
    pub abort_command: String,

    /// Command asking the worker to exit
    pub halt_command: String,

    /// Extension of worker source files
    pub source_extension: String,

    /// How interrupts reach the worker
    pub interrupt: InterruptMethod,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::generic()
    }
}

impl Capabilities {
    /// Neutral dialect used by the bundled loopback worker and tests.
    pub fn generic() -> Self {
        Self {
            dialect: "generic".to_string(),
            prompt_marker: "| ?- ".to_string(),
            break_marker: "[break] ?- ".to_string(),
            error_marker: "*** ".to_string(),
            goal_loop_command: "termbridge_goal_loop.\n".to_string(),
            solution_wrapper: "termbridge_solutions({collector}, [{vars}], ({goal}))".to_string(),
            abort_command: "abort.\n".to_string(),
            halt_command: "halt.\n".to_string(),
            source_extension: "pl".to_string(),
            interrupt: InterruptMethod::default(),
        }
    }

    /// Load a dialect descriptor from a JSON file; missing fields fall back
    /// to [`Capabilities::generic`].
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

    /// Worker code that reports every solution of `goal` to `collector`.
    pub fn wrap_solutions(&self, goal: &str, collector: ObjectId, output: &OutputSpec) -> String {
        self.solution_wrapper
            .replace("{collector}", &collector.0.to_string())
            .replace("{vars}", &output.variables.join(", "))
            .replace("{goal}", goal)
    }

    /// File name for a worker source file with the given stem.
    pub fn source_file_name(&self, stem: &str) -> String {
        if self.source_extension.is_empty() {
            stem.to_string()
        } else {
            format!("{}.{}", stem, self.source_extension)
        }
    }
}
