//! Error types for the termbridge engine
//!
//! Domain errors use thiserror; `anyhow` only appears at the binary boundary.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::protocol::GoalId;
use super::term::{ObjectId, Term};

/// Top-level engine error
///
/// A failed `call()` always reports exactly one of `Worker`, `Aborted`,
/// `Interrupted` or `TransportFailure`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The worker reported a computation-level error for the goal
    #[error("worker error in goal {goal}: {error}")]
    Worker {
        /// Goal that raised the error
        goal: GoalId,
        /// Opaque error payload produced by the worker
        error: Term,
    },

    /// The goal was cancelled by a host-initiated abort cascade
    #[error("goal aborted: {0}")]
    Aborted(String),

    /// The goal was cancelled by an interrupt
    #[error("goal interrupted: {0}")]
    Interrupted(String),

    /// The channel to the worker failed; the engine is disabled
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Transport-level error raised by a direct engine operation
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Goal identifiers would wrap around
    #[error("goal identifier space exhausted after {0}")]
    IdSpaceExhausted(GoalId),

    /// A solution iterator is already active on this engine
    #[error("a solution iterator is already active")]
    IteratorActive,

    /// Waiting for the worker exceeded the configured bound
    #[error("timed out after {0:?} waiting for worker availability")]
    Timeout(Duration),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience result alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Channel transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error while talking to the worker
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The worker closed its end of the channel
    #[error("worker died: {0}")]
    WorkerDied(String),

    /// The transport was destroyed by the host
    #[error("transport closed")]
    Closed,

    /// The transport has not been connected yet
    #[error("transport not connected")]
    NotConnected,

    /// The worker never opened the structured channel
    #[error("worker did not connect within {0:?}")]
    ConnectTimeout(Duration),

    /// Attempted to spawn a worker without a program
    #[error("worker command is empty")]
    EmptyCommand,

    /// Spawned worker is missing a standard stream pipe
    #[error("spawned worker process did not expose {0}")]
    MissingPipe(&'static str),

    /// The requested operation is not available on this transport
    #[error("unsupported on this transport: {0}")]
    Unsupported(String),
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Payload codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding failed
    #[error("payload encoding failed: {0}")]
    Encode(String),

    /// Decoding failed (malformed payload)
    #[error("malformed payload: {0}")]
    Decode(String),

    /// Frame header announced an implausible size
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Errors raised while executing a worker callback
///
/// These are captured into the callback outcome and sent back to the worker;
/// they never reach the dispatch loop.
#[derive(Debug, Clone, Error)]
pub enum CallbackError {
    /// Target or argument refers to an object that is not registered
    #[error("object {0} is not registered")]
    UnknownObject(ObjectId),

    /// Target type has no registered operations
    #[error("type '{0}' has no registered operations")]
    UnknownType(String),

    /// No operation matches name, arity and argument kinds
    #[error("no operation '{operation}/{arity}' on '{type_name}' accepts the given arguments")]
    NoSuchOperation {
        /// Type the operation was looked up on
        type_name: String,
        /// Operation name
        operation: String,
        /// Number of arguments supplied
        arity: usize,
    },

    /// More than one overload is equally specific
    #[error("call to '{operation}' on '{type_name}' is ambiguous between {candidates} overloads")]
    Ambiguous {
        /// Type the operation was looked up on
        type_name: String,
        /// Operation name
        operation: String,
        /// Number of equally specific candidates
        candidates: usize,
    },

    /// An argument or receiver had an unexpected shape
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The handler reported a failure
    #[error("{0}")]
    Failed(String),

    /// The handler panicked
    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl CallbackError {
    /// Short machine-readable tag used in the error term sent to the worker.
    pub fn tag(&self) -> &'static str {
        match self {
            CallbackError::UnknownObject(_) => "unknown_object",
            CallbackError::UnknownType(_) => "unknown_type",
            CallbackError::NoSuchOperation { .. } => "no_such_operation",
            CallbackError::Ambiguous { .. } => "ambiguous_operation",
            CallbackError::TypeMismatch(_) => "type_mismatch",
            CallbackError::Failed(_) => "failed",
            CallbackError::Panicked(_) => "panicked",
        }
    }

    /// Encode as the opaque error term carried by a callback outcome.
    pub fn to_term(&self) -> Term {
        Term::compound(
            "host_error",
            vec![Term::atom(self.tag()), Term::string(self.to_string())],
        )
    }
}

/// Convenience result alias for callback handlers
pub type CallbackResult<T> = std::result::Result<T, CallbackError>;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        /// File that failed to load
        path: PathBuf,
        /// Underlying IO error
        source: io::Error,
    },

    /// Config file is not valid JSON for the expected shape
    #[error("invalid config {path}: {source}")]
    Parse {
        /// File that failed to parse
        path: PathBuf,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// An environment override could not be parsed
    #[error("invalid value '{value}' for {var}")]
    Env {
        /// Environment variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
