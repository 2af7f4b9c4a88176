//! Termbridge – drive a long-lived worker interpreter as a synchronous call
//!
//! This crate implements the host side of a goal/callback protocol:
//! - Goals submitted from any thread, correlated with their results by id
//! - Re-entrant callbacks from the worker into registered host objects
//! - Availability and break detection by scanning the worker's output
//! - Interrupt and abort cascades over every open goal
//! - Lazy, pull-based iteration over the solutions of a goal
//! - Subprocess and in-memory transports with pluggable payload codecs

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine controller, correlator, dispatcher and callback registry
pub mod engine;

/// Channel transports and payload codecs
pub mod transport;

// Re-export key types for convenience
pub use engine::{Bindings, Capabilities, Engine, EngineConfig, EngineError, EngineResult};

/// Current version of the termbridge crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the structured-channel protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";
