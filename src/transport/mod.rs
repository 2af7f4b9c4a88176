//! Channel transports between the host and a worker
//!
//! A transport owns the worker's process or connection handles. It exposes a
//! primary text command input, a structured object channel for protocol
//! payloads, an out-of-band interrupt, and feeds everything the worker prints
//! into the [`OutputScanner`](crate::engine::recognizer::OutputScanner) it was
//! built with.
//!
//! Implementations must serialise concurrent writers per channel. Only the
//! engine's dispatch loop calls [`Transport::receive_object`].

use serde::{Deserialize, Serialize};

use crate::engine::error::TransportResult;
use crate::engine::protocol::Payload;

pub mod codec;
pub mod loopback;
pub mod process;

pub use codec::{CodecKind, JsonLinesCodec, PayloadCodec, PreservesCodec};
pub use loopback::{LoopbackTransport, WorkerEnd, WorkerInput};
pub use process::{ProcessConfig, ProcessTransport};

/// Host side of a worker channel
pub trait Transport: Send + Sync {
    /// Write text to the worker's primary input.
    fn send_command(&self, text: &str) -> TransportResult<()>;

    /// Write a payload to the structured channel.
    fn send_object(&self, payload: &Payload) -> TransportResult<()>;

    /// Block until the next payload arrives on the structured channel.
    ///
    /// Fails with `WorkerDied` when the worker closes the channel and with
    /// `Closed` once [`Transport::destroy`] has been called.
    fn receive_object(&self) -> TransportResult<Payload>;

    /// Deliver an out-of-band interrupt to the worker.
    fn interrupt(&self) -> TransportResult<()>;

    /// Tear the connection down, unblocking any pending receive.
    fn destroy(&self);

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// How an interrupt is delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptMethod {
    /// Send SIGINT to the worker process (unix only)
    Signal,
    /// Write a control sequence to the worker's primary input
    Sequence(String),
}

impl Default for InterruptMethod {
    fn default() -> Self {
        if cfg!(unix) {
            InterruptMethod::Signal
        } else {
            InterruptMethod::Sequence("\u{3}".to_string())
        }
    }
}
