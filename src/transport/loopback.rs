//! In-memory transport for in-process workers
//!
//! [`pair`] returns the host-side [`LoopbackTransport`] and a [`WorkerEnd`]
//! that an embedded worker drives from its own thread. Output written through
//! the worker end is fed to the engine's scanner exactly like process output.
//! With [`pair_with_codec`] every payload is pushed through a codec in both
//! directions, exercising the wire format without sockets.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::Transport;
use super::codec::PayloadCodec;
use crate::engine::error::{TransportError, TransportResult};
use crate::engine::protocol::Payload;
use crate::engine::recognizer::{OutputScanner, OutputStream};

/// Input seen by the worker end
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerInput {
    /// Text written to the primary input
    Command(String),
    /// Structured payload
    Object(Payload),
    /// Out-of-band interrupt
    Interrupt,
}

enum Inbound {
    Payload(Payload),
    Closed(String),
}

/// Create a connected host/worker pair.
pub fn pair(output: Arc<OutputScanner>) -> (LoopbackTransport, WorkerEnd) {
    build(output, None)
}

/// Create a pair that round-trips every payload through `codec`.
pub fn pair_with_codec(
    output: Arc<OutputScanner>,
    codec: Arc<dyn PayloadCodec>,
) -> (LoopbackTransport, WorkerEnd) {
    build(output, Some(codec))
}

fn build(
    output: Arc<OutputScanner>,
    codec: Option<Arc<dyn PayloadCodec>>,
) -> (LoopbackTransport, WorkerEnd) {
    let (to_worker, worker_rx) = mpsc::channel();
    let (to_host, host_rx) = mpsc::channel();

    let transport = LoopbackTransport {
        to_worker: Mutex::new(Some(to_worker)),
        from_worker: Mutex::new(host_rx),
        wake: Mutex::new(Some(to_host.clone())),
        codec: codec.clone(),
        closed: AtomicBool::new(false),
    };
    let worker = WorkerEnd {
        inbox: worker_rx,
        to_host,
        output,
        codec,
    };
    (transport, worker)
}

fn roundtrip(codec: &Option<Arc<dyn PayloadCodec>>, payload: Payload) -> TransportResult<Payload> {
    let Some(codec) = codec else {
        return Ok(payload);
    };
    let frame = codec.encode(&payload)?;
    let mut reader = &frame[..];
    codec
        .decode(&mut reader)?
        .ok_or_else(|| TransportError::WorkerDied("empty frame".to_string()))
}

/// Host side of an in-memory channel
pub struct LoopbackTransport {
    to_worker: Mutex<Option<Sender<WorkerInput>>>,
    from_worker: Mutex<Receiver<Inbound>>,
    wake: Mutex<Option<Sender<Inbound>>>,
    codec: Option<Arc<dyn PayloadCodec>>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    fn deliver(&self, input: WorkerInput) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let guard = self.to_worker.lock();
        let sender = guard.as_ref().ok_or(TransportError::Closed)?;
        sender
            .send(input)
            .map_err(|_| TransportError::WorkerDied("worker end dropped".to_string()))
    }
}

impl Transport for LoopbackTransport {
    fn send_command(&self, text: &str) -> TransportResult<()> {
        self.deliver(WorkerInput::Command(text.to_string()))
    }

    fn send_object(&self, payload: &Payload) -> TransportResult<()> {
        let payload = roundtrip(&self.codec, payload.clone())?;
        self.deliver(WorkerInput::Object(payload))
    }

    fn receive_object(&self) -> TransportResult<Payload> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let inbound = self.from_worker.lock().recv();
        match inbound {
            Ok(Inbound::Payload(payload)) => Ok(payload),
            Ok(Inbound::Closed(reason)) => {
                if self.closed.load(Ordering::Acquire) {
                    Err(TransportError::Closed)
                } else {
                    Err(TransportError::WorkerDied(reason))
                }
            }
            Err(_) => Err(TransportError::WorkerDied("worker end dropped".to_string())),
        }
    }

    fn interrupt(&self) -> TransportResult<()> {
        self.deliver(WorkerInput::Interrupt)
    }

    fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.to_worker.lock().take();
        if let Some(wake) = self.wake.lock().take() {
            let _ = wake.send(Inbound::Closed("transport destroyed".to_string()));
        }
    }

    fn describe(&self) -> String {
        match &self.codec {
            Some(codec) => format!("loopback ({})", codec.name()),
            None => "loopback".to_string(),
        }
    }
}

/// Worker side of an in-memory channel
pub struct WorkerEnd {
    inbox: Receiver<WorkerInput>,
    to_host: Sender<Inbound>,
    output: Arc<OutputScanner>,
    codec: Option<Arc<dyn PayloadCodec>>,
}

impl WorkerEnd {
    /// Block for the next input. `None` once the host has gone away.
    pub fn recv(&self) -> Option<WorkerInput> {
        self.inbox.recv().ok()
    }

    /// Wait up to `timeout` for the next input.
    ///
    /// `Ok(None)` means the timeout elapsed.
    pub fn recv_timeout(&self, timeout: Duration) -> TransportResult<Option<WorkerInput>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(input) => Ok(Some(input)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    /// Send a payload to the host.
    pub fn send(&self, payload: Payload) -> TransportResult<()> {
        let payload = roundtrip(&self.codec, payload)?;
        self.to_host
            .send(Inbound::Payload(payload))
            .map_err(|_| TransportError::Closed)
    }

    /// Write text to the worker's primary output.
    pub fn print(&self, text: &str) {
        self.output.feed(OutputStream::Stdout, text.as_bytes());
    }

    /// Write text to the worker's error output.
    pub fn eprint(&self, text: &str) {
        self.output.feed(OutputStream::Stderr, text.as_bytes());
    }
}

impl Drop for WorkerEnd {
    fn drop(&mut self) {
        // The host keeps its own sender for `destroy`, so say goodbye explicitly.
        let _ = self.to_host.send(Inbound::Closed("worker end dropped".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protocol::{GoalId, ResultPayload};
    use crate::transport::codec::JsonLinesCodec;

    fn result(id: u64) -> Payload {
        Payload::Result(ResultPayload {
            id: GoalId(id),
            succeeded: true,
            bindings: Vec::new(),
            undefined: false,
            error: None,
        })
    }

    #[test]
    fn test_payloads_cross_in_both_directions() {
        let (transport, worker) = pair_with_codec(OutputScanner::new(), Arc::new(JsonLinesCodec));

        transport.send_command("start.\n").expect("command");
        assert_eq!(worker.recv(), Some(WorkerInput::Command("start.\n".to_string())));

        worker.send(result(1)).expect("send");
        assert_eq!(transport.receive_object().expect("receive"), result(1));
    }

    #[test]
    fn test_dropping_worker_reports_death() {
        let (transport, worker) = pair(OutputScanner::new());
        drop(worker);
        assert!(matches!(
            transport.receive_object(),
            Err(TransportError::WorkerDied(_))
        ));
    }

    #[test]
    fn test_destroy_unblocks_receiver() {
        let (transport, _worker) = pair(OutputScanner::new());
        let transport = Arc::new(transport);
        let reader = {
            let transport = transport.clone();
            std::thread::spawn(move || transport.receive_object())
        };

        transport.destroy();
        let outcome = reader.join().expect("join");
        assert!(matches!(outcome, Err(TransportError::Closed)));
        assert!(matches!(
            transport.send_command("x"),
            Err(TransportError::Closed)
        ));
    }
}
