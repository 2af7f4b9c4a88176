//! Subprocess transport
//!
//! Spawns the worker with piped stdin/stdout/stderr and opens a loopback TCP
//! listener for the structured channel. The listener port is substituted for
//! `{port}` in the worker arguments and startup commands; the worker is
//! expected to connect back once. Output streams are drained by reader
//! threads into the engine's scanner.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use super::codec::{CodecKind, PayloadCodec};
use super::{InterruptMethod, Transport};
use crate::engine::error::{CodecError, TransportError, TransportResult};
use crate::engine::protocol::Payload;
use crate::engine::recognizer::{OutputScanner, OutputStream};

/// How to launch a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Worker executable
    pub program: PathBuf,

    /// Arguments; `{port}` is replaced by the structured-channel port
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Commands written to stdin right after spawning; `{port}` is replaced
    #[serde(default)]
    pub startup_commands: Vec<String>,

    /// Structured channel codec
    #[serde(default)]
    pub codec: CodecKind,

    /// How long to wait for the worker to connect back
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl ProcessConfig {
    /// Launch `program` with default settings.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            startup_commands: Vec::new(),
            codec: CodecKind::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

struct Channel {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    control: TcpStream,
}

/// Worker running as a child process
pub struct ProcessTransport {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    channel: Channel,
    codec: Arc<dyn PayloadCodec>,
    interrupt: InterruptMethod,
    closed: AtomicBool,
    description: String,
}

impl ProcessTransport {
    /// Spawn the worker and wait for it to open the structured channel.
    ///
    /// Interrupts are delivered with `interrupt`, taken from the worker's
    /// dialect descriptor.
    pub fn spawn(
        config: &ProcessConfig,
        interrupt: InterruptMethod,
        output: Arc<OutputScanner>,
    ) -> TransportResult<Self> {
        if config.program.as_os_str().is_empty() {
            return Err(TransportError::EmptyCommand);
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port().to_string();

        let mut command = Command::new(&config.program);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        for arg in &config.args {
            command.arg(arg.replace("{port}", &port));
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or(TransportError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(TransportError::MissingPipe("stderr"))?;
        let mut stdin = child.stdin.take().ok_or(TransportError::MissingPipe("stdin"))?;

        spawn_output_reader(stdout, OutputStream::Stdout, output.clone());
        spawn_output_reader(stderr, OutputStream::Stderr, output);

        for startup in &config.startup_commands {
            stdin.write_all(startup.replace("{port}", &port).as_bytes())?;
        }
        stdin.flush()?;

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = match accept_within(listener, timeout) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };
        stream.set_nodelay(true).ok();

        let description = format!(
            "process {} (pid {}, port {})",
            config.program.display(),
            child.id(),
            port
        );
        tracing::info!(transport = %description, "worker connected");

        let channel = Channel {
            reader: Mutex::new(BufReader::new(stream.try_clone()?)),
            writer: Mutex::new(BufWriter::new(stream.try_clone()?)),
            control: stream,
        };

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            channel,
            codec: config.codec.build(),
            interrupt,
            closed: AtomicBool::new(false),
            description,
        })
    }

    /// Operating system process id of the worker.
    pub fn pid(&self) -> u32 {
        self.child.lock().id()
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn write_stdin(&self, bytes: &[u8]) -> TransportResult<()> {
        self.ensure_open()?;
        let mut guard = self.stdin.lock();
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;
        stdin.write_all(bytes).map_err(|err| self.classify(err))?;
        stdin.flush().map_err(|err| self.classify(err))
    }

    fn classify(&self, err: io::Error) -> TransportError {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => {
                if self.closed.load(Ordering::Acquire) {
                    TransportError::Closed
                } else {
                    TransportError::WorkerDied(err.to_string())
                }
            }
            _ => TransportError::Io(err),
        }
    }

    #[cfg(unix)]
    fn signal_interrupt(&self) -> TransportResult<()> {
        let pid = self.child.lock().id() as libc::pid_t;
        let result = unsafe { libc::kill(pid, libc::SIGINT) };
        if result == 0 {
            Ok(())
        } else {
            Err(TransportError::Io(io::Error::last_os_error()))
        }
    }

    #[cfg(not(unix))]
    fn signal_interrupt(&self) -> TransportResult<()> {
        Err(TransportError::Unsupported(
            "signal interrupts require a unix host".to_string(),
        ))
    }
}

impl Transport for ProcessTransport {
    fn send_command(&self, text: &str) -> TransportResult<()> {
        self.write_stdin(text.as_bytes())
    }

    fn send_object(&self, payload: &Payload) -> TransportResult<()> {
        self.ensure_open()?;
        let frame = self.codec.encode(payload)?;
        let mut writer = self.channel.writer.lock();
        writer.write_all(&frame).map_err(|err| self.classify(err))?;
        writer.flush().map_err(|err| self.classify(err))
    }

    fn receive_object(&self) -> TransportResult<Payload> {
        self.ensure_open()?;
        let mut reader = self.channel.reader.lock();
        match self.codec.decode(&mut *reader) {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => {
                self.ensure_open()?;
                Err(TransportError::WorkerDied(
                    "structured channel closed by worker".to_string(),
                ))
            }
            Err(CodecError::Io(err)) => Err(self.classify(err)),
            Err(err) => Err(err.into()),
        }
    }

    fn interrupt(&self) -> TransportResult<()> {
        self.ensure_open()?;
        match &self.interrupt {
            InterruptMethod::Signal => self.signal_interrupt(),
            InterruptMethod::Sequence(sequence) => self.write_stdin(sequence.as_bytes()),
        }
    }

    fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.channel.control.shutdown(Shutdown::Both);
        self.stdin.lock().take();

        let mut child = self.child.lock();
        // Ignore errors: the worker may already have exited.
        let _ = child.kill();
        let _ = child.wait();
        tracing::info!(transport = %self.description, "worker process destroyed");
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn accept_within(listener: TcpListener, timeout: Duration) -> TransportResult<TcpStream> {
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("termbridge-accept".to_string())
        .spawn(move || {
            let _ = tx.send(listener.accept().map(|(stream, _)| stream));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(TransportError::Io(err)),
        Err(_) => {
            // Unblock the accept thread so it does not outlive the attempt.
            let _ = TcpStream::connect(addr);
            Err(TransportError::ConnectTimeout(timeout))
        }
    }
}

fn spawn_output_reader<R>(mut stream: R, name: OutputStream, output: Arc<OutputScanner>)
where
    R: Read + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name(format!("termbridge-{}", name))
        .spawn(move || {
            let mut buffer = [0u8; 8192];
            loop {
                match stream.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => output.feed(name, &buffer[..n]),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            tracing::debug!(stream = %name, "worker output stream closed");
        });

    if let Err(err) = spawned {
        tracing::warn!(stream = %name, error = %err, "failed to start output reader");
    }
}
