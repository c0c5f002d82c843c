//! Pump tasks that move bytes between a child process and the caller
//!
//! Each pump is bound to one (source, destination) pair and a role. Output
//! pumps block on reads from the child until the stream closes. The stdin
//! pump polls for input so that it can be told to stop within one poll
//! interval. A pump never raises its I/O error on its own thread: the error
//! is returned through the join handle and inspected by the caller after the
//! join.

use std::fmt;
use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Chunk size used by every pump
pub const PUMP_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the input source reader and the stdin pump
const SOURCE_QUEUE_DEPTH: usize = 4;

static WORKER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Which stream a pump serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpRole {
    Stdout,
    Stderr,
    Stdin,
}

impl PumpRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Stdin => "stdin",
        }
    }
}

impl fmt::Display for PumpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn worker_name(role: PumpRole) -> String {
    format!("{role}-pump-{}", WORKER_COUNT.fetch_add(1, Ordering::Relaxed))
}

/// What a pump hands back when it ends.
///
/// `error` is the terminal error slot: set at most once, by the pump itself.
#[derive(Debug)]
pub struct PumpOutcome<W> {
    pub role: PumpRole,
    pub bytes: u64,
    pub sink: W,
    pub error: Option<io::Error>,
}

impl<W> PumpOutcome<W> {
    fn finished(role: PumpRole, bytes: u64, sink: W) -> Self {
        Self {
            role,
            bytes,
            sink,
            error: None,
        }
    }

    fn failed(role: PumpRole, bytes: u64, sink: W, error: io::Error) -> Self {
        Self {
            role,
            bytes,
            sink,
            error: Some(error),
        }
    }
}

// ============================================================================
// Output pumps (stdout / stderr)
// ============================================================================

/// Copy `source` into `sink` until end of stream, then flush.
pub fn pump_output<R: Read, W: Write>(role: PumpRole, mut source: R, mut sink: W) -> PumpOutcome<W> {
    let mut buffer = [0u8; PUMP_BUFFER_SIZE];
    let mut bytes = 0u64;

    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return PumpOutcome::failed(role, bytes, sink, err),
        };
        if let Err(err) = sink.write_all(&buffer[..read]) {
            return PumpOutcome::failed(role, bytes, sink, err);
        }
        bytes += read as u64;
    }

    if let Err(err) = sink.flush() {
        return PumpOutcome::failed(role, bytes, sink, err);
    }

    debug!(role = %role, bytes, "Pump reached end of stream");
    PumpOutcome::finished(role, bytes, sink)
}

/// Start an output pump on its own named thread within `scope`.
pub fn spawn_output_pump<'scope, 'env, R, W>(
    scope: &'scope Scope<'scope, 'env>,
    role: PumpRole,
    source: R,
    sink: W,
) -> io::Result<ScopedJoinHandle<'scope, PumpOutcome<W>>>
where
    R: Read + Send + 'scope,
    W: Write + Send + 'scope,
{
    thread::Builder::new()
        .name(worker_name(role))
        .spawn_scoped(scope, move || pump_output(role, source, sink))
}

// ============================================================================
// Input pump (stdin)
// ============================================================================

/// Cooperative stop request shared between the orchestrator and the stdin pump.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type Chunk = io::Result<Vec<u8>>;

/// Read `source` on a detached thread and forward its chunks.
///
/// The thread ends at end of input, on a read error (forwarded), or as soon
/// as a send finds the receiver gone. A source that blocks forever keeps the
/// thread parked in `read` until the source yields.
fn spawn_source_reader(mut source: Box<dyn Read + Send>) -> io::Result<mpsc::Receiver<Chunk>> {
    let (tx, rx) = mpsc::sync_channel::<Chunk>(SOURCE_QUEUE_DEPTH);

    thread::Builder::new()
        .name(format!("stdin-source-{}", WORKER_COUNT.fetch_add(1, Ordering::Relaxed)))
        .spawn(move || {
            let mut buffer = [0u8; PUMP_BUFFER_SIZE];
            loop {
                let chunk = match source.read(&mut buffer) {
                    Ok(0) => return,
                    Ok(n) => Ok(buffer[..n].to_vec()),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => Err(err),
                };
                let stop = chunk.is_err();
                if tx.send(chunk).is_err() || stop {
                    return;
                }
            }
        })?;

    Ok(rx)
}

/// How far a chunk got before [`deliver`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Complete,
    Stopped,
}

/// Write all of `chunk` to `sink`, counting accepted bytes into `bytes`.
///
/// A sink that reports `WouldBlock` (a full non-blocking pipe) is retried
/// once per `poll_interval`, checking `stop` before each wait.
fn deliver<W: Write>(
    sink: &mut W,
    chunk: &[u8],
    stop: &StopSignal,
    poll_interval: Duration,
    bytes: &mut u64,
) -> io::Result<Delivery> {
    let mut rest = chunk;

    while !rest.is_empty() {
        match sink.write(rest) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                rest = &rest[n..];
                *bytes += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if stop.is_signalled() {
                    return Ok(Delivery::Stopped);
                }
                thread::sleep(poll_interval);
            }
            Err(err) => return Err(err),
        }
    }

    match sink.flush() {
        Err(err) if err.kind() != io::ErrorKind::WouldBlock => Err(err),
        _ => Ok(Delivery::Complete),
    }
}

/// Feed `source` into the child's stdin until the source is exhausted or
/// `stop` is signalled.
///
/// `stop` is checked before every wait and after every poll interval, so a
/// stop request is observed within roughly one `poll_interval`. That also
/// holds while the child is not reading, provided the sink is non-blocking
/// (see [`set_nonblocking`]). When the source is exhausted the child's stdin
/// is closed so that it sees end of input. A broken pipe means the child
/// stopped reading; the pump ends without error in that case.
pub fn pump_input<W: Write>(
    source: Box<dyn Read + Send>,
    sink: W,
    stop: &StopSignal,
    poll_interval: Duration,
) -> PumpOutcome<()> {
    let role = PumpRole::Stdin;
    let mut sink = sink;
    let mut bytes = 0u64;

    let chunks = match spawn_source_reader(source) {
        Ok(rx) => rx,
        Err(err) => return PumpOutcome::failed(role, bytes, (), err),
    };

    loop {
        if stop.is_signalled() {
            debug!(bytes, "Stdin pump stopped on request");
            return PumpOutcome::finished(role, bytes, ());
        }

        match chunks.recv_timeout(poll_interval) {
            Ok(Ok(chunk)) => match deliver(&mut sink, &chunk, stop, poll_interval, &mut bytes) {
                Ok(Delivery::Complete) => {}
                Ok(Delivery::Stopped) => {
                    debug!(bytes, "Stdin pump stopped while the child was not reading");
                    return PumpOutcome::finished(role, bytes, ());
                }
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(bytes, "Child closed stdin before all input was written");
                    return PumpOutcome::finished(role, bytes, ());
                }
                Err(err) => return PumpOutcome::failed(role, bytes, (), err),
            },
            Ok(Err(err)) => return PumpOutcome::failed(role, bytes, (), err),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                drop(sink);
                debug!(bytes, "Stdin source exhausted; closed child stdin");
                return PumpOutcome::finished(role, bytes, ());
            }
        }
    }
}

/// Put a pipe end into non-blocking mode, so writes to a full pipe fail
/// with `WouldBlock` instead of parking the stdin pump.
///
/// # Errors
///
/// Returns the OS error from `fcntl`.
#[cfg(unix)]
pub fn set_nonblocking(pipe: &impl AsFd) -> io::Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};

    let fd = pipe.as_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Start the stdin pump on its own named thread within `scope`.
pub fn spawn_input_pump<'scope, 'env, W>(
    scope: &'scope Scope<'scope, 'env>,
    source: Box<dyn Read + Send>,
    sink: W,
    stop: StopSignal,
    poll_interval: Duration,
) -> io::Result<ScopedJoinHandle<'scope, PumpOutcome<()>>>
where
    W: Write + Send + 'scope,
{
    thread::Builder::new()
        .name(worker_name(PumpRole::Stdin))
        .spawn_scoped(scope, move || pump_input(source, sink, &stop, poll_interval))
}
