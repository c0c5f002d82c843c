use std::ffi::OsString;
use std::io::{self, Cursor, Read, Write};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::{CancellationToken, DestroyProcess, ShutdownHandler};
use crate::config::SubprocessConfig;
use crate::encoding::{TextEncoding, decode_diagnostic};
use crate::env::inherited_environment;
use crate::error::{SubprocessError, SubprocessFailure};
use crate::invocation::Invocation;
use crate::io::{Sink, TeeWriter};
use crate::process::{KillReason, ProcessHandle, Spawn, SystemSpawner, exit_code};
#[cfg(unix)]
use crate::pump::set_nonblocking;
use crate::pump::{PumpOutcome, PumpRole, StopSignal, spawn_input_pump, spawn_output_pump};

// ============================================================================
// Streams - Caller-side wiring for one call
// ============================================================================

/// Sources and sinks for one call.
///
/// Without stdin the child's stdin is the null device. Stdout and stderr
/// default to this process's own handles. Whatever the stderr sink, stderr is
/// also captured internally for failure reports.
#[derive(Default)]
pub struct Streams<'a> {
    stdin: Option<Box<dyn Read + Send>>,
    stdout: Sink<'a>,
    stderr: Sink<'a>,
}

impl<'a> Streams<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the child's stdin from `source`.
    #[must_use]
    pub fn stdin(mut self, source: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(source));
        self
    }

    /// Feed the child's stdin from an in-memory buffer.
    #[must_use]
    pub fn stdin_bytes(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin(Cursor::new(bytes.into()))
    }

    #[must_use]
    pub fn stdout(mut self, sink: Sink<'a>) -> Self {
        self.stdout = sink;
        self
    }

    #[must_use]
    pub fn stderr(mut self, sink: Sink<'a>) -> Self {
        self.stderr = sink;
        self
    }
}

impl std::fmt::Debug for Streams<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streams")
            .field("stdin", &self.stdin.as_ref().map(|_| ".."))
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .finish()
    }
}

/// Result of the state machine before exit-code mapping
#[derive(Debug)]
struct Completion {
    exit_code: i32,
    stderr: Vec<u8>,
}

// ============================================================================
// Subprocess - Launch, pump, wait, clean up
// ============================================================================

/// Runs an [`Invocation`] with its standard streams pumped on worker threads.
///
/// Each call spawns one process and blocks the calling thread until the
/// process has exited and every pump has been joined. Stdout and stderr are
/// pumped concurrently with the process; stdin, when supplied, is fed on a
/// third worker that is stopped once the process exits. Whatever happens, the
/// process is destroyed and deregistered from the cancellation token before
/// the call returns.
///
/// # Example
///
/// ```rust,no_run
/// use jaks_subprocess::{Invocation, Subprocess, TextEncoding};
///
/// let subprocess = Subprocess::new(Invocation::new(["echo", "hello"])?);
/// let text = subprocess.call_text(TextEncoding::Utf8)?;
/// assert_eq!(text, "hello\n");
/// # Ok::<(), jaks_subprocess::SubprocessError>(())
/// ```
pub struct Subprocess {
    invocation: Invocation,
    config: SubprocessConfig,
    base_env: Option<Vec<(OsString, OsString)>>,
    cancel: Option<CancellationToken>,
    shutdown_handler: Arc<dyn ShutdownHandler>,
    spawner: Arc<dyn Spawn>,
}

impl Subprocess {
    #[must_use]
    pub fn new(invocation: Invocation) -> Self {
        Self {
            invocation,
            config: SubprocessConfig::default(),
            base_env: None,
            cancel: None,
            shutdown_handler: Arc::new(DestroyProcess),
            spawner: Arc::new(SystemSpawner),
        }
    }

    /// Shorthand for `Subprocess::new(Invocation::new(args)?)`.
    ///
    /// # Errors
    ///
    /// Returns [`SubprocessError::DirectoryNotFound`] if the current
    /// directory cannot be resolved.
    pub fn from_args<I, S>(args: I) -> Result<Self, SubprocessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self::new(Invocation::new(args)?))
    }

    #[must_use]
    pub const fn config(mut self, config: SubprocessConfig) -> Self {
        self.config = config;
        self
    }

    /// Kill the process and fail with [`SubprocessError::Timeout`] once
    /// `timeout` has elapsed.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Merge environment overrides into `base` instead of this process's
    /// environment.
    #[must_use]
    pub fn base_env<I, K, V>(mut self, base: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.base_env = Some(base.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Register every call with `token`.
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Replace what happens to a running process when the token fires.
    #[must_use]
    pub fn shutdown_handler(mut self, handler: Arc<dyn ShutdownHandler>) -> Self {
        self.shutdown_handler = handler;
        self
    }

    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn Spawn>) -> Self {
        self.spawner = spawner;
        self
    }

    #[must_use]
    pub const fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn invocation_mut(&mut self) -> &mut Invocation {
        &mut self.invocation
    }

    #[must_use]
    pub const fn settings(&self) -> &SubprocessConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Call forms
    // ------------------------------------------------------------------------

    /// Run and return stdout. Stderr is not forwarded anywhere.
    ///
    /// # Errors
    ///
    /// [`SubprocessError::Failed`] on a non-zero exit; see
    /// [`call_with`](Self::call_with) for the rest.
    pub fn call(&self) -> Result<Vec<u8>, SubprocessError> {
        let mut stdout = Vec::new();
        self.call_with(
            Streams::new()
                .stdout(Sink::Writer(&mut stdout))
                .stderr(Sink::Discard),
        )?;
        Ok(stdout)
    }

    /// Run with `stdin` as input and return stdout.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call).
    pub fn call_with_input(&self, stdin: &[u8]) -> Result<Vec<u8>, SubprocessError> {
        let mut stdout = Vec::new();
        self.call_with(
            Streams::new()
                .stdin_bytes(stdin)
                .stdout(Sink::Writer(&mut stdout))
                .stderr(Sink::Discard),
        )?;
        Ok(stdout)
    }

    /// Run and return stdout decoded with `encoding`.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call).
    pub fn call_text(&self, encoding: TextEncoding) -> Result<String, SubprocessError> {
        Ok(encoding.decode(&self.call()?))
    }

    /// Run with `stdin` encoded as input and return stdout decoded, both with
    /// `encoding`.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call).
    pub fn call_text_with_input(
        &self,
        stdin: &str,
        encoding: TextEncoding,
    ) -> Result<String, SubprocessError> {
        Ok(encoding.decode(&self.call_with_input(&encoding.encode(stdin))?))
    }

    /// Run and stream stdout into `stdout` as it is produced.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call).
    pub fn call_into(&self, stdout: &mut (dyn Write + Send)) -> Result<(), SubprocessError> {
        self.call_with(
            Streams::new()
                .stdout(Sink::Writer(stdout))
                .stderr(Sink::Discard),
        )
    }

    /// Run with caller-supplied wiring; a non-zero exit is an error.
    ///
    /// # Errors
    ///
    /// - [`SubprocessError::Failed`] if the process exits non-zero, carrying
    ///   its stderr
    /// - [`SubprocessError::Pump`] if moving bytes to or from the process
    ///   failed (reported ahead of the exit code)
    /// - [`SubprocessError::Timeout`] / [`SubprocessError::Cancelled`] if the
    ///   process was killed by the deadline or the token
    /// - [`SubprocessError::Spawn`] / [`SubprocessError::EmptyCommand`] if the
    ///   process could not be started
    pub fn call_with(&self, streams: Streams<'_>) -> Result<(), SubprocessError> {
        let completion = self.run(streams)?;
        if completion.exit_code == 0 {
            return Ok(());
        }

        let failure = SubprocessFailure::new(
            self.invocation.to_vec(),
            completion.exit_code,
            self.invocation.working_dir().to_path_buf(),
            decode_diagnostic(&completion.stderr),
        );
        debug!(exit_code = failure.exit_code, command = %self.invocation.command_line(), "Subprocess exited non-zero");
        Err(failure.into())
    }

    /// Run with caller-supplied wiring and return the exit code as is.
    ///
    /// # Errors
    ///
    /// As [`call_with`](Self::call_with), minus the non-zero exit case.
    pub fn execute(&self, streams: Streams<'_>) -> Result<i32, SubprocessError> {
        self.run(streams).map(|completion| completion.exit_code)
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    fn environment(&self) -> Vec<(OsString, OsString)> {
        self.base_env.clone().unwrap_or_else(inherited_environment)
    }

    fn run(&self, streams: Streams<'_>) -> Result<Completion, SubprocessError> {
        let Streams {
            stdin,
            stdout,
            stderr,
        } = streams;

        let program = self
            .invocation
            .program()
            .ok_or(SubprocessError::EmptyCommand)?
            .to_string();

        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(SubprocessError::Cancelled {
                command: self.invocation.to_vec(),
            });
        }

        // NotStarted -> Running
        let mut command = self.invocation.to_command(self.environment())?;
        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = self
            .spawner
            .spawn(&mut command)
            .map_err(|source| SubprocessError::Spawn {
                program: program.clone(),
                source,
            })?;
        let started = Instant::now();

        info!(
            program = %program,
            pid = child.id(),
            cwd = %self.invocation.working_dir().display(),
            "Spawned subprocess"
        );

        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let process = Arc::new(ProcessHandle::new(child, program.clone()).in_own_group(cfg!(unix)));

        // Dropped last: after the process has been destroyed
        let _hook = self
            .cancel
            .as_ref()
            .map(|token| token.register(&process, Arc::clone(&self.shutdown_handler)));

        let result = thread::scope(|scope| -> Result<Completion, SubprocessError> {
            // Dropped first on every path, so blocked pumps see end of stream
            let _destroy = DestroyOnDrop(&process);

            let watchdog = match self.config.timeout {
                Some(timeout) => Some(Watchdog::arm(scope, Arc::clone(&process), timeout)?),
                None => None,
            };

            // Running -> Draining
            let stdout_pipe = child_stdout.ok_or_else(|| missing_pipe(PumpRole::Stdout))?;
            let stdout_pump = spawn_output_pump(
                scope,
                PumpRole::Stdout,
                stdout_pipe,
                stdout.into_writer(PumpRole::Stdout),
            )
            .map_err(|source| pump_error(PumpRole::Stdout, source))?;

            let stderr_pipe = child_stderr.ok_or_else(|| missing_pipe(PumpRole::Stderr))?;
            let stderr_sink = TeeWriter::new(stderr.into_writer(PumpRole::Stderr), Vec::new());
            let stderr_pump = spawn_output_pump(scope, PumpRole::Stderr, stderr_pipe, stderr_sink)
                .map_err(|source| pump_error(PumpRole::Stderr, source))?;

            let stop = StopSignal::new();
            let stdin_pump = match (stdin, child_stdin) {
                (Some(source), Some(pipe)) => Some({
                    // Keeps the pump responsive to `stop` while the pipe is full
                    #[cfg(unix)]
                    if let Err(err) = set_nonblocking(&pipe) {
                        warn!(error = %err, "Failed to make child stdin non-blocking");
                    }

                    spawn_input_pump(scope, source, pipe, stop.clone(), self.config.poll_interval)
                        .map_err(|source| pump_error(PumpRole::Stdin, source))?
                }),
                _ => None,
            };

            // Draining -> WaitingExit: stdout first, then stderr
            let stdout_done = join_pump(PumpRole::Stdout, stdout_pump);
            let stderr_done = join_pump(PumpRole::Stderr, stderr_pump);
            let status = process.wait(self.config.poll_interval);
            if let Some(watchdog) = watchdog {
                watchdog.disarm();
            }

            // WaitingExit -> JoiningStdin
            let stdin_done = stdin_pump.map(|handle| {
                stop.signal();
                join_pump(PumpRole::Stdin, handle)
            });

            // JoiningStdin -> Completed | Failed
            let stdout_done = stdout_done?;
            let (_, captured_stderr) = stderr_done?.sink.into_parts();
            let stdin_bytes = match stdin_done {
                Some(done) => done?.bytes,
                None => 0,
            };
            let status = status.map_err(|source| SubprocessError::Wait {
                program: program.clone(),
                source,
            })?;

            match process.kill_reason() {
                Some(KillReason::Timeout) => {
                    return Err(SubprocessError::Timeout {
                        command: self.invocation.to_vec(),
                        timeout: self.config.timeout.unwrap_or_default(),
                    });
                }
                Some(KillReason::Cancelled) => {
                    return Err(SubprocessError::Cancelled {
                        command: self.invocation.to_vec(),
                    });
                }
                Some(KillReason::Cleanup) | None => {}
            }

            debug!(
                stdout_bytes = stdout_done.bytes,
                stderr_bytes = captured_stderr.len(),
                stdin_bytes,
                "Pumps joined"
            );

            Ok(Completion {
                exit_code: exit_code(status),
                stderr: captured_stderr,
            })
        });

        let duration_ms = started.elapsed().as_millis();
        match &result {
            Ok(completion) => info!(
                program = %program,
                exit_code = completion.exit_code,
                duration_ms = %duration_ms,
                "Subprocess finished"
            ),
            Err(err) => warn!(
                program = %program,
                duration_ms = %duration_ms,
                error = %err,
                "Subprocess failed"
            ),
        }

        result
    }
}

impl From<Invocation> for Subprocess {
    fn from(invocation: Invocation) -> Self {
        Self::new(invocation)
    }
}

impl std::fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subprocess")
            .field("invocation", &self.invocation)
            .field("config", &self.config)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

struct DestroyOnDrop<'a>(&'a ProcessHandle);

impl Drop for DestroyOnDrop<'_> {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

/// Kills the process if it is still running when the deadline passes.
struct Watchdog<'scope> {
    done: mpsc::Sender<()>,
    handle: ScopedJoinHandle<'scope, ()>,
}

impl<'scope> Watchdog<'scope> {
    fn arm<'env>(
        scope: &'scope Scope<'scope, 'env>,
        process: Arc<ProcessHandle>,
        timeout: Duration,
    ) -> Result<Self, SubprocessError> {
        let (done, disarmed) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("subprocess-watchdog".to_string())
            .spawn_scoped(scope, move || {
                if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(timeout) {
                    match process.kill(KillReason::Timeout) {
                        Ok(true) => warn!(
                            pid = process.id(),
                            program = %process.program(),
                            timeout_ms = %timeout.as_millis(),
                            "Deadline passed; killed process"
                        ),
                        Ok(false) => {}
                        Err(err) => warn!(pid = process.id(), error = %err, "Failed to kill process at deadline"),
                    }
                }
            })
            .map_err(|source| SubprocessError::Spawn {
                program: "subprocess-watchdog".to_string(),
                source,
            })?;

        Ok(Self { done, handle })
    }

    fn disarm(self) {
        // A send after the watchdog already fired finds no receiver; either way it ends
        let _ = self.done.send(());
        if self.handle.join().is_err() {
            warn!("Watchdog thread panicked");
        }
    }
}

fn join_pump<W>(
    role: PumpRole,
    handle: ScopedJoinHandle<'_, PumpOutcome<W>>,
) -> Result<PumpOutcome<W>, SubprocessError> {
    let mut outcome = handle
        .join()
        .map_err(|_| pump_error(role, io::Error::other(format!("{role} pump panicked"))))?;

    if let Some(source) = outcome.error.take() {
        return Err(pump_error(role, source));
    }
    Ok(outcome)
}

const fn pump_error(role: PumpRole, source: io::Error) -> SubprocessError {
    SubprocessError::Pump { role, source }
}

fn missing_pipe(role: PumpRole) -> SubprocessError {
    pump_error(role, io::Error::other(format!("child {role} was not captured")))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Child, Command};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sh(script: &str) -> Subprocess {
        Subprocess::from_args(["sh", "-c", script]).unwrap()
    }

    struct CountingSpawner(Arc<AtomicUsize>);

    impl Spawn for CountingSpawner {
        fn spawn(&self, command: &mut Command) -> io::Result<Child> {
            self.0.fetch_add(1, Ordering::SeqCst);
            SystemSpawner.spawn(command)
        }
    }

    struct RefusingSpawner;

    impl Spawn for RefusingSpawner {
        fn spawn(&self, _command: &mut Command) -> io::Result<Child> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    #[test]
    fn test_call_returns_stdout_exactly() {
        let output = sh("printf 'a\\nb'").call().unwrap();
        assert_eq!(output, b"a\nb");
    }

    #[test]
    fn test_non_zero_exit_carries_stderr() {
        let err = sh("printf boom >&2; exit 2").call().unwrap_err();
        let failure = err.as_failure().expect("non-zero exit should be a failure");
        assert_eq!(failure.exit_code, 2);
        assert_eq!(failure.stderr, "boom");
        assert_eq!(failure.command[0], "sh");
    }

    #[test]
    fn test_execute_returns_exit_code_without_failing() {
        let code = sh("exit 7")
            .execute(Streams::new().stdout(Sink::Discard).stderr(Sink::Discard))
            .unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn test_stderr_reaches_caller_sink_and_capture() {
        let mut err_sink: Vec<u8> = Vec::new();
        let result = sh("printf oops >&2; exit 1").call_with(
            Streams::new()
                .stdout(Sink::Discard)
                .stderr(Sink::Writer(&mut err_sink)),
        );

        assert_eq!(result.unwrap_err().as_failure().unwrap().stderr, "oops");
        assert_eq!(err_sink, b"oops");
    }

    #[test]
    fn test_stdin_is_delivered_and_closed() {
        let output = Subprocess::from_args(["cat"])
            .unwrap()
            .call_text_with_input("abc", TextEncoding::Utf8)
            .unwrap();
        assert_eq!(output, "abc");
    }

    #[test]
    fn test_large_output_is_not_truncated() {
        let output = sh("i=0; while [ $i -lt 2000 ]; do echo 0123456789abcdef; i=$((i+1)); done")
            .call()
            .unwrap();
        assert_eq!(output.len(), 2000 * 17);
    }

    #[test]
    fn test_empty_invocation_is_rejected() {
        let subprocess = Subprocess::new(Invocation::new(Vec::<String>::new()).unwrap());
        assert!(matches!(subprocess.call(), Err(SubprocessError::EmptyCommand)));
    }

    #[test]
    fn test_spawn_failure_is_propagated() {
        let err = Subprocess::from_args(["true"])
            .unwrap()
            .spawner(Arc::new(RefusingSpawner))
            .call()
            .unwrap_err();
        match err {
            SubprocessError::Spawn { program, source } => {
                assert_eq!(program, "true");
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("Expected Spawn error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = Subprocess::from_args(["this_command_definitely_does_not_exist_12345"])
            .unwrap()
            .call()
            .unwrap_err();
        assert!(matches!(err, SubprocessError::Spawn { .. }), "got {err:?}");
    }

    #[test]
    fn test_spawner_called_once_per_call() {
        let count = Arc::new(AtomicUsize::new(0));
        let subprocess = Subprocess::from_args(["true"])
            .unwrap()
            .spawner(Arc::new(CountingSpawner(Arc::clone(&count))));

        subprocess.call().unwrap();
        subprocess.call().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timeout_kills_process() {
        let started = Instant::now();
        let err = Subprocess::from_args(["sleep", "30"])
            .unwrap()
            .timeout(Duration::from_millis(200))
            .call()
            .unwrap_err();

        assert!(matches!(err, SubprocessError::Timeout { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_timeout_reaches_grandchildren() {
        // sh forks sleep, which holds stdout open; the group kill closes it
        let started = Instant::now();
        let err = sh("sleep 30; echo done")
            .timeout(Duration::from_millis(200))
            .call()
            .unwrap_err();

        assert!(matches!(err, SubprocessError::Timeout { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_timeout_after_leader_exit() {
        // sh exits at once; only its backgrounded sleep keeps stdout open
        let started = Instant::now();
        let err = sh("sleep 30 & exit 0")
            .timeout(Duration::from_millis(200))
            .call()
            .unwrap_err();

        assert!(matches!(err, SubprocessError::Timeout { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_fast_process_beats_timeout() {
        let output = Subprocess::from_args(["echo", "quick"])
            .unwrap()
            .timeout(Duration::from_secs(30))
            .call()
            .unwrap();
        assert_eq!(output, b"quick\n");
    }

    #[test]
    fn test_cancelled_token_prevents_spawn() {
        let count = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        token.cancel();

        let err = Subprocess::from_args(["true"])
            .unwrap()
            .spawner(Arc::new(CountingSpawner(Arc::clone(&count))))
            .cancellation_token(token)
            .call()
            .unwrap_err();

        assert!(matches!(err, SubprocessError::Cancelled { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_during_call() {
        let token = CancellationToken::new();
        let subprocess = Subprocess::from_args(["sleep", "30"])
            .unwrap()
            .cancellation_token(token.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            token.cancel();
            token
        });

        let err = subprocess.call().unwrap_err();
        let token = canceller.join().unwrap();
        assert!(matches!(err, SubprocessError::Cancelled { .. }), "got {err:?}");
        assert_eq!(token.registered(), 0, "hook must be deregistered after the call");
    }

    #[test]
    fn test_hook_deregistered_after_success() {
        let token = CancellationToken::new();
        Subprocess::from_args(["true"])
            .unwrap()
            .cancellation_token(token.clone())
            .call()
            .unwrap();
        assert_eq!(token.registered(), 0);
    }

    #[test]
    fn test_stdin_source_error_is_pump_failure() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("source broke"))
            }
        }

        let err = Subprocess::from_args(["cat"])
            .unwrap()
            .call_with(
                Streams::new()
                    .stdin(Broken)
                    .stdout(Sink::Discard)
                    .stderr(Sink::Discard),
            )
            .unwrap_err();

        match err {
            SubprocessError::Pump { role, source } => {
                assert_eq!(role, PumpRole::Stdin);
                assert_eq!(source.to_string(), "source broke");
            }
            other => panic!("Expected stdin pump error, got {other:?}"),
        }
    }

    #[test]
    fn test_stdout_sink_error_takes_precedence_over_exit_code() {
        struct Rejecting;
        impl Write for Rejecting {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("sink rejected"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sink = Rejecting;
        let err = sh("echo out; exit 3")
            .call_with(
                Streams::new()
                    .stdout(Sink::Writer(&mut sink))
                    .stderr(Sink::Discard),
            )
            .unwrap_err();

        match err {
            SubprocessError::Pump { role, .. } => assert_eq!(role, PumpRole::Stdout),
            other => panic!("Expected stdout pump error, got {other:?}"),
        }
    }

    #[test]
    fn test_exit_while_grandchild_holds_unread_stdin() {
        // sh exits at once; the backgrounded sleep keeps stdin open via fd 3 and
        // never reads it, so the pipe fills up long before the input runs out
        let input = vec![b'x'; 1 << 20];
        let started = Instant::now();
        let output = sh("exec 3<&0; sleep 30 >/dev/null 2>&1 & exit 0")
            .call_with_input(&input)
            .unwrap();

        assert!(output.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    }

    #[test]
    fn test_child_that_ignores_stdin_still_succeeds() {
        let input = vec![b'x'; 1024 * 1024];
        let output = Subprocess::from_args(["echo", "ignored"])
            .unwrap()
            .call_with_input(&input)
            .unwrap();
        assert_eq!(output, b"ignored\n");
    }

    #[test]
    fn test_base_env_override() {
        let output = Subprocess::from_args(["sh", "-c", "printf %s \"$GREETING\""])
            .unwrap()
            .base_env([("GREETING", "hi"), ("PATH", "/usr/bin:/bin")])
            .call_text(TextEncoding::Utf8)
            .unwrap();
        assert_eq!(output, "hi");
    }

    #[test]
    fn test_call_into_streams_to_writer() {
        let mut out: Vec<u8> = Vec::new();
        sh("printf streamed").call_into(&mut out).unwrap();
        assert_eq!(out, b"streamed");
    }
}
