use std::io;
use std::process::{Child, Command, ExitStatus};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::warn;

// ============================================================================
// Spawn Trait - Process Creation Seam
// ============================================================================

/// Creates child processes from prepared commands.
///
/// [`SystemSpawner`] hands the command to the OS. Other implementations can
/// wrap it, for example to count or refuse spawns in tests.
pub trait Spawn: Send + Sync {
    /// Start the process described by `command`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the process could not be created.
    fn spawn(&self, command: &mut Command) -> io::Result<Child>;
}

/// Spawns through `std::process::Command::spawn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSpawner;

impl Spawn for SystemSpawner {
    fn spawn(&self, command: &mut Command) -> io::Result<Child> {
        command.spawn()
    }
}

// ============================================================================
// ProcessHandle - Exclusively owned running process
// ============================================================================

/// Why a process was forcibly terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The caller's deadline passed
    Timeout,
    /// A cancellation token fired
    Cancelled,
    /// Cleanup at the end of a call
    Cleanup,
}

/// A running child process shared between the orchestrator, the deadline
/// watchdog and any cancellation token it is registered with.
///
/// The child sits behind a mutex that is only held for non-blocking calls,
/// so a kill is never stuck behind a wait.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Mutex<Child>,
    pid: u32,
    program: String,
    own_group: bool,
    kill_reason: Mutex<Option<KillReason>>,
}

impl ProcessHandle {
    #[must_use]
    pub fn new(child: Child, program: impl Into<String>) -> Self {
        let pid = child.id();
        Self {
            child: Mutex::new(child),
            pid,
            program: program.into(),
            own_group: false,
            kill_reason: Mutex::new(None),
        }
    }

    /// Mark the child as leader of its own process group, so kills take the
    /// whole group down with it.
    #[must_use]
    pub fn in_own_group(mut self, own_group: bool) -> Self {
        self.own_group = own_group;
        self
    }

    /// OS process id
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the process has exited (reaping it if so).
    ///
    /// # Errors
    ///
    /// Returns the OS error from the status query.
    pub fn has_exited(&self) -> io::Result<bool> {
        Ok(self.child().try_wait()?.is_some())
    }

    /// Forcibly terminate the process if it is still running.
    ///
    /// Returns `Ok(true)` when a kill was delivered. For a group leader the
    /// rest of its process group is killed too, even after the leader itself
    /// has exited, so members still holding its pipes go down with it.
    /// Killing when nothing is left running is a no-op returning `Ok(false)`.
    /// Only the first delivered kill's reason is recorded.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the kill could not be delivered.
    pub fn kill(&self, reason: KillReason) -> io::Result<bool> {
        let mut child = self.child();
        let mut delivered = false;

        if child.try_wait()?.is_none() {
            match child.kill() {
                Ok(()) => delivered = true,
                Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
                Err(err) => return Err(err),
            }
        }

        #[cfg(unix)]
        if self.own_group && kill_group(self.pid) {
            delivered = true;
        }

        if delivered {
            let mut recorded = self.kill_reason.lock().unwrap_or_else(PoisonError::into_inner);
            if recorded.is_none() {
                *recorded = Some(reason);
            }
        }
        Ok(delivered)
    }

    /// Reason recorded by the first delivered kill, if any.
    #[must_use]
    pub fn kill_reason(&self) -> Option<KillReason> {
        *self.kill_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the process to exit, checking every `poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from the status query.
    pub fn wait(&self, poll_interval: Duration) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.child().try_wait()? {
                return Ok(status);
            }
            thread::sleep(poll_interval);
        }
    }

    /// Kill the process (and for a group leader, whatever is left of its
    /// group) and reap it.
    ///
    /// Safe to call any number of times; once nothing is left running it
    /// does nothing.
    pub fn destroy(&self) {
        match self.kill(KillReason::Cleanup) {
            Ok(true) => {
                if let Err(err) = self.child().wait() {
                    warn!(pid = self.pid, program = %self.program, error = %err, "Failed to reap destroyed process");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(pid = self.pid, program = %self.program, error = %err, "Failed to destroy process");
            }
        }
    }
}

/// SIGKILL the process group led by `pid`.
///
/// Returns whether the signal reached at least one member. An empty group
/// (`ESRCH`) is not an error.
#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(pgid = pid, error = %err, "Failed to kill process group");
            false
        }
    }
}

/// Numeric exit code for a finished process.
///
/// On Unix a process terminated by a signal reports `128 + signal`, the
/// convention shells use. `-1` if neither is available.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
