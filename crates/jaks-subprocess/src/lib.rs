//! Synchronous subprocess execution with pumped standard streams
//!
//! An [`Invocation`] names what to run: argv, working directory and
//! environment overrides. A [`Subprocess`] runs it, moving stdin, stdout and
//! stderr on dedicated worker threads so that a chatty child never blocks on
//! a full pipe. A non-zero exit becomes a [`SubprocessFailure`] carrying the
//! child's stderr.
//!
//! # Security Model
//!
//! Arguments are passed to the OS as discrete argv elements. No shell is
//! involved unless the caller names one as the program.
//!
//! # Cancellation
//!
//! Calls can be tied to a [`CancellationToken`]. Firing the token hands every
//! registered process to its [`ShutdownHandler`], which by default kills it.
//! Nothing is installed process-wide; hosts wire the token to whatever signal
//! they care about.

pub mod cancel;
pub mod config;
pub mod encoding;
pub mod env;
pub mod error;
pub mod invocation;
pub mod io;
pub mod process;
pub mod pump;
pub mod subprocess;

pub use cancel::{CancellationToken, DestroyProcess, HookGuard, ShutdownHandler};
pub use config::{DEFAULT_POLL_INTERVAL, SubprocessConfig};
pub use encoding::{TextEncoding, decode_diagnostic};
pub use env::{inherited_environment, merge_environment};
pub use error::{SubprocessError, SubprocessFailure};
pub use invocation::Invocation;
pub use io::{Sink, TeeWriter};
pub use process::{KillReason, ProcessHandle, Spawn, SystemSpawner, exit_code};
pub use pump::{PUMP_BUFFER_SIZE, PumpOutcome, PumpRole, StopSignal};
pub use subprocess::{Streams, Subprocess};
