//! jaks - run external programs with pumped standard streams
//!
//! The process machinery lives in [`jaks_subprocess`] and is re-exported
//! here. This crate adds the `jaks-run` command line front end: config file
//! discovery, logging setup and exit-code mapping.

pub mod cli;
pub mod config;
pub mod exit_codes;
pub mod logging;

pub use config::{CliArgs, Config, ConfigSource};
pub use exit_codes::ExitCode;
pub use jaks_subprocess::{
    CancellationToken, Invocation, ShutdownHandler, Sink, Streams, Subprocess, SubprocessConfig,
    SubprocessError, SubprocessFailure, TextEncoding,
};
