//! `jaks-run` command implementation
//!
//! [`run`] parses arguments, layers configuration, wires Ctrl-C to a
//! cancellation token and runs the child. It prints every diagnostic itself
//! and hands back only the process exit code.

mod args;

pub use args::{Cli, parse_env_pair};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, warn};

use jaks_subprocess::{
    CancellationToken, Invocation, Sink, Streams, Subprocess, SubprocessError, TextEncoding,
};

use crate::config::{CliArgs, Config};
use crate::exit_codes::ExitCode;
use crate::logging::init_tracing;

/// How a run ended, as printed by `--json`.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub command: Vec<String>,
    pub cwd: String,
    /// `success`, `failed`, `timeout`, `cancelled` or `error`
    pub status: &'static str,
    pub exit_code: Option<i32>,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    fn status_for(result: &Result<(), SubprocessError>) -> &'static str {
        match result {
            Ok(()) => "success",
            Err(SubprocessError::Failed(_)) => "failed",
            Err(SubprocessError::Timeout { .. }) => "timeout",
            Err(SubprocessError::Cancelled { .. }) => "cancelled",
            Err(_) => "error",
        }
    }
}

/// Entry point for the binary.
///
/// # Errors
///
/// Returns the exit code to terminate with when the run did not succeed.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();

    let cli_args = CliArgs {
        config_path: cli.config.clone(),
        working_dir: cli.cwd.clone(),
        timeout_secs: cli.timeout,
        poll_interval_ms: cli.poll_interval_ms,
        env: cli.env.clone(),
        verbose: cli.verbose.then_some(true),
    };

    let config = match Config::discover(&cli_args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("jaks-run: {err:#}");
            return Err(ExitCode::CLI_ARGS);
        }
    };

    if let Err(err) = init_tracing(config.verbose()) {
        eprintln!("jaks-run: failed to initialize logging: {err}");
    }
    for (key, (value, source)) in config.effective_config() {
        debug!(key = %key, value = %value, source = %source, "Effective config");
    }

    let encoding = match TextEncoding::from_str(&cli.encoding) {
        Ok(encoding) => encoding,
        Err(err) => {
            eprintln!("jaks-run: {err}");
            return Err(ExitCode::CLI_ARGS);
        }
    };

    let invocation = match Invocation::with_env(config.working_dir(), config.env.clone(), cli.command.clone()) {
        Ok(invocation) => invocation,
        Err(err) => {
            eprintln!("jaks-run: {err}");
            return Err(ExitCode::from(&err));
        }
    };

    let token = CancellationToken::new();
    let handler_token = token.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %err, "Failed to install Ctrl-C handler; interrupts will not cancel the child");
    }

    let subprocess = Subprocess::new(invocation)
        .config(config.subprocess_config())
        .cancellation_token(token);

    execute(&cli, &subprocess, encoding)
}

fn execute(cli: &Cli, subprocess: &Subprocess, encoding: TextEncoding) -> Result<(), ExitCode> {
    let mut streams = Streams::new();
    if let Some(path) = &cli.stdin_file {
        let file = match File::open(path).with_context(|| format!("Failed to open stdin file: {}", path.display())) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("jaks-run: {err:#}");
                return Err(ExitCode::CLI_ARGS);
            }
        };
        streams = streams.stdin(file);
    }

    let started = Instant::now();
    let capture = cli.capture || cli.json;
    let mut captured: Vec<u8> = Vec::new();
    let result = if capture {
        subprocess.call_with(streams.stdout(Sink::Writer(&mut captured)))
    } else {
        subprocess.call_with(streams)
    };
    let duration_ms = started.elapsed().as_millis();

    if cli.json {
        let report = RunReport {
            command: subprocess.invocation().to_vec(),
            cwd: subprocess.invocation().working_dir().display().to_string(),
            status: RunReport::status_for(&result),
            exit_code: match &result {
                Ok(()) => Some(0),
                Err(err) => err.exit_code(),
            },
            duration_ms,
            stdout: Some(encoding.decode(&captured)),
            stderr: result.as_ref().err().and_then(SubprocessError::as_failure).map(|f| f.stderr.clone()),
            error: result.as_ref().err().map(ToString::to_string),
        };
        print_json(&report);
    } else if cli.capture && result.is_ok() {
        let mut stdout = std::io::stdout().lock();
        if let Err(err) = stdout.write_all(encoding.decode(&captured).as_bytes()).and_then(|()| stdout.flush()) {
            warn!(error = %err, "Failed to write captured output");
        }
    }

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            if !cli.json && !matches!(err, SubprocessError::Failed(_)) {
                eprintln!("jaks-run: {err}");
            }
            Err(ExitCode::from(&err))
        }
    }
}

fn print_json(report: &RunReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("jaks-run: failed to serialize report: {err}"),
    }
}
