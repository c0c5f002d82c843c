//! Command line definition for `jaks-run`

use clap::Parser;
use std::path::PathBuf;

/// jaks-run - run a program with pumped standard streams
#[derive(Debug, Parser)]
#[command(name = "jaks-run")]
#[command(about = "Run a program, pumping its standard streams, and report how it ended")]
#[command(long_about = r#"
jaks-run runs COMMAND without a shell, streams its output, and exits with the
child's own exit code.

EXAMPLES:
  # Run in another directory with an extra variable
  jaks-run --cwd /tmp --env GREETING=hi -- sh -c 'echo $GREETING'

  # Kill the child after 5 seconds
  jaks-run --timeout 5 -- ./slow-task

  # Feed stdin from a file and print a JSON report
  jaks-run --stdin-file input.txt --json -- sort

CONFIGURATION:
  Configuration is loaded with precedence: CLI flags > config file > defaults
  Config file is discovered by searching upward from CWD for .jaks/config.toml

EXIT CODES:
  child's code on non-zero exit, 2 usage or configuration error,
  124 timeout, 130 interrupted, 1 any other failure
"#)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Working directory for the child
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Environment override for the child (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Kill the child after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Interval between exit polls, in milliseconds
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Feed the child's stdin from this file
    #[arg(long, value_name = "FILE")]
    pub stdin_file: Option<PathBuf>,

    /// Capture stdout and print it decoded once the child succeeds
    #[arg(long)]
    pub capture: bool,

    /// Text encoding used to decode stdout for --capture and --json
    #[arg(long, value_name = "NAME", default_value = "utf-8")]
    pub encoding: String,

    /// Print a JSON report of the run on stdout
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging on stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Program and arguments to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Parse `KEY=VALUE`. The value may itself contain `=`.
pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}
