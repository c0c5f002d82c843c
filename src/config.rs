//! Configuration for `jaks-run`
//!
//! Values come from three layers with precedence CLI > config file >
//! built-in defaults. The config file is `.jaks/config.toml`, discovered by
//! searching upward from the starting directory and stopping at a repository
//! root, or named explicitly with `--config`.
//!
//! ```toml
//! [runner]
//! timeout_secs = 30
//! poll_interval_ms = 10
//! working_dir = "build"
//!
//! [env]
//! RUST_BACKTRACE = "1"
//!
//! [logging]
//! verbose = true
//! ```
//!
//! A relative `working_dir` in the file is resolved against the directory
//! that holds `.jaks/`.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use jaks_subprocess::{DEFAULT_POLL_INTERVAL, SubprocessConfig};

/// Directory searched for during discovery
pub const CONFIG_DIR: &str = ".jaks";

/// File name inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.toml";

/// Where an effective value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Command line flag
    Cli,
    /// Config file at the given path
    ConfigFile(PathBuf),
    /// Built-in default
    Default,
}

impl ConfigSource {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::ConfigFile(_) => "config",
            Self::Default => "default",
        }
    }
}

/// Values supplied on the command line. `None` defers to the lower layers.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: Option<f64>,
    pub poll_interval_ms: Option<u64>,
    pub env: Vec<(String, String)>,
    pub verbose: Option<bool>,
}

/// `[runner]` section
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    pub timeout_secs: Option<f64>,
    pub poll_interval_ms: Option<u64>,
    pub working_dir: Option<PathBuf>,
}

/// `[logging]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub verbose: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    runner: Option<RunnerConfig>,
    env: Option<BTreeMap<String, String>>,
    logging: Option<LoggingConfig>,
}

/// Effective configuration after layering.
#[derive(Debug, Clone)]
pub struct Config {
    pub runner: RunnerConfig,
    /// Environment overrides applied to the child
    pub env: BTreeMap<String, String>,
    pub logging: LoggingConfig,
    /// Config file that was loaded, if any
    pub config_file: Option<PathBuf>,
    pub source_attribution: HashMap<String, ConfigSource>,
}

impl Config {
    /// Discover and load configuration starting from the current directory.
    ///
    /// # Errors
    ///
    /// Fails if the current directory is unavailable or the config file
    /// cannot be read, parsed or validated.
    pub fn discover(cli_args: &CliArgs) -> Result<Self> {
        let start_dir = std::env::current_dir().context("Failed to get current directory")?;
        Self::discover_from(&start_dir, cli_args)
    }

    /// Discover and load configuration starting from `start_dir`.
    ///
    /// # Errors
    ///
    /// As [`discover`](Self::discover).
    pub fn discover_from(start_dir: &Path, cli_args: &CliArgs) -> Result<Self> {
        let mut source_attribution = HashMap::new();
        let mut runner = RunnerConfig::default();
        let mut env = BTreeMap::new();
        let mut logging = LoggingConfig::default();

        for key in ["timeout_secs", "poll_interval_ms", "working_dir", "verbose"] {
            source_attribution.insert(key.to_string(), ConfigSource::Default);
        }

        let config_file = match &cli_args.config_path {
            Some(explicit) => Some(explicit.clone()),
            None => Self::discover_config_file_from(start_dir),
        };

        if let Some(path) = &config_file {
            let file_config = Self::load_config_file(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;
            let source = ConfigSource::ConfigFile(path.clone());

            if let Some(file_runner) = file_config.runner {
                if file_runner.timeout_secs.is_some() {
                    runner.timeout_secs = file_runner.timeout_secs;
                    source_attribution.insert("timeout_secs".to_string(), source.clone());
                }
                if file_runner.poll_interval_ms.is_some() {
                    runner.poll_interval_ms = file_runner.poll_interval_ms;
                    source_attribution.insert("poll_interval_ms".to_string(), source.clone());
                }
                if let Some(dir) = file_runner.working_dir {
                    runner.working_dir = Some(project_root(path).join(dir));
                    source_attribution.insert("working_dir".to_string(), source.clone());
                }
            }

            for (key, value) in file_config.env.unwrap_or_default() {
                source_attribution.insert(format!("env.{key}"), source.clone());
                env.insert(key, value);
            }

            if let Some(file_logging) = file_config.logging
                && file_logging.verbose.is_some()
            {
                logging.verbose = file_logging.verbose;
                source_attribution.insert("verbose".to_string(), source.clone());
            }
        }

        // CLI overrides everything
        if cli_args.timeout_secs.is_some() {
            runner.timeout_secs = cli_args.timeout_secs;
            source_attribution.insert("timeout_secs".to_string(), ConfigSource::Cli);
        }
        if cli_args.poll_interval_ms.is_some() {
            runner.poll_interval_ms = cli_args.poll_interval_ms;
            source_attribution.insert("poll_interval_ms".to_string(), ConfigSource::Cli);
        }
        if cli_args.working_dir.is_some() {
            runner.working_dir.clone_from(&cli_args.working_dir);
            source_attribution.insert("working_dir".to_string(), ConfigSource::Cli);
        }
        for (key, value) in &cli_args.env {
            source_attribution.insert(format!("env.{key}"), ConfigSource::Cli);
            env.insert(key.clone(), value.clone());
        }
        if cli_args.verbose.is_some() {
            logging.verbose = cli_args.verbose;
            source_attribution.insert("verbose".to_string(), ConfigSource::Cli);
        }

        let config = Self {
            runner,
            env,
            logging,
            config_file,
            source_attribution,
        };
        config.validate()?;
        Ok(config)
    }

    /// Search upward from `start_dir` for `.jaks/config.toml`.
    ///
    /// The search stops at the filesystem root or at the first directory
    /// that looks like a repository root.
    #[must_use]
    pub fn discover_config_file_from(start_dir: &Path) -> Option<PathBuf> {
        let mut current = Some(start_dir);

        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILE);
            if candidate.is_file() {
                return Some(candidate);
            }

            if [".git", ".hg", ".svn"].iter().any(|marker| dir.join(marker).exists()) {
                break;
            }
            current = dir.parent();
        }

        None
    }

    fn load_config_file(path: &Path) -> Result<TomlConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if let Some(secs) = self.runner.timeout_secs
            && (!secs.is_finite() || secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err())
        {
            bail!("timeout_secs must be a positive number of seconds, got {secs}");
        }
        if self.runner.poll_interval_ms == Some(0) {
            bail!("poll_interval_ms must be at least 1");
        }
        if let Some(key) = self.env.keys().find(|key| key.is_empty() || key.contains('=')) {
            bail!("invalid environment variable name: {key:?}");
        }
        Ok(())
    }

    /// Execution tunables for the core runner.
    #[must_use]
    pub fn subprocess_config(&self) -> SubprocessConfig {
        let mut config = SubprocessConfig::default().with_poll_interval(
            self.runner
                .poll_interval_ms
                .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis),
        );
        if let Some(timeout) = self.runner.timeout_secs.and_then(|secs| Duration::try_from_secs_f64(secs).ok()) {
            config = config.with_timeout(timeout);
        }
        config
    }

    /// Working directory for the child; the current directory if unset.
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.runner
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    #[must_use]
    pub fn verbose(&self) -> bool {
        self.logging.verbose.unwrap_or(false)
    }

    /// Effective values as key -> (value, source label).
    #[must_use]
    pub fn effective_config(&self) -> BTreeMap<String, (String, String)> {
        let label = |key: &str| {
            self.source_attribution
                .get(key)
                .unwrap_or(&ConfigSource::Default)
                .label()
                .to_string()
        };
        let subprocess = self.subprocess_config();

        let mut effective = BTreeMap::new();
        effective.insert(
            "timeout_secs".to_string(),
            (
                subprocess
                    .timeout
                    .map_or_else(|| "none".to_string(), |t| t.as_secs_f64().to_string()),
                label("timeout_secs"),
            ),
        );
        effective.insert(
            "poll_interval_ms".to_string(),
            (subprocess.poll_interval.as_millis().to_string(), label("poll_interval_ms")),
        );
        effective.insert(
            "working_dir".to_string(),
            (self.working_dir().display().to_string(), label("working_dir")),
        );
        effective.insert("verbose".to_string(), (self.verbose().to_string(), label("verbose")));
        for (key, value) in &self.env {
            let attributed = format!("env.{key}");
            effective.insert(attributed.clone(), (value.clone(), label(&attributed)));
        }
        effective
    }
}

/// Directory holding `.jaks/` for a discovered file; the file's own directory
/// for anything else.
fn project_root(config_file: &Path) -> PathBuf {
    let parent = config_file.parent().unwrap_or_else(|| Path::new("."));
    if parent.file_name().is_some_and(|name| name == CONFIG_DIR) {
        parent.parent().unwrap_or(parent).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}
