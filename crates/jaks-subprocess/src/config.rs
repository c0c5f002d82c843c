//! Tunables for subprocess execution

use std::time::Duration;

/// Default interval between stdin availability checks and exit polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Execution settings shared by every call made through a `Subprocess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubprocessConfig {
    /// How often the stdin pump re-checks its stop signal, and how often the
    /// orchestrator polls for exit
    pub poll_interval: Duration,
    /// Optional deadline after which the process is killed and the call fails
    pub timeout: Option<Duration>,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

impl SubprocessConfig {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SubprocessConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert!(config.timeout.is_none());
    }

    #[test]
    fn test_builders() {
        let config = SubprocessConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(1));
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
    }
}
