//! Exit codes for `jaks-run`.
//!
//! | Code | Constant | Description |
//! |------|----------|-------------|
//! | 0 | `SUCCESS` | The child exited zero |
//! | 1 | `INTERNAL` | Spawn, pump or other failure |
//! | 2 | `CLI_ARGS` | Invalid arguments or configuration |
//! | 124 | `TIMEOUT` | The child was killed at its deadline |
//! | 130 | `CANCELLED` | The child was killed on interrupt |
//!
//! A child that exits non-zero passes its own code through.

use jaks_subprocess::SubprocessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);

    pub const INTERNAL: ExitCode = ExitCode(1);

    /// Invalid command line, config file, working directory or encoding
    pub const CLI_ARGS: ExitCode = ExitCode(2);

    /// Same code `timeout(1)` uses
    pub const TIMEOUT: ExitCode = ExitCode(124);

    /// 128 + SIGINT
    pub const CANCELLED: ExitCode = ExitCode(130);

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }

    /// Pass a child's non-zero code through, falling back to `INTERNAL` for
    /// codes a process cannot exit with.
    #[must_use]
    pub const fn from_child(code: i32) -> Self {
        if code >= 1 && code <= 255 {
            ExitCode(code)
        } else {
            Self::INTERNAL
        }
    }
}

impl From<&SubprocessError> for ExitCode {
    fn from(err: &SubprocessError) -> Self {
        match err {
            SubprocessError::Failed(failure) => Self::from_child(failure.exit_code),
            SubprocessError::Timeout { .. } => Self::TIMEOUT,
            SubprocessError::Cancelled { .. } => Self::CANCELLED,
            SubprocessError::DirectoryNotFound { .. }
            | SubprocessError::EmptyCommand
            | SubprocessError::UnsupportedEncoding { .. } => Self::CLI_ARGS,
            SubprocessError::Spawn { .. }
            | SubprocessError::Pump { .. }
            | SubprocessError::Wait { .. } => Self::INTERNAL,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jaks_subprocess::SubprocessFailure;
    use std::path::PathBuf;
    use std::time::Duration;

    fn failed(code: i32) -> SubprocessError {
        SubprocessFailure::new(vec!["false".into()], code, PathBuf::from("/"), String::new()).into()
    }

    #[test]
    fn test_child_code_passes_through() {
        assert_eq!(ExitCode::from(&failed(3)).as_i32(), 3);
        assert_eq!(ExitCode::from(&failed(137)).as_i32(), 137);
    }

    #[test]
    fn test_unrepresentable_child_code_is_internal() {
        assert_eq!(ExitCode::from(&failed(-1)), ExitCode::INTERNAL);
        assert_eq!(ExitCode::from(&failed(256)), ExitCode::INTERNAL);
    }

    #[test]
    fn test_kill_reasons_map_to_conventional_codes() {
        let timeout = SubprocessError::Timeout {
            command: vec!["sleep".into()],
            timeout: Duration::from_secs(1),
        };
        let cancelled = SubprocessError::Cancelled {
            command: vec!["sleep".into()],
        };

        assert_eq!(ExitCode::from(&timeout).as_i32(), 124);
        assert_eq!(ExitCode::from(&cancelled).as_i32(), 130);
    }

    #[test]
    fn test_usage_errors_map_to_cli_args() {
        let err = SubprocessError::DirectoryNotFound {
            path: PathBuf::from("/nope"),
        };
        assert_eq!(ExitCode::from(&err), ExitCode::CLI_ARGS);
        assert_eq!(ExitCode::from(&SubprocessError::EmptyCommand), ExitCode::CLI_ARGS);
    }
}
