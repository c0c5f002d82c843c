use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::env::merge_environment;
use crate::error::SubprocessError;

// ============================================================================
// Invocation - What to run, where, and with which environment overrides
// ============================================================================

/// Full description of a process to run.
///
/// An `Invocation` is an ordered, mutable list of argument strings (program
/// first) bound to a working directory and a set of environment overrides.
/// It dereferences to `Vec<String>`, so arguments may be pushed, extended or
/// edited in place before execution; the list itself is what gets executed.
///
/// The working directory is checked and canonicalized at construction. A
/// directory that does not exist fails construction, so no process can ever
/// be started for it.
///
/// Arguments are passed to the OS as discrete elements; nothing is run
/// through a shell.
///
/// # Example
///
/// ```rust
/// use jaks_subprocess::Invocation;
///
/// let mut invocation = Invocation::new(["git", "status"])?;
/// invocation.push("--short".to_string());
/// assert_eq!(invocation.len(), 3);
/// assert_eq!(invocation.program(), Some("git"));
/// # Ok::<(), jaks_subprocess::SubprocessError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    args: Vec<String>,
    working_dir: PathBuf,
    env_delta: BTreeMap<String, String>,
}

impl Invocation {
    /// Create an invocation that runs in the current directory.
    ///
    /// # Errors
    ///
    /// Returns [`SubprocessError::DirectoryNotFound`] if the current
    /// directory cannot be resolved.
    pub fn new<I, S>(args: I) -> Result<Self, SubprocessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::in_dir(".", args)
    }

    /// Create an invocation that runs in `working_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`SubprocessError::DirectoryNotFound`] if `working_dir` is not
    /// an existing directory.
    pub fn in_dir<P, I, S>(working_dir: P, args: I) -> Result<Self, SubprocessError>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_env(working_dir, std::iter::empty::<(String, String)>(), args)
    }

    /// Create an invocation with a working directory and environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`SubprocessError::DirectoryNotFound`] if `working_dir` is not
    /// an existing directory.
    pub fn with_env<P, E, K, V, I, S>(
        working_dir: P,
        env_delta: E,
        args: I,
    ) -> Result<Self, SubprocessError>
    where
        P: AsRef<Path>,
        E: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let working_dir = resolve_working_dir(working_dir.as_ref())?;
        Ok(Self {
            args: args.into_iter().map(Into::into).collect(),
            working_dir,
            env_delta: env_delta
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_delta.insert(key.into(), value.into());
        self
    }

    /// Add several environment overrides.
    #[must_use]
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in envs {
            self.env_delta.insert(key.into(), value.into());
        }
        self
    }

    /// The program to run, if any argument has been given.
    #[must_use]
    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Canonical working directory.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    #[must_use]
    pub fn env_delta(&self) -> &BTreeMap<String, String> {
        &self.env_delta
    }

    #[must_use]
    pub fn env_delta_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.env_delta
    }

    /// Program and arguments joined with spaces, for log lines.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }

    /// Build a `std::process::Command` for this invocation.
    ///
    /// The child gets a cleared environment populated from `base_env` with the
    /// overrides merged in (see [`merge_environment`]).
    ///
    /// # Errors
    ///
    /// Returns [`SubprocessError::EmptyCommand`] if no program was given, or
    /// [`SubprocessError::DirectoryNotFound`] if the working directory has
    /// disappeared since construction.
    pub fn to_command<E>(&self, base_env: E) -> Result<Command, SubprocessError>
    where
        E: IntoIterator<Item = (OsString, OsString)>,
    {
        let (program, args) = self
            .args
            .split_first()
            .ok_or(SubprocessError::EmptyCommand)?;

        if !self.working_dir.is_dir() {
            return Err(SubprocessError::DirectoryNotFound {
                path: self.working_dir.clone(),
            });
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(merge_environment(base_env, &self.env_delta));

        Ok(cmd)
    }
}

fn resolve_working_dir(dir: &Path) -> Result<PathBuf, SubprocessError> {
    let not_found = || SubprocessError::DirectoryNotFound {
        path: dir.to_path_buf(),
    };

    if !dir.is_dir() {
        return Err(not_found());
    }

    #[cfg(windows)]
    let canonical = dunce::canonicalize(dir);
    #[cfg(not(windows))]
    let canonical = dir.canonicalize();

    canonical.map_err(|_| not_found())
}

impl Deref for Invocation {
    type Target = Vec<String>;

    fn deref(&self) -> &Self::Target {
        &self.args
    }
}

impl DerefMut for Invocation {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.args
    }
}

impl<S: Into<String>> Extend<S> for Invocation {
    fn extend<T: IntoIterator<Item = S>>(&mut self, iter: T) {
        self.args.extend(iter.into_iter().map(Into::into));
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}$ {}", self.working_dir.display(), self.command_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_invocation_new_uses_current_dir() {
        let invocation = Invocation::new(["ls", "-al"]).unwrap();
        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
        assert_eq!(invocation.working_dir(), cwd.as_path());
        assert_eq!(invocation.program(), Some("ls"));
        assert_eq!(*invocation, vec!["ls".to_string(), "-al".to_string()]);
        assert!(invocation.env_delta().is_empty());
    }

    #[test]
    fn test_missing_directory_fails_construction() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("does-not-exist");

        match Invocation::in_dir(&missing, ["true"]) {
            Err(SubprocessError::DirectoryNotFound { path }) => assert_eq!(path, missing),
            other => panic!("Expected DirectoryNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_file_is_not_a_working_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(matches!(
            Invocation::in_dir(&file, ["true"]),
            Err(SubprocessError::DirectoryNotFound { .. })
        ));
    }

    #[test]
    fn test_working_dir_is_canonical() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a");
        std::fs::create_dir(&nested).unwrap();
        let indirect = nested.join("..").join("a");

        let invocation = Invocation::in_dir(&indirect, ["true"]).unwrap();
        assert_eq!(invocation.working_dir(), nested.canonicalize().unwrap());
    }

    #[test]
    fn test_arguments_are_mutable_in_place() {
        let mut invocation = Invocation::new(Vec::<String>::new()).unwrap();
        assert!(invocation.is_empty());
        assert_eq!(invocation.program(), None);

        invocation.push("echo".to_string());
        invocation.extend(["a", "b"]);
        invocation[1] = "A".to_string();
        assert_eq!(invocation.command_line(), "echo A b");
    }

    #[test]
    fn test_builder_chain() {
        let invocation = Invocation::new(["cargo"])
            .unwrap()
            .arg("build")
            .args(["--release", "--locked"])
            .env("RUST_LOG", "debug")
            .envs([("CARGO_TERM_COLOR", "never")]);

        assert_eq!(invocation.len(), 4);
        assert_eq!(invocation.env_delta().len(), 2);
        assert_eq!(
            invocation.env_delta().get("RUST_LOG").map(String::as_str),
            Some("debug")
        );
    }

    #[test]
    fn test_with_env_constructor() {
        let temp = TempDir::new().unwrap();
        let invocation = Invocation::with_env(temp.path(), [("FOO", "bar")], ["env"]).unwrap();
        assert_eq!(invocation.env_delta().get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn test_empty_invocation_cannot_become_command() {
        let invocation = Invocation::new(Vec::<String>::new()).unwrap();
        assert!(matches!(
            invocation.to_command(Vec::new()),
            Err(SubprocessError::EmptyCommand)
        ));
    }

    #[test]
    fn test_shell_metacharacters_preserved() {
        let invocation = Invocation::new(["echo", "$(whoami)", "a; rm -rf /", "`id`"]).unwrap();
        assert_eq!(invocation[1], "$(whoami)");
        assert_eq!(invocation[2], "a; rm -rf /");
        assert_eq!(invocation[3], "`id`");

        let cmd = invocation.to_command(Vec::new()).unwrap();
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("$(whoami)"));
    }

    #[test]
    fn test_display_includes_directory_and_command() {
        let temp = TempDir::new().unwrap();
        let invocation = Invocation::in_dir(temp.path(), ["echo", "hi"]).unwrap();
        let rendered = invocation.to_string();
        assert!(rendered.ends_with("$ echo hi"), "got: {rendered}");
    }
}
