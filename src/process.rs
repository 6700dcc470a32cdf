//! External command execution.
//!
//! [`Cmd`] is a small builder over [`std::process::Command`]:
//!
//! ```rust,ignore
//! use tps_builder::process::Cmd;
//!
//! // Inherit the console, fail on non-zero exit.
//! Cmd::shell("make install").current_dir(&src).exec_or_fail()?;
//!
//! // Capture output, tolerate failure.
//! let out = Cmd::new("which").arg("nmake").allow_fail().run()?;
//! ```
//!
//! Build steps are single command-line strings handed to the platform shell
//! (`sh -c` or `cmd /S /C`), so no quoting is imposed on them here.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use tracing::{debug, info, warn};

use crate::error::{BuildError, IoContext, Result};

/// What to execute: a program with discrete arguments, or a shell line.
#[derive(Debug, Clone)]
enum Invocation {
    Program { program: OsString, args: Vec<OsString> },
    Shell(String),
}

/// Builder for one external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    invocation: Invocation,
    cwd: Option<PathBuf>,
    allow_fail: bool,
}

/// Exit status and captured output of a finished command.
#[derive(Debug)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, `-1` when the process was terminated by a signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl Cmd {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            invocation: Invocation::Program {
                program: program.into(),
                args: Vec::new(),
            },
            cwd: None,
            allow_fail: false,
        }
    }

    /// Run `line` through the platform shell.
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            invocation: Invocation::Shell(line.into()),
            cwd: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        if let Invocation::Program { args, .. } = &mut self.invocation {
            args.push(arg.into());
        }
        self
    }

    pub fn args<I, S>(mut self, new_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        if let Invocation::Program { args, .. } = &mut self.invocation {
            args.extend(new_args.into_iter().map(Into::into));
        }
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Do not turn a non-zero exit into [`BuildError::CommandFailed`].
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// The command line as it is reported in logs and errors.
    pub fn display(&self) -> String {
        match &self.invocation {
            Invocation::Shell(line) => line.clone(),
            Invocation::Program { program, args } => std::iter::once(program)
                .chain(args.iter())
                .map(|s| s.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = match &self.invocation {
            Invocation::Program { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            Invocation::Shell(line) => shell_command(line),
        };
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run with inherited stdio and return the exit status, whatever it is.
    pub fn status(&self) -> Result<ExitStatus> {
        let line = self.display();
        info!("RUN: {}", line);
        self.command()
            .stdin(Stdio::null())
            .status()
            .io_context(|| format!("starting [{}]", line))
    }

    /// Run with captured stdout/stderr.
    ///
    /// Fails on non-zero exit unless [`Cmd::allow_fail`] was set.
    pub fn run(&self) -> Result<CmdResult> {
        let line = self.display();
        debug!("RUN (captured): {}", line);
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .io_context(|| format!("starting [{}]", line))?;

        let result = CmdResult {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if !result.success() && !self.allow_fail {
            return Err(BuildError::CommandFailed {
                command: line,
                code: result.code(),
            });
        }
        Ok(result)
    }

    /// Run with inherited stdio and fail with [`BuildError::CommandFailed`]
    /// on a non-zero exit.
    pub fn exec_or_fail(&self) -> Result<()> {
        let status = self.status()?;
        if status.success() || self.allow_fail {
            return Ok(());
        }
        let code = status.code().unwrap_or(-1);
        warn!("[{}] exited with {}", self.display(), code);
        Err(BuildError::CommandFailed {
            command: self.display(),
            code,
        })
    }
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    use std::os::windows::process::CommandExt;

    let mut cmd = Command::new("cmd");
    cmd.arg("/S").arg("/C").raw_arg(format!("\"{line}\""));
    cmd
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

/// Scoped change of the process working directory.
///
/// The previous directory is restored when the guard drops, on the error
/// path as well as on normal return.
#[derive(Debug)]
pub struct ScopedDir {
    previous: PathBuf,
    current: PathBuf,
}

impl ScopedDir {
    pub fn enter(dir: &Path) -> Result<Self> {
        let previous = env::current_dir().io_context(|| "reading current directory")?;
        let current = dir
            .canonicalize()
            .io_context(|| format!("resolving '{}'", dir.display()))?;
        env::set_current_dir(&current)
            .io_context(|| format!("entering '{}'", current.display()))?;
        debug!("CHDIR: {}", current.display());
        Ok(Self { previous, current })
    }

    /// Absolute path of the directory this guard entered.
    pub fn path(&self) -> &Path {
        &self.current
    }
}

impl Drop for ScopedDir {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.previous) {
            warn!(
                "failed to restore working directory '{}': {}",
                self.previous.display(),
                e
            );
        }
    }
}

/// Run `f` with the process working directory set to `dir`.
pub fn in_dir<T>(dir: &Path, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let guard = ScopedDir::enter(dir)?;
    f(guard.path())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static PROCESS_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that touch process-wide state: the working directory,
    /// `PATH`, or child processes that depend on either.
    pub(crate) fn process_serial() -> MutexGuard<'static, ()> {
        PROCESS_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::test_support::process_serial;
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn run_captures_output() {
        let _serial = process_serial();
        let out = Cmd::shell("echo hello; echo oops 1>&2").run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_lossy().trim(), "hello");
        assert_eq!(out.stderr_lossy().trim(), "oops");
    }

    #[test]
    fn run_fails_on_nonzero_exit() {
        let _serial = process_serial();
        let err = Cmd::shell("exit 3").run().unwrap_err();
        match err {
            BuildError::CommandFailed { command, code } => {
                assert_eq!(command, "exit 3");
                assert_eq!(code, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn allow_fail_returns_status() {
        let _serial = process_serial();
        let out = Cmd::new("sh").args(["-c", "exit 4"]).allow_fail().run().unwrap();
        assert_eq!(out.code(), 4);
    }

    #[test]
    fn exec_or_fail_reports_exact_command() {
        let _serial = process_serial();
        let err = Cmd::shell("false && true || exit 7")
            .exec_or_fail()
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::CommandFailed { ref command, code: 7 } if command == "false && true || exit 7"
        ));
        Cmd::shell("true").exec_or_fail().unwrap();
    }

    #[test]
    fn missing_program_is_io_error() {
        let _serial = process_serial();
        let err = Cmd::new("definitely_not_a_real_command_12345").run().unwrap_err();
        assert!(matches!(err, BuildError::Io { .. }));
    }

    #[test]
    fn current_dir_scopes_subprocess() {
        let _serial = process_serial();
        let temp = TempDir::new().unwrap();
        Cmd::shell("touch marker")
            .current_dir(temp.path())
            .exec_or_fail()
            .unwrap();
        assert!(temp.path().join("marker").is_file());
    }

    #[test]
    fn display_joins_program_and_args() {
        let cmd = Cmd::new("nmake").args(["-f", "Makefile.MSVC"]);
        assert_eq!(cmd.display(), "nmake -f Makefile.MSVC");
    }

    #[test]
    fn scoped_dir_restores_on_success_and_failure() {
        let _serial = process_serial();
        let temp = TempDir::new().unwrap();
        let inner = temp.path().join("inner");
        fs::create_dir_all(&inner).unwrap();
        let before = env::current_dir().unwrap();

        let seen = in_dir(&inner, |dir| {
            assert_eq!(env::current_dir().unwrap(), dir);
            Ok(dir.to_path_buf())
        })
        .unwrap();
        assert_eq!(seen, inner.canonicalize().unwrap());
        assert_eq!(env::current_dir().unwrap(), before);

        let err = in_dir(&inner, |_| -> Result<()> {
            Cmd::shell("exit 1").exec_or_fail()
        })
        .unwrap_err();
        assert!(matches!(err, BuildError::CommandFailed { .. }));
        assert_eq!(env::current_dir().unwrap(), before);
    }

    #[test]
    fn scoped_dir_missing_dir_is_io_error() {
        let _serial = process_serial();
        let before = env::current_dir().unwrap();
        let err = ScopedDir::enter(Path::new("/nonexistent/tps-builder")).unwrap_err();
        assert!(matches!(err, BuildError::Io { .. }));
        assert_eq!(env::current_dir().unwrap(), before);
    }
}
