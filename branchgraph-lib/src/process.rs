//! Spawns the version-control binary and streams its output.
//!
//! This is deliberately the thinnest layer in the crate: construct with an
//! argument vector, then either iterate decoded lines or consume the whole
//! thing as a string. Everything upstream (the branch/commit model) talks to
//! the repository exclusively through [`VcsRunner`]; nothing here knows what
//! the arguments mean.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

/// A failure invoking the version-control binary.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The binary could not be spawned at all (not found, not executable).
    #[error("failed to run `{}`: {source}", format_argv(.argv))]
    Spawn {
        /// Pieces of the attempted command line.
        argv: Vec<String>,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The binary exited with a non-zero status.
    #[error(
        "`{}` exited with status {status}: {stderr}",
        format_argv(.argv)
    )]
    NonZeroExit {
        /// Pieces of the attempted command line.
        argv: Vec<String>,
        /// The process exit code, or -1 if terminated by a signal.
        status: i32,
        /// Captured standard error, decoded lossily as UTF-8.
        stderr: String,
    },

    /// Reading the child's output failed for a reason other than being
    /// interrupted (which is retried transparently).
    #[error("I/O error reading output of `{}`: {source}", format_argv(.argv))]
    Io {
        /// Pieces of the attempted command line.
        argv: Vec<String>,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

fn format_argv(argv: &[String]) -> String {
    argv.join(" ")
}

/// Invokes a single version-control binary (e.g. `git`) with a fixed
/// working directory.
#[derive(Debug, Clone)]
pub struct VcsRunner {
    binary: PathBuf,
    dir: PathBuf,
}

impl VcsRunner {
    /// Creates a runner that invokes `binary` with `dir` as the current
    /// directory for every spawned process.
    pub fn new(binary: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        VcsRunner {
            binary: binary.into(),
            dir: dir.into(),
        }
    }

    /// Runs the command to completion and returns its stdout as a single
    /// string, with at most one trailing newline stripped. Fails on
    /// non-zero exit, carrying the captured stderr.
    pub fn run(&self, args: &[&str]) -> Result<String, ProcessError> {
        let mut scoped = self.spawn(args)?;
        let mut output = String::new();
        scoped
            .stdout
            .read_to_string(&mut output)
            .map_err(|source| ProcessError::Io {
                argv: scoped.argv.clone(),
                source,
            })?;
        scoped.finish()?;
        if output.ends_with('\n') {
            output.pop();
        }
        Ok(output)
    }

    /// Runs the command to completion and returns its stdout split on `\n`,
    /// with the final empty record (from a trailing newline, or the whole
    /// output if it was empty) suppressed.
    pub fn run_lines(&self, args: &[&str]) -> Result<Vec<String>, ProcessError> {
        let mut scoped = self.spawn(args)?;
        let mut reader = BufReader::new(&mut scoped.stdout);
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = retry_on_eintr(|| reader.read_line(&mut line)).map_err(|source| {
                ProcessError::Io {
                    argv: scoped.argv.clone(),
                    source,
                }
            })?;
            if read == 0 {
                break;
            }
            if line.ends_with('\n') {
                line.pop();
            }
            lines.push(line);
        }
        scoped.finish()?;
        Ok(lines)
    }

    fn spawn(&self, args: &[&str]) -> Result<ScopedChild, ProcessError> {
        let argv: Vec<String> = std::iter::once(self.binary.to_string_lossy().into_owned())
            .chain(args.iter().map(|arg| arg.to_string()))
            .collect();

        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                argv: argv.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .expect("stdout was requested as piped");

        Ok(ScopedChild {
            child,
            stdout,
            argv,
        })
    }
}

/// Guarantees the child is reaped (and its stderr captured) once dropped or
/// explicitly finished, mirroring a `with`-style scoped subprocess.
struct ScopedChild {
    child: Child,
    stdout: ChildStdout,
    argv: Vec<String>,
}

impl ScopedChild {
    fn finish(mut self) -> Result<(), ProcessError> {
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let status = retry_on_eintr(|| self.child.wait()).map_err(|source| ProcessError::Io {
            argv: self.argv.clone(),
            source,
        })?;
        if !status.success() {
            return Err(ProcessError::NonZeroExit {
                argv: self.argv.clone(),
                status: status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }
}

impl Drop for ScopedChild {
    fn drop(&mut self) {
        // Best-effort reap if `finish` was never called (e.g. the caller
        // abandoned iteration early): make sure we don't leak a zombie.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Retries `f` if it fails with `ErrorKind::Interrupted`; any other error is
/// returned to the caller.
fn retry_on_eintr<T>(mut f: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Finds the repository's control directory for `start_dir`, shelling out to
/// `git rev-parse --git-dir`. Used once at startup to pin the watch roots
/// and the [`VcsRunner`] working directory.
pub fn discover_git_dir(binary: &Path, start_dir: &Path) -> Result<PathBuf, ProcessError> {
    let runner = VcsRunner::new(binary, start_dir);
    let raw = runner.run(&["rev-parse", "--git-dir"])?;
    let path = PathBuf::from(raw);
    Ok(if path.is_absolute() {
        path
    } else {
        start_dir.join(path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_trimmed_stdout() {
        let runner = VcsRunner::new("echo", std::env::temp_dir());
        let output = runner.run(&["hello"]).unwrap();
        assert_eq!(output, "hello");
    }

    #[test]
    fn run_lines_suppresses_trailing_empty_record() {
        let runner = VcsRunner::new("printf", std::env::temp_dir());
        let lines = runner.run_lines(&["a\\nb\\nc\\n"]).unwrap();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn nonzero_exit_captures_stderr() {
        let runner = VcsRunner::new("sh", std::env::temp_dir());
        let err = runner
            .run(&["-c", "echo oops 1>&2; exit 7"])
            .unwrap_err();
        match err {
            ProcessError::NonZeroExit { status, stderr, .. } => {
                assert_eq!(status, 7);
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let runner = VcsRunner::new("definitely-not-a-real-binary", std::env::temp_dir());
        assert!(matches!(
            runner.run(&[]),
            Err(ProcessError::Spawn { .. })
        ));
    }
}
