//! Execution backends.
//!
//! A [`Runtime`] is everything the script runner needs from a machine: path
//! resolution, stat, buffered and background command execution, temp
//! directories and a sink for spilled output. [`LocalRuntime`] talks to the
//! host directly; [`RemoteRuntime`] tunnels the same contract over an OpenSSH
//! control connection. Both speak POSIX paths.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::process::{BackgroundHandle, ExitRecord};
use crate::process_group::{self, KillSignal};
use crate::quote::shell_quote;

mod local;
mod remote;

pub use local::LocalRuntime;
pub use remote::RemoteRuntime;

/// Exit code reported for buffered commands that hit their timeout, matching
/// coreutils `timeout`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Local,
    Remote,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("path not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    #[error("remote connection failed: {0}")]
    Connection(String),
}

impl RuntimeError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub is_directory: bool,
    pub is_file: bool,
    pub is_executable: bool,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl BufferedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Turn a failed run into a [`RuntimeError`].
    pub fn check(self, command: &str) -> Result<Self, RuntimeError> {
        if self.success() {
            return Ok(self);
        }
        Err(RuntimeError::CommandFailed {
            command: command.to_string(),
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub cwd: PathBuf,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// SIGTERM to SIGKILL window used by `terminate()`.
    pub grace: Duration,
    /// Longest line forwarded to the output callbacks.
    pub max_line_bytes: usize,
}

impl SpawnOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: HashMap::new(),
            grace: Duration::from_secs(2),
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Append-only destination for output that no longer fits in memory.
#[async_trait]
pub trait SpillSink: Send {
    fn path(&self) -> &Path;

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flush and close. The file stays on disk.
    async fn finish(self: Box<Self>) -> io::Result<()>;
}

#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn separator(&self) -> char {
        '/'
    }

    /// Lexical form used for prefix containment checks.
    fn normalize_path(&self, path: &Path) -> String {
        let normalized = wsrun_commons::normalize_path(path);
        let text = normalized.to_string_lossy();
        let trimmed = text.trim_end_matches(self.separator());
        if trimmed.is_empty() {
            self.separator().to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Absolute path with symlinks resolved. Paths that do not exist yet
    /// resolve through their deepest existing ancestor.
    async fn resolve_path(&self, path: &Path) -> Result<PathBuf, RuntimeError>;

    async fn stat(&self, path: &Path) -> Result<FileStat, RuntimeError>;

    /// Run `command` through `sh -c` and collect all of its output.
    async fn exec_buffered(
        &self,
        command: &str,
        options: ExecOptions,
    ) -> Result<BufferedOutput, RuntimeError>;

    /// Start `command` (a shell command line) detached in its own process
    /// group and return without waiting.
    async fn spawn_background(
        &self,
        command: &str,
        options: SpawnOptions,
    ) -> Result<BackgroundHandle, RuntimeError>;

    async fn create_spill_file(&self, path: &Path) -> Result<Box<dyn SpillSink>, RuntimeError>;

    /// Create a fresh directory, inside `parent` when given, else in the
    /// backend's temp location.
    async fn create_temp_dir(&self, parent: Option<&Path>) -> Result<PathBuf, RuntimeError> {
        let command = match parent {
            Some(parent) => {
                let parent = parent.to_string_lossy();
                format!(
                    "mkdir -p {} && mktemp -d {}",
                    shell_quote(&parent),
                    shell_quote(&format!("{parent}/script-XXXXXXXX"))
                )
            }
            None => "mktemp -d \"${TMPDIR:-/tmp}/wsrun-XXXXXXXX\"".to_string(),
        };
        let output = self
            .exec_buffered(&command, ExecOptions::default())
            .await?
            .check(&command)?;
        let dir = output.stdout.trim();
        if dir.is_empty() {
            return Err(RuntimeError::CommandFailed {
                command,
                exit_code: output.exit_code,
                stderr: "mktemp printed no path".to_string(),
            });
        }
        Ok(PathBuf::from(dir))
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<(), RuntimeError> {
        let command = format!("rm -rf -- {}", shell_quote(&path.to_string_lossy()));
        self.exec_buffered(&command, ExecOptions::default())
            .await?
            .check(&command)?;
        Ok(())
    }

    /// Names of the entries in `dir`, unsorted, without `.` and `..`.
    async fn list_dir(&self, dir: &Path) -> Result<Vec<String>, RuntimeError> {
        let quoted = shell_quote(&dir.to_string_lossy());
        let command = format!("test -d {quoted} || exit 3; ls -1A -- {quoted}");
        let output = self.exec_buffered(&command, ExecOptions::default()).await?;
        if output.exit_code == 3 {
            return Err(RuntimeError::NotFound {
                path: dir.to_path_buf(),
            });
        }
        let output = output.check(&command)?;
        Ok(output
            .stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// First `max_lines` lines of a text file.
    async fn read_head(&self, path: &Path, max_lines: usize) -> Result<String, RuntimeError> {
        let command = format!(
            "head -n {max_lines} -- {}",
            shell_quote(&path.to_string_lossy())
        );
        let output = self
            .exec_buffered(&command, ExecOptions::default())
            .await?
            .check(&command)?;
        Ok(output.stdout)
    }
}

/// Run a prepared command to completion, killing its process group if
/// `timeout` elapses first.
pub(crate) async fn run_buffered(
    mut command: Command,
    label: &str,
    timeout: Duration,
) -> Result<BufferedOutput, RuntimeError> {
    #[cfg(unix)]
    command.process_group(0);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|source| RuntimeError::io(format!("failed to spawn `{label}`"), source))?;
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(BufferedOutput {
            exit_code: ExitRecord::from(output.status).exit_code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
        }),
        Ok(Err(source)) => Err(RuntimeError::io(
            format!("failed to collect output of `{label}`"),
            source,
        )),
        Err(_) => {
            debug!(command = label, timeout_secs = timeout.as_secs(), "Buffered command timed out");
            if let Some(pid) = pid {
                let _ = process_group::signal_process_group(pid, KillSignal::Kill);
            }
            Ok(BufferedOutput {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("timed out after {}s", timeout.as_secs()),
                timed_out: true,
            })
        }
    }
}
