//! Runtime that executes on another machine over OpenSSH.
//!
//! [`RemoteRuntime::connect`] opens a ControlMaster connection once; every
//! later operation multiplexes a fresh session over that socket, so per-call
//! cost is one round trip rather than a full handshake. All remote commands
//! are wrapped in `sh -c` so the remote login shell does not matter.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};
use wsrun_config::RemoteConfig;

use super::{
    BufferedOutput, ExecOptions, FileStat, Runtime, RuntimeError, RuntimeKind, SpawnOptions,
    SpillSink, run_buffered,
};
use crate::pipe::{PidMarker, PipeSpawnOptions, spawn_piped};
use crate::process::{BackgroundHandle, ChildTerminator, ProcessGroupTerminator};
use crate::process_group::KillSignal;
use crate::quote::shell_quote;

const PGID_MARKER_PREFIX: &str = "__wsrun_pgid__=";
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// One ControlMaster connection. Closed when the last user drops it.
#[derive(Debug)]
struct SshSession {
    target: String,
    control_path: PathBuf,
    ssh_options: Vec<String>,
}

impl SshSession {
    fn client_args(&self) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        for option in &self.ssh_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(self.target.clone());
        args
    }

    /// `ssh ... target "sh -c '<script>'"`
    fn command(&self, script: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(self.client_args());
        command.arg(format!("sh -c {}", shell_quote(script)));
        command
    }

    fn close(&self) {
        let status = std::process::Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(err) = status {
            warn!(target = %self.target, error = %err, "Failed to close ssh control connection");
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Executes commands on `target` through a persistent ssh connection.
#[derive(Debug, Clone)]
pub struct RemoteRuntime {
    session: Arc<SshSession>,
}

impl RemoteRuntime {
    /// Open the master connection described by `config`.
    pub async fn connect(config: &RemoteConfig) -> Result<Self, RuntimeError> {
        let target = config
            .target
            .as_deref()
            .map(str::trim)
            .filter(|target| !target.is_empty())
            .ok_or_else(|| RuntimeError::Connection("no remote target configured".to_string()))?
            .to_string();

        let control_path = build_control_path(&target);
        let mut command = Command::new("ssh");
        command
            .arg("-MNf")
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", config.connect_timeout_secs));
        for option in &config.ssh_options {
            command.arg("-o").arg(option);
        }
        command.arg(&target);

        let timeout = Duration::from_secs(config.connect_timeout_secs.saturating_add(5));
        let output = run_buffered(command, "ssh -MNf", timeout).await?;
        if !output.success() {
            return Err(RuntimeError::Connection(format!(
                "ssh to {target} failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        info!(%target, control_path = %control_path.display(), "Opened ssh control connection");

        Ok(Self {
            session: Arc::new(SshSession {
                target,
                control_path,
                ssh_options: config.ssh_options.clone(),
            }),
        })
    }

    pub fn target(&self) -> &str {
        &self.session.target
    }

    async fn run(&self, script: &str, timeout: Duration) -> Result<BufferedOutput, RuntimeError> {
        run_buffered(self.session.command(script), script, timeout).await
    }
}

#[async_trait]
impl Runtime for RemoteRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Remote
    }

    async fn resolve_path(&self, path: &Path) -> Result<PathBuf, RuntimeError> {
        let script = format!("realpath -m -- {}", shell_quote(&path.to_string_lossy()));
        let output = self
            .run(&script, ExecOptions::default().timeout)
            .await?
            .check(&script)?;
        Ok(PathBuf::from(output.stdout.trim_end_matches('\n')))
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, RuntimeError> {
        let script = stat_script(path);
        let output = self
            .run(&script, ExecOptions::default().timeout)
            .await?
            .check(&script)?;
        parse_stat_line(output.stdout.trim()).ok_or_else(|| {
            if output.stdout.trim() == "missing" {
                RuntimeError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                RuntimeError::CommandFailed {
                    command: script.clone(),
                    exit_code: output.exit_code,
                    stderr: format!("unexpected stat output `{}`", output.stdout.trim()),
                }
            }
        })
    }

    async fn exec_buffered(
        &self,
        command: &str,
        options: ExecOptions,
    ) -> Result<BufferedOutput, RuntimeError> {
        let script = match &options.cwd {
            Some(cwd) => format!(
                "cd {} || exit 1\n{command}",
                shell_quote(&cwd.to_string_lossy())
            ),
            None => command.to_string(),
        };
        self.run(&script, options.timeout).await
    }

    async fn spawn_background(
        &self,
        command: &str,
        options: SpawnOptions,
    ) -> Result<BackgroundHandle, RuntimeError> {
        let script = spawn_script(command, &options.cwd, &options.env);
        let remote_pgid = Arc::new(OnceLock::new());

        let mut args = self.session.client_args();
        args.push(format!("sh -c {}", shell_quote(&script)));
        let spawn = PipeSpawnOptions {
            program: "ssh".to_string(),
            args,
            cwd: None,
            env: HashMap::new(),
            grace: options.grace,
            max_line_bytes: options.max_line_bytes,
            pid_marker: Some(PidMarker {
                prefix: PGID_MARKER_PREFIX.to_string(),
                slot: Arc::clone(&remote_pgid),
            }),
        };

        let session = Arc::clone(&self.session);
        spawn_piped(spawn, move |pid| {
            Box::new(RemoteTerminator {
                session,
                remote_pgid,
                local: ProcessGroupTerminator {
                    process_group_id: pid,
                },
            })
        })
        .map_err(|err| RuntimeError::io("failed to spawn ssh", err))
    }

    async fn create_spill_file(&self, path: &Path) -> Result<Box<dyn SpillSink>, RuntimeError> {
        let script = format!("cat > {}", shell_quote(&path.to_string_lossy()));
        let mut command = self.session.command(&script);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|err| RuntimeError::io("failed to spawn ssh for spill file", err))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::io("ssh spill", io::Error::other("stdin not piped")))?;
        Ok(Box::new(RemoteSpill {
            path: path.to_path_buf(),
            child,
            stdin,
        }))
    }
}

/// Signals the remote process group, falling back to the local ssh client.
struct RemoteTerminator {
    session: Arc<SshSession>,
    remote_pgid: Arc<OnceLock<u32>>,
    local: ProcessGroupTerminator,
}

#[async_trait]
impl ChildTerminator for RemoteTerminator {
    async fn signal(&self, signal: KillSignal) -> io::Result<()> {
        if let Some(pgid) = self.remote_pgid.get() {
            let script = format!("kill -{} -- -{pgid} 2>/dev/null; exit 0", signal.name());
            match run_buffered(self.session.command(&script), &script, SIGNAL_TIMEOUT).await {
                Ok(output) if output.success() => {
                    debug!(pgid, signal = signal.name(), "Signalled remote process group");
                }
                Ok(output) => {
                    warn!(pgid, exit_code = output.exit_code, "Remote kill did not succeed");
                }
                Err(err) => warn!(pgid, error = %err, "Remote kill failed"),
            }
            if signal == KillSignal::Term {
                return Ok(());
            }
        }
        // No remote pgid yet, or escalation: drop the ssh client so the
        // session is torn down.
        self.local.signal(signal).await
    }
}

struct RemoteSpill {
    path: PathBuf,
    child: Child,
    stdin: ChildStdin,
}

#[async_trait]
impl SpillSink for RemoteSpill {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stdin.write_all(bytes).await
    }

    async fn finish(self: Box<Self>) -> io::Result<()> {
        let Self {
            mut child,
            mut stdin,
            ..
        } = *self;
        stdin.flush().await?;
        stdin.shutdown().await?;
        drop(stdin);
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("remote spill writer exited with {status}")))
        }
    }
}

fn build_control_path(target: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::env::temp_dir().join(format!("wsrun-ssh-{:x}.sock", hasher.finish()))
}

fn stat_script(path: &Path) -> String {
    format!(
        "p={}\n\
         if [ ! -e \"$p\" ]; then echo missing; exit 0; fi\n\
         d=0; f=0; x=0; s=0\n\
         [ -d \"$p\" ] && d=1\n\
         [ -f \"$p\" ] && f=1 && s=$(wc -c < \"$p\")\n\
         [ -x \"$p\" ] && x=1\n\
         echo \"$d $f $x $s\"",
        shell_quote(&path.to_string_lossy())
    )
}

/// Parse `"<dir> <file> <exec> <size>"` as printed by [`stat_script`].
fn parse_stat_line(line: &str) -> Option<FileStat> {
    let mut fields = line.split_whitespace();
    let is_directory = fields.next()? == "1";
    let is_file = fields.next()? == "1";
    let executable = fields.next()? == "1";
    let size = fields.next()?.parse().ok()?;
    Some(FileStat {
        is_directory,
        is_file,
        is_executable: is_file && executable,
        size,
    })
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Remote wrapper: report the process group, enter `cwd`, export the
/// environment and `exec` the command so the reported group owns it.
///
/// Exports happen in the wrapper shell, which is replaced by `exec`, so the
/// values do not linger in the command's argv.
fn spawn_script(command: &str, cwd: &Path, env: &HashMap<String, String>) -> String {
    let mut script = String::new();
    script.push_str("pgid=$(ps -o pgid= -p $$ 2>/dev/null | tr -d ' ')\n");
    script.push_str(&format!(
        "printf '%s%s\\n' {} \"${{pgid:-$$}}\"\n",
        shell_quote(PGID_MARKER_PREFIX)
    ));
    script.push_str(&format!(
        "cd {} || exit 1\n",
        shell_quote(&cwd.to_string_lossy())
    ));

    let mut keys: Vec<_> = env.keys().collect();
    keys.sort();
    for key in keys {
        if !is_valid_env_name(key) {
            warn!(key = %key, "Skipping environment variable with an invalid name");
            continue;
        }
        if let Some(value) = env.get(key) {
            script.push_str(&format!("export {key}={}\n", shell_quote(value)));
        }
    }
    script.push_str(&format!("exec sh -c {}", shell_quote(command)));
    script
}
