//! Pipe-based spawning of background processes.
//!
//! The child gets its own session (and therefore its own process group),
//! stdin from `/dev/null`, and one reader task per output stream that splits
//! the stream into bounded lines.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::process::{BackgroundHandle, ChildTerminator, EventChannel, ExitRecord, HandleChannels};
use crate::process_group;
use crate::stream::{ReadLineResult, decode_line, read_line_with_limit};

/// How long the exit event waits for the output streams to close.
const READER_DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// A stdout line prefix that carries a pid instead of script output.
///
/// Remote commands print `<prefix><pid>` first so the remote process group
/// can be signalled later. The line is swallowed, not forwarded.
#[derive(Debug, Clone)]
pub struct PidMarker {
    pub prefix: String,
    pub slot: Arc<OnceLock<u32>>,
}

pub struct PipeSpawnOptions {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub grace: Duration,
    pub max_line_bytes: usize,
    pub pid_marker: Option<PidMarker>,
}

impl PipeSpawnOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            grace: Duration::from_secs(2),
            max_line_bytes: 64 * 1024,
            pid_marker: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Spawn `opts.program` detached from the terminal and wire its output into
/// a [`BackgroundHandle`].
///
/// `make_terminator` receives the child's pid, which is also its process
/// group id.
pub fn spawn_piped(
    opts: PipeSpawnOptions,
    make_terminator: impl FnOnce(u32) -> Box<dyn ChildTerminator>,
) -> io::Result<BackgroundHandle> {
    if opts.program.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "missing program"));
    }

    let mut command = Command::new(&opts.program);
    command.args(&opts.args);

    #[cfg(target_os = "linux")]
    let parent_pid = unsafe { libc::getpid() };

    #[cfg(unix)]
    unsafe {
        command.pre_exec(move || {
            process_group::detach_from_tty()?;
            #[cfg(target_os = "linux")]
            process_group::set_parent_death_signal(parent_pid)?;
            Ok(())
        });
    }

    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    command.envs(&opts.env);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("spawned child has no pid"))?;
    debug!(pid, program = %opts.program, "Spawned background process");

    let channels = HandleChannels::new();
    let mut readers = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        let channels = Arc::clone(&channels);
        let marker = opts.pid_marker.clone();
        let max_line_bytes = opts.max_line_bytes;
        readers.push(tokio::spawn(async move {
            pump_lines(stdout, &channels.stdout, max_line_bytes, marker).await;
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let channels = Arc::clone(&channels);
        let max_line_bytes = opts.max_line_bytes;
        readers.push(tokio::spawn(async move {
            pump_lines(stderr, &channels.stderr, max_line_bytes, None).await;
        }));
    }

    let mut tasks: Vec<_> = readers.iter().map(|reader| reader.abort_handle()).collect();

    let (exit_tx, exit_rx) = watch::channel(None);
    let wait_channels = Arc::clone(&channels);
    let wait_task = tokio::spawn(async move {
        let record = match child.wait().await {
            Ok(status) => ExitRecord::from(status),
            Err(err) => {
                warn!(pid, error = %err, "Failed to wait for background process");
                ExitRecord::unknown()
            }
        };
        exit_tx.send_replace(Some(record));

        // Let the readers flush what the process wrote before exiting. A
        // grandchild holding the pipe open must not delay the exit event
        // forever.
        let drain = async {
            for reader in readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(READER_DRAIN_WINDOW, drain).await.is_err() {
            debug!(pid, "Output streams still open after exit");
        }
        wait_channels.publish_exit(record.exit_code());
    });
    tasks.push(wait_task.abort_handle());

    Ok(BackgroundHandle::new(
        Some(pid),
        channels,
        exit_rx,
        make_terminator(pid),
        opts.grace,
        tasks,
    ))
}

async fn pump_lines<R>(
    reader: R,
    channel: &EventChannel<String>,
    max_line_bytes: usize,
    mut marker: Option<PidMarker>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let bytes = match read_line_with_limit(&mut reader, &mut buf, max_line_bytes).await {
            Ok(ReadLineResult::Line(bytes)) => bytes,
            Ok(ReadLineResult::Truncated(bytes)) => {
                trace!(max_line_bytes, "Cut overlong output line");
                bytes
            }
            Ok(ReadLineResult::Eof) => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(error = %err, "Output stream closed with error");
                break;
            }
        };
        let line = decode_line(&bytes);

        // Only the very first line may carry the marker.
        if let Some(PidMarker { prefix, slot }) = marker.take()
            && let Some(rest) = line.strip_prefix(prefix.as_str())
        {
            if let Ok(pid) = rest.trim().parse::<u32>() {
                let _ = slot.set(pid);
            }
            continue;
        }
        channel.publish(line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{ProcessGroupTerminator, TerminationOutcome};
    use tokio::sync::mpsc;

    fn terminator(pid: u32) -> Box<dyn ChildTerminator> {
        Box::new(ProcessGroupTerminator {
            process_group_id: pid,
        })
    }

    #[tokio::test]
    async fn echo_lines_and_exit_code() -> anyhow::Result<()> {
        let handle = spawn_piped(
            PipeSpawnOptions::new("sh").args(["-c", "echo one; echo two >&2; exit 3"]),
            terminator,
        )?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let out_tx = tx.clone();
        handle.on_stdout(move |line| {
            let _ = out_tx.send(format!("out:{line}"));
        });
        let err_tx = tx.clone();
        handle.on_stderr(move |line| {
            let _ = err_tx.send(format!("err:{line}"));
        });
        handle.on_exit(move |code| {
            let _ = tx.send(format!("exit:{code}"));
        });

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = event.starts_with("exit:");
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(seen.contains(&"out:one".to_string()));
        assert!(seen.contains(&"err:two".to_string()));
        assert_eq!(seen.last().map(String::as_str), Some("exit:3"));
        assert_eq!(handle.exit_code(), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn pid_marker_line_is_swallowed() -> anyhow::Result<()> {
        let slot = Arc::new(OnceLock::new());
        let mut opts = PipeSpawnOptions::new("sh").args(["-c", "echo '@@pid 77'; echo body"]);
        opts.pid_marker = Some(PidMarker {
            prefix: "@@pid ".to_string(),
            slot: Arc::clone(&slot),
        });
        let handle = spawn_piped(opts, terminator)?;
        handle.wait().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.on_stdout(move |line| {
            let _ = tx.send(line);
        });
        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.dispose();

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["body".to_string()]);
        assert_eq!(slot.get(), Some(&77));
        Ok(())
    }

    #[tokio::test]
    async fn terminate_stops_sleeping_group() -> anyhow::Result<()> {
        let mut opts = PipeSpawnOptions::new("sh").args(["-c", "sleep 30 & wait"]);
        opts.grace = Duration::from_millis(200);
        let handle = spawn_piped(opts, terminator)?;
        assert!(handle.is_running());

        let outcome = handle.terminate().await;
        assert!(matches!(
            outcome,
            TerminationOutcome::GracefulExit | TerminationOutcome::ForcefulKill
        ));
        assert!(!handle.is_running());
        Ok(())
    }
}
