//! Bash execution engine.
//!
//! Runs one `bash -c <invocation>` through a [`Runtime`], merges stdout and
//! stderr lines into a single output stream in arrival order, and enforces
//! the wall-clock limit, cancellation and the output overflow policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsrun_config::{OverflowPolicy, ScriptsConfig};

use crate::circular_buffer::CircularBuffer;
use crate::quote::shell_quote;
use crate::runtime::{Runtime, RuntimeError, SpawnOptions, SpillSink};

/// Marker present in the error text of runs whose full log was spilled.
pub const OVERFLOW_MARKER: &str = "OUTPUT OVERFLOW";

/// File name of the spilled log inside the execution temp directory.
pub const SPILL_FILE_NAME: &str = "output.log";

/// Stderr lines quoted in the error text of a failed run.
const STDERR_TAIL_LINES: usize = 20;

/// Size limits applied to one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub overflow_threshold_bytes: usize,
    pub head_bytes: usize,
    pub tail_lines: usize,
    pub max_line_bytes: usize,
    pub termination_grace: Duration,
}

impl From<&ScriptsConfig> for ExecutionLimits {
    fn from(config: &ScriptsConfig) -> Self {
        Self {
            overflow_threshold_bytes: config.overflow_threshold_bytes,
            head_bytes: config.head_bytes,
            tail_lines: config.tail_lines,
            max_line_bytes: config.max_line_bytes,
            termination_grace: config.termination_grace(),
        }
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from(&ScriptsConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Shell-ready command line, already quoted.
    pub script_invocation: String,
    pub timeout: Duration,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Merged over `env`; a secret wins over a plain variable of the same name.
    pub secrets: HashMap<String, String>,
    /// Per-execution scratch directory. Exported as `TMPDIR` and used for the
    /// spilled log.
    pub temp_dir: PathBuf,
    pub overflow_policy: OverflowPolicy,
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowInfo {
    pub total_bytes: u64,
    pub policy: OverflowPolicy,
    /// Where the full log was written (tmpfile policy only).
    pub spill_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutcome {
    pub success: bool,
    /// Captured output, condensed when it overflowed.
    pub output: String,
    /// Failure text. `None` on success.
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub wall_duration_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub overflow: Option<OverflowInfo>,
}

impl EngineOutcome {
    fn cancelled_before_start() -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some("Command was cancelled".to_string()),
            exit_code: None,
            wall_duration_ms: 0,
            timed_out: false,
            cancelled: true,
            overflow: None,
        }
    }
}

enum StreamEvent {
    Stdout(String),
    Stderr(String),
    Exit(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct BashEngine {
    limits: ExecutionLimits,
}

impl BashEngine {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Run the request to completion.
    ///
    /// Timeouts, cancellation, non-zero exits and overflow all come back as an
    /// unsuccessful [`EngineOutcome`]. `Err` is reserved for failures to start
    /// the process at all.
    pub async fn execute(
        &self,
        runtime: &dyn Runtime,
        request: EngineRequest,
    ) -> Result<EngineOutcome, RuntimeError> {
        if request.cancellation.is_cancelled() {
            return Ok(EngineOutcome::cancelled_before_start());
        }

        let mut env = request.env.clone();
        env.extend(request.secrets.clone());
        env.insert(
            "TMPDIR".to_string(),
            request.temp_dir.to_string_lossy().into_owned(),
        );

        let command = format!("exec bash -c {}", shell_quote(&request.script_invocation));
        let options = SpawnOptions {
            cwd: request.cwd.clone(),
            env,
            grace: self.limits.termination_grace,
            max_line_bytes: self.limits.max_line_bytes,
        };

        let started = Instant::now();
        let handle = runtime.spawn_background(&command, options).await?;
        debug!(pid = ?handle.pid(), backend = runtime.kind().as_str(), "Script process started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout_tx = tx.clone();
        handle.on_stdout(move |line| {
            let _ = stdout_tx.send(StreamEvent::Stdout(line));
        });
        let stderr_tx = tx.clone();
        handle.on_stderr(move |line| {
            let _ = stderr_tx.send(StreamEvent::Stderr(line));
        });
        handle.on_exit(move |code| {
            let _ = tx.send(StreamEvent::Exit(code));
        });

        let mut collector = OutputCollector::new(
            runtime,
            &self.limits,
            request.overflow_policy,
            &request.temp_dir,
        );

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let completion = loop {
            tokio::select! {
                biased;
                _ = request.cancellation.cancelled() => break Completion::Cancelled,
                _ = &mut deadline => break Completion::TimedOut,
                event = rx.recv() => match event {
                    Some(StreamEvent::Stdout(line)) => collector.push(line, false).await,
                    Some(StreamEvent::Stderr(line)) => collector.push(line, true).await,
                    Some(StreamEvent::Exit(code)) => break Completion::Exited(code),
                    None => break Completion::Exited(handle.exit_code().unwrap_or(-1)),
                },
            }
        };

        if matches!(completion, Completion::TimedOut | Completion::Cancelled) {
            let outcome = handle.terminate().await;
            info!(?completion, ?outcome, "Stopped script process");
        }

        // Lines that raced with the exit (or termination) event.
        while let Ok(event) = rx.try_recv() {
            match event {
                StreamEvent::Stdout(line) => collector.push(line, false).await,
                StreamEvent::Stderr(line) => collector.push(line, true).await,
                StreamEvent::Exit(_) => {}
            }
        }
        handle.dispose();
        collector.finish().await;

        let exit_code = match completion {
            Completion::Exited(code) => Some(code),
            _ => handle.exit_code(),
        };
        let wall_duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut failures = Vec::new();
        match completion {
            Completion::TimedOut => failures.push(format!(
                "Command timed out after {}",
                format_timeout(request.timeout)
            )),
            Completion::Cancelled => failures.push("Command was cancelled".to_string()),
            Completion::Exited(0) => {}
            Completion::Exited(code) => {
                let mut message = format!("Command exited with code {code}");
                if !collector.stderr_tail.is_empty() {
                    message.push_str("\nstderr (last lines):\n");
                    let lines: Vec<&str> =
                        collector.stderr_tail.iter().map(String::as_str).collect();
                    message.push_str(&lines.join("\n"));
                }
                failures.push(message);
            }
        }
        if let Some(message) = collector.overflow_message() {
            // Kept last: callers read the saved path from the end of the text.
            failures.push(message);
        }

        let outcome = EngineOutcome {
            success: failures.is_empty(),
            output: collector.render(),
            error: (!failures.is_empty()).then(|| failures.join("\n")),
            exit_code,
            wall_duration_ms,
            timed_out: completion == Completion::TimedOut,
            cancelled: completion == Completion::Cancelled,
            overflow: collector.overflow_info(),
        };
        debug!(
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            wall_duration_ms,
            total_bytes = collector.total_bytes,
            "Script process finished"
        );
        Ok(outcome)
    }
}

/// Accumulates output, switching to head/tail retention (and optionally a
/// spill file) once the threshold is crossed.
struct OutputCollector<'a> {
    runtime: &'a dyn Runtime,
    limits: &'a ExecutionLimits,
    policy: OverflowPolicy,
    temp_dir: &'a Path,
    /// Complete output; only populated until the threshold is crossed.
    full: String,
    head: String,
    tail: CircularBuffer<String>,
    stderr_tail: CircularBuffer<String>,
    total_bytes: u64,
    overflowed: bool,
    spill: Option<Box<dyn SpillSink>>,
    spill_path: Option<PathBuf>,
    spill_error: Option<String>,
}

impl<'a> OutputCollector<'a> {
    fn new(
        runtime: &'a dyn Runtime,
        limits: &'a ExecutionLimits,
        policy: OverflowPolicy,
        temp_dir: &'a Path,
    ) -> Self {
        Self {
            runtime,
            limits,
            policy,
            temp_dir,
            full: String::new(),
            head: String::new(),
            tail: CircularBuffer::new(limits.tail_lines),
            stderr_tail: CircularBuffer::new(STDERR_TAIL_LINES),
            total_bytes: 0,
            overflowed: false,
            spill: None,
            spill_path: None,
            spill_error: None,
        }
    }

    async fn push(&mut self, line: String, is_stderr: bool) {
        if is_stderr {
            self.stderr_tail.push(line.clone());
        }
        let mut line = line;
        line.push('\n');
        self.total_bytes += line.len() as u64;

        if !self.overflowed {
            self.full.push_str(&line);
            if self.full.len() > self.limits.overflow_threshold_bytes {
                self.begin_overflow().await;
            }
            return;
        }
        if let Some(spill) = self.spill.as_mut()
            && let Err(err) = spill.write_all(line.as_bytes()).await
        {
            warn!(error = %err, "Failed to append to spilled output log");
            self.spill_error = Some(err.to_string());
            self.spill = None;
        }
        self.tail.push(line);
    }

    async fn begin_overflow(&mut self) {
        self.overflowed = true;
        let full = std::mem::take(&mut self.full);
        let cut = floor_char_boundary(&full, self.limits.head_bytes);
        self.head = full[..cut].to_string();
        // The tail only holds lines that start past the head.
        let mut offset = 0;
        for line in full.split_inclusive('\n') {
            if offset >= cut {
                self.tail.push(line.to_string());
            }
            offset += line.len();
        }
        debug!(
            threshold = self.limits.overflow_threshold_bytes,
            policy = %self.policy,
            "Output crossed overflow threshold"
        );

        if self.policy != OverflowPolicy::Tmpfile {
            return;
        }
        let path = self.temp_dir.join(SPILL_FILE_NAME);
        match self.runtime.create_spill_file(&path).await {
            Ok(mut sink) => match sink.write_all(full.as_bytes()).await {
                Ok(()) => {
                    self.spill_path = Some(sink.path().to_path_buf());
                    self.spill = Some(sink);
                }
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "Failed to write spilled output log");
                    self.spill_error = Some(err.to_string());
                }
            },
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Failed to create spilled output log");
                self.spill_error = Some(err.to_string());
            }
        }
    }

    async fn finish(&mut self) {
        if let Some(spill) = self.spill.take()
            && let Err(err) = spill.finish().await
        {
            warn!(error = %err, "Failed to close spilled output log");
            self.spill_error = Some(err.to_string());
        }
    }

    fn render(&self) -> String {
        if !self.overflowed {
            return self.full.clone();
        }
        let tail: String = self.tail.iter().map(String::as_str).collect();
        let omitted = self
            .total_bytes
            .saturating_sub(self.head.len() as u64)
            .saturating_sub(tail.len() as u64);
        let mut rendered = self.head.clone();
        if !rendered.ends_with('\n') {
            rendered.push('\n');
        }
        rendered.push_str(&format!("… [{omitted} bytes truncated] …\n"));
        rendered.push_str(&tail);
        rendered
    }

    fn overflow_message(&self) -> Option<String> {
        if !self.overflowed || self.policy != OverflowPolicy::Tmpfile {
            return None;
        }
        let threshold = self.limits.overflow_threshold_bytes;
        let total = self.total_bytes;
        match (&self.spill_path, &self.spill_error) {
            (Some(path), None) => Some(format!(
                "{OVERFLOW_MARKER}: output exceeded {threshold} bytes ({total} bytes total); full output saved to {}",
                path.display()
            )),
            (_, Some(err)) => Some(format!(
                "Output exceeded {threshold} bytes ({total} bytes total) and the full log could not be saved: {err}"
            )),
            (None, None) => None,
        }
    }

    fn overflow_info(&self) -> Option<OverflowInfo> {
        self.overflowed.then(|| OverflowInfo {
            total_bytes: self.total_bytes,
            policy: self.policy,
            spill_path: self
                .spill_error
                .is_none()
                .then(|| self.spill_path.clone())
                .flatten(),
        })
    }
}

/// Whole seconds as `Ns`, anything finer as `Nms`.
fn format_timeout(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 && timeout.as_secs() > 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
