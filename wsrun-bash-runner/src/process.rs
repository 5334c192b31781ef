//! Handle for a background process.
//!
//! A [`BackgroundHandle`] exposes three independent event streams: stdout
//! lines, stderr lines and a single exit code. Each stream buffers events
//! until its callback is registered, then flushes the backlog in order and
//! switches to direct delivery. Termination is staged: SIGTERM to the whole
//! process group, a grace window, then SIGKILL.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::process_group::{self, KillSignal};

/// How long to wait for the group to disappear after SIGKILL.
const KILL_REAP_WINDOW: Duration = Duration::from_millis(500);

/// Delivers a signal to whatever the handle controls.
#[async_trait]
pub trait ChildTerminator: Send + Sync {
    async fn signal(&self, signal: KillSignal) -> io::Result<()>;
}

/// Signals a local process group.
#[derive(Debug, Clone, Copy)]
pub struct ProcessGroupTerminator {
    pub process_group_id: u32,
}

#[async_trait]
impl ChildTerminator for ProcessGroupTerminator {
    async fn signal(&self, signal: KillSignal) -> io::Result<()> {
        process_group::signal_process_group(self.process_group_id, signal)
    }
}

enum Delivery<T> {
    Buffering(VecDeque<T>),
    Direct(Box<dyn FnMut(T) + Send>),
}

/// A single-consumer event stream that queues events until a callback is
/// attached.
///
/// Callbacks run while the channel lock is held, which keeps delivery order
/// intact across the buffered-to-direct switch. A callback must not publish
/// into the same channel.
pub struct EventChannel<T> {
    state: Mutex<Delivery<T>>,
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(Delivery::Buffering(VecDeque::new())),
        }
    }
}

impl<T> EventChannel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: T) {
        let mut state = self.state.lock();
        match &mut *state {
            Delivery::Buffering(pending) => pending.push_back(event),
            Delivery::Direct(callback) => callback(event),
        }
    }

    /// Attach `callback`, replaying anything buffered so far.
    ///
    /// Attaching again replaces the previous callback.
    pub fn subscribe(&self, mut callback: Box<dyn FnMut(T) + Send>) {
        let mut state = self.state.lock();
        if let Delivery::Buffering(pending) = &mut *state {
            for event in pending.drain(..) {
                callback(event);
            }
        }
        *state = Delivery::Direct(callback);
    }
}

/// The event streams shared between a handle and its I/O tasks.
#[derive(Default)]
pub struct HandleChannels {
    pub stdout: EventChannel<String>,
    pub stderr: EventChannel<String>,
    exit: EventChannel<i32>,
    exit_published: AtomicBool,
}

impl HandleChannels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish the exit code. Later calls are ignored.
    pub fn publish_exit(&self, code: i32) {
        if self.exit_published.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exit.publish(code);
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitRecord {
    /// Shell-style exit code: the status code, or `128 + signal` when the
    /// process was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitRecord {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Result of [`BackgroundHandle::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process exited within the grace window after SIGTERM.
    GracefulExit,
    /// SIGKILL was needed.
    ForcefulKill,
    /// Nothing to do; the process had already exited.
    AlreadyExited,
    /// A previous call already handled termination.
    AlreadyRequested,
}

/// A running (or finished) background process.
pub struct BackgroundHandle {
    pid: Option<u32>,
    channels: Arc<HandleChannels>,
    exit_rx: watch::Receiver<Option<ExitRecord>>,
    terminator: Box<dyn ChildTerminator>,
    grace: Duration,
    termination_requested: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl fmt::Debug for BackgroundHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundHandle")
            .field("pid", &self.pid)
            .field("is_running", &self.is_running())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

impl BackgroundHandle {
    pub fn new(
        pid: Option<u32>,
        channels: Arc<HandleChannels>,
        exit_rx: watch::Receiver<Option<ExitRecord>>,
        terminator: Box<dyn ChildTerminator>,
        grace: Duration,
        tasks: Vec<AbortHandle>,
    ) -> Self {
        Self {
            pid,
            channels,
            exit_rx,
            terminator,
            grace,
            termination_requested: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        }
    }

    /// Pid of the locally spawned process (for remote runs, the ssh client).
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn on_stdout(&self, callback: impl FnMut(String) + Send + 'static) {
        self.channels.stdout.subscribe(Box::new(callback));
    }

    pub fn on_stderr(&self, callback: impl FnMut(String) + Send + 'static) {
        self.channels.stderr.subscribe(Box::new(callback));
    }

    /// Register the exit callback. It fires at most once, immediately if the
    /// exit code was already published.
    pub fn on_exit(&self, callback: impl FnOnce(i32) + Send + 'static) {
        let mut slot = Some(callback);
        self.channels.exit.subscribe(Box::new(move |code| {
            if let Some(callback) = slot.take() {
                callback(code);
            }
        }));
    }

    /// True until the OS reports an exit status or terminating signal.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        *self.exit_rx.borrow()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_record().map(|record| record.exit_code())
    }

    /// Wait until the process exits and return its exit code. Returns `None`
    /// if the handle was disposed before an exit status was observed.
    pub async fn wait(&self) -> Option<i32> {
        self.wait_record().await.map(|record| record.exit_code())
    }

    pub async fn wait_record(&self) -> Option<ExitRecord> {
        let mut rx = self.exit_rx.clone();
        let record = rx.wait_for(Option::is_some).await.ok()?;
        *record
    }

    async fn wait_for_exit(&self, window: Duration) -> bool {
        matches!(
            tokio::time::timeout(window, self.wait_record()).await,
            Ok(Some(_))
        )
    }

    /// Stop the process group: SIGTERM, wait up to the grace window, then
    /// SIGKILL if it is still running.
    ///
    /// Only the first call does anything; repeated calls return
    /// [`TerminationOutcome::AlreadyRequested`]. Signal delivery failures are
    /// logged, never returned.
    pub async fn terminate(&self) -> TerminationOutcome {
        if self.termination_requested.swap(true, Ordering::SeqCst) {
            return TerminationOutcome::AlreadyRequested;
        }
        if !self.is_running() {
            return TerminationOutcome::AlreadyExited;
        }

        debug!(pid = ?self.pid, grace_ms = self.grace.as_millis() as u64, "Terminating process group");
        self.send(KillSignal::Term).await;
        if self.wait_for_exit(self.grace).await {
            return TerminationOutcome::GracefulExit;
        }

        warn!(pid = ?self.pid, "Process ignored SIGTERM, escalating to SIGKILL");
        self.send(KillSignal::Kill).await;
        if !self.wait_for_exit(KILL_REAP_WINDOW).await {
            debug!(pid = ?self.pid, "No exit status observed after SIGKILL");
        }
        TerminationOutcome::ForcefulKill
    }

    async fn send(&self, signal: KillSignal) {
        if let Err(err) = self.terminator.signal(signal).await {
            warn!(pid = ?self.pid, signal = signal.name(), error = %err, "Failed to signal process group");
        }
    }

    /// Stop the I/O tasks. The process itself is left alone; call
    /// [`terminate`](Self::terminate) first to stop it. Idempotent.
    pub fn dispose(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for BackgroundHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
