//! Script runner.
//!
//! Turns a script name from the workspace scripts directory into a finished
//! [`ScriptExecutionResult`]: validate the name, resolve it (canonical
//! directory first, legacy second), prove the resolved file is still inside
//! the scripts directory, allocate a temp directory, hand the quoted
//! invocation to the [`BashEngine`] and clean up afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use wsrun_bash_runner::{
    BashEngine, EngineOutcome, EngineRequest, ExecutionLimits, OVERFLOW_MARKER, Runtime,
    RuntimeKind,
};
use wsrun_commons::{TelemetrySink, contains_traversal};
use wsrun_config::{OverflowPolicy, ScriptsConfig};
use wsrun_exec_events::{
    BackendKind, FailureReason, ScriptCompletedEvent, ScriptEvent, ScriptFailedEvent,
    ScriptStartedEvent, VersionedScriptEvent,
};

use crate::error::ScriptError;
use crate::quoting::build_invocation;

/// Text that precedes the spilled log path in overflow errors.
const SAVED_TO: &str = "saved to ";

/// Per-call knobs. Unset fields fall back to [`ScriptsConfig`].
#[derive(Debug, Clone, Default)]
pub struct ScriptRunOptions {
    pub env: HashMap<String, String>,
    /// Applied after `env`, so a secret replaces a same-named variable.
    pub secrets: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
    pub overflow_policy: Option<OverflowPolicy>,
    /// Parent for the per-run temp directory. When set together with the
    /// tmpfile policy, an overflowing run keeps its directory (and log).
    pub persistent_temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptExecutionResult {
    pub exit_code: i32,
    /// Full output on success, whatever was captured on failure.
    pub stdout: String,
    /// Empty on success, the failure text otherwise.
    pub stderr: String,
    pub raw_result: EngineOutcome,
}

impl ScriptExecutionResult {
    pub fn success(&self) -> bool {
        self.raw_result.success
    }

    fn from_outcome(outcome: EngineOutcome) -> Self {
        let exit_code = outcome.exit_code.unwrap_or(-1);
        if outcome.success {
            Self {
                exit_code,
                stdout: outcome.output.clone(),
                stderr: String::new(),
                raw_result: outcome,
            }
        } else {
            Self {
                exit_code,
                stdout: outcome.output.clone(),
                stderr: outcome.error.clone().unwrap_or_default(),
                raw_result: outcome,
            }
        }
    }
}

/// Pull the spilled log path out of an overflow error text.
pub fn extract_overflow_path(text: &str) -> Option<PathBuf> {
    let (_, rest) = text.rsplit_once(SAVED_TO)?;
    let path = rest.lines().next()?.trim();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Reject names that could leave the scripts directory before touching the
/// filesystem.
pub fn validate_script_name(name: &str) -> Result<(), ScriptError> {
    if name.trim().is_empty() || name == "." || contains_traversal(name) {
        return Err(ScriptError::InvalidScriptName {
            name: name.to_string(),
        });
    }
    Ok(())
}

struct LocatedScript {
    script_path: PathBuf,
    scripts_dir: PathBuf,
}

pub struct ScriptRunner {
    config: ScriptsConfig,
    engine: BashEngine,
    telemetry: Option<Arc<dyn TelemetrySink<VersionedScriptEvent>>>,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new(ScriptsConfig::default())
    }
}

impl ScriptRunner {
    pub fn new(config: ScriptsConfig) -> Self {
        let engine = BashEngine::new(ExecutionLimits::from(&config));
        Self {
            config,
            engine,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink<VersionedScriptEvent>>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn config(&self) -> &ScriptsConfig {
        &self.config
    }

    /// Run `name` from the workspace scripts directory with `args`.
    pub async fn run(
        &self,
        runtime: &Arc<dyn Runtime>,
        workspace_root: &Path,
        name: &str,
        args: &[String],
        options: ScriptRunOptions,
    ) -> Result<ScriptExecutionResult, ScriptError> {
        validate_script_name(name)?;

        let execution_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "script_run",
            script = name,
            execution_id = %execution_id,
            backend = runtime.kind().as_str()
        );
        self.run_validated(runtime, workspace_root, name, args, options, execution_id)
            .instrument(span)
            .await
    }

    async fn run_validated(
        &self,
        runtime: &Arc<dyn Runtime>,
        workspace_root: &Path,
        name: &str,
        args: &[String],
        options: ScriptRunOptions,
        execution_id: String,
    ) -> Result<ScriptExecutionResult, ScriptError> {
        let workspace = runtime
            .resolve_path(workspace_root)
            .await
            .map_err(|err| ScriptError::Execution(err.to_string()))?;

        let located = self.locate(runtime.as_ref(), &workspace, name).await?;
        self.ensure_contained(runtime.as_ref(), name, &located)?;

        match runtime.stat(&located.script_path).await {
            Ok(stat) if stat.is_directory => {
                return Err(ScriptError::IsDirectory {
                    path: located.script_path,
                });
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                return Err(ScriptError::NotFound {
                    name: name.to_string(),
                    expected: format!(
                        "{}/{name}",
                        self.config.canonical_scripts_dir.trim_end_matches('/')
                    ),
                });
            }
            Err(err) => return Err(ScriptError::Execution(err.to_string())),
        }
        debug!(path = %located.script_path.display(), "Resolved script");

        let temp_dir = runtime
            .create_temp_dir(options.persistent_temp_dir.as_deref())
            .await
            .map_err(ScriptError::TempDirAllocation)?;

        let policy = options
            .overflow_policy
            .unwrap_or(self.config.overflow_policy);
        let timeout = options.timeout.unwrap_or(self.config.default_timeout());
        let retain_on_overflow =
            options.persistent_temp_dir.is_some() && policy == OverflowPolicy::Tmpfile;

        self.record(ScriptEvent::Started(ScriptStartedEvent {
            execution_id: execution_id.clone(),
            script: name.to_string(),
            arg_count: args.len(),
            backend: match runtime.kind() {
                RuntimeKind::Local => BackendKind::Local,
                RuntimeKind::Remote => BackendKind::Remote,
            },
        }));
        info!(args = args.len(), timeout_secs = timeout.as_secs(), %policy, "Running script");

        let request = EngineRequest {
            script_invocation: build_invocation(&located.script_path, args),
            timeout,
            cwd: workspace,
            env: options.env,
            secrets: options.secrets,
            temp_dir: temp_dir.clone(),
            overflow_policy: policy,
            cancellation: options.cancellation,
        };

        let outcome = match self.engine.execute(runtime.as_ref(), request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                schedule_cleanup(Arc::clone(runtime), temp_dir);
                self.record(ScriptEvent::Failed(ScriptFailedEvent {
                    execution_id,
                    exit_code: None,
                    reason: FailureReason::SpawnError,
                    overflow_path: None,
                }));
                return Err(ScriptError::Execution(err.to_string()));
            }
        };

        let overflowed = outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains(OVERFLOW_MARKER));
        let retained = retain_on_overflow && overflowed;
        if retained {
            info!(path = %temp_dir.display(), "Keeping temp directory with overflow log");
        } else {
            schedule_cleanup(Arc::clone(runtime), temp_dir);
        }

        self.record_outcome(execution_id, &outcome, overflowed, retained);
        info!(
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.wall_duration_ms,
            "Script finished"
        );
        Ok(ScriptExecutionResult::from_outcome(outcome))
    }

    /// Canonical directory first, then legacy. When neither has the script
    /// the canonical location is returned so later checks report it.
    async fn locate(
        &self,
        runtime: &dyn Runtime,
        workspace: &Path,
        name: &str,
    ) -> Result<LocatedScript, ScriptError> {
        let dirs = [
            &self.config.canonical_scripts_dir,
            &self.config.legacy_scripts_dir,
        ];
        let mut first = None;
        for dir in dirs {
            let unresolved_dir = workspace.join(dir);
            let located = LocatedScript {
                scripts_dir: runtime
                    .resolve_path(&unresolved_dir)
                    .await
                    .map_err(|err| ScriptError::Execution(err.to_string()))?,
                script_path: runtime
                    .resolve_path(&unresolved_dir.join(name))
                    .await
                    .map_err(|err| ScriptError::Execution(err.to_string()))?,
            };
            if runtime.stat(&located.script_path).await.is_ok() {
                return Ok(located);
            }
            debug!(dir = %dir, "Script not found in directory");
            if first.is_none() {
                first = Some(located);
            }
        }
        first.ok_or_else(|| ScriptError::Execution("no scripts directory configured".to_string()))
    }

    fn ensure_contained(
        &self,
        runtime: &dyn Runtime,
        name: &str,
        located: &LocatedScript,
    ) -> Result<(), ScriptError> {
        let separator = runtime.separator();
        let script = runtime.normalize_path(&located.script_path);
        let mut dir = runtime.normalize_path(&located.scripts_dir);
        if !dir.ends_with(separator) {
            dir.push(separator);
        }
        if script.starts_with(&dir) {
            return Ok(());
        }
        warn!(
            resolved = %script,
            scripts_dir = %dir,
            "Script resolves outside the scripts directory"
        );
        Err(ScriptError::PathEscape {
            name: name.to_string(),
            resolved: located.script_path.clone(),
        })
    }

    fn record_outcome(
        &self,
        execution_id: String,
        outcome: &EngineOutcome,
        overflowed: bool,
        retained: bool,
    ) {
        let event = if outcome.success {
            ScriptEvent::Completed(ScriptCompletedEvent {
                execution_id,
                exit_code: outcome.exit_code.unwrap_or(0),
                duration_ms: outcome.wall_duration_ms,
            })
        } else {
            let reason = if outcome.timed_out {
                FailureReason::TimedOut
            } else if outcome.cancelled {
                FailureReason::Cancelled
            } else if overflowed {
                FailureReason::Overflow
            } else {
                FailureReason::NonZeroExit
            };
            let overflow_path = retained
                .then(|| outcome.error.as_deref().and_then(extract_overflow_path))
                .flatten()
                .map(|path| path.display().to_string());
            ScriptEvent::Failed(ScriptFailedEvent {
                execution_id,
                exit_code: outcome.exit_code,
                reason,
                overflow_path,
            })
        };
        self.record(event);
    }

    fn record(&self, event: ScriptEvent) {
        let Some(sink) = &self.telemetry else {
            return;
        };
        if let Err(err) = sink.record(&VersionedScriptEvent::new(event)) {
            warn!(error = %err, "Failed to record script telemetry");
        }
    }
}

/// Remove `dir` in the background. Never awaited; failures are only logged.
fn schedule_cleanup(runtime: Arc<dyn Runtime>, dir: PathBuf) {
    tokio::spawn(async move {
        match runtime.remove_dir_all(&dir).await {
            Ok(()) => debug!(path = %dir.display(), "Removed temp directory"),
            Err(err) => warn!(path = %dir.display(), error = %err, "Failed to remove temp directory"),
        }
    });
}

/// Run `name` with a default-configured [`ScriptRunner`].
pub async fn run_script(
    runtime: &Arc<dyn Runtime>,
    workspace_root: &Path,
    name: &str,
    args: &[String],
    options: ScriptRunOptions,
) -> Result<ScriptExecutionResult, ScriptError> {
    ScriptRunner::default()
        .run(runtime, workspace_root, name, args, options)
        .await
}
