use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use wsrun_bash_runner::{LocalRuntime, RemoteRuntime, Runtime};
use wsrun_commons::canonicalize_workspace;
use wsrun_config::{ConfigManager, WsrunConfig};

use self::args::TargetArgs;

pub mod args;
pub mod list;
pub mod run;
pub mod spawn;

/// Effective configuration plus the runtime chosen for a command.
pub(crate) struct CommandContext {
    pub workspace: PathBuf,
    pub config: WsrunConfig,
    pub runtime: Arc<dyn Runtime>,
}

impl CommandContext {
    /// Load config from the local workspace and connect to `--ssh` (or the
    /// configured remote target) when one is given.
    pub(crate) async fn from_target(target: &TargetArgs) -> Result<Self> {
        let local_root = canonicalize_workspace(&target.workspace);
        let config = load_config(&local_root)?;

        let mut remote = config.remote.clone();
        if let Some(ssh) = &target.ssh {
            remote.target = Some(ssh.clone());
        }

        let runtime: Arc<dyn Runtime> = match remote.target.as_deref() {
            Some(host) => {
                info!(target = host, "Connecting to remote host");
                let runtime = RemoteRuntime::connect(&remote)
                    .await
                    .with_context(|| format!("Failed to connect to {host}"))?;
                Arc::new(runtime)
            }
            None => Arc::new(LocalRuntime::new()),
        };

        // A remote workspace path is interpreted on the remote host.
        let workspace = if remote.target.is_some() {
            target.workspace.clone()
        } else {
            local_root
        };

        Ok(Self {
            workspace,
            config,
            runtime,
        })
    }
}

fn load_config(workspace: &Path) -> Result<WsrunConfig> {
    let manager = ConfigManager::load_from_workspace(workspace)
        .with_context(|| format!("Failed to load configuration for {}", workspace.display()))?;
    for layer in manager.layers() {
        tracing::debug!(file = %layer.file().display(), "Using configuration layer");
    }
    Ok(manager.into_config())
}

/// Map a script exit code onto a process exit status. Codes outside
/// `1..=255` (signals reported as -1, unsuccessful runs reporting 0) become 1.
pub(crate) fn exit_code_for(code: i32, success: bool) -> ExitCode {
    if success {
        return ExitCode::SUCCESS;
    }
    match u8::try_from(code) {
        Ok(0) | Err(_) => ExitCode::FAILURE,
        Ok(code) => ExitCode::from(code),
    }
}
