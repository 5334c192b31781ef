use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use wsrun_bash_runner::{LocalRuntime, Runtime, SpawnOptions, TerminationOutcome};
use wsrun_commons::canonicalize_workspace;

use super::args::SpawnArgs;
use super::exit_code_for;

pub async fn handle_spawn_command(args: SpawnArgs) -> Result<ExitCode> {
    let mut options = SpawnOptions::new(canonicalize_workspace(&args.cwd));
    options.grace = Duration::from_millis(args.grace_ms);

    let handle = LocalRuntime::new()
        .spawn_background(&args.command, options)
        .await
        .context("Failed to spawn background command")?;
    info!(pid = ?handle.pid(), "Spawned background command");

    handle.on_stdout(|line| println!("{line}"));
    handle.on_stderr(|line| eprintln!("{line}"));
    // The exit event follows the drained output, unlike `wait()`.
    let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
    handle.on_exit(move |code| {
        let _ = exit_tx.send(code);
    });

    let wait = Duration::from_secs(args.wait_secs);
    tokio::select! {
        code = exit_rx => {
            let code = code.unwrap_or(-1);
            info!(exit_code = code, "Background command exited");
            handle.dispose();
            return Ok(exit_code_for(code, code == 0));
        }
        _ = tokio::time::sleep(wait) => {
            info!(wait_secs = args.wait_secs, "Wait elapsed; terminating");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; terminating");
        }
    }

    let outcome = handle.terminate().await;
    let label = match outcome {
        TerminationOutcome::GracefulExit => "exited after SIGTERM",
        TerminationOutcome::ForcefulKill => "killed with SIGKILL",
        TerminationOutcome::AlreadyExited => "had already exited",
        TerminationOutcome::AlreadyRequested => "termination already requested",
    };
    eprintln!("wsrun: background command {label}");
    handle.dispose();
    Ok(ExitCode::SUCCESS)
}
