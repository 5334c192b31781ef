use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wsrun_core::{ScriptRunOptions, ScriptRunner};
use wsrun_exec_events::TracingEmitter;

use super::args::RunArgs;
use super::{CommandContext, exit_code_for};

pub async fn handle_run_command(args: RunArgs) -> Result<ExitCode> {
    let context = CommandContext::from_target(&args.target).await?;

    let cancellation = CancellationToken::new();
    let watcher = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; cancelling script");
            watcher.cancel();
        }
    });

    let options = ScriptRunOptions {
        env: args.env.into_iter().collect(),
        timeout: args.timeout.map(Duration::from_secs),
        cancellation,
        overflow_policy: args.overflow,
        persistent_temp_dir: args.persist_dir,
        ..ScriptRunOptions::default()
    };

    let runner =
        ScriptRunner::new(context.config.scripts.clone()).with_telemetry(Arc::new(TracingEmitter));
    let result = match runner
        .run(
            &context.runtime,
            &context.workspace,
            &args.name,
            &args.args,
            options,
        )
        .await
    {
        Ok(result) => result,
        Err(err) if err.is_user_error() => {
            eprintln!("wsrun: {err}");
            return Ok(ExitCode::from(2));
        }
        Err(err) => return Err(err).context("Script run failed"),
    };

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(result.stdout.as_bytes())
        .context("Failed to write script output")?;
    stdout.flush().ok();
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr);
    }
    if !result.success() {
        warn!(exit_code = result.exit_code, "Script failed");
    }

    Ok(exit_code_for(result.exit_code, result.success()))
}
