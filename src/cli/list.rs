use std::process::ExitCode;

use anyhow::{Context, Result};
use wsrun_core::{FsScriptCatalog, ScriptCatalog};

use super::CommandContext;
use super::args::ListArgs;

pub async fn handle_list_command(args: ListArgs) -> Result<ExitCode> {
    let context = CommandContext::from_target(&args.target).await?;
    let catalog = FsScriptCatalog::new(&context.config.scripts);
    let scripts = catalog
        .discover(context.runtime.as_ref(), &context.workspace)
        .await
        .context("Failed to list workspace scripts")?;

    if scripts.is_empty() {
        eprintln!(
            "No scripts found. Add executable files to `{}` in the workspace.",
            context.config.scripts.canonical_scripts_dir
        );
        return Ok(ExitCode::SUCCESS);
    }

    let width = scripts.iter().map(|s| s.name.len()).max().unwrap_or(0);
    for script in &scripts {
        match &script.description {
            Some(description) => println!("{:<width$}  {description}", script.name),
            None => println!("{}", script.name),
        }
    }
    Ok(ExitCode::SUCCESS)
}
