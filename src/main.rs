//! wsrun - run workspace scripts from the command line.
//!
//! Thin binary entry point that delegates to the handlers in `cli`.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

mod cli;
mod main_helpers;

use cli::args::{Cli, Commands};
use main_helpers::initialize_tracing;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    initialize_tracing();

    match args.command {
        Commands::Run(run) => cli::run::handle_run_command(run).await,
        Commands::List(list) => cli::list::handle_list_command(list).await,
        Commands::Spawn(spawn) => cli::spawn::handle_spawn_command(spawn).await,
    }
}
