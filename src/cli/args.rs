use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use wsrun_config::OverflowPolicy;

#[derive(Debug, Parser)]
#[command(
    name = "wsrun",
    version,
    about = "Run workspace scripts with bounded output, timeouts and clean termination"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a script from `.wsrun/scripts` (or the legacy `.scripts`).
    Run(RunArgs),
    /// List runnable scripts and their descriptions.
    List(ListArgs),
    /// Run a shell command in the background, stream its output and stop it
    /// after a wait period.
    Spawn(SpawnArgs),
}

/// Where scripts are looked up and which machine runs them.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Workspace root.
    #[arg(long, short = 'w', default_value = ".")]
    pub workspace: PathBuf,

    /// Run on this ssh destination instead of locally.
    #[arg(long, value_name = "TARGET")]
    pub ssh: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Script name inside the scripts directory.
    pub name: String,

    /// Arguments passed to the script unchanged.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Wall-clock limit in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// What to do when output exceeds the configured threshold.
    #[arg(long, value_name = "POLICY", value_parser = parse_overflow_policy)]
    pub overflow: Option<OverflowPolicy>,

    /// Keep per-run temp directories under DIR; overflow logs survive the run.
    #[arg(long, value_name = "DIR")]
    pub persist_dir: Option<PathBuf>,

    /// Extra environment variable for the script. Repeatable.
    #[arg(long = "env", short = 'e', value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Debug, Args)]
pub struct SpawnArgs {
    /// Shell command to run.
    pub command: String,

    /// Milliseconds between SIGTERM and SIGKILL.
    #[arg(long, value_name = "N", default_value_t = 2_000)]
    pub grace_ms: u64,

    /// Seconds to let the command run before terminating it.
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub wait_secs: u64,

    /// Working directory for the command.
    #[arg(long, default_value = ".")]
    pub cwd: PathBuf,
}

fn parse_overflow_policy(value: &str) -> Result<OverflowPolicy, String> {
    value.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{value}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_collects_trailing_args() {
        let cli = Cli::parse_from([
            "wsrun", "run", "--timeout", "5", "-e", "A=1", "build", "--release", "x y",
        ]);
        let Commands::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(run.name, "build");
        assert_eq!(run.args, vec!["--release", "x y"]);
        assert_eq!(run.timeout, Some(5));
        assert_eq!(run.env, vec![("A".to_string(), "1".to_string())]);
    }

    #[test]
    fn env_pairs_need_a_key() {
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
        assert_eq!(
            parse_env_pair("K=a=b"),
            Ok(("K".to_string(), "a=b".to_string()))
        );
    }

    #[test]
    fn overflow_policy_parses() {
        assert_eq!(parse_overflow_policy("tmpfile"), Ok(OverflowPolicy::Tmpfile));
        assert!(parse_overflow_policy("spill").is_err());
    }
}
