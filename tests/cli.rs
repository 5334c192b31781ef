#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;

use anyhow::Result;
use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;

fn wsrun(workspace: &TempDir) -> Result<Command> {
    let mut cmd = Command::cargo_bin("wsrun")?;
    cmd.current_dir(workspace.path())
        .env("HOME", workspace.path())
        .env_remove("WSRUN_CONFIG_PATH")
        .env("RUST_LOG", "error");
    Ok(cmd)
}

fn add_script(workspace: &TempDir, rel: &str, body: &str) -> Result<()> {
    let file = workspace.child(rel);
    file.write_str(body)?;
    fs::set_permissions(file.path(), fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[test]
fn run_prints_output_and_passes_args() -> Result<()> {
    let workspace = TempDir::new()?;
    add_script(
        &workspace,
        ".wsrun/scripts/echo-args",
        "#!/bin/sh\nfor a in \"$@\"; do echo \"<$a>\"; done\n",
    )?;

    wsrun(&workspace)?
        .args(["run", "echo-args", "one two", "--flag"])
        .assert()
        .success()
        .stdout("<one two>\n<--flag>\n");
    Ok(())
}

#[test]
fn run_exits_with_script_code_and_reports_failure() -> Result<()> {
    let workspace = TempDir::new()?;
    add_script(
        &workspace,
        ".scripts/broken",
        "#!/bin/sh\necho half\necho bad >&2\nexit 4\n",
    )?;

    wsrun(&workspace)?
        .args(["run", "broken"])
        .assert()
        .code(4)
        .stdout(predicate::str::contains("half"))
        .stderr(predicate::str::contains("Command exited with code 4"));
    Ok(())
}

#[test]
fn run_passes_env_pairs() -> Result<()> {
    let workspace = TempDir::new()?;
    add_script(&workspace, ".wsrun/scripts/show", "#!/bin/sh\necho \"$GREETING\"\n")?;

    wsrun(&workspace)?
        .args(["run", "--env", "GREETING=hi there", "show"])
        .assert()
        .success()
        .stdout("hi there\n");
    Ok(())
}

#[test]
fn run_rejects_traversal_names() -> Result<()> {
    let workspace = TempDir::new()?;
    wsrun(&workspace)?
        .args(["run", "../etc/passwd"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid script name"));
    Ok(())
}

#[test]
fn run_missing_script_suggests_location() -> Result<()> {
    let workspace = TempDir::new()?;
    wsrun(&workspace)?
        .args(["run", "deploy"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains(".wsrun/scripts/deploy"));
    Ok(())
}

#[test]
fn run_timeout_flag_stops_script() -> Result<()> {
    let workspace = TempDir::new()?;
    add_script(&workspace, ".wsrun/scripts/slow", "#!/bin/sh\nsleep 30\n")?;

    wsrun(&workspace)?
        .args(["run", "--timeout", "1", "slow"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Command timed out after 1s"));
    Ok(())
}

#[test]
fn workspace_config_controls_overflow() -> Result<()> {
    let workspace = TempDir::new()?;
    workspace.child("wsrun.toml").write_str(
        "[scripts]\noverflow_threshold_bytes = 1000\nhead_bytes = 100\ntail_lines = 3\n",
    )?;
    add_script(
        &workspace,
        ".wsrun/scripts/noisy",
        "#!/bin/sh\nfor i in $(seq 1 400); do echo row-$i; done\n",
    )?;

    wsrun(&workspace)?
        .args(["run", "noisy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bytes truncated]"))
        .stdout(predicate::str::ends_with("row-400\n"));
    Ok(())
}

#[test]
fn list_shows_scripts_with_descriptions() -> Result<()> {
    let workspace = TempDir::new()?;
    add_script(
        &workspace,
        ".wsrun/scripts/build",
        "#!/bin/sh\n# Description: Compile the project\nmake\n",
    )?;
    add_script(&workspace, ".scripts/lint", "#!/bin/sh\ntrue\n")?;

    wsrun(&workspace)?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("build  Compile the project"))
        .stdout(predicate::str::contains("lint"));
    Ok(())
}

#[test]
fn spawn_streams_and_reports_exit() -> Result<()> {
    let workspace = TempDir::new()?;
    wsrun(&workspace)?
        .args(["spawn", "echo streamed; exit 3", "--wait-secs", "10"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("streamed"));
    Ok(())
}

#[test]
fn spawn_terminates_after_wait() -> Result<()> {
    let workspace = TempDir::new()?;
    wsrun(&workspace)?
        .args(["spawn", "sleep 30", "--wait-secs", "1", "--grace-ms", "200"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stderr(predicate::str::contains("background command"));
    Ok(())
}
