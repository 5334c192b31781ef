#![cfg(unix)]

use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wsrun_bash_runner::{LocalRuntime, OVERFLOW_MARKER, Runtime};
use wsrun_commons::MemoryTelemetry;
use wsrun_config::{OverflowPolicy, ScriptsConfig};
use wsrun_core::{
    FsScriptCatalog, ScriptCatalog, ScriptError, ScriptRunOptions, ScriptRunner,
    extract_overflow_path, run_script,
};
use wsrun_exec_events::{FailureReason, ScriptEvent, VersionedScriptEvent};

fn runtime() -> Arc<dyn Runtime> {
    Arc::new(LocalRuntime::new())
}

fn write_script(workspace: &Path, dir: &str, name: &str, body: &str) -> PathBuf {
    let dir = workspace.join(dir);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn small_overflow_config() -> ScriptsConfig {
    ScriptsConfig {
        overflow_threshold_bytes: 1_000,
        head_bytes: 100,
        tail_lines: 5,
        ..ScriptsConfig::default()
    }
}

const NOISY: &str = "#!/bin/sh\nfor i in $(seq 1 500); do echo line-$i; done\n";

#[tokio::test]
async fn runs_script_from_canonical_dir_with_quoted_args() {
    let workspace = TempDir::new().unwrap();
    write_script(
        workspace.path(),
        ".wsrun/scripts",
        "greet",
        "#!/bin/sh\nfor arg in \"$@\"; do echo \"[$arg]\"; done\n",
    );

    let args = vec!["a b".to_string(), "it's".to_string(), "$(id)".to_string()];
    let result = run_script(
        &runtime(),
        workspace.path(),
        "greet",
        &args,
        ScriptRunOptions::default(),
    )
    .await
    .unwrap();

    assert!(result.success());
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "[a b]\n[it's]\n[$(id)]\n");
    assert!(result.stderr.is_empty());
}

#[tokio::test]
async fn falls_back_to_legacy_dir() {
    let workspace = TempDir::new().unwrap();
    write_script(workspace.path(), ".scripts", "old", "#!/bin/sh\necho legacy\n");

    let result = run_script(
        &runtime(),
        workspace.path(),
        "old",
        &[],
        ScriptRunOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout, "legacy\n");
}

#[tokio::test]
async fn canonical_dir_wins_over_legacy() {
    let workspace = TempDir::new().unwrap();
    write_script(workspace.path(), ".scripts", "both", "#!/bin/sh\necho legacy\n");
    write_script(workspace.path(), ".wsrun/scripts", "both", "#!/bin/sh\necho canonical\n");

    let result = run_script(
        &runtime(),
        workspace.path(),
        "both",
        &[],
        ScriptRunOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout, "canonical\n");
}

#[tokio::test]
async fn invalid_names_are_rejected_before_lookup() {
    let workspace = TempDir::new().unwrap();
    for name in ["../escape", "nested/script", "back\\slash", ""] {
        let err = run_script(
            &runtime(),
            workspace.path(),
            name,
            &[],
            ScriptRunOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidScriptName { .. }), "{name:?}");
        assert!(err.is_user_error());
    }
}

#[tokio::test]
async fn symlink_out_of_scripts_dir_is_a_path_escape() {
    let workspace = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let target = write_script(outside.path(), "bin", "evil", "#!/bin/sh\necho pwned\n");
    fs::create_dir_all(workspace.path().join(".wsrun/scripts")).unwrap();
    symlink(&target, workspace.path().join(".wsrun/scripts/evil")).unwrap();

    let err = run_script(
        &runtime(),
        workspace.path(),
        "evil",
        &[],
        ScriptRunOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ScriptError::PathEscape { .. }), "{err}");
}

#[tokio::test]
async fn missing_script_reports_canonical_location() {
    let workspace = TempDir::new().unwrap();
    let err = run_script(
        &runtime(),
        workspace.path(),
        "deploy",
        &[],
        ScriptRunOptions::default(),
    )
    .await
    .unwrap_err();
    match err {
        ScriptError::NotFound { name, expected } => {
            assert_eq!(name, "deploy");
            assert_eq!(expected, ".wsrun/scripts/deploy");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn directory_in_place_of_script_is_rejected() {
    let workspace = TempDir::new().unwrap();
    fs::create_dir_all(workspace.path().join(".wsrun/scripts/tools")).unwrap();

    let err = run_script(
        &runtime(),
        workspace.path(),
        "tools",
        &[],
        ScriptRunOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ScriptError::IsDirectory { .. }), "{err}");
}

#[tokio::test]
async fn non_zero_exit_is_a_failed_result() {
    let workspace = TempDir::new().unwrap();
    write_script(
        workspace.path(),
        ".wsrun/scripts",
        "fail",
        "#!/bin/sh\necho before\necho oops >&2\nexit 3\n",
    );

    let result = run_script(
        &runtime(),
        workspace.path(),
        "fail",
        &[],
        ScriptRunOptions::default(),
    )
    .await
    .unwrap();
    assert!(!result.success());
    assert_eq!(result.exit_code, 3);
    assert!(result.stdout.contains("before"));
    assert!(result.stderr.contains("Command exited with code 3"));
    assert!(result.stderr.contains("oops"));
}

#[tokio::test]
async fn timeout_option_overrides_config() {
    let workspace = TempDir::new().unwrap();
    write_script(workspace.path(), ".wsrun/scripts", "slow", "#!/bin/sh\nsleep 30\n");

    let options = ScriptRunOptions {
        timeout: Some(Duration::from_secs(1)),
        ..ScriptRunOptions::default()
    };
    let result = run_script(&runtime(), workspace.path(), "slow", &[], options)
        .await
        .unwrap();
    assert!(result.raw_result.timed_out);
    assert_eq!(result.stderr, "Command timed out after 1s");
}

#[tokio::test]
async fn tmpfile_overflow_with_persistent_dir_keeps_log() {
    let workspace = TempDir::new().unwrap();
    let persist = TempDir::new().unwrap();
    write_script(workspace.path(), ".wsrun/scripts", "noisy", NOISY);

    let options = ScriptRunOptions {
        overflow_policy: Some(OverflowPolicy::Tmpfile),
        persistent_temp_dir: Some(persist.path().to_path_buf()),
        ..ScriptRunOptions::default()
    };
    let result = ScriptRunner::new(small_overflow_config())
        .run(&runtime(), workspace.path(), "noisy", &[], options)
        .await
        .unwrap();

    assert!(!result.success());
    assert!(result.stderr.contains(OVERFLOW_MARKER));
    let log = extract_overflow_path(&result.stderr).unwrap();
    assert!(log.starts_with(persist.path()));

    // Cleanup is skipped for retained runs, so the log must survive a pause.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let logged = fs::read_to_string(&log).unwrap();
    assert_eq!(logged.lines().count(), 500);
}

#[tokio::test]
async fn temp_dir_is_removed_after_run() {
    let workspace = TempDir::new().unwrap();
    let persist = TempDir::new().unwrap();
    write_script(workspace.path(), ".wsrun/scripts", "noisy", NOISY);

    // Truncate policy never retains, even with a persistent parent.
    let options = ScriptRunOptions {
        persistent_temp_dir: Some(persist.path().to_path_buf()),
        ..ScriptRunOptions::default()
    };
    let result = ScriptRunner::new(small_overflow_config())
        .run(&runtime(), workspace.path(), "noisy", &[], options)
        .await
        .unwrap();
    assert!(result.success());
    assert!(result.stdout.contains("bytes truncated]"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fs::read_dir(persist.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn ephemeral_temp_dir_is_removed_after_run() {
    let workspace = TempDir::new().unwrap();
    write_script(
        workspace.path(),
        ".wsrun/scripts",
        "where",
        "#!/bin/sh\necho \"$TMPDIR\"\n",
    );

    let result = run_script(
        &runtime(),
        workspace.path(),
        "where",
        &[],
        ScriptRunOptions::default(),
    )
    .await
    .unwrap();
    let temp_dir = PathBuf::from(result.stdout.trim());
    assert!(!result.stdout.trim().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!temp_dir.exists(), "{} still exists", temp_dir.display());
}

#[tokio::test]
async fn tmpfile_overflow_without_persistent_dir_is_not_retained() {
    let workspace = TempDir::new().unwrap();
    write_script(workspace.path(), ".wsrun/scripts", "noisy", NOISY);

    let options = ScriptRunOptions {
        overflow_policy: Some(OverflowPolicy::Tmpfile),
        ..ScriptRunOptions::default()
    };
    let result = ScriptRunner::new(small_overflow_config())
        .run(&runtime(), workspace.path(), "noisy", &[], options)
        .await
        .unwrap();

    assert!(!result.success());
    assert!(result.stderr.contains(OVERFLOW_MARKER));
    let log = extract_overflow_path(&result.stderr).unwrap();
    let temp_dir = log.parent().unwrap().to_path_buf();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!log.exists());
    assert!(!temp_dir.exists());
}

#[tokio::test]
async fn telemetry_records_start_and_failure() {
    let workspace = TempDir::new().unwrap();
    write_script(workspace.path(), ".wsrun/scripts", "fail", "#!/bin/sh\nexit 2\n");
    write_script(workspace.path(), ".wsrun/scripts", "ok", "#!/bin/sh\ntrue\n");

    let sink = Arc::new(MemoryTelemetry::<VersionedScriptEvent>::new());
    let runner = ScriptRunner::new(ScriptsConfig::default()).with_telemetry(sink.clone());
    let rt = runtime();
    runner
        .run(&rt, workspace.path(), "fail", &["x".to_string()], ScriptRunOptions::default())
        .await
        .unwrap();
    runner
        .run(&rt, workspace.path(), "ok", &[], ScriptRunOptions::default())
        .await
        .unwrap();

    let events: Vec<ScriptEvent> = sink.events().into_iter().map(|e| e.into_event()).collect();
    assert_eq!(events.len(), 4);
    match (&events[0], &events[1]) {
        (ScriptEvent::Started(started), ScriptEvent::Failed(failed)) => {
            assert_eq!(started.script, "fail");
            assert_eq!(started.arg_count, 1);
            assert_eq!(started.execution_id, failed.execution_id);
            assert_eq!(failed.reason, FailureReason::NonZeroExit);
            assert_eq!(failed.exit_code, Some(2));
        }
        other => panic!("unexpected events: {other:?}"),
    }
    assert!(matches!(events[3], ScriptEvent::Completed(_)));
    assert_ne!(events[0].execution_id(), events[2].execution_id());
}

#[tokio::test]
async fn discovery_lists_executables_with_descriptions() {
    let workspace = TempDir::new().unwrap();
    write_script(
        workspace.path(),
        ".wsrun/scripts",
        "build",
        "#!/bin/bash\n# Description: Build everything\nmake\n",
    );
    write_script(workspace.path(), ".scripts", "build", "#!/bin/sh\n# Description: old build\n");
    write_script(workspace.path(), ".scripts", "clean", "#!/bin/sh\nrm -rf out\n");
    let notes = workspace.path().join(".wsrun/scripts/NOTES.md");
    fs::write(&notes, "# Description: not a script\n").unwrap();

    let scripts = FsScriptCatalog::default()
        .discover(runtime().as_ref(), workspace.path())
        .await
        .unwrap();

    let names: Vec<&str> = scripts.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["build", "clean"]);
    assert_eq!(scripts[0].description.as_deref(), Some("Build everything"));
    assert!(scripts[0].path.ends_with(".wsrun/scripts/build"));
    assert_eq!(scripts[1].description, None);
    assert!(scripts.iter().all(|s| s.is_executable));
}

#[tokio::test]
async fn discovery_without_script_dirs_is_empty() {
    let workspace = TempDir::new().unwrap();
    let scripts = FsScriptCatalog::default()
        .discover(runtime().as_ref(), workspace.path())
        .await
        .unwrap();
    assert!(scripts.is_empty());
}
